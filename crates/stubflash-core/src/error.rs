//! Error types for stubflash-core
//!
//! Every command ends with a one-byte status sent to the host. This module
//! provides a no_std compatible error type whose variants map one-to-one onto
//! those status bytes, so an operation can fail with `?` and the dispatcher
//! only has to call [`Error::status`].

use core::fmt;

/// Core error type - no_std compatible, Copy for efficiency
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    // Flash write
    /// Flash write target address is not sector aligned
    WriteAddrUnaligned,
    /// Flash write length is not a multiple of the sector size
    WriteLenUnaligned,
    /// ROM refused to unlock the flash for writing
    UnlockFailed,
    /// Block erase ahead of the write cursor failed
    BlockEraseFailed,
    /// Sector erase ahead of the write cursor failed
    SectorEraseFailed,
    /// Receive assembler latched an error (host abort, bad escape or
    /// ring overrun)
    ReceiveAborted,
    /// ROM write failed
    WriteFailed,
    /// Host sent more data than the requested length
    WriteOverrun,
    /// Compressed packet could not be inflated
    InflateFailed,
    /// Flash write argument vector has the wrong length
    WriteArgs,

    // Flash read
    /// Flash read argument vector has the wrong length
    ReadArgs,
    /// Read block size is zero, larger than the read buffer, or larger
    /// than the in-flight ceiling
    ReadBlockSize,
    /// ROM read failed while streaming
    ReadFailed,
    /// Acknowledgment packet was not exactly four bytes
    AckLength,
    /// Host acknowledged more bytes than were sent
    AckOverrun,

    // Flash digest
    /// Flash digest argument vector has the wrong length
    DigestArgs,
    /// Digest block size is larger than the read buffer
    DigestBlockSize,
    /// ROM read failed while hashing
    DigestReadFailed,

    // Registers
    /// Read-register argument vector has the wrong length
    ReadRegArgs,
    /// Write-register argument vector has the wrong length
    WriteRegArgs,

    // Collaborators
    /// Raw ROM result code, forwarded as the status byte
    Rom(u8),
    /// Opcode not recognised
    UnknownCommand(u8),
    /// UART transmit failed
    Link,
}

impl Error {
    /// Status byte reported to the host for this error
    pub const fn status(&self) -> u8 {
        match self {
            Self::WriteAddrUnaligned => 0x32,
            Self::WriteLenUnaligned => 0x33,
            Self::UnlockFailed => 0x34,
            Self::BlockEraseFailed => 0x35,
            Self::SectorEraseFailed => 0x36,
            Self::ReceiveAborted => 0x37,
            Self::WriteFailed => 0x38,
            Self::WriteOverrun => 0x39,
            Self::InflateFailed => 0x40,
            Self::WriteArgs => 0x41,
            Self::ReadArgs => 0x51,
            Self::ReadBlockSize => 0x52,
            Self::ReadFailed => 0x53,
            Self::AckLength => 0x54,
            Self::AckOverrun => 0x55,
            Self::DigestArgs => 0x61,
            Self::DigestBlockSize => 0x62,
            Self::DigestReadFailed => 0x63,
            Self::ReadRegArgs => 0x91,
            Self::WriteRegArgs => 0xA1,
            Self::Rom(code) => *code,
            Self::UnknownCommand(_) => 0xFF,
            Self::Link => 0xFE,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WriteAddrUnaligned => write!(f, "write address not sector aligned"),
            Self::WriteLenUnaligned => write!(f, "write length not a multiple of the sector size"),
            Self::UnlockFailed => write!(f, "flash unlock failed"),
            Self::BlockEraseFailed => write!(f, "block erase failed"),
            Self::SectorEraseFailed => write!(f, "sector erase failed"),
            Self::ReceiveAborted => write!(f, "receive aborted"),
            Self::WriteFailed => write!(f, "flash write failed"),
            Self::WriteOverrun => write!(f, "received data exceeds write length"),
            Self::InflateFailed => write!(f, "decompression failed"),
            Self::WriteArgs => write!(f, "bad flash write arguments"),
            Self::ReadArgs => write!(f, "bad flash read arguments"),
            Self::ReadBlockSize => write!(f, "invalid read block size"),
            Self::ReadFailed => write!(f, "flash read failed"),
            Self::AckLength => write!(f, "malformed acknowledgment"),
            Self::AckOverrun => write!(f, "acknowledged more bytes than sent"),
            Self::DigestArgs => write!(f, "bad flash digest arguments"),
            Self::DigestBlockSize => write!(f, "invalid digest block size"),
            Self::DigestReadFailed => write!(f, "flash read failed while hashing"),
            Self::ReadRegArgs => write!(f, "bad read register arguments"),
            Self::WriteRegArgs => write!(f, "bad write register arguments"),
            Self::Rom(code) => write!(f, "ROM returned 0x{:02X}", code),
            Self::UnknownCommand(op) => write!(f, "unknown command 0x{:02X}", op),
            Self::Link => write!(f, "UART transmit failed"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

/// Result type alias using the core Error type
pub type Result<T> = core::result::Result<T, Error>;
