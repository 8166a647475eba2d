//! Wire contract shared with the host tool
//!
//! All multi-byte integers are little-endian. The buffer constants are part
//! of the protocol: the host sizes its flow control from them, so changing
//! any of them is a breaking change.

use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::{Error, Result};

// ============================================================================
// Flash geometry
// ============================================================================

/// Large erase unit
pub const FLASH_BLOCK_SIZE: u32 = 65536;
/// Small erase unit; write address and length must be multiples of it
pub const FLASH_SECTOR_SIZE: u32 = 4096;
/// Program page size
pub const FLASH_PAGE_SIZE: u32 = 256;
/// Chip size the ROM flash driver is configured with
pub const FLASH_CHIP_SIZE: u32 = 16 * 1024 * 1024;

/// Parameters handed to the ROM flash driver at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashGeometry {
    /// Total size in bytes
    pub chip_size: u32,
    /// Large erase unit
    pub block_size: u32,
    /// Small erase unit
    pub sector_size: u32,
    /// Program page size
    pub page_size: u32,
}

impl FlashGeometry {
    /// Geometry the stub configures before entering the command loop
    pub const STUB: Self = Self {
        chip_size: FLASH_CHIP_SIZE,
        block_size: FLASH_BLOCK_SIZE,
        sector_size: FLASH_SECTOR_SIZE,
        page_size: FLASH_PAGE_SIZE,
    };
}

// ============================================================================
// Buffering
// ============================================================================

/// Number of packet buffers in the receive ring
pub const NUM_BUFS: usize = 4;
/// Capacity of one packet buffer
pub const BUF_SIZE: usize = 4096;
/// Amount of flash the write pipeline keeps erased ahead of the cursor
pub const FLASH_WRITE_SIZE: u32 = BUF_SIZE as u32;
/// Size of the decompression output window
pub const INFLATE_WINDOW: usize = 32768;
/// Largest argument vector of any command
pub const MAX_ARGS_LEN: usize = 16;
/// Digest length
pub const DIGEST_LEN: usize = 16;

/// Command opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Write a region, streaming data through the receive ring
    FlashWrite = 1,
    /// Stream a region back to the host
    FlashRead = 2,
    /// Hash a region, optionally per block
    FlashDigest = 3,
    /// Report the flash JEDEC ID
    FlashReadChipId = 4,
    /// Erase the whole chip
    FlashEraseChip = 5,
    /// Leave the stub and resume the resident firmware
    BootFirmware = 6,
    /// Leave the stub and reset the chip
    Reboot = 7,
    /// Send the argument bytes back
    Echo = 8,
    /// Read a 32-bit register
    ReadReg = 9,
    /// Write a 32-bit register
    WriteReg = 10,
}

impl Opcode {
    /// True for the opcodes that end the command loop
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::BootFirmware | Self::Reboot)
    }
}

impl TryFrom<u8> for Opcode {
    type Error = Error;

    fn try_from(op: u8) -> Result<Self> {
        Ok(match op {
            1 => Self::FlashWrite,
            2 => Self::FlashRead,
            3 => Self::FlashDigest,
            4 => Self::FlashReadChipId,
            5 => Self::FlashEraseChip,
            6 => Self::BootFirmware,
            7 => Self::Reboot,
            8 => Self::Echo,
            9 => Self::ReadReg,
            10 => Self::WriteReg,
            _ => return Err(Error::UnknownCommand(op)),
        })
    }
}

// ============================================================================
// Argument vectors
// ============================================================================

/// Arguments of [`Opcode::FlashWrite`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct FlashWriteArgs {
    /// Target address, sector aligned
    pub addr: U32,
    /// Length, a multiple of the sector size
    pub len: U32,
    /// Non-zero to erase ahead of the write cursor
    pub erase: U32,
}

/// Arguments of [`Opcode::FlashRead`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct FlashReadArgs {
    /// Start address
    pub addr: U32,
    /// Length
    pub len: U32,
    /// Size of each data packet
    pub block_size: U32,
    /// Ceiling on unacknowledged bytes
    pub max_in_flight: U32,
}

/// Arguments of [`Opcode::FlashDigest`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct FlashDigestArgs {
    /// Start address
    pub addr: U32,
    /// Length
    pub len: U32,
    /// Per-block digest size, 0 for the overall digest only
    pub digest_block_size: U32,
}

/// Arguments of [`Opcode::ReadReg`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct ReadRegArgs {
    /// Register address
    pub addr: U32,
}

/// Arguments of [`Opcode::WriteReg`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct WriteRegArgs {
    /// Register address
    pub addr: U32,
    /// Value to store
    pub value: U32,
}

/// Parse an argument vector that must have exactly the size of `T`
pub fn parse_args<T: FromBytes + KnownLayout + Immutable>(bytes: &[u8], shape: Error) -> Result<T> {
    T::read_from_bytes(bytes).map_err(|_| shape)
}

// ============================================================================
// Records streamed during flash write
// ============================================================================

/// Sent after every chunk written
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct WriteProgress {
    /// Bytes written so far
    pub num_written: U32,
    /// Bytes currently held in the receive ring
    pub buf_level: U32,
    /// MD5 of everything written so far
    pub digest: [u8; DIGEST_LEN],
}

/// Sent once when the write completes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct WriteResult {
    /// Cycles spent waiting for data
    pub wait_time: U32,
    /// Cycles spent decompressing
    pub decomp_time: U32,
    /// Cycles spent writing
    pub write_time: U32,
    /// Cycles spent erasing
    pub erase_time: U32,
    /// Cycles for the whole operation
    pub total_time: U32,
    /// MD5 of the whole region
    pub digest: [u8; DIGEST_LEN],
}
