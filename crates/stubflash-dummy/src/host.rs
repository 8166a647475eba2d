//! Host side of the wire protocol
//!
//! Builders for the frames a host tool sends and parsers for the stub's
//! replies. Used by the scenario tests; kept deliberately thin so tests
//! read like the protocol itself.

use std::vec::Vec;

use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, IntoBytes};

use stubflash_core::protocol::{
    FlashDigestArgs, FlashReadArgs, FlashWriteArgs, Opcode, ReadRegArgs, WriteProgress,
    WriteRegArgs, WriteResult,
};
use stubflash_core::rx::PacketFlags;
use stubflash_core::slip::{self, Decoded, SlipDecoder};

/// Encode `payload` as one SLIP frame
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut wire = Vec::with_capacity(slip::encoded_len(payload));
    match slip::encode(&mut wire, payload) {
        Ok(()) => wire,
        Err(never) => match never {},
    }
}

/// Opcode frame followed by an argument frame
pub fn command(op: Opcode, args: &[u8]) -> Vec<u8> {
    let mut wire = frame(&[op as u8]);
    wire.extend(frame(args));
    wire
}

/// Opcode frame for commands without arguments
pub fn bare_command(op: Opcode) -> Vec<u8> {
    frame(&[op as u8])
}

/// Flash write command
pub fn flash_write(addr: u32, len: u32, erase: bool) -> Vec<u8> {
    let args = FlashWriteArgs {
        addr: U32::new(addr),
        len: U32::new(len),
        erase: U32::new(erase as u32),
    };
    command(Opcode::FlashWrite, args.as_bytes())
}

/// Flash read command
pub fn flash_read(addr: u32, len: u32, block_size: u32, max_in_flight: u32) -> Vec<u8> {
    let args = FlashReadArgs {
        addr: U32::new(addr),
        len: U32::new(len),
        block_size: U32::new(block_size),
        max_in_flight: U32::new(max_in_flight),
    };
    command(Opcode::FlashRead, args.as_bytes())
}

/// Flash digest command
pub fn flash_digest(addr: u32, len: u32, digest_block_size: u32) -> Vec<u8> {
    let args = FlashDigestArgs {
        addr: U32::new(addr),
        len: U32::new(len),
        digest_block_size: U32::new(digest_block_size),
    };
    command(Opcode::FlashDigest, args.as_bytes())
}

/// Read register command
pub fn read_reg(addr: u32) -> Vec<u8> {
    let args = ReadRegArgs {
        addr: U32::new(addr),
    };
    command(Opcode::ReadReg, args.as_bytes())
}

/// Write register command
pub fn write_reg(addr: u32, value: u32) -> Vec<u8> {
    let args = WriteRegArgs {
        addr: U32::new(addr),
        value: U32::new(value),
    };
    command(Opcode::WriteReg, args.as_bytes())
}

/// Acknowledgment of `received` bytes during a flash read
pub fn read_ack(received: u32) -> Vec<u8> {
    frame(&received.to_le_bytes())
}

/// Data packet for a flash write, flag byte first
pub fn data_packet(payload: &[u8], compressed: bool) -> Vec<u8> {
    let flags = if compressed {
        PacketFlags::COMPRESSED
    } else {
        PacketFlags::empty()
    };
    let mut body = Vec::with_capacity(payload.len() + 1);
    body.push(flags.bits());
    body.extend_from_slice(payload);
    frame(&body)
}

/// Empty packet telling the stub to abort the flash write
pub fn abort_packet() -> Vec<u8> {
    std::vec![slip::END, slip::END]
}

/// Split a transmitted byte stream into frames
///
/// # Panics
///
/// Panics on an invalid escape; the stub never sends one.
pub fn decode_frames(wire: &[u8]) -> Vec<Vec<u8>> {
    let mut decoder = SlipDecoder::new();
    let mut frames = Vec::new();
    let mut cur = Vec::new();
    for &b in wire {
        match decoder.feed(b) {
            Decoded::Start => cur.clear(),
            Decoded::Byte(x) => cur.push(x),
            Decoded::End => frames.push(std::mem::take(&mut cur)),
            Decoded::Nothing => {}
            Decoded::Error => panic!("host: invalid escape in stub output"),
        }
    }
    frames
}

/// Parse a one-byte status frame
pub fn status(frame: &[u8]) -> Option<u8> {
    match frame {
        [status] => Some(*status),
        _ => None,
    }
}

/// Parse a progress record
pub fn progress(frame: &[u8]) -> Option<WriteProgress> {
    WriteProgress::read_from_bytes(frame).ok()
}

/// Parse a result record
pub fn result(frame: &[u8]) -> Option<WriteResult> {
    WriteResult::read_from_bytes(frame).ok()
}

/// Parse a 16-byte digest frame
pub fn digest(frame: &[u8]) -> Option<[u8; 16]> {
    frame.try_into().ok()
}

/// Parse a 4-byte little-endian word frame
pub fn word(frame: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = frame.try_into().ok()?;
    Some(u32::from_le_bytes(bytes))
}
