//! Flash read and digest pipelines

use heapless::Vec;
use md5::{Digest, Md5};

use super::{finish, send_packet};
use crate::error::{Error, Result};
use crate::platform::{FlashRom, Uart};
use crate::protocol::{FlashDigestArgs, FlashReadArgs, FLASH_SECTOR_SIZE};
use crate::slip::{self, RecvError};

const READ_BUF_SIZE: usize = FLASH_SECTOR_SIZE as usize;

/// Stream a flash region to the host
///
/// Blocks are sent while the unacknowledged byte count stays within
/// `max_in_flight`. The host acknowledges with the cumulative number of
/// bytes it has received, as a 4-byte little-endian frame. The MD5 of the
/// whole region follows the last block.
pub fn flash_read<F: FlashRom, U: Uart>(
    flash: &mut F,
    uart: &mut U,
    args: &FlashReadArgs,
) -> Result<()> {
    let mut addr = args.addr.get();
    let len = args.len.get();
    let block_size = args.block_size.get();
    let max_in_flight = args.max_in_flight.get();
    log::debug!(
        "flash read 0x{:08X}+{} block={} in_flight={}",
        addr,
        len,
        block_size,
        max_in_flight
    );

    if block_size == 0 || block_size as usize > READ_BUF_SIZE || block_size > max_in_flight {
        return Err(Error::ReadBlockSize);
    }

    let mut buf = [0u8; READ_BUF_SIZE];
    let mut hasher = Md5::new();
    let mut sent = 0u32;
    let mut acked = 0u32;

    while acked < len {
        while sent < len {
            let n = (len - sent).min(block_size);
            if sent - acked + n > max_in_flight {
                break;
            }
            let chunk = &mut buf[..n as usize];
            flash.read(addr, chunk).map_err(|_| Error::ReadFailed)?;
            send_packet(uart, chunk)?;
            hasher.update(&*chunk);
            addr += n;
            sent += n;
        }
        acked = recv_ack(uart)?;
        log::trace!("read ack {}/{}", acked, sent);
        if acked > sent {
            return Err(Error::AckOverrun);
        }
    }

    send_packet(uart, &finish(hasher))
}

fn recv_ack<U: Uart>(uart: &mut U) -> Result<u32> {
    // One spare byte so an oversized ack is seen as such
    let mut frame: Vec<u8, 5> = Vec::new();
    match slip::recv_frame(uart, &mut frame) {
        Ok(4) => Ok(u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]])),
        Ok(_) | Err(RecvError::BadEscape) => Err(Error::AckLength),
        Err(RecvError::Io(_)) | Err(RecvError::Eof) => Err(Error::Link),
    }
}

/// Hash a flash region
///
/// With a non-zero `digest_block_size` the MD5 of every block is sent
/// first, each computed over that block alone. The MD5 of the whole region
/// always comes last.
pub fn flash_digest<F: FlashRom, U: Uart>(
    flash: &mut F,
    uart: &mut U,
    args: &FlashDigestArgs,
) -> Result<()> {
    let mut addr = args.addr.get();
    let mut len = args.len.get();
    let digest_block_size = args.digest_block_size.get();
    log::debug!(
        "flash digest 0x{:08X}+{} block={}",
        addr,
        len,
        digest_block_size
    );

    if digest_block_size as usize > READ_BUF_SIZE {
        return Err(Error::DigestBlockSize);
    }
    let read_size = match digest_block_size {
        0 => READ_BUF_SIZE as u32,
        n => n,
    };

    let mut buf = [0u8; READ_BUF_SIZE];
    let mut hasher = Md5::new();
    while len > 0 {
        let n = len.min(read_size);
        let chunk = &mut buf[..n as usize];
        flash
            .read(addr, chunk)
            .map_err(|_| Error::DigestReadFailed)?;
        hasher.update(&*chunk);
        if digest_block_size > 0 {
            send_packet(uart, &finish(Md5::new_with_prefix(&*chunk)))?;
        }
        addr += n;
        len -= n;
    }

    send_packet(uart, &finish(hasher))
}
