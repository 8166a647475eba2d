//! Flash write pipeline
//!
//! Data arrives through the receive interrupt into the packet ring while
//! the main context erases ahead, inflates, hashes and programs one packet
//! at a time. After every packet a [`WriteProgress`] record tells the host
//! how full the ring is; that occupancy is the host's only flow control.

use md5::{Digest, Md5};
use zerocopy::little_endian::U32;
use zerocopy::IntoBytes;

use super::{finish, send_packet, snapshot};
use crate::error::{Error, Result};
use crate::platform::{Clock, FlashRom, Uart};
use crate::protocol::{
    FlashWriteArgs, WriteProgress, WriteResult, FLASH_BLOCK_SIZE, FLASH_SECTOR_SIZE,
    FLASH_WRITE_SIZE,
};
use crate::ring::RingConsumer;
use crate::rx::{PacketFlags, RxAssembler};
use crate::session::{FlashSession, Inflater};

/// Erase bookkeeping for one write
struct Eraser {
    base: u32,
    len: u32,
    erased: u32,
}

impl Eraser {
    /// Erase forward until `target` bytes from the start are erased
    ///
    /// Whole blocks are used while a full aligned block remains, sectors
    /// otherwise. Never erases past the end of the region.
    fn erase_to<F: FlashRom>(&mut self, flash: &mut F, target: u32) -> Result<()> {
        let target = target.min(self.len);
        while self.erased < target {
            let at = self.base + self.erased;
            let remaining = self.len - self.erased;
            if remaining >= FLASH_BLOCK_SIZE && at % FLASH_BLOCK_SIZE == 0 {
                log::trace!("erase block 0x{:08X}", at);
                flash.erase_block(at).map_err(|_| Error::BlockEraseFailed)?;
                self.erased += FLASH_BLOCK_SIZE;
            } else {
                log::trace!("erase sector 0x{:08X}", at);
                flash.erase_sector(at).map_err(|_| Error::SectorEraseFailed)?;
                self.erased += FLASH_SECTOR_SIZE;
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct Timing {
    wait: u32,
    decomp: u32,
    write: u32,
    erase: u32,
}

/// Write `args.len` bytes received from the host to flash at `args.addr`
///
/// Sends one [`WriteProgress`] per packet and a final [`WriteResult`]. The
/// receive interrupt is armed only for the duration of the transfer.
pub fn flash_write<F, U, C>(
    flash: &mut F,
    uart: &mut U,
    clock: &C,
    session: &mut FlashSession,
    args: &FlashWriteArgs,
) -> Result<()>
where
    F: FlashRom,
    U: Uart,
    C: Clock,
{
    let addr = args.addr.get();
    let len = args.len.get();
    let erase = args.erase.get() != 0;
    log::debug!("flash write 0x{:08X}+{} erase={}", addr, len, erase);

    if addr % FLASH_SECTOR_SIZE != 0 {
        return Err(Error::WriteAddrUnaligned);
    }
    if len % FLASH_SECTOR_SIZE != 0 {
        return Err(Error::WriteLenUnaligned);
    }
    flash.unlock().map_err(|_| Error::UnlockFailed)?;

    let (ring, inflater) = session.begin();
    let (producer, consumer) = ring.split();
    let mut rx = RxAssembler::new(producer);
    let eraser = erase.then_some(Eraser {
        base: addr,
        len,
        erased: 0,
    });

    let result = uart.with_rx_interrupt(&mut rx, |uart| {
        stream(flash, uart, clock, consumer, inflater, addr, len, eraser)
    });
    if rx.is_halted() {
        log::debug!("receive halted in state {:?}", rx.state());
    }

    let result = result?;
    send_packet(uart, result.as_bytes())
}

#[allow(clippy::too_many_arguments)]
fn stream<F, U, C, const N: usize, const CAP: usize>(
    flash: &mut F,
    uart: &mut U,
    clock: &C,
    mut consumer: RingConsumer<'_, N, CAP>,
    inflater: &mut Inflater,
    addr: u32,
    len: u32,
    mut eraser: Option<Eraser>,
) -> Result<WriteResult>
where
    F: FlashRom,
    U: Uart,
    C: Clock,
{
    let mut hasher = Md5::new();
    let mut timing = Timing::default();
    let start = clock.cycles();
    let mut written = 0u32;

    while written < len {
        // Prepare the space ahead
        let t = clock.cycles();
        if let Some(eraser) = eraser.as_mut() {
            eraser.erase_to(flash, written.saturating_add(FLASH_WRITE_SIZE))?;
        }
        timing.erase = timing.erase.wrapping_add(clock.cycles().wrapping_sub(t));

        let t = clock.cycles();
        while consumer.is_empty() && !consumer.error_latched() {
            uart.wait_for_rx();
        }
        if consumer.error_latched() {
            return Err(Error::ReceiveAborted);
        }
        timing.wait = timing.wait.wrapping_add(clock.cycles().wrapping_sub(t));

        let Some(packet) = consumer.peek() else {
            continue;
        };

        let t = clock.cycles();
        let data = if packet.flags.contains(PacketFlags::COMPRESSED) {
            inflater.inflate(packet.data)?
        } else {
            packet.data
        };
        timing.decomp = timing.decomp.wrapping_add(clock.cycles().wrapping_sub(t));

        let n = u32::try_from(data.len()).map_err(|_| Error::WriteOverrun)?;
        if n > len - written {
            return Err(Error::WriteOverrun);
        }

        let t = clock.cycles();
        if let Some(eraser) = eraser.as_mut() {
            eraser.erase_to(flash, written + n)?;
        }
        timing.erase = timing.erase.wrapping_add(clock.cycles().wrapping_sub(t));

        hasher.update(data);

        let t = clock.cycles();
        flash
            .write(addr + written, data)
            .map_err(|_| Error::WriteFailed)?;
        timing.write = timing.write.wrapping_add(clock.cycles().wrapping_sub(t));

        consumer.release();
        written += n;

        let progress = WriteProgress {
            num_written: U32::new(written),
            buf_level: U32::new(consumer.occupancy() as u32),
            digest: snapshot(&hasher),
        };
        send_packet(uart, progress.as_bytes())?;
    }

    Ok(WriteResult {
        wait_time: U32::new(timing.wait),
        decomp_time: U32::new(timing.decomp),
        write_time: U32::new(timing.write),
        erase_time: U32::new(timing.erase),
        total_time: U32::new(clock.cycles().wrapping_sub(start)),
        digest: finish(hasher),
    })
}
