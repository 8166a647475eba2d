//! Collaborator trait definitions

use core::fmt;

use crate::protocol::FlashGeometry;
use crate::rx::RxAssembler;

/// Raw non-zero result code returned by a ROM flash routine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RomError(pub u8);

impl fmt::Display for RomError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ROM result 0x{:02X}", self.0)
    }
}

/// Result of a ROM flash routine
pub type RomResult<T = ()> = core::result::Result<T, RomError>;

/// SPI flash as exposed by the boot ROM
///
/// The ROM hides the SPI command set behind read/write/erase routines, so
/// the stub only sees this opaque view of the chip. Addresses are byte
/// offsets from the start of flash.
pub trait FlashRom {
    /// Hand the geometry to the ROM driver
    ///
    /// Called once before the command loop starts.
    fn configure(&mut self, geometry: &FlashGeometry) {
        let _ = geometry;
    }

    /// Clear the status register protection bits
    fn unlock(&mut self) -> RomResult;

    /// Erase the sector starting at `addr`
    fn erase_sector(&mut self, addr: u32) -> RomResult;

    /// Erase the block starting at `addr`
    fn erase_block(&mut self, addr: u32) -> RomResult;

    /// Erase the whole chip
    fn erase_chip(&mut self) -> RomResult;

    /// Program `data` at `addr`
    ///
    /// The region must already be erased.
    fn write(&mut self, addr: u32, data: &[u8]) -> RomResult;

    /// Read `buf.len()` bytes starting at `addr`
    fn read(&mut self, addr: u32, buf: &mut [u8]) -> RomResult;

    /// Issue RDID and return the raw identification word
    fn read_chip_id(&mut self) -> RomResult<u32>;
}

/// The single UART wire to the host
///
/// Outside a flash write the stub polls the UART through the
/// `embedded_io` traits. During a flash write reception switches to the
/// receive interrupt, see [`Uart::with_rx_interrupt`].
pub trait Uart: embedded_io::Read + embedded_io::Write {
    /// Drop everything waiting in the receive FIFO
    fn reset_rx_fifo(&mut self);

    /// Called while the main context waits for the interrupt to publish a
    /// packet
    ///
    /// Must return promptly; the caller re-checks the ring after every
    /// call.
    fn wait_for_rx(&mut self) {
        core::hint::spin_loop();
    }

    /// Run `f` with the receive interrupt feeding `rx`
    ///
    /// Implementations raise the FIFO threshold and enable the receive
    /// timeout so the interrupt fires less often, unmask the line, run `f`,
    /// then mask the line and restore the saved configuration before
    /// returning, whatever `f` returned. The interrupt handler must stop
    /// delivering bytes once [`RxAssembler::feed`] reports
    /// [`RxStatus::Halted`](crate::rx::RxStatus::Halted).
    fn with_rx_interrupt<const N: usize, const CAP: usize, R>(
        &mut self,
        rx: &mut RxAssembler<'_, N, CAP>,
        f: impl FnOnce(&mut Self) -> R,
    ) -> R;
}

/// Raw memory-mapped register access
pub trait Registers {
    /// Read the 32-bit register at `addr`
    ///
    /// # Safety
    ///
    /// `addr` must be a readable, word-aligned register address.
    unsafe fn read(&mut self, addr: u32) -> u32;

    /// Write `value` to the 32-bit register at `addr`
    ///
    /// # Safety
    ///
    /// `addr` must be a writable, word-aligned register address, and the
    /// write must not break the memory the stub itself runs from.
    unsafe fn write(&mut self, addr: u32, value: u32);
}

/// Cycle counter and busy-wait delay
pub trait Clock {
    /// Free-running CPU cycle counter; wraps
    fn cycles(&self) -> u32;

    /// Busy-wait for `us` microseconds
    fn delay_us(&mut self, us: u32);
}

/// Chip-level control
pub trait Chip {
    /// Switch the UART from `old_baud` to `new_baud`
    ///
    /// Returns the previous clock divider so the host can confirm the
    /// switch.
    fn set_baud_rate(&mut self, old_baud: u32, new_baud: u32) -> u32;

    /// Leave the stub and continue into the resident firmware
    fn resume_firmware(&mut self);

    /// Reset the chip
    fn reset(&mut self);
}

/// Everything besides flash and UART that the stub needs from the board
pub trait System: Registers + Clock + Chip {}

impl<T: Registers + Clock + Chip> System for T {}
