//! Registers, clock and chip control in memory

use alloc::collections::BTreeMap;
use core::cell::Cell;

use stubflash_core::platform::{Chip, Clock, Registers};

/// Cycles the dummy clock advances per read
const CYCLES_PER_TICK: u32 = 160;

/// In-memory system collaborator
///
/// Registers read back what was last written (0 when never written). The
/// cycle counter advances on every read so phase timers are non-zero, and
/// delays advance it by the equivalent cycle count.
#[derive(Debug)]
pub struct DummySystem {
    regs: BTreeMap<u32, u32>,
    cycles: Cell<u32>,
    cpu_mhz: u32,
    apb_hz: u32,
    baud: u32,
    delayed_us: u64,
    resumed: usize,
    resets: usize,
}

impl DummySystem {
    /// Create a system at 160 MHz with an 80 MHz UART clock
    pub fn new(baud: u32) -> Self {
        Self {
            regs: BTreeMap::new(),
            cycles: Cell::new(0),
            cpu_mhz: 160,
            apb_hz: 80_000_000,
            baud,
            delayed_us: 0,
            resumed: 0,
            resets: 0,
        }
    }

    /// Start the cycle counter at `value`
    pub fn with_cycles(self, value: u32) -> Self {
        self.cycles.set(value);
        self
    }

    /// Current UART baud rate
    pub fn baud(&self) -> u32 {
        self.baud
    }

    /// Total time spent in `delay_us`
    pub fn delayed_us(&self) -> u64 {
        self.delayed_us
    }

    /// Times the stub resumed the firmware
    pub fn resumed(&self) -> usize {
        self.resumed
    }

    /// Times the stub reset the chip
    pub fn resets(&self) -> usize {
        self.resets
    }

    /// Register contents, for inspection
    pub fn register(&self, addr: u32) -> Option<u32> {
        self.regs.get(&addr).copied()
    }

    fn divider(&self, baud: u32) -> u32 {
        self.apb_hz / baud.max(1)
    }
}

impl Default for DummySystem {
    fn default() -> Self {
        Self::new(115_200)
    }
}

impl Registers for DummySystem {
    unsafe fn read(&mut self, addr: u32) -> u32 {
        let value = self.regs.get(&addr).copied().unwrap_or(0);
        log::trace!("dummy: read 0x{:08X} = 0x{:08X}", addr, value);
        value
    }

    unsafe fn write(&mut self, addr: u32, value: u32) {
        log::trace!("dummy: write 0x{:08X} = 0x{:08X}", addr, value);
        self.regs.insert(addr, value);
    }
}

impl Clock for DummySystem {
    fn cycles(&self) -> u32 {
        let now = self.cycles.get();
        self.cycles.set(now.wrapping_add(CYCLES_PER_TICK));
        now
    }

    fn delay_us(&mut self, us: u32) {
        self.delayed_us += u64::from(us);
        let now = self.cycles.get();
        self.cycles
            .set(now.wrapping_add(us.wrapping_mul(self.cpu_mhz)));
    }
}

impl Chip for DummySystem {
    fn set_baud_rate(&mut self, old_baud: u32, new_baud: u32) -> u32 {
        if old_baud != self.baud {
            log::warn!("dummy: loader baud {} but UART runs at {}", old_baud, self.baud);
        }
        let old_div = self.divider(old_baud);
        self.baud = new_baud;
        old_div
    }

    fn resume_firmware(&mut self) {
        self.resumed += 1;
    }

    fn reset(&mut self) {
        self.resets += 1;
    }
}
