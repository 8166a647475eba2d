//! Stub emulator: the real command loop against an in-memory flash

use std::error::Error;
use std::fs;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use stubflash_core::platform::{Chip, Clock, Registers};
use stubflash_core::stub::{Stub, StubParams};
use stubflash_dummy::{DummyConfig, DummyFlash, DummySystem};

use crate::transport::{BaudControl, WireUart};

/// Emulated CPU clock, for the cycle counter
const CPU_MHZ: u128 = 160;
/// UART source clock, for the greeting divider
const APB_HZ: u32 = 80_000_000;

/// Board collaborator backed by the host
///
/// The cycle counter and delays follow wall-clock time so the phase timers
/// in a write result are meaningful. Registers live in the dummy register
/// file. A serial wire follows the baud rate switch, and leaving the stub
/// puts it back at the loader rate, as a chip reset would.
pub struct HostSystem {
    regs: DummySystem,
    start: Instant,
    loader_baud: u32,
    baud: Option<BaudControl>,
}

impl HostSystem {
    pub fn new(loader_baud: u32, baud: Option<BaudControl>) -> Self {
        Self {
            regs: DummySystem::new(loader_baud),
            start: Instant::now(),
            loader_baud,
            baud,
        }
    }

    fn restore_baud(&mut self) {
        if let Some(ctl) = &mut self.baud {
            if let Err(e) = ctl.set(self.loader_baud) {
                log::warn!("Cannot restore baud rate: {}", e);
            }
        }
    }
}

impl Registers for HostSystem {
    unsafe fn read(&mut self, addr: u32) -> u32 {
        // SAFETY: forwarded to the in-memory register file
        unsafe { self.regs.read(addr) }
    }

    unsafe fn write(&mut self, addr: u32, value: u32) {
        log::debug!("Register 0x{:08X} <- 0x{:08X}", addr, value);
        // SAFETY: forwarded to the in-memory register file
        unsafe { self.regs.write(addr, value) }
    }
}

impl Clock for HostSystem {
    fn cycles(&self) -> u32 {
        (self.start.elapsed().as_nanos() * CPU_MHZ / 1000) as u32
    }

    fn delay_us(&mut self, us: u32) {
        thread::sleep(Duration::from_micros(u64::from(us)));
    }
}

impl Chip for HostSystem {
    fn set_baud_rate(&mut self, old_baud: u32, new_baud: u32) -> u32 {
        if let Some(ctl) = &mut self.baud {
            if let Err(e) = ctl.set(new_baud) {
                log::warn!("Cannot switch to {} baud: {}", new_baud, e);
            }
        }
        APB_HZ / old_baud.max(1)
    }

    fn resume_firmware(&mut self) {
        log::info!("Stub left, resuming firmware");
        self.restore_baud();
    }

    fn reset(&mut self) {
        log::info!("Stub left, resetting chip");
        self.restore_baud();
    }
}

/// What to serve and how long
pub struct ServeOptions {
    pub image: Option<PathBuf>,
    pub size: usize,
    pub save: bool,
    pub switch_baud: u32,
    pub once: bool,
}

fn load_flash(opts: &ServeOptions) -> Result<DummyFlash, Box<dyn Error>> {
    let config = DummyConfig {
        size: opts.size,
        ..Default::default()
    };
    let Some(path) = &opts.image else {
        return Ok(DummyFlash::new(config));
    };
    let data = match fs::read(path) {
        Ok(data) => data,
        // A missing image starts erased and is created by --save
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && opts.save => Vec::new(),
        Err(e) => return Err(format!("Failed to read {}: {}", path.display(), e).into()),
    };
    if data.len() > opts.size {
        return Err(format!(
            "Image {} is {} bytes, larger than the {} byte flash",
            path.display(),
            data.len(),
            opts.size
        )
        .into());
    }
    log::info!("Loaded {} bytes from {}", data.len(), path.display());
    Ok(DummyFlash::with_data(config, &data))
}

/// Serve host sessions until `once` is set and the first one ends
///
/// Every session is a full stub lifetime: greeting, commands, then boot or
/// reboot. The flash contents carry over between sessions.
pub fn serve(uart: WireUart, opts: &ServeOptions) -> Result<(), Box<dyn Error>> {
    let flash = load_flash(opts)?;
    let params = StubParams {
        old_baud: uart.baud(),
        new_baud: opts.switch_baud,
    };
    let system = HostSystem::new(uart.baud(), uart.baud_control()?);
    let mut stub = Box::new(Stub::new(flash, uart, system));

    loop {
        log::info!("Stub running, greeting host");
        let last = stub.run(params);
        log::info!("Session ended with {:?}", last);

        if opts.save {
            if let Some(path) = &opts.image {
                fs::write(path, stub.flash().data())?;
                log::info!("Saved flash to {}", path.display());
            }
        }
        if opts.once {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_greeting_divider_and_clock() {
        let mut sys = HostSystem::new(115_200, None);
        assert_eq!(sys.set_baud_rate(115_200, 921_600), 694);
        let before = sys.cycles();
        sys.delay_us(1000);
        assert!(sys.cycles().wrapping_sub(before) >= 1000 * CPU_MHZ as u32);
    }

    #[test]
    fn test_registers_forwarded() {
        let mut sys = HostSystem::new(115_200, None);
        // SAFETY: the register file is in memory
        unsafe {
            sys.write(0x6000_0000, 0xDEAD_BEEF);
            assert_eq!(sys.read(0x6000_0000), 0xDEAD_BEEF);
        }
    }

    #[test]
    fn test_load_flash_rejects_oversized_image() {
        let dir = std::env::temp_dir().join(format!("stubflash-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("big.bin");
        fs::write(&path, vec![0u8; 8192]).unwrap();

        let mut opts = ServeOptions {
            image: Some(path.clone()),
            size: 4096,
            save: false,
            switch_baud: 0,
            once: true,
        };
        assert!(load_flash(&opts).is_err());

        opts.size = 16384;
        let flash = load_flash(&opts).unwrap();
        assert_eq!(flash.data()[..8192], [0u8; 8192]);
        assert_eq!(flash.data()[8192], 0xFF);

        opts.image = Some(dir.join("missing.bin"));
        assert!(load_flash(&opts).is_err());
        opts.save = true;
        assert!(load_flash(&opts).unwrap().data().iter().all(|&b| b == 0xFF));

        fs::remove_dir_all(&dir).unwrap();
    }
}
