//! NOR flash emulator

use alloc::vec;
use alloc::vec::Vec;

use stubflash_core::platform::{FlashRom, RomError, RomResult};
use stubflash_core::protocol::{FlashGeometry, FLASH_BLOCK_SIZE, FLASH_SECTOR_SIZE};

use crate::DummyConfig;

/// ROM result code for a routine that failed
const ROM_ERR: RomError = RomError(1);
/// ROM result code for a routine that timed out
const ROM_TIMEOUT: RomError = RomError(2);

/// A ROM routine that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// `unlock` fails
    Unlock,
    /// `erase_sector` fails at this address
    EraseSector(u32),
    /// `erase_block` fails at this address
    EraseBlock(u32),
    /// `erase_chip` times out
    EraseChip,
    /// `write` fails when the range covers this address
    Write(u32),
    /// `read` fails when the range covers this address
    Read(u32),
}

/// In-memory NOR flash
///
/// Erasing sets bytes to 0xFF, programming can only clear bits. Every
/// erase is logged so tests can check what the stub erased.
pub struct DummyFlash {
    config: DummyConfig,
    data: Vec<u8>,
    protected: bool,
    geometry: Option<FlashGeometry>,
    erase_log: Vec<(u32, u32)>,
    write_count: usize,
    faults: Vec<Fault>,
}

impl DummyFlash {
    /// Create a new dummy flash with the given configuration
    pub fn new(config: DummyConfig) -> Self {
        let data = vec![0xFF; config.size];
        let protected = config.protected;
        Self {
            config,
            data,
            protected,
            geometry: None,
            erase_log: Vec::new(),
            write_count: 0,
            faults: Vec::new(),
        }
    }

    /// Create a dummy flash with pre-filled data
    pub fn with_data(config: DummyConfig, initial_data: &[u8]) -> Self {
        let mut flash = Self::new(config);
        let len = core::cmp::min(initial_data.len(), flash.data.len());
        flash.data[..len].copy_from_slice(&initial_data[..len]);
        flash
    }

    /// Get a reference to the flash data
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Geometry handed over by the stub, if any
    pub fn geometry(&self) -> Option<&FlashGeometry> {
        self.geometry.as_ref()
    }

    /// Every erase so far as `(addr, size)`
    pub fn erase_log(&self) -> &[(u32, u32)] {
        &self.erase_log
    }

    /// Number of successful write calls
    pub fn write_count(&self) -> usize {
        self.write_count
    }

    /// True while the status register protection is set
    pub fn is_protected(&self) -> bool {
        self.protected
    }

    /// Make a ROM routine fail from now on
    pub fn inject(&mut self, fault: Fault) {
        self.faults.push(fault);
    }

    /// Remove every injected fault
    pub fn clear_faults(&mut self) {
        self.faults.clear();
    }

    fn has_fault(&self, fault: Fault) -> bool {
        self.faults.contains(&fault)
    }

    fn fault_in(&self, addr: u32, len: usize, pick: fn(Fault) -> Option<u32>) -> bool {
        let range = addr as u64..addr as u64 + len as u64;
        self.faults
            .iter()
            .filter_map(|&f| pick(f))
            .any(|at| range.contains(&(at as u64)))
    }

    fn range(&self, addr: u32, len: usize) -> RomResult<core::ops::Range<usize>> {
        let start = addr as usize;
        let end = start.checked_add(len).ok_or(ROM_ERR)?;
        if end > self.data.len() {
            log::debug!("dummy: 0x{:08X}+{} out of bounds", addr, len);
            return Err(ROM_ERR);
        }
        Ok(start..end)
    }

    fn erase(&mut self, addr: u32, size: u32) -> RomResult {
        if self.protected {
            return Err(ROM_ERR);
        }
        if addr % size != 0 {
            return Err(ROM_ERR);
        }
        let range = self.range(addr, size as usize)?;
        self.data[range].fill(0xFF);
        self.erase_log.push((addr, size));
        Ok(())
    }
}

impl FlashRom for DummyFlash {
    fn configure(&mut self, geometry: &FlashGeometry) {
        self.geometry = Some(*geometry);
    }

    fn unlock(&mut self) -> RomResult {
        if self.has_fault(Fault::Unlock) {
            return Err(ROM_ERR);
        }
        self.protected = false;
        Ok(())
    }

    fn erase_sector(&mut self, addr: u32) -> RomResult {
        if self.has_fault(Fault::EraseSector(addr)) {
            return Err(ROM_ERR);
        }
        self.erase(addr, FLASH_SECTOR_SIZE)
    }

    fn erase_block(&mut self, addr: u32) -> RomResult {
        if self.has_fault(Fault::EraseBlock(addr)) {
            return Err(ROM_ERR);
        }
        self.erase(addr, FLASH_BLOCK_SIZE)
    }

    fn erase_chip(&mut self) -> RomResult {
        if self.has_fault(Fault::EraseChip) {
            return Err(ROM_TIMEOUT);
        }
        if self.protected {
            return Err(ROM_ERR);
        }
        self.data.fill(0xFF);
        self.erase_log.push((0, self.data.len() as u32));
        Ok(())
    }

    fn write(&mut self, addr: u32, data: &[u8]) -> RomResult {
        let faulty = self.fault_in(addr, data.len(), |f| match f {
            Fault::Write(at) => Some(at),
            _ => None,
        });
        if self.protected || faulty {
            return Err(ROM_ERR);
        }
        let range = self.range(addr, data.len())?;
        // Flash programming: can only change 1 -> 0
        for (cell, &byte) in self.data[range].iter_mut().zip(data) {
            *cell &= byte;
        }
        self.write_count += 1;
        Ok(())
    }

    fn read(&mut self, addr: u32, buf: &mut [u8]) -> RomResult {
        let faulty = self.fault_in(addr, buf.len(), |f| match f {
            Fault::Read(at) => Some(at),
            _ => None,
        });
        if faulty {
            return Err(ROM_ERR);
        }
        let range = self.range(addr, buf.len())?;
        buf.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn read_chip_id(&mut self) -> RomResult<u32> {
        let [dev_hi, dev_lo] = self.config.device_id.to_be_bytes();
        // RDID shifts in manufacturer first; the top byte is bus noise
        Ok(u32::from_le_bytes([
            self.config.manufacturer_id,
            dev_hi,
            dev_lo,
            0xA5,
        ]))
    }
}
