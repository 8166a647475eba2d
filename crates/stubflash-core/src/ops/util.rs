//! Small commands: chip id, chip erase, echo and raw register access

use super::send_packet;
use crate::error::{Error, Result};
use crate::platform::{FlashRom, Registers, Uart};
use crate::protocol::{ReadRegArgs, WriteRegArgs};

/// Send the low 24 bits of the JEDEC ID as a 4-byte frame
pub fn read_chip_id<F: FlashRom, U: Uart>(flash: &mut F, uart: &mut U) -> Result<()> {
    let id = flash.read_chip_id().map_err(|e| Error::Rom(e.0))? & 0x00FF_FFFF;
    log::debug!("chip id 0x{:06X}", id);
    send_packet(uart, &id.to_le_bytes())
}

/// Erase the whole chip, forwarding the ROM result code on failure
pub fn erase_chip<F: FlashRom>(flash: &mut F) -> Result<()> {
    flash.erase_chip().map_err(|e| Error::Rom(e.0))
}

/// Send `args` back unchanged
pub fn echo<U: Uart>(uart: &mut U, args: &[u8]) -> Result<()> {
    send_packet(uart, args)
}

/// Read a register and send its value
pub fn read_reg<S: Registers, U: Uart>(regs: &mut S, uart: &mut U, args: &ReadRegArgs) -> Result<()> {
    // SAFETY: register access is a privileged debugging command; the host
    // is trusted with the address.
    let value = unsafe { regs.read(args.addr.get()) };
    send_packet(uart, &value.to_le_bytes())
}

/// Store a value into a register
pub fn write_reg<S: Registers>(regs: &mut S, args: &WriteRegArgs) {
    // SAFETY: as for `read_reg`
    unsafe { regs.write(args.addr.get(), args.value.get()) };
}
