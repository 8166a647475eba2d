//! Stub entry point and command dispatcher

use heapless::Vec;

use crate::error::{Error, Result};
use crate::ops;
use crate::platform::{FlashRom, System, Uart};
use crate::protocol::{
    parse_args, FlashDigestArgs, FlashGeometry, FlashReadArgs, FlashWriteArgs, Opcode,
    ReadRegArgs, WriteRegArgs, MAX_ARGS_LEN,
};
use crate::session::FlashSession;
use crate::slip;

/// Argument buffer with one spare byte, so an oversized frame never passes
/// as a full one
const ARGS_BUF_LEN: usize = MAX_ARGS_LEN + 1;

/// Settle time around a baud rate switch and before leaving the stub
const SETTLE_US: u32 = 10_000;
/// Time given to the host to reconfigure before the greeting
const HOST_READY_US: u32 = 50_000;

/// Parameters the loader places in front of the stub image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StubParams {
    /// Baud rate the ROM loader is talking at
    pub old_baud: u32,
    /// Baud rate to switch to, 0 to keep the current one
    pub new_baud: u32,
}

impl StubParams {
    /// Decode the two parameter words written by the loader
    pub const fn from_loader(words: &[u32; 2]) -> Self {
        Self {
            old_baud: words[0],
            new_baud: words[1],
        }
    }
}

/// The flashing stub
///
/// Owns the collaborators and the flash write session for as long as the
/// stub runs.
pub struct Stub<F, U, S> {
    flash: F,
    uart: U,
    system: S,
    session: FlashSession,
}

impl<F: FlashRom, U: Uart, S: System> Stub<F, U, S> {
    /// Create a stub around the board collaborators
    pub fn new(flash: F, uart: U, system: S) -> Self {
        Self {
            flash,
            uart,
            system,
            session: FlashSession::new(),
        }
    }

    /// Flash collaborator
    pub fn flash(&self) -> &F {
        &self.flash
    }

    /// UART collaborator
    pub fn uart(&self) -> &U {
        &self.uart
    }

    /// Mutable UART collaborator
    pub fn uart_mut(&mut self) -> &mut U {
        &mut self.uart
    }

    /// System collaborator
    pub fn system(&self) -> &S {
        &self.system
    }

    /// Full stub lifetime: configure, greet, serve commands, then leave
    ///
    /// The greeting frame carries the UART divider in effect before the
    /// baud rate switch, or 0 when the rate was kept. Returns the terminal
    /// opcode once the platform has been told to resume the firmware or
    /// reset, which on real hardware does not come back.
    pub fn run(&mut self, params: StubParams) -> Opcode {
        self.flash.configure(&FlashGeometry::STUB);

        let mut old_div = 0;
        if params.new_baud > 0 {
            self.system.delay_us(SETTLE_US);
            old_div = self.system.set_baud_rate(params.old_baud, params.new_baud);
            log::debug!(
                "baud {} -> {}, old divider {}",
                params.old_baud,
                params.new_baud,
                old_div
            );
        }

        self.system.delay_us(HOST_READY_US);
        if let Err(e) = ops::send_packet(&mut self.uart, &u32::to_le_bytes(old_div)) {
            log::warn!("greeting not sent: {}", e);
        }

        let last = self.cmd_loop();

        self.system.delay_us(SETTLE_US);
        match last {
            Opcode::BootFirmware => self.system.resume_firmware(),
            _ => self.system.reset(),
        }
        last
    }

    /// Serve commands until boot firmware or reboot is received
    pub fn cmd_loop(&mut self) -> Opcode {
        loop {
            if let Some(op) = self.poll_command() {
                return op;
            }
        }
    }

    /// Serve a single command
    ///
    /// Returns the opcode if it was terminal. A missing or malformed opcode
    /// frame is skipped without a reply.
    pub fn poll_command(&mut self) -> Option<Opcode> {
        // Re-sync in case the previous command left bytes behind
        self.uart.reset_rx_fifo();

        // The spare byte tells a one-byte frame from a longer truncated one
        let mut frame: Vec<u8, 2> = Vec::new();
        match slip::recv_frame(&mut self.uart, &mut frame) {
            Ok(1) => {}
            Ok(_) => {
                log::trace!("ignoring malformed command frame");
                return None;
            }
            Err(e) => {
                log::trace!("command frame: {:?}", e);
                return None;
            }
        }

        let status = match Opcode::try_from(frame[0]) {
            Ok(op) if op.is_terminal() => {
                log::debug!("{:?}", op);
                self.send_status(0);
                return Some(op);
            }
            Ok(op) => match self.execute(op) {
                Ok(()) => 0,
                Err(e) => {
                    log::debug!("{:?} failed: {}", op, e);
                    e.status()
                }
            },
            Err(e) => {
                log::debug!("{}", e);
                e.status()
            }
        };
        self.send_status(status);
        None
    }

    fn execute(&mut self, op: Opcode) -> Result<()> {
        match op {
            Opcode::FlashWrite => {
                let args: FlashWriteArgs = parse_args(&self.recv_args(), Error::WriteArgs)?;
                ops::flash_write(
                    &mut self.flash,
                    &mut self.uart,
                    &self.system,
                    &mut self.session,
                    &args,
                )
            }
            Opcode::FlashRead => {
                let args: FlashReadArgs = parse_args(&self.recv_args(), Error::ReadArgs)?;
                ops::flash_read(&mut self.flash, &mut self.uart, &args)
            }
            Opcode::FlashDigest => {
                let args: FlashDigestArgs = parse_args(&self.recv_args(), Error::DigestArgs)?;
                ops::flash_digest(&mut self.flash, &mut self.uart, &args)
            }
            Opcode::FlashReadChipId => ops::read_chip_id(&mut self.flash, &mut self.uart),
            Opcode::FlashEraseChip => ops::erase_chip(&mut self.flash),
            Opcode::Echo => {
                let args = self.recv_args();
                ops::echo(&mut self.uart, &args[..args.len().min(MAX_ARGS_LEN)])
            }
            Opcode::ReadReg => {
                let args: ReadRegArgs = parse_args(&self.recv_args(), Error::ReadRegArgs)?;
                ops::read_reg(&mut self.system, &mut self.uart, &args)
            }
            Opcode::WriteReg => {
                let args: WriteRegArgs = parse_args(&self.recv_args(), Error::WriteRegArgs)?;
                ops::write_reg(&mut self.system, &args);
                Ok(())
            }
            Opcode::BootFirmware | Opcode::Reboot => Ok(()),
        }
    }

    /// Receive an argument frame; a framing error reads as no arguments
    ///
    /// A frame longer than [`MAX_ARGS_LEN`] comes back with
    /// `MAX_ARGS_LEN + 1` bytes, which no argument vector accepts.
    fn recv_args(&mut self) -> Vec<u8, ARGS_BUF_LEN> {
        let mut args = Vec::new();
        if let Err(e) = slip::recv_frame(&mut self.uart, &mut args) {
            log::trace!("argument frame: {:?}", e);
            args.clear();
        }
        args
    }

    fn send_status(&mut self, status: u8) {
        if let Err(e) = ops::send_packet(&mut self.uart, &[status]) {
            log::warn!("status 0x{:02X} not sent: {}", status, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{Chip, Clock, Registers, RomResult};
    use crate::rx::RxAssembler;
    use core::convert::Infallible;
    use std::collections::VecDeque;
    use std::vec::Vec as StdVec;

    #[derive(Default)]
    struct CountingFlash {
        calls: usize,
        geometry: Option<FlashGeometry>,
    }

    impl FlashRom for CountingFlash {
        fn configure(&mut self, geometry: &FlashGeometry) {
            self.geometry = Some(*geometry);
        }
        fn unlock(&mut self) -> RomResult {
            self.calls += 1;
            Ok(())
        }
        fn erase_sector(&mut self, _addr: u32) -> RomResult {
            self.calls += 1;
            Ok(())
        }
        fn erase_block(&mut self, _addr: u32) -> RomResult {
            self.calls += 1;
            Ok(())
        }
        fn erase_chip(&mut self) -> RomResult {
            self.calls += 1;
            Err(crate::platform::RomError(2))
        }
        fn write(&mut self, _addr: u32, _data: &[u8]) -> RomResult {
            self.calls += 1;
            Ok(())
        }
        fn read(&mut self, _addr: u32, _buf: &mut [u8]) -> RomResult {
            self.calls += 1;
            Ok(())
        }
        fn read_chip_id(&mut self) -> RomResult<u32> {
            self.calls += 1;
            Ok(0xAB_C8_40_18)
        }
    }

    #[derive(Default)]
    struct ScriptUart {
        rx: VecDeque<u8>,
        tx: StdVec<u8>,
        resets: usize,
    }

    impl ScriptUart {
        fn frame(&mut self, payload: &[u8]) {
            let mut wire = StdVec::new();
            slip::encode(&mut wire, payload).unwrap();
            self.rx.extend(wire);
        }

        fn replies(&self) -> StdVec<StdVec<u8>> {
            let mut src = &self.tx[..];
            let mut out = StdVec::new();
            while !src.is_empty() {
                let mut buf: Vec<u8, 64> = Vec::new();
                slip::recv_frame(&mut src, &mut buf).unwrap();
                out.push(buf.to_vec());
            }
            out
        }
    }

    impl embedded_io::ErrorType for ScriptUart {
        type Error = Infallible;
    }

    impl embedded_io::Read for ScriptUart {
        fn read(&mut self, buf: &mut [u8]) -> core::result::Result<usize, Infallible> {
            match self.rx.pop_front() {
                Some(b) if !buf.is_empty() => {
                    buf[0] = b;
                    Ok(1)
                }
                _ => Ok(0),
            }
        }
    }

    impl embedded_io::Write for ScriptUart {
        fn write(&mut self, buf: &[u8]) -> core::result::Result<usize, Infallible> {
            self.tx.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> core::result::Result<(), Infallible> {
            Ok(())
        }
    }

    impl Uart for ScriptUart {
        fn reset_rx_fifo(&mut self) {
            self.resets += 1;
        }

        fn with_rx_interrupt<const N: usize, const CAP: usize, R>(
            &mut self,
            _rx: &mut RxAssembler<'_, N, CAP>,
            f: impl FnOnce(&mut Self) -> R,
        ) -> R {
            f(self)
        }
    }

    #[derive(Default)]
    struct FakeSystem {
        regs: std::collections::BTreeMap<u32, u32>,
        delays: StdVec<u32>,
        baud: Option<(u32, u32)>,
        resumed: bool,
        reset: bool,
    }

    impl Registers for FakeSystem {
        unsafe fn read(&mut self, addr: u32) -> u32 {
            self.regs.get(&addr).copied().unwrap_or(0)
        }
        unsafe fn write(&mut self, addr: u32, value: u32) {
            self.regs.insert(addr, value);
        }
    }

    impl Clock for FakeSystem {
        fn cycles(&self) -> u32 {
            0
        }
        fn delay_us(&mut self, us: u32) {
            self.delays.push(us);
        }
    }

    impl Chip for FakeSystem {
        fn set_baud_rate(&mut self, old_baud: u32, new_baud: u32) -> u32 {
            self.baud = Some((old_baud, new_baud));
            80_000_000 / old_baud
        }
        fn resume_firmware(&mut self) {
            self.resumed = true;
        }
        fn reset(&mut self) {
            self.reset = true;
        }
    }

    type TestStub = Stub<CountingFlash, ScriptUart, FakeSystem>;

    fn stub() -> std::boxed::Box<TestStub> {
        std::boxed::Box::new(Stub::new(
            CountingFlash::default(),
            ScriptUart::default(),
            FakeSystem::default(),
        ))
    }

    #[test]
    fn test_unknown_opcode() {
        let mut stub = stub();
        stub.uart_mut().frame(&[0x42]);
        assert_eq!(stub.poll_command(), None);
        assert_eq!(stub.uart().replies(), [[0xFF]]);
    }

    #[test]
    fn test_malformed_opcode_frames_skipped() {
        let mut stub = stub();
        stub.uart_mut().frame(&[]);
        stub.uart_mut().rx.extend([slip::END, slip::ESC, 0x01, slip::END]);
        stub.uart_mut().frame(&[Opcode::Reboot as u8]);
        assert_eq!(stub.cmd_loop(), Opcode::Reboot);
        assert_eq!(stub.uart().replies(), [[0]]);
        assert_eq!(stub.uart().resets, 3);
    }

    #[test]
    fn test_long_opcode_frames_skipped() {
        let mut stub = stub();
        stub.uart_mut().frame(&[Opcode::Reboot as u8, 0]);
        // A stray compressed data packet after an aborted write
        stub.uart_mut().frame(&[0x01, 0x78, 0x9C, 0x03, 0x00]);
        assert_eq!(stub.poll_command(), None);
        assert_eq!(stub.poll_command(), None);
        assert!(stub.uart().tx.is_empty());
        assert_eq!(stub.flash().calls, 0);

        stub.uart_mut().frame(&[Opcode::BootFirmware as u8]);
        assert_eq!(stub.cmd_loop(), Opcode::BootFirmware);
        assert_eq!(stub.uart().replies(), [[0]]);
    }

    #[test]
    fn test_long_args_are_shape_errors() {
        let cases = [
            (Opcode::FlashWrite, 13, 0x41),
            (Opcode::FlashRead, 20, 0x51),
            (Opcode::FlashDigest, 17, 0x61),
            (Opcode::ReadReg, 5, 0x91),
            (Opcode::WriteReg, 9, 0xA1),
        ];
        for (op, len, status) in cases {
            let mut stub = stub();
            stub.uart_mut().frame(&[op as u8]);
            stub.uart_mut().frame(&std::vec![0; len]);
            stub.poll_command();
            assert_eq!(stub.uart().replies(), [[status]], "{:?}", op);
            assert_eq!(stub.flash().calls, 0, "{:?}", op);
        }
    }

    #[test]
    fn test_short_write_args() {
        let mut stub = stub();
        stub.uart_mut().frame(&[Opcode::FlashWrite as u8]);
        stub.uart_mut().frame(&[0; 8]);
        stub.poll_command();
        assert_eq!(stub.uart().replies(), [[0x41]]);
        assert_eq!(stub.flash().calls, 0);
    }

    #[test]
    fn test_shape_errors_per_family() {
        let cases = [
            (Opcode::FlashRead, 12, 0x51),
            (Opcode::FlashDigest, 16, 0x61),
            (Opcode::ReadReg, 8, 0x91),
            (Opcode::WriteReg, 4, 0xA1),
        ];
        for (op, len, status) in cases {
            let mut stub = stub();
            stub.uart_mut().frame(&[op as u8]);
            stub.uart_mut().frame(&std::vec![0; len]);
            stub.poll_command();
            assert_eq!(stub.uart().replies(), [[status]], "{:?}", op);
        }
    }

    #[test]
    fn test_echo_and_registers() {
        let mut stub = stub();
        stub.uart_mut().frame(&[Opcode::Echo as u8]);
        stub.uart_mut().frame(&[1, 2, slip::END, 4]);
        stub.poll_command();

        let mut write = StdVec::from(0x6000_0000u32.to_le_bytes());
        write.extend(0xDEAD_BEEFu32.to_le_bytes());
        stub.uart_mut().frame(&[Opcode::WriteReg as u8]);
        stub.uart_mut().frame(&write);
        stub.poll_command();

        stub.uart_mut().frame(&[Opcode::ReadReg as u8]);
        stub.uart_mut().frame(&0x6000_0000u32.to_le_bytes());
        stub.poll_command();

        let replies = stub.uart().replies();
        assert_eq!(replies.len(), 5);
        assert_eq!(replies[0], [1, 2, slip::END, 4]);
        assert_eq!(replies[1], [0]);
        assert_eq!(replies[2], [0]);
        assert_eq!(replies[3], 0xDEAD_BEEFu32.to_le_bytes());
        assert_eq!(replies[4], [0]);
    }

    #[test]
    fn test_echo_truncates_to_args_len() {
        let mut stub = stub();
        stub.uart_mut().frame(&[Opcode::Echo as u8]);
        stub.uart_mut().frame(&[7; 20]);
        stub.poll_command();
        assert_eq!(stub.uart().replies()[0], [7; MAX_ARGS_LEN]);
    }

    #[test]
    fn test_chip_id_and_erase_chip() {
        let mut stub = stub();
        stub.uart_mut().frame(&[Opcode::FlashReadChipId as u8]);
        stub.poll_command();
        stub.uart_mut().frame(&[Opcode::FlashEraseChip as u8]);
        stub.poll_command();
        let replies = stub.uart().replies();
        assert_eq!(replies[0], 0x00C8_4018u32.to_le_bytes());
        assert_eq!(replies[1], [0]);
        // ROM result code forwarded verbatim
        assert_eq!(replies[2], [2]);
    }

    #[test]
    fn test_run_switches_baud_and_boots() {
        let mut stub = stub();
        stub.uart_mut().frame(&[Opcode::BootFirmware as u8]);
        let last = stub.run(StubParams::from_loader(&[115_200, 921_600]));
        assert_eq!(last, Opcode::BootFirmware);

        let replies = stub.uart().replies();
        assert_eq!(replies[0], (80_000_000u32 / 115_200).to_le_bytes());
        assert_eq!(replies[1], [0]);
        let system = stub.system();
        assert_eq!(system.baud, Some((115_200, 921_600)));
        assert_eq!(system.delays, [SETTLE_US, HOST_READY_US, SETTLE_US]);
        assert!(system.resumed && !system.reset);
        assert_eq!(stub.flash().geometry, Some(FlashGeometry::STUB));
    }

    #[test]
    fn test_run_keeps_baud_and_reboots() {
        let mut stub = stub();
        stub.uart_mut().frame(&[Opcode::Reboot as u8]);
        assert_eq!(stub.run(StubParams::default()), Opcode::Reboot);
        assert_eq!(stub.uart().replies()[0], [0, 0, 0, 0]);
        let system = stub.system();
        assert_eq!(system.baud, None);
        assert_eq!(system.delays, [HOST_READY_US, SETTLE_US]);
        assert!(system.reset && !system.resumed);
    }
}
