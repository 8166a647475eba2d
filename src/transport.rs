//! Host wire for the emulator
//!
//! The emulated stub talks to a real host tool over a serial port or a TCP
//! socket. Polled reads block until the host sends something. While a flash
//! write runs, a reader thread plays the receive interrupt and feeds every
//! byte from the wire to the receive assembler.

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use thiserror::Error;

use stubflash_core::platform::Uart;
use stubflash_core::rx::{RxAssembler, RxStatus};
use stubflash_core::slip;

/// Serial read timeout on the polled path; reads are retried
const IDLE_TIMEOUT: Duration = Duration::from_secs(1);
/// How long the interrupt thread blocks before looking at the stop flag
const IRQ_POLL: Duration = Duration::from_millis(20);
/// Idle hint while the pipeline waits for a packet
const WAIT_HINT: Duration = Duration::from_micros(100);

/// Wire errors
#[derive(Debug, Error)]
pub enum WireError {
    /// I/O error on the socket or port
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),
}

/// Result type for wire operations
pub type Result<T> = std::result::Result<T, WireError>;

fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

enum Link {
    Serial(Box<dyn SerialPort>),
    Tcp {
        listener: TcpListener,
        stream: TcpStream,
    },
}

impl Link {
    /// Second handle on the same wire, for the interrupt thread
    fn rx_handle(&self) -> io::Result<Box<dyn Read + Send>> {
        match self {
            Link::Serial(port) => {
                let mut port = port.try_clone()?;
                port.set_timeout(IRQ_POLL)?;
                Ok(Box::new(port))
            }
            Link::Tcp { stream, .. } => {
                let stream = stream.try_clone()?;
                stream.set_read_timeout(Some(IRQ_POLL))?;
                Ok(Box::new(stream))
            }
        }
    }

    /// Undo what `rx_handle` changed on the shared wire
    fn restore(&mut self) -> io::Result<()> {
        match self {
            // The timeout belongs to the cloned handle
            Link::Serial(_) => Ok(()),
            Link::Tcp { stream, .. } => stream.set_read_timeout(None),
        }
    }

    /// Replace a closed TCP connection with the next one
    ///
    /// Returns false when the wire cannot come back.
    fn reconnect(&mut self) -> io::Result<bool> {
        match self {
            Link::Serial(_) => Ok(false),
            Link::Tcp { listener, stream } => {
                log::info!("Host disconnected, waiting for the next connection");
                *stream = accept(listener)?;
                Ok(true)
            }
        }
    }
}

impl Read for Link {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Link::Serial(port) => port.read(buf),
            Link::Tcp { stream, .. } => stream.read(buf),
        }
    }
}

impl Write for Link {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Link::Serial(port) => port.write(buf),
            Link::Tcp { stream, .. } => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Link::Serial(port) => port.flush(),
            Link::Tcp { stream, .. } => stream.flush(),
        }
    }
}

fn accept(listener: &TcpListener) -> io::Result<TcpStream> {
    let (stream, peer) = listener.accept()?;
    // Set TCP_NODELAY to keep small status frames from lingering
    stream.set_nodelay(true)?;
    log::info!("Host connected from {}", peer);
    Ok(stream)
}

/// Changes the baud rate of a serial wire from the chip side
pub struct BaudControl {
    port: Box<dyn SerialPort>,
}

impl BaudControl {
    /// Switch the port to `baud`
    pub fn set(&mut self, baud: u32) -> Result<()> {
        self.port.set_baud_rate(baud)?;
        log::info!("Serial port now at {} baud", baud);
        Ok(())
    }
}

/// The stub's UART, backed by a host-side serial port or TCP socket
pub struct WireUart {
    link: Link,
    baud: u32,
}

impl WireUart {
    /// Open a serial port with the specified baud rate
    pub fn open_serial(device: &str, baud: u32) -> Result<Self> {
        let port = serialport::new(device, baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(IDLE_TIMEOUT)
            .open()?;

        log::info!("Opened serial port {} at {} baud", device, baud);

        Ok(Self {
            link: Link::Serial(port),
            baud,
        })
    }

    /// Bind `addr` and wait for the host to connect
    ///
    /// A TCP wire has no baud rate; the stub still reports the loader rate
    /// in its greeting so the host sees the usual handshake.
    pub fn listen(addr: &str, baud: u32) -> Result<Self> {
        let listener = TcpListener::bind(addr)?;
        log::info!("Waiting for host on {}", listener.local_addr()?);
        let stream = accept(&listener)?;
        Ok(Self {
            link: Link::Tcp { listener, stream },
            baud,
        })
    }

    /// Baud rate the wire was opened at
    pub fn baud(&self) -> u32 {
        self.baud
    }

    /// Handle for switching the baud rate, serial wires only
    pub fn baud_control(&self) -> Result<Option<BaudControl>> {
        match &self.link {
            Link::Serial(port) => Ok(Some(BaudControl {
                port: port.try_clone()?,
            })),
            Link::Tcp { .. } => Ok(None),
        }
    }
}

impl embedded_io::ErrorType for WireUart {
    type Error = io::Error;
}

impl embedded_io::Read for WireUart {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            match self.link.read(buf) {
                Ok(0) => {
                    if !self.link.reconnect()? {
                        return Ok(0);
                    }
                }
                Ok(n) => return Ok(n),
                Err(e) if is_timeout(&e) => {}
                Err(e) => return Err(e),
            }
        }
    }
}

impl embedded_io::Write for WireUart {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.link.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.link.flush()
    }
}

/// Sets the flag when dropped, so the interrupt thread stops even if the
/// pipeline panics
struct StopOnDrop<'a>(&'a AtomicBool);

impl Drop for StopOnDrop<'_> {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

impl Uart for WireUart {
    fn reset_rx_fifo(&mut self) {
        // Whatever the OS buffered was sent after our last reply, so it is
        // the host's next command and must be kept
        log::trace!("wire: rx fifo reset");
    }

    fn wait_for_rx(&mut self) {
        thread::sleep(WAIT_HINT);
    }

    fn with_rx_interrupt<const N: usize, const CAP: usize, R>(
        &mut self,
        rx: &mut RxAssembler<'_, N, CAP>,
        f: impl FnOnce(&mut Self) -> R,
    ) -> R {
        let handle = match self.link.rx_handle() {
            Ok(handle) => handle,
            Err(e) => {
                log::error!("wire: cannot arm receive: {}", e);
                halt(rx);
                return f(self);
            }
        };

        let stop = AtomicBool::new(false);
        let result = thread::scope(|s| {
            let irq = s.spawn(|| interrupt(handle, rx, &stop));
            let result = {
                let _stop = StopOnDrop(&stop);
                f(self)
            };
            if let Err(panic) = irq.join() {
                std::panic::resume_unwind(panic);
            }
            result
        });

        if let Err(e) = self.link.restore() {
            log::warn!("wire: cannot restore read timeout: {}", e);
        }
        result
    }
}

/// Receive interrupt: feed the wire to `rx` until halted or stopped
fn interrupt<const N: usize, const CAP: usize>(
    mut wire: Box<dyn Read + Send>,
    rx: &mut RxAssembler<'_, N, CAP>,
    stop: &AtomicBool,
) {
    let mut buf = [0u8; 256];
    while !stop.load(Ordering::Acquire) {
        match wire.read(&mut buf) {
            Ok(0) => {
                log::warn!("wire: host went away during a flash write");
                halt(rx);
                return;
            }
            Ok(n) => {
                if rx.feed_slice(&buf[..n]) == RxStatus::Halted {
                    log::debug!("wire: receive halted");
                    return;
                }
            }
            Err(e) if is_timeout(&e) => {}
            Err(e) => {
                log::error!("wire: receive failed: {}", e);
                halt(rx);
                return;
            }
        }
    }
}

/// Drive the assembler into its error state, as a host abort would
///
/// Closes any partial packet, then feeds an empty one. Three ENDs suffice
/// from every state.
fn halt<const N: usize, const CAP: usize>(rx: &mut RxAssembler<'_, N, CAP>) {
    for _ in 0..3 {
        if rx.feed(slip::END) == RxStatus::Halted {
            return;
        }
    }
}
