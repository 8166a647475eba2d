//! Scripted UART with a threaded receive interrupt
//!
//! The host side is a script: frames queued with [`LoopbackUart::host_send`]
//! are read by the stub's polled receive path, bytes queued with
//! [`LoopbackUart::host_stream`] are delivered through the receive
//! interrupt during the next flash write. While a flash write runs, a
//! scoped thread plays the interrupt and feeds the streamed bytes to the
//! receive assembler concurrently with the write pipeline.
//!
//! By default the feeder paces itself like a host tool, from nothing but the
//! progress records the stub sends back: a packet goes out only while the
//! packets not yet reported as written fit the ring, at most `N` packets and
//! `N * CAP` payload bytes. [`Pacing::Flood`] pushes bytes as fast as it can,
//! which can overrun the ring.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::vec::Vec;

use stubflash_core::platform::Uart;
use stubflash_core::rx::{RxAssembler, RxStatus};
use stubflash_core::slip::{Decoded, SlipDecoder};

/// How the scripted host paces streamed packets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Pacing {
    /// Wait for progress records so the packets in flight fit the ring
    #[default]
    Progress,
    /// Send everything at once
    Flood,
}

/// Sets the flag when dropped, so the feeder stops even if the pipeline
/// panics
struct StopOnDrop<'a>(&'a AtomicBool);

impl Drop for StopOnDrop<'_> {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

/// What the host has learned from the stub during one flash write
#[derive(Debug, Default)]
struct HostView {
    /// Progress records received
    reported: AtomicUsize,
    /// Largest payload in flight when a packet went out
    peak_in_flight: AtomicUsize,
}

/// Loopback UART driven by a host script
#[derive(Debug)]
pub struct LoopbackUart {
    rx: VecDeque<u8>,
    irq_rx: VecDeque<u8>,
    tx: Vec<u8>,
    pacing: Pacing,
    fifo_resets: usize,
    interrupt_sessions: usize,
    armed: bool,
    discarded: usize,
    feeder_done: Arc<AtomicBool>,
    idle_waits: usize,
    reply: SlipDecoder,
    reply_buf: Vec<u8>,
    view: Arc<HostView>,
}

impl LoopbackUart {
    /// Create an idle UART pacing from progress records
    pub fn new() -> Self {
        Self {
            rx: VecDeque::new(),
            irq_rx: VecDeque::new(),
            tx: Vec::new(),
            pacing: Pacing::default(),
            fifo_resets: 0,
            interrupt_sessions: 0,
            armed: false,
            discarded: 0,
            feeder_done: Arc::new(AtomicBool::new(false)),
            idle_waits: 0,
            reply: SlipDecoder::new(),
            reply_buf: Vec::new(),
            view: Arc::new(HostView::default()),
        }
    }

    /// Change how streamed packets are paced
    pub fn set_pacing(&mut self, pacing: Pacing) {
        self.pacing = pacing;
    }

    /// Queue raw bytes for the polled receive path
    pub fn host_send(&mut self, bytes: &[u8]) {
        self.rx.extend(bytes);
    }

    /// Queue raw bytes for the receive interrupt
    pub fn host_stream(&mut self, bytes: &[u8]) {
        self.irq_rx.extend(bytes);
    }

    /// Everything the stub has transmitted so far
    pub fn sent(&self) -> &[u8] {
        &self.tx
    }

    /// Take everything the stub has transmitted so far
    pub fn take_sent(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.tx)
    }

    /// Decode and take every frame the stub has transmitted so far
    pub fn take_frames(&mut self) -> Vec<Vec<u8>> {
        crate::host::decode_frames(&self.take_sent())
    }

    /// Bytes still waiting on the polled path
    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    /// Number of receive FIFO resets
    pub fn fifo_resets(&self) -> usize {
        self.fifo_resets
    }

    /// Number of times the receive interrupt was armed
    pub fn interrupt_sessions(&self) -> usize {
        self.interrupt_sessions
    }

    /// True while the receive interrupt is armed
    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Streamed bytes dropped because reception had stopped
    pub fn discarded(&self) -> usize {
        self.discarded
    }

    /// Progress records seen during the last flash write
    pub fn progress_reports(&self) -> usize {
        self.view.reported.load(Ordering::Acquire)
    }

    /// Most payload bytes the paced host had in flight during the last
    /// flash write
    pub fn peak_in_flight(&self) -> usize {
        self.view.peak_in_flight.load(Ordering::Acquire)
    }

    /// Follow the stub's output the way the host reads it
    fn watch_reply(&mut self, byte: u8) {
        match self.reply.feed(byte) {
            Decoded::Start => self.reply_buf.clear(),
            Decoded::Byte(b) => self.reply_buf.push(b),
            Decoded::End => {
                if crate::host::progress(&self.reply_buf).is_some() {
                    self.view.reported.fetch_add(1, Ordering::AcqRel);
                }
            }
            Decoded::Nothing | Decoded::Error => {}
        }
    }
}

impl Default for LoopbackUart {
    fn default() -> Self {
        Self::new()
    }
}

impl embedded_io::ErrorType for LoopbackUart {
    type Error = Infallible;
}

impl embedded_io::Read for LoopbackUart {
    /// # Panics
    ///
    /// Panics when the script is exhausted, since a real stub would wait
    /// forever.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Infallible> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.rx.is_empty() {
            panic!("loopback: stub reads past the end of the host script");
        }
        let n = buf.len().min(self.rx.len());
        for (dst, src) in buf.iter_mut().zip(self.rx.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }
}

impl embedded_io::Write for LoopbackUart {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Infallible> {
        self.tx.extend_from_slice(buf);
        if self.armed {
            for &b in buf {
                self.watch_reply(b);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Infallible> {
        Ok(())
    }
}

impl Uart for LoopbackUart {
    fn reset_rx_fifo(&mut self) {
        // The script models bytes the host has yet to send, so there is
        // nothing in the FIFO to drop
        self.fifo_resets += 1;
    }

    /// # Panics
    ///
    /// Panics if the pipeline keeps waiting after the feeder has delivered
    /// every streamed byte.
    fn wait_for_rx(&mut self) {
        if self.feeder_done.load(Ordering::Acquire) {
            // One more look at the ring is allowed after the last byte
            self.idle_waits += 1;
            if self.idle_waits > 1 {
                panic!("loopback: stub waits for data the host never streams");
            }
        }
        thread::yield_now();
    }

    fn with_rx_interrupt<const N: usize, const CAP: usize, R>(
        &mut self,
        rx: &mut RxAssembler<'_, N, CAP>,
        f: impl FnOnce(&mut Self) -> R,
    ) -> R {
        let bytes: Vec<u8> = self.irq_rx.drain(..).collect();
        let stop = AtomicBool::new(false);
        let done = Arc::clone(&self.feeder_done);
        done.store(false, Ordering::Release);
        self.idle_waits = 0;
        self.interrupt_sessions += 1;
        self.armed = true;
        self.reply.reset();
        self.view = Arc::new(HostView::default());
        let view = Arc::clone(&self.view);
        let pacing = self.pacing;

        let (result, fed) = thread::scope(|s| {
            let feeder = s.spawn(|| {
                let fed = feed(rx, &bytes, &stop, pacing, &view);
                done.store(true, Ordering::Release);
                fed
            });
            let result = {
                let _stop = StopOnDrop(&stop);
                f(self)
            };
            let fed = match feeder.join() {
                Ok(fed) => fed,
                Err(panic) => std::panic::resume_unwind(panic),
            };
            (result, fed)
        });

        self.armed = false;
        self.discarded += bytes.len() - fed;
        if fed < bytes.len() {
            log::debug!("loopback: {} streamed bytes not delivered", bytes.len() - fed);
        }
        result
    }
}

/// Offset of the opening byte and payload length of every packet in a
/// stream, up to the first invalid escape
fn packets(bytes: &[u8]) -> Vec<(usize, usize)> {
    let mut decoder = SlipDecoder::new();
    let mut out = Vec::new();
    let mut start = 0;
    let mut decoded = 0usize;
    for (i, &b) in bytes.iter().enumerate() {
        match decoder.feed(b) {
            Decoded::Start => {
                start = i;
                decoded = 0;
            }
            Decoded::Byte(_) => decoded += 1,
            // The first decoded byte is the flag byte
            Decoded::End => out.push((start, decoded.saturating_sub(1))),
            Decoded::Error => break,
            Decoded::Nothing => {}
        }
    }
    out
}

/// Deliver `bytes` to the assembler, returning how many were consumed
fn feed<const N: usize, const CAP: usize>(
    rx: &mut RxAssembler<'_, N, CAP>,
    bytes: &[u8],
    stop: &AtomicBool,
    pacing: Pacing,
    view: &HostView,
) -> usize {
    let packets = match pacing {
        Pacing::Progress => packets(bytes),
        Pacing::Flood => Vec::new(),
    };
    let mut next = 0;

    for (i, &byte) in bytes.iter().enumerate() {
        if stop.load(Ordering::Acquire) {
            return i;
        }
        if packets.get(next).is_some_and(|&(start, _)| start == i) {
            loop {
                let written = view.reported.load(Ordering::Acquire).min(next);
                let in_flight = &packets[written..=next];
                let payload: usize = in_flight.iter().map(|&(_, len)| len).sum();
                if in_flight.len() <= N && payload <= N * CAP {
                    view.peak_in_flight.fetch_max(payload, Ordering::AcqRel);
                    break;
                }
                if stop.load(Ordering::Acquire) {
                    return i;
                }
                thread::yield_now();
            }
            next += 1;
        }
        if rx.feed(byte) == RxStatus::Halted {
            return i + 1;
        }
    }
    bytes.len()
}
