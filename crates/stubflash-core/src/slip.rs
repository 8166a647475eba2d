//! SLIP byte framing
//!
//! Every packet on the wire starts and ends with [`END`]. Inside a packet,
//! `END` and [`ESC`] are replaced by `ESC ESC_END` and `ESC ESC_ESC`.
//!
//! The decoder is a pure per-byte state machine with no buffering of its
//! own. It is shared by the polled receive path ([`recv_frame`]) and the
//! interrupt-driven [`RxAssembler`](crate::rx::RxAssembler).

use embedded_io::{Read, Write};
use heapless::Vec;

/// Frame delimiter
pub const END: u8 = 0xC0;
/// Escape introducer
pub const ESC: u8 = 0xDB;
/// Escaped `END`
pub const ESC_END: u8 = 0xDC;
/// Escaped `ESC`
pub const ESC_ESC: u8 = 0xDD;

/// Wire length of `payload` once framed, including both delimiters
pub fn encoded_len(payload: &[u8]) -> usize {
    2 + payload.len() + payload.iter().filter(|&&b| b == END || b == ESC).count()
}

/// Write `payload` as one complete frame
pub fn encode<W: Write>(w: &mut W, payload: &[u8]) -> Result<(), W::Error> {
    w.write_all(&[END])?;
    let mut rest = payload;
    while let Some(pos) = rest.iter().position(|&b| b == END || b == ESC) {
        w.write_all(&rest[..pos])?;
        let sub = if rest[pos] == END { ESC_END } else { ESC_ESC };
        w.write_all(&[ESC, sub])?;
        rest = &rest[pos + 1..];
    }
    w.write_all(rest)?;
    w.write_all(&[END])
}

/// Decoder state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecoderState {
    /// Outside a frame, waiting for `END`
    #[default]
    Idle,
    /// Inside a frame
    Frame,
    /// Previous byte was `ESC`
    Escape,
}

/// Output of one decoder step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoded {
    /// Byte consumed, nothing to report
    Nothing,
    /// A new frame was opened
    Start,
    /// A payload byte, already unescaped
    Byte(u8),
    /// The current frame was closed
    End,
    /// `ESC` followed by something other than `ESC_END`/`ESC_ESC`
    Error,
}

/// Advance the framing state machine by one raw byte
pub const fn step(state: DecoderState, byte: u8) -> (DecoderState, Decoded) {
    match state {
        DecoderState::Idle => match byte {
            END => (DecoderState::Frame, Decoded::Start),
            _ => (DecoderState::Idle, Decoded::Nothing),
        },
        DecoderState::Frame => match byte {
            END => (DecoderState::Idle, Decoded::End),
            ESC => (DecoderState::Escape, Decoded::Nothing),
            b => (DecoderState::Frame, Decoded::Byte(b)),
        },
        DecoderState::Escape => match byte {
            ESC_END => (DecoderState::Frame, Decoded::Byte(END)),
            ESC_ESC => (DecoderState::Frame, Decoded::Byte(ESC)),
            _ => (DecoderState::Idle, Decoded::Error),
        },
    }
}

/// Incremental SLIP decoder
#[derive(Debug, Clone, Default)]
pub struct SlipDecoder {
    state: DecoderState,
}

impl SlipDecoder {
    /// Create a decoder waiting for the start of a frame
    pub const fn new() -> Self {
        Self {
            state: DecoderState::Idle,
        }
    }

    /// Current state
    pub fn state(&self) -> DecoderState {
        self.state
    }

    /// Feed one raw byte
    #[inline]
    pub fn feed(&mut self, byte: u8) -> Decoded {
        let (next, out) = step(self.state, byte);
        self.state = next;
        out
    }

    /// Drop any partial frame and wait for the next `END`
    pub fn reset(&mut self) {
        self.state = DecoderState::Idle;
    }
}

/// Error from the polled receive path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvError<E> {
    /// Underlying UART read failed
    Io(E),
    /// UART reported end of input
    Eof,
    /// Frame contained an invalid escape sequence
    BadEscape,
}

impl<E> From<E> for RecvError<E> {
    fn from(e: E) -> Self {
        Self::Io(e)
    }
}

fn read_byte<R: Read>(r: &mut R) -> Result<u8, RecvError<R::Error>> {
    let mut byte = [0u8; 1];
    match r.read(&mut byte)? {
        0 => Err(RecvError::Eof),
        _ => Ok(byte[0]),
    }
}

/// Receive one frame by polling the UART
///
/// Skips bytes until a frame opens, then collects decoded bytes into `buf`
/// until the frame closes. Bytes that do not fit into `buf` are discarded,
/// so the returned length never exceeds `CAP`. On an invalid escape the rest
/// of the frame is drained before the error is returned, leaving the wire
/// positioned at a frame boundary.
pub fn recv_frame<R: Read, const CAP: usize>(
    r: &mut R,
    buf: &mut Vec<u8, CAP>,
) -> Result<usize, RecvError<R::Error>> {
    buf.clear();
    let mut decoder = SlipDecoder::new();
    loop {
        let byte = read_byte(r)?;
        match decoder.feed(byte) {
            Decoded::Nothing | Decoded::Start => {}
            Decoded::Byte(b) => {
                // Truncate silently, like an undersized receive buffer
                let _ = buf.push(b);
            }
            Decoded::End => return Ok(buf.len()),
            Decoded::Error => {
                // `ESC END` already closed the frame
                if byte != END {
                    while read_byte(r)? != END {}
                }
                return Err(RecvError::BadEscape);
            }
        }
    }
}
