//! Interrupt-driven receive assembler
//!
//! While a flash write is in progress the UART receive interrupt hands every
//! raw byte to [`RxAssembler::feed`]. The assembler runs the SLIP decoder,
//! stores the first decoded byte of each packet as its flag byte, appends the
//! rest to the ring slot under the write cursor and publishes the slot when
//! the packet closes.
//!
//! Three conditions latch the error state and stop reception:
//!
//! - an empty packet (the host's way of aborting a transfer),
//! - an invalid escape sequence,
//! - a byte arriving while every slot is published and the next one has not
//!   been released (ring overrun).
//!
//! The latch is sticky: once set, bytes are ignored until the ring and the
//! assembler are rebuilt for the next flash write.

use bitflags::bitflags;

use crate::ring::RingProducer;
use crate::slip::{Decoded, DecoderState, SlipDecoder};

bitflags! {
    /// Per-packet flag byte
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PacketFlags: u8 {
        /// Payload is a zlib stream
        const COMPRESSED = 1 << 0;
    }
}

/// Observable assembler state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxState {
    /// Waiting for a start byte
    WaitStart,
    /// Next decoded byte is the flag byte
    Flags,
    /// Collecting payload bytes
    Payload,
    /// Previous byte was an escape
    Escape,
    /// Error latched, reception stopped
    Error,
}

/// Whether the interrupt should keep the receive line enabled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxStatus {
    /// Keep receiving
    Armed,
    /// Error latched, mask the receive interrupt
    Halted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Flags,
    Payload,
}

/// Byte-at-a-time packet assembler feeding a [`RingProducer`]
pub struct RxAssembler<'a, const N: usize, const CAP: usize> {
    producer: RingProducer<'a, N, CAP>,
    decoder: SlipDecoder,
    phase: Phase,
    received: usize,
    halted: bool,
}

impl<'a, const N: usize, const CAP: usize> RxAssembler<'a, N, CAP> {
    /// Create an assembler waiting for the first packet
    pub fn new(producer: RingProducer<'a, N, CAP>) -> Self {
        Self {
            producer,
            decoder: SlipDecoder::new(),
            phase: Phase::Flags,
            received: 0,
            halted: false,
        }
    }

    /// Current state
    pub fn state(&self) -> RxState {
        if self.halted {
            return RxState::Error;
        }
        match (self.decoder.state(), self.phase) {
            (DecoderState::Idle, _) => RxState::WaitStart,
            (DecoderState::Escape, _) => RxState::Escape,
            (DecoderState::Frame, Phase::Flags) => RxState::Flags,
            (DecoderState::Frame, Phase::Payload) => RxState::Payload,
        }
    }

    /// True once the error state has been latched
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Process one raw byte from the UART
    ///
    /// Must not block; this is the body of the receive interrupt.
    pub fn feed(&mut self, byte: u8) -> RxStatus {
        if self.halted {
            return RxStatus::Halted;
        }
        match self.decoder.feed(byte) {
            Decoded::Nothing => {}
            Decoded::Start => {
                self.phase = Phase::Flags;
                self.received = 0;
            }
            Decoded::Byte(b) => match self.phase {
                Phase::Flags => {
                    if self.producer.set_flags(b).is_err() {
                        return self.halt();
                    }
                    self.phase = Phase::Payload;
                }
                Phase::Payload => {
                    if self.producer.push(b).is_err() {
                        return self.halt();
                    }
                    self.received += 1;
                }
            },
            Decoded::End => {
                // An empty packet is the host aborting the transfer
                if self.received == 0 || self.producer.commit().is_err() {
                    return self.halt();
                }
            }
            Decoded::Error => return self.halt(),
        }
        RxStatus::Armed
    }

    /// Feed a run of bytes, stopping early once halted
    pub fn feed_slice(&mut self, bytes: &[u8]) -> RxStatus {
        for &b in bytes {
            if self.feed(b) == RxStatus::Halted {
                return RxStatus::Halted;
            }
        }
        RxStatus::Armed
    }

    fn halt(&mut self) -> RxStatus {
        self.halted = true;
        self.producer.latch_error();
        RxStatus::Halted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::PacketRing;
    use crate::slip::{self, END, ESC, ESC_END};
    use std::vec::Vec;

    fn data_frame(flags: u8, payload: &[u8]) -> Vec<u8> {
        let mut body = Vec::with_capacity(payload.len() + 1);
        body.push(flags);
        body.extend_from_slice(payload);
        let mut wire = Vec::new();
        slip::encode(&mut wire, &body).unwrap();
        wire
    }

    #[test]
    fn test_packets_arrive_in_order() {
        let mut ring: PacketRing<4, 16> = PacketRing::new();
        let (p, mut c) = ring.split();
        let mut rx = RxAssembler::new(p);

        assert_eq!(rx.feed_slice(&data_frame(0, &[1, 2, 3])), RxStatus::Armed);
        assert_eq!(rx.feed_slice(&data_frame(1, &[END, ESC])), RxStatus::Armed);
        assert_eq!(rx.state(), RxState::WaitStart);

        let pkt = c.peek().unwrap();
        assert_eq!(pkt.data, &[1, 2, 3]);
        assert!(pkt.flags.is_empty());
        c.release();
        let pkt = c.peek().unwrap();
        assert_eq!(pkt.data, &[END, ESC]);
        assert_eq!(pkt.flags, PacketFlags::COMPRESSED);
    }

    #[test]
    fn test_state_transitions() {
        let mut ring: PacketRing<4, 16> = PacketRing::new();
        let (p, _c) = ring.split();
        let mut rx = RxAssembler::new(p);

        assert_eq!(rx.state(), RxState::WaitStart);
        rx.feed(0x55);
        assert_eq!(rx.state(), RxState::WaitStart);
        rx.feed(END);
        assert_eq!(rx.state(), RxState::Flags);
        rx.feed(0);
        assert_eq!(rx.state(), RxState::Payload);
        rx.feed(ESC);
        assert_eq!(rx.state(), RxState::Escape);
        rx.feed(ESC_END);
        assert_eq!(rx.state(), RxState::Payload);
        rx.feed(END);
        assert_eq!(rx.state(), RxState::WaitStart);
    }

    #[test]
    fn test_escaped_flag_byte() {
        let mut ring: PacketRing<4, 16> = PacketRing::new();
        let (p, c) = ring.split();
        let mut rx = RxAssembler::new(p);
        rx.feed_slice(&data_frame(END, &[7]));
        let pkt = c.peek().unwrap();
        assert_eq!(pkt.flags.bits(), END);
        assert_eq!(pkt.data, &[7]);
    }

    #[test]
    fn test_empty_packet_latches_error() {
        let mut ring: PacketRing<4, 16> = PacketRing::new();
        let (p, c) = ring.split();
        let mut rx = RxAssembler::new(p);

        rx.feed_slice(&data_frame(0, &[0xAB, 0xCD]));
        assert_eq!(rx.feed_slice(&[END, END]), RxStatus::Halted);
        assert_eq!(rx.state(), RxState::Error);
        assert!(c.error_latched());

        // Sticky, and the finished slot is intact
        assert_eq!(rx.feed_slice(&data_frame(0, &[1])), RxStatus::Halted);
        assert_eq!(c.peek().unwrap().data, &[0xAB, 0xCD]);
    }

    #[test]
    fn test_flags_only_packet_is_empty() {
        let mut ring: PacketRing<4, 16> = PacketRing::new();
        let (p, c) = ring.split();
        let mut rx = RxAssembler::new(p);
        assert_eq!(rx.feed_slice(&data_frame(0, &[])), RxStatus::Halted);
        assert!(c.error_latched());
        assert!(c.is_empty());
    }

    #[test]
    fn test_bad_escape_latches_error() {
        let mut ring: PacketRing<4, 16> = PacketRing::new();
        let (p, c) = ring.split();
        let mut rx = RxAssembler::new(p);
        assert_eq!(rx.feed_slice(&[END, 0, 1, ESC, 0x42]), RxStatus::Halted);
        assert!(c.error_latched());
        assert!(c.is_empty());
    }

    #[test]
    fn test_full_ring_accepts_every_slot() {
        let mut ring: PacketRing<2, 16> = PacketRing::new();
        let (p, mut c) = ring.split();
        let mut rx = RxAssembler::new(p);
        assert_eq!(rx.feed_slice(&data_frame(0, &[1; 16])), RxStatus::Armed);
        assert_eq!(rx.feed_slice(&data_frame(0, &[2; 16])), RxStatus::Armed);
        assert_eq!(c.occupancy(), 32);

        // The start byte of the next packet needs no slot yet
        assert_eq!(rx.feed(END), RxStatus::Armed);
        c.release();
        assert_eq!(rx.feed_slice(&data_frame(0, &[3])[1..]), RxStatus::Armed);
        assert_eq!(c.peek().unwrap().data, &[2; 16]);
        c.release();
        assert_eq!(c.peek().unwrap().data, &[3]);
        assert!(!c.error_latched());
    }

    #[test]
    fn test_overrun_latches_error() {
        let mut ring: PacketRing<2, 16> = PacketRing::new();
        let (p, c) = ring.split();
        let mut rx = RxAssembler::new(p);
        assert_eq!(rx.feed_slice(&data_frame(0, &[1])), RxStatus::Armed);
        assert_eq!(rx.feed_slice(&data_frame(0, &[2])), RxStatus::Armed);
        assert_eq!(rx.feed_slice(&data_frame(0, &[3])), RxStatus::Halted);
        assert_eq!(rx.state(), RxState::Error);
        assert!(c.error_latched());
        assert_eq!(c.peek().unwrap().data, &[1]);
    }

    #[test]
    fn test_chunked_delivery_matches() {
        let payloads: [&[u8]; 3] = [&[0xC0; 5], &[1, 2, 3, 4, 5, 6], &[0xDB, 0, 0xDB]];
        let mut wire = Vec::new();
        for p in payloads {
            wire.extend(data_frame(0, p));
        }
        for stride in 1..wire.len() {
            let mut ring: PacketRing<4, 16> = PacketRing::new();
            let (p, mut c) = ring.split();
            let mut rx = RxAssembler::new(p);
            for chunk in wire.chunks(stride) {
                rx.feed_slice(chunk);
            }
            for expected in payloads {
                assert_eq!(c.peek().unwrap().data, expected, "stride {}", stride);
                c.release();
            }
            assert!(c.is_empty());
        }
    }
}
