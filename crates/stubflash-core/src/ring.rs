//! Packet buffer ring shared between the receive interrupt and the main loop
//!
//! The ring is a fixed array of `N` slots of `CAP` bytes. The receive
//! interrupt assembles one packet at a time into the slot under the write
//! cursor and publishes it by advancing the cursor; the flash write pipeline
//! drains published slots from the read cursor.
//!
//! There are no locks. [`PacketRing::split`] hands out exactly one
//! [`RingProducer`] and one [`RingConsumer`], and each shared field has a
//! single writer:
//!
//! | Field | Writer | Reader |
//! |---|---|---|
//! | write cursor | producer | consumer |
//! | read cursor | consumer | producer |
//! | slot under the write cursor | producer | consumer (length only) |
//! | published slots | nobody until released | consumer |
//! | error latch | producer | consumer |
//!
//! A published slot is released by the consumer zeroing its length and then
//! advancing the read cursor, after which the producer may reuse it. Both
//! cursors wrap at `2 * N`, so all `N` slots can be published at once and the
//! ring holds up to `N * CAP` bytes. Once every slot is published the slot
//! under the write cursor is the one the consumer reads next; a byte arriving
//! before the consumer releases it is an overrun.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use crate::rx::PacketFlags;

struct Slot<const CAP: usize> {
    len: AtomicUsize,
    flags: AtomicU8,
    data: UnsafeCell<[u8; CAP]>,
}

impl<const CAP: usize> Slot<CAP> {
    const fn new() -> Self {
        Self {
            len: AtomicUsize::new(0),
            flags: AtomicU8::new(0),
            data: UnsafeCell::new([0; CAP]),
        }
    }
}

/// Fixed ring of packet buffers
pub struct PacketRing<const N: usize, const CAP: usize> {
    slots: [Slot<CAP>; N],
    write: AtomicUsize,
    read: AtomicUsize,
    error: AtomicBool,
}

// SAFETY: slot payloads are only accessed through the producer and consumer
// handles, which never touch the same slot's payload at the same time: the
// producer writes the slot under the write cursor only while fewer than `N`
// slots are published, the consumer reads only published slots, and
// ownership moves between them through Release/Acquire stores of the
// cursors.
unsafe impl<const N: usize, const CAP: usize> Sync for PacketRing<N, CAP> {}

/// Published slots between two cursors
#[inline]
const fn published<const N: usize>(write: usize, read: usize) -> usize {
    (write + 2 * N - read) % (2 * N)
}

impl<const N: usize, const CAP: usize> PacketRing<N, CAP> {
    /// Create an empty ring
    pub const fn new() -> Self {
        assert!(N >= 2, "ring needs at least two slots");
        Self {
            slots: [const { Slot::new() }; N],
            write: AtomicUsize::new(0),
            read: AtomicUsize::new(0),
            error: AtomicBool::new(false),
        }
    }

    /// Upper bound on the bytes the ring can hold at once
    pub const fn capacity(&self) -> usize {
        N * CAP
    }

    /// Return every slot, both cursors and the error latch to their
    /// initial state
    pub fn reset(&mut self) {
        for slot in &mut self.slots {
            *slot.len.get_mut() = 0;
            *slot.flags.get_mut() = 0;
        }
        *self.write.get_mut() = 0;
        *self.read.get_mut() = 0;
        *self.error.get_mut() = false;
    }

    /// Split into the producer and consumer halves
    ///
    /// The mutable borrow guarantees that only one pair exists at a time.
    pub fn split(&mut self) -> (RingProducer<'_, N, CAP>, RingConsumer<'_, N, CAP>) {
        let write = *self.write.get_mut();
        let read = *self.read.get_mut();
        let ring: &Self = self;
        (
            RingProducer { ring, write },
            RingConsumer { ring, read },
        )
    }
}

impl<const N: usize, const CAP: usize> Default for PacketRing<N, CAP> {
    fn default() -> Self {
        Self::new()
    }
}

/// The slot under the write cursor has not been released by the consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Overrun;

/// Write half of a [`PacketRing`], owned by the receive interrupt
pub struct RingProducer<'a, const N: usize, const CAP: usize> {
    ring: &'a PacketRing<N, CAP>,
    write: usize,
}

impl<const N: usize, const CAP: usize> RingProducer<'_, N, CAP> {
    /// True while the slot under the write cursor is free for assembly
    #[inline]
    pub fn has_slot(&self) -> bool {
        published::<N>(self.write, self.ring.read.load(Ordering::Acquire)) < N
    }

    #[inline]
    fn slot(&self) -> Result<&Slot<CAP>, Overrun> {
        if self.has_slot() {
            Ok(&self.ring.slots[self.write % N])
        } else {
            Err(Overrun)
        }
    }

    /// Append a byte to the packet being assembled
    ///
    /// Bytes beyond the slot capacity are dropped.
    #[inline]
    pub fn push(&mut self, byte: u8) -> Result<(), Overrun> {
        let slot = self.slot()?;
        let len = slot.len.load(Ordering::Relaxed);
        if len < CAP {
            // SAFETY: fewer than `N` slots are published, so the slot under
            // the write cursor belongs to the producer until the cursor moves
            // past it; the consumer never reads its payload.
            unsafe { (&mut *slot.data.get())[len] = byte };
            slot.len.store(len + 1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Set the flag byte of the packet being assembled
    #[inline]
    pub fn set_flags(&mut self, flags: u8) -> Result<(), Overrun> {
        self.slot()?.flags.store(flags, Ordering::Relaxed);
        Ok(())
    }

    /// Publish the assembled packet and move on to the next slot
    ///
    /// The next slot is empty: it was either never used since the last
    /// reset or zeroed by the consumer's release.
    pub fn commit(&mut self) -> Result<(), Overrun> {
        self.slot()?;
        self.write = (self.write + 1) % (2 * N);
        self.ring.write.store(self.write, Ordering::Release);
        Ok(())
    }

    /// Latch the error state observed by the consumer
    pub fn latch_error(&mut self) {
        self.ring.error.store(true, Ordering::Release);
    }
}

/// A published packet borrowed from the ring
#[derive(Debug, Clone, Copy)]
pub struct Packet<'a> {
    /// Flag byte sent ahead of the payload
    pub flags: PacketFlags,
    /// Payload bytes
    pub data: &'a [u8],
}

/// Read half of a [`PacketRing`], owned by the main loop
pub struct RingConsumer<'a, const N: usize, const CAP: usize> {
    ring: &'a PacketRing<N, CAP>,
    read: usize,
}

impl<const N: usize, const CAP: usize> RingConsumer<'_, N, CAP> {
    /// True when no published packet is waiting
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ring.write.load(Ordering::Acquire) == self.read
    }

    /// True once the producer has latched an error
    #[inline]
    pub fn error_latched(&self) -> bool {
        self.ring.error.load(Ordering::Acquire)
    }

    /// Oldest published packet, if any
    pub fn peek(&self) -> Option<Packet<'_>> {
        if self.is_empty() {
            return None;
        }
        let slot = &self.ring.slots[self.read % N];
        let len = slot.len.load(Ordering::Relaxed);
        // SAFETY: the slot is published by the producer's Release store
        // observed in `is_empty`, and the producer will not touch it again
        // until `release` advances the read cursor.
        let data = unsafe { &(&*slot.data.get())[..len] };
        Some(Packet {
            flags: PacketFlags::from_bits_retain(slot.flags.load(Ordering::Relaxed)),
            data,
        })
    }

    /// Hand the oldest published slot back to the producer
    pub fn release(&mut self) {
        if self.is_empty() {
            return;
        }
        let slot = &self.ring.slots[self.read % N];
        slot.len.store(0, Ordering::Relaxed);
        slot.flags.store(0, Ordering::Relaxed);
        self.read = (self.read + 1) % (2 * N);
        self.ring.read.store(self.read, Ordering::Release);
    }

    /// Bytes currently held across all slots, including the one being
    /// assembled
    pub fn occupancy(&self) -> usize {
        self.ring
            .slots
            .iter()
            .map(|slot| slot.len.load(Ordering::Relaxed))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec::Vec;

    fn fill<const N: usize, const CAP: usize>(p: &mut RingProducer<'_, N, CAP>, bytes: &[u8]) {
        for &b in bytes {
            p.push(b).unwrap();
        }
    }

    #[test]
    fn test_fifo_order() {
        let mut ring: PacketRing<4, 8> = PacketRing::new();
        let (mut p, mut c) = ring.split();
        assert!(c.peek().is_none());

        fill(&mut p, &[1, 2]);
        p.set_flags(1).unwrap();
        p.commit().unwrap();
        fill(&mut p, &[3]);
        p.commit().unwrap();

        let pkt = c.peek().unwrap();
        assert_eq!(pkt.data, &[1, 2]);
        assert!(pkt.flags.contains(PacketFlags::COMPRESSED));
        c.release();
        let pkt = c.peek().unwrap();
        assert_eq!(pkt.data, &[3]);
        assert!(pkt.flags.is_empty());
        c.release();
        assert!(c.is_empty());
    }

    #[test]
    fn test_truncates_at_capacity() {
        let mut ring: PacketRing<4, 8> = PacketRing::new();
        let (mut p, c) = ring.split();
        fill(&mut p, &[0xAA; 20]);
        p.commit().unwrap();
        assert_eq!(c.peek().unwrap().data, &[0xAA; 8]);
    }

    #[test]
    fn test_every_slot_can_be_published() {
        let mut ring: PacketRing<4, 8> = PacketRing::new();
        let capacity = ring.capacity();
        let (mut p, mut c) = ring.split();

        // The consumer starts on the first packet before the rest arrive
        fill(&mut p, &[0; 8]);
        p.commit().unwrap();
        assert_eq!(c.peek().unwrap().data, &[0; 8]);
        for i in 1..4 {
            fill(&mut p, &[i; 8]);
            p.commit().unwrap();
        }
        assert_eq!(c.occupancy(), capacity);
        assert!(!p.has_slot());

        c.release();
        assert!(p.has_slot());
        fill(&mut p, &[4; 8]);
        p.commit().unwrap();

        let mut seen = Vec::new();
        while let Some(pkt) = c.peek() {
            seen.push(pkt.data[0]);
            c.release();
        }
        assert_eq!(seen, [1, 2, 3, 4]);
        assert_eq!(c.occupancy(), 0);
    }

    #[test]
    fn test_overrun_detected() {
        let mut ring: PacketRing<4, 8> = PacketRing::new();
        let (mut p, mut c) = ring.split();
        for i in 0..4 {
            fill(&mut p, &[i]);
            p.commit().unwrap();
        }
        assert_eq!(p.set_flags(0), Err(Overrun));
        assert_eq!(p.push(9), Err(Overrun));
        assert_eq!(p.commit(), Err(Overrun));

        // Published slots are untouched
        let pkt = c.peek().unwrap();
        assert_eq!(pkt.data, &[0]);
        assert!(pkt.flags.is_empty());
        c.release();
        fill(&mut p, &[9]);
        p.commit().unwrap();
        let mut seen = Vec::new();
        while let Some(pkt) = c.peek() {
            seen.push(pkt.data[0]);
            c.release();
        }
        assert_eq!(seen, [1, 2, 3, 9]);
    }

    #[test]
    fn test_cursors_wrap() {
        let mut ring: PacketRing<2, 4> = PacketRing::new();
        let (mut p, mut c) = ring.split();
        for i in 0..11u8 {
            fill(&mut p, &[i, i]);
            p.commit().unwrap();
            if i % 2 == 1 {
                assert!(!p.has_slot());
                for j in [i - 1, i] {
                    assert_eq!(c.peek().unwrap().data, &[j, j]);
                    c.release();
                }
                assert!(c.is_empty());
            }
        }
        assert_eq!(c.peek().unwrap().data, &[10, 10]);
    }

    #[test]
    fn test_reset_clears_error() {
        let mut ring: PacketRing<4, 8> = PacketRing::new();
        {
            let (mut p, c) = ring.split();
            fill(&mut p, &[1]);
            p.commit().unwrap();
            p.latch_error();
            assert!(c.error_latched());
        }
        ring.reset();
        let (_, c) = ring.split();
        assert!(!c.error_latched());
        assert!(c.is_empty());
        assert_eq!(c.occupancy(), 0);
    }

    #[test]
    fn test_concurrent_producer() {
        let mut ring: PacketRing<4, 8> = PacketRing::new();
        let (mut p, mut c) = ring.split();
        std::thread::scope(|s| {
            s.spawn(move || {
                for i in 0..200u8 {
                    while !p.has_slot() {
                        std::thread::yield_now();
                    }
                    p.push(i).unwrap();
                    p.push(i.wrapping_mul(3)).unwrap();
                    p.commit().unwrap();
                }
            });
            for i in 0..200u8 {
                let pkt = loop {
                    if let Some(pkt) = c.peek() {
                        break pkt;
                    }
                    std::hint::spin_loop();
                };
                assert_eq!(pkt.data, &[i, i.wrapping_mul(3)]);
                c.release();
            }
        });
    }
}
