//! Flash write session state
//!
//! Everything a flash write needs besides the collaborators lives in one
//! [`FlashSession`]: the packet ring shared with the receive interrupt and
//! the decompression arena. The stub owns exactly one session and returns
//! it to its initial state at the start of every flash write, so nothing
//! leaks from one write into the next.

use miniz_oxide::inflate::core::inflate_flags::{
    TINFL_FLAG_PARSE_ZLIB_HEADER, TINFL_FLAG_USING_NON_WRAPPING_OUTPUT_BUF,
};
use miniz_oxide::inflate::core::{decompress, DecompressorOxide};
use miniz_oxide::inflate::TINFLStatus;

use crate::error::{Error, Result};
use crate::protocol::{BUF_SIZE, INFLATE_WINDOW, NUM_BUFS};
use crate::ring::PacketRing;

/// Ring type used by the flash write pipeline
pub type StubRing = PacketRing<NUM_BUFS, BUF_SIZE>;

/// One-shot zlib inflater writing into a fixed window
///
/// Every compressed packet is a complete zlib stream on its own, so the
/// decompressor is re-initialised per packet and the output never wraps.
pub struct Inflater {
    state: DecompressorOxide,
    window: [u8; INFLATE_WINDOW],
}

impl Inflater {
    /// Create an inflater with a zeroed window
    pub fn new() -> Self {
        Self {
            state: DecompressorOxide::new(),
            window: [0; INFLATE_WINDOW],
        }
    }

    /// Inflate one complete zlib stream
    ///
    /// Fails with [`Error::InflateFailed`] if the stream is corrupt,
    /// truncated, or inflates to more than the window holds.
    pub fn inflate(&mut self, input: &[u8]) -> Result<&[u8]> {
        self.state.init();
        let flags = TINFL_FLAG_PARSE_ZLIB_HEADER | TINFL_FLAG_USING_NON_WRAPPING_OUTPUT_BUF;
        let (status, _, written) = decompress(&mut self.state, input, &mut self.window, 0, flags);
        match status {
            TINFLStatus::Done => Ok(&self.window[..written]),
            status => {
                log::debug!("inflate of {} bytes failed: {:?}", input.len(), status);
                Err(Error::InflateFailed)
            }
        }
    }

    fn reset(&mut self) {
        self.state.init();
        self.window.fill(0);
    }
}

impl Default for Inflater {
    fn default() -> Self {
        Self::new()
    }
}

/// Buffers owned by the flash write pipeline
pub struct FlashSession {
    ring: StubRing,
    inflater: Inflater,
}

impl FlashSession {
    /// Create an idle session
    pub fn new() -> Self {
        Self {
            ring: PacketRing::new(),
            inflater: Inflater::new(),
        }
    }

    /// Reset the ring, the receive error latch and the inflater, then
    /// hand out both for a new flash write
    pub fn begin(&mut self) -> (&mut StubRing, &mut Inflater) {
        self.ring.reset();
        self.inflater.reset();
        (&mut self.ring, &mut self.inflater)
    }
}

impl Default for FlashSession {
    fn default() -> Self {
        Self::new()
    }
}
