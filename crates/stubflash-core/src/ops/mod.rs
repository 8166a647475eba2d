//! Command implementations
//!
//! Each operation returns `Ok(())` for a zero status or the [`Error`] whose
//! [`Error::status`] the dispatcher sends back. Streamed replies (records,
//! data blocks, digests) are sent by the operation itself before it
//! returns.

mod read;
mod util;
mod write;

use md5::{Digest, Md5};

use crate::error::{Error, Result};
use crate::protocol::DIGEST_LEN;
use crate::slip;

pub use read::{flash_digest, flash_read};
pub use util::{echo, erase_chip, read_chip_id, read_reg, write_reg};
pub use write::flash_write;

/// Send one SLIP frame to the host
pub(crate) fn send_packet<W: embedded_io::Write>(w: &mut W, payload: &[u8]) -> Result<()> {
    slip::encode(w, payload).map_err(|_| Error::Link)?;
    w.flush().map_err(|_| Error::Link)
}

/// Finalize a copy of `hasher`, leaving the running state untouched
pub(crate) fn snapshot(hasher: &Md5) -> [u8; DIGEST_LEN] {
    finish(hasher.clone())
}

pub(crate) fn finish(hasher: Md5) -> [u8; DIGEST_LEN] {
    let mut digest = [0u8; DIGEST_LEN];
    digest.copy_from_slice(&hasher.finalize());
    digest
}
