//! stubflash-core - Flashing stub core
//!
//! This crate implements the program that a host tool downloads into chip
//! RAM and runs in place of the real firmware. It reprograms, reads back and
//! verifies the SPI flash over a single UART wire using a SLIP-framed binary
//! protocol. It is `no_std` and allocation free: every buffer is a
//! compile-time sized arena owned by the [`stub::Stub`].
//!
//! # Execution contexts
//!
//! Two contexts share one core:
//!
//! - the UART receive interrupt, which runs [`rx::RxAssembler::feed`] for
//!   every raw byte while a flash write is in progress, and
//! - the main command loop ([`stub::Stub::cmd_loop`]), which runs everything
//!   else to completion.
//!
//! The only structure touched by both is the [`ring::PacketRing`], a
//! single-producer/single-consumer ring with one writer per field.
//!
//! # Features
//!
//! - `std` - Enable standard library support (includes `alloc`)
//! - `alloc` - Enable heap allocation support in `embedded-io`
//!
//! # Example
//!
//! ```ignore
//! use stubflash_core::stub::{Stub, StubParams};
//!
//! fn stub_main(board: Board) -> ! {
//!     let mut stub = Stub::new(board.flash, board.uart, board.system);
//!     stub.run(StubParams::from_loader(&PARAMS));
//!     loop {}
//! }
//! ```

#![no_std]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

#[cfg(any(feature = "std", test))]
extern crate std;

pub mod error;
pub mod ops;
pub mod platform;
pub mod protocol;
pub mod ring;
pub mod rx;
pub mod session;
pub mod slip;
pub mod stub;

pub use error::{Error, Result};
