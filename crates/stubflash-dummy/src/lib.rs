//! stubflash-dummy - In-memory collaborators for the flashing stub
//!
//! This crate provides everything needed to run the stub without a chip:
//!
//! - [`DummyFlash`], a NOR flash emulator behind the ROM flash interface,
//! - [`LoopbackUart`], a scripted UART whose receive interrupt is driven
//!   from a scoped thread while a flash write runs,
//! - [`DummySystem`], registers, a cycle counter and chip control,
//! - [`host`], helpers for building host frames and parsing replies.
//!
//! The emulator binary and the scenario tests are built on top of it.

#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(feature = "alloc")]
mod flash;
#[cfg(feature = "std")]
pub mod host;
#[cfg(feature = "std")]
mod loopback;
#[cfg(feature = "alloc")]
mod system;

#[cfg(feature = "alloc")]
pub use flash::{DummyFlash, Fault};
#[cfg(feature = "std")]
pub use loopback::{LoopbackUart, Pacing};
#[cfg(feature = "alloc")]
pub use system::DummySystem;

/// Configuration for the dummy flash
#[derive(Debug, Clone)]
pub struct DummyConfig {
    /// JEDEC manufacturer ID
    pub manufacturer_id: u8,
    /// JEDEC device ID
    pub device_id: u16,
    /// Flash size in bytes
    pub size: usize,
    /// Status register protection set at power-up; cleared by unlock
    pub protected: bool,
}

impl Default for DummyConfig {
    fn default() -> Self {
        Self {
            manufacturer_id: 0xEF, // Winbond
            device_id: 0x4018,     // W25Q128FV
            size: 16 * 1024 * 1024,
            protected: true,
        }
    }
}
