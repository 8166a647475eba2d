//! Platform collaborators
//!
//! The stub core never touches hardware directly. A board support crate
//! implements these traits on top of the boot ROM routines and the UART
//! peripheral; `stubflash-dummy` implements them in memory for tests.

mod traits;

pub use traits::*;
