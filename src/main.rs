//! stubflash - Flashing stub emulator
//!
//! Runs the flashing stub's command loop on the host against an in-memory
//! flash, so host tools can be exercised without a chip.
//!
//! # Architecture
//!
//! The stub itself lives in `stubflash-core` and only sees its collaborator
//! traits. This binary supplies them:
//! - **Flash**: the NOR emulator from `stubflash-dummy`, optionally loaded
//!   from an image file and written back after each session
//! - **UART**: a serial port or TCP socket, with a reader thread standing in
//!   for the receive interrupt during flash writes
//! - **System**: wall-clock timing and baud rate control of the serial port

mod cli;
mod emulator;
mod transport;

use clap::Parser;
use cli::{Cli, Commands, DEFAULT_BAUD};
use emulator::ServeOptions;
use transport::WireUart;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logger; RUST_LOG still wins over -v
    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match cli.command {
        Commands::Serve {
            wire,
            flash,
            switch_baud,
            once,
        } => {
            let uart = match (wire.serial, wire.listen) {
                (Some(serial), _) => WireUart::open_serial(&serial.device, serial.baud)?,
                (None, Some(addr)) => WireUart::listen(&addr, DEFAULT_BAUD)?,
                (None, None) => return Err("either --serial or --listen is required".into()),
            };
            let opts = ServeOptions {
                image: flash.image,
                size: flash.size,
                save: flash.save,
                switch_baud,
                once,
            };
            emulator::serve(uart, &opts)
        }
    }
}
