//! CLI argument parsing

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Serial device with an optional baud rate, `DEV[:BAUD]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialArg {
    pub device: String,
    pub baud: u32,
}

/// Baud rate the ROM loader talks at when none is given
pub const DEFAULT_BAUD: u32 = 115_200;

fn parse_serial(s: &str) -> Result<SerialArg, String> {
    match s.rsplit_once(':') {
        // Windows COM ports and /dev paths never end in `:digits`
        Some((device, baud)) if !device.is_empty() && baud.bytes().all(|b| b.is_ascii_digit()) => {
            let baud = baud
                .parse()
                .map_err(|_| format!("Invalid baud rate: {}", baud))?;
            Ok(SerialArg {
                device: device.to_string(),
                baud,
            })
        }
        _ => Ok(SerialArg {
            device: s.to_string(),
            baud: DEFAULT_BAUD,
        }),
    }
}

/// Parse a size string like "16MiB", "4096" or "0x1000000"
fn parse_size(s: &str) -> Result<usize, String> {
    let s = s.trim();

    if let Ok(n) = s.parse::<usize>() {
        return Ok(n);
    }

    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        return usize::from_str_radix(hex.trim(), 16).map_err(|e| format!("Invalid hex value: {}", e));
    }

    let lower = s.to_lowercase();
    let (num, multiplier) = if let Some(n) = lower.strip_suffix("mib") {
        (n.trim(), 1024 * 1024)
    } else if let Some(n) = lower.strip_suffix("kib") {
        (n.trim(), 1024)
    } else if let Some(n) = lower.strip_suffix('m') {
        (n.trim(), 1024 * 1024)
    } else if let Some(n) = lower.strip_suffix('k') {
        (n.trim(), 1024)
    } else {
        return Err(format!("invalid size: {}", s));
    };

    let n = num
        .parse::<usize>()
        .map_err(|e| format!("invalid size {}: {}", s, e))?;
    n.checked_mul(multiplier)
        .ok_or_else(|| format!("size too large: {}", s))
}

#[derive(Parser)]
#[command(name = "stubflash")]
#[command(author, version, about = "Flashing stub emulator", long_about = None)]
pub struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

/// Where the host tool connects
#[derive(clap::Args, Debug, Clone)]
#[group(required = true, multiple = false)]
pub struct WireArgs {
    /// Serial port the host is attached to (e.g. /dev/ttyUSB0:115200)
    #[arg(long, value_name = "DEV[:BAUD]", value_parser = parse_serial)]
    pub serial: Option<SerialArg>,

    /// Accept the host on a TCP socket (e.g. 127.0.0.1:5555)
    #[arg(long, value_name = "HOST:PORT")]
    pub listen: Option<String>,
}

/// Emulated flash contents
#[derive(clap::Args, Debug, Clone)]
pub struct FlashArgs {
    /// Initial flash image; the rest of the chip reads as erased
    #[arg(short, long)]
    pub image: Option<PathBuf>,

    /// Flash size (e.g., "16MiB", "0x400000")
    #[arg(long, default_value = "16MiB", value_parser = parse_size)]
    pub size: usize,

    /// Write the flash contents back to the image after every session
    #[arg(long, requires = "image")]
    pub save: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the stub against an in-memory flash and serve a host tool
    Serve {
        #[command(flatten)]
        wire: WireArgs,

        #[command(flatten)]
        flash: FlashArgs,

        /// Baud rate to switch to after start-up (0 keeps the loader rate)
        #[arg(long, default_value_t = 0)]
        switch_baud: u32,

        /// Exit after the first session instead of waiting for the next
        #[arg(long)]
        once: bool,
    },
}
