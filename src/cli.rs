//! This module implements the CLI interface.
//!
//! The binary enumerates a small simulated machine and is mainly useful to
//! watch the phases run: scan, discovery, allocation, commit, enable.

use clap::Parser;

/// Parse a number that may carry a `0x` prefix.
fn parse_maybe_hex(arg: &str) -> Result<u64, String> {
    let (digits, radix) = match arg.strip_prefix("0x") {
        Some(hex) => (hex, 16),
        None => (arg, 10),
    };
    u64::from_str_radix(digits, radix).map_err(|err| err.to_string())
}

#[derive(Parser, Debug)]
#[command(
    name = env!("CARGO_PKG_NAME"),
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
    about = env!("CARGO_PKG_DESCRIPTION"),
    long_about = None
)]
pub struct Cli {
    /// Enable verbose logging. Can be specified multiple times to
    /// increase verbosity.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Base of the I/O port range handed to the allocator.
    #[arg(long, value_parser = parse_maybe_hex, default_value = "0x1000")]
    pub io_base: u64,

    /// Base of the 32-bit memory range handed to the allocator.
    #[arg(long, value_parser = parse_maybe_hex, default_value = "0xc0000000")]
    pub mem_base: u64,
}
