//! Strongvelope wire inspector.
//!
//! # Usage
//!
//! ```bash
//! # Decode a captured command stream
//! strongvelope-inspect command 01000000000000c4a7...
//!
//! # Explain a message envelope
//! strongvelope-inspect envelope 0301...
//!
//! # Dump the TLV records of a buffer, skipping the version and type bytes
//! strongvelope-inspect records --offset 2 0301...
//! ```

#![allow(clippy::print_stdout)]

mod render;

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Strongvelope wire inspector
#[derive(Parser, Debug)]
#[command(name = "strongvelope-inspect")]
#[command(about = "Decode strongvelope commands and envelopes from hex")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    input: Input,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Input {
    /// Concatenated chat commands
    Command {
        /// Hex-encoded bytes
        hex: String,
    },
    /// Message or management envelope
    Envelope {
        /// Hex-encoded bytes
        hex: String,
    },
    /// Raw TLV records
    Records {
        /// Hex-encoded bytes
        hex: String,

        /// Offset of the first record
        #[arg(long, default_value = "0")]
        offset: usize,

        /// Legacy record headers (version 1)
        #[arg(long)]
        legacy: bool,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer().with_writer(std::io::stderr)).with(filter).init();

    let report = match &args.input {
        Input::Command { hex } => {
            let bytes = decode_hex(hex)?;
            tracing::debug!(len = bytes.len(), "decoding command stream");
            render::commands(&bytes)?
        },
        Input::Envelope { hex } => render::envelope(&decode_hex(hex)?)?,
        Input::Records { hex, offset, legacy } => {
            render::records(&decode_hex(hex)?, *offset, *legacy)?
        },
    };

    print!("{report}");
    Ok(())
}

fn decode_hex(input: &str) -> Result<Vec<u8>, render::InspectError> {
    let compact: String = input.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    Ok(hex::decode(compact)?)
}
