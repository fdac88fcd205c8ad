//! # Undertow Player
//!
//! Streams one sound file to the default output device through the
//! Undertow buffer streamer.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]

mod app;
mod cli;
mod config;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Main entry point.
fn main() -> Result<()> {
    let args = cli::Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("undertow=info".parse()?))
        .init();

    info!("Undertow player starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    app::run(&args)?;

    info!("Undertow player shutdown complete");
    Ok(())
}
