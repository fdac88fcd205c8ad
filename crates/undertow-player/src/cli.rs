//! Command-line arguments.

use std::path::PathBuf;

use clap::Parser;

/// Stream a sound file to the default output device.
#[derive(Debug, Parser)]
#[command(name = "undertow", version, about)]
pub struct Args {
    /// Sound file to play (Ogg Vorbis, WAV, FLAC or MP3)
    pub path: PathBuf,

    /// Configuration file (defaults to the platform config directory)
    #[arg(long, env = "UNDERTOW_CONFIG")]
    pub config: Option<PathBuf>,

    /// Restart from the beginning at end of file
    #[arg(long = "loop")]
    pub looped: bool,

    /// Voice gain, 0.0 to 1.0
    #[arg(long)]
    pub volume: Option<f32>,

    /// Low-pass high-frequency gain, 0.0 to 1.0
    #[arg(long)]
    pub low_pass: Option<f32>,

    /// Buffer slots in the stream's ring
    #[arg(long)]
    pub buffers: Option<usize>,

    /// Stop after this many seconds
    #[arg(long)]
    pub seconds: Option<f64>,
}
