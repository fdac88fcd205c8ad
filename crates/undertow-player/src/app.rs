//! Playback loop.

use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{info, warn};
use undertow_audio::{AudioOutput, Stream, StreamState, Streamer};

use crate::cli::Args;
use crate::config::PlayerConfig;

/// How often the main thread checks on playback.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Output latency allowed after the last buffer leaves the device.
const TAIL: Duration = Duration::from_millis(250);

/// Play the requested file until it ends or the time limit passes.
pub fn run(args: &Args) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => PlayerConfig::load_from(path),
        None => PlayerConfig::load(),
    };
    config.apply(args);
    config.validate();

    let output = AudioOutput::open().context("opening audio output")?;
    let streamer = Streamer::new(config.streamer.clone()).context("starting streamer")?;
    let stream = Stream::from_path(
        &streamer.handle(),
        output.backend(),
        &args.path,
        config.stream_options(),
    )
    .with_context(|| format!("loading {}", args.path.display()))?;
    stream.set_low_pass_gain(config.low_pass_gain)?;

    stream.play()?;
    info!(
        "Playing {} ({} buffers, looping: {})",
        args.path.display(),
        stream.buffer_count(),
        stream.is_looped()
    );

    let limit = args.seconds.map(Duration::from_secs_f64);
    let started = Instant::now();
    loop {
        thread::sleep(POLL_INTERVAL);
        if limit.is_some_and(|limit| started.elapsed() >= limit) {
            info!("Time limit reached");
            break;
        }
        if !streamer.is_registered(stream.id()) && stream.state()? == StreamState::Stopped {
            thread::sleep(TAIL);
            info!("Playback finished");
            break;
        }
    }

    stream.stop()?;
    if let Err(e) = stream.dispose() {
        warn!("Releasing stream failed: {e}");
    }
    streamer.dispose();
    Ok(())
}
