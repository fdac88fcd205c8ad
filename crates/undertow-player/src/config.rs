//! Player configuration.
//!
//! Playback defaults and streamer tuning, loaded from `undertow.toml` and
//! overridden by command-line flags.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use undertow_audio::{StreamOptions, StreamerConfig, MIN_BUFFER_COUNT};

use crate::cli::Args;

/// Configuration file name.
const CONFIG_FILE: &str = "undertow.toml";

/// Player configuration parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// Voice gain (0.0 - 1.0)
    pub volume: f32,
    /// Low-pass high-frequency gain (1.0 = unfiltered)
    pub low_pass_gain: f32,
    /// Buffer slots per stream
    pub buffer_count: usize,
    /// Restart at end of file
    pub looped: bool,
    /// Scheduler tuning
    pub streamer: StreamerConfig,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            volume: 1.0,
            low_pass_gain: 1.0,
            buffer_count: 3,
            looped: false,
            streamer: StreamerConfig::default(),
        }
    }
}

impl PlayerConfig {
    /// Load configuration from the default file location.
    /// Returns default config if file doesn't exist.
    pub fn load() -> Self {
        Self::load_from(Self::config_path())
    }

    /// Load configuration from a specific path.
    /// Returns default config if file doesn't exist or is invalid.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();

        if !path.exists() {
            info!("Config file not found, using defaults");
            return Self::default();
        }

        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) => {
                warn!("Failed to read config file: {e}");
                return Self::default();
            },
        };

        match toml::from_str(&contents) {
            Ok(config) => {
                info!("Loaded config from {}", path.display());
                config
            },
            Err(e) => {
                warn!("Failed to parse config file: {e}");
                Self::default()
            },
        }
    }

    /// Save configuration to a specific path.
    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let mut file = fs::File::create(path)?;
        file.write_all(contents.as_bytes())?;

        info!("Saved config to {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path.
    fn config_path() -> PathBuf {
        dirs::config_dir().map_or_else(
            || PathBuf::from(CONFIG_FILE),
            |dir| dir.join("undertow").join(CONFIG_FILE),
        )
    }

    /// Apply command-line overrides.
    pub fn apply(&mut self, args: &Args) {
        if args.looped {
            self.looped = true;
        }
        if let Some(volume) = args.volume {
            self.volume = volume;
        }
        if let Some(gain) = args.low_pass {
            self.low_pass_gain = gain;
        }
        if let Some(buffers) = args.buffers {
            self.buffer_count = buffers;
        }
    }

    /// Validate and clamp configuration values to sensible ranges.
    pub fn validate(&mut self) {
        self.volume = self.volume.clamp(0.0, 1.0);
        self.low_pass_gain = self.low_pass_gain.clamp(0.0, 1.0);
        self.buffer_count = self.buffer_count.clamp(MIN_BUFFER_COUNT, 16);
        self.streamer.validate();
    }

    /// Per-stream options derived from this configuration.
    #[must_use]
    pub fn stream_options(&self) -> StreamOptions {
        StreamOptions::default()
            .with_buffer_count(self.buffer_count)
            .with_looping(self.looped)
            .with_volume(self.volume)
    }
}
