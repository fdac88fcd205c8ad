//! Streaming configuration.
//!
//! [`StreamerConfig`] sizes the shared scheduler; [`StreamOptions`] is the
//! per-stream construction set.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use undertow_common::StreamerError;

/// Default number of samples decoded into one buffer slot.
pub const DEFAULT_BUFFER_SIZE: usize = 44_100;

/// Default scheduler tick rate in Hz.
pub const DEFAULT_UPDATE_RATE: f32 = 10.0;

/// Default number of buffer slots per stream.
pub const DEFAULT_BUFFER_COUNT: usize = 3;

/// Smallest chunk that still holds one whole stereo frame.
pub const MIN_BUFFER_SIZE: usize = 2;

/// Slowest scheduler tick rate in Hz.
pub const MIN_UPDATE_RATE: f32 = 1.0;

/// Fastest scheduler tick rate in Hz.
pub const MAX_UPDATE_RATE: f32 = 1000.0;

/// Fewest buffer slots a stream can double-buffer with.
pub const MIN_BUFFER_COUNT: usize = 2;

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamerConfig {
    /// Samples decoded per buffer slot (chunk size)
    pub buffer_size: usize,
    /// Scheduler ticks per second
    pub update_rate: f32,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            update_rate: DEFAULT_UPDATE_RATE,
        }
    }
}

impl StreamerConfig {
    /// Create config with a chunk size.
    #[must_use]
    pub const fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Create config with a tick rate.
    #[must_use]
    pub const fn with_update_rate(mut self, update_rate: f32) -> Self {
        self.update_rate = update_rate;
        self
    }

    /// Sleep between two scheduler passes.
    ///
    /// Rates that cannot be expressed as a duration fall back to the
    /// default tick.
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        Duration::try_from_secs_f64(1.0 / f64::from(self.update_rate))
            .unwrap_or_else(|_| Duration::from_secs_f64(1.0 / f64::from(DEFAULT_UPDATE_RATE)))
    }

    /// Clamp values loaded from user files to sensible ranges.
    pub fn validate(&mut self) {
        self.buffer_size = self.buffer_size.clamp(256, 1_048_576);
        if !self.update_rate.is_finite() {
            self.update_rate = DEFAULT_UPDATE_RATE;
        }
        self.update_rate = self.update_rate.clamp(MIN_UPDATE_RATE, MAX_UPDATE_RATE);
    }

    /// Reject values the scheduler cannot run with.
    pub fn check(&self) -> Result<(), StreamerError> {
        if self.buffer_size < MIN_BUFFER_SIZE {
            return Err(StreamerError::InvalidConfig(format!(
                "buffer_size must be at least {MIN_BUFFER_SIZE}, got {}",
                self.buffer_size
            )));
        }
        if !(MIN_UPDATE_RATE..=MAX_UPDATE_RATE).contains(&self.update_rate) {
            return Err(StreamerError::InvalidConfig(format!(
                "update_rate must be within {MIN_UPDATE_RATE}..={MAX_UPDATE_RATE} Hz, got {}",
                self.update_rate
            )));
        }
        Ok(())
    }
}

/// Per-stream construction options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamOptions {
    /// Buffer slots in the stream's ring
    pub buffer_count: usize,
    /// Restart from the first sample at end of stream
    pub looped: bool,
    /// Initial voice gain
    pub volume: f32,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            buffer_count: DEFAULT_BUFFER_COUNT,
            looped: true,
            volume: 1.0,
        }
    }
}

impl StreamOptions {
    /// Create options with a buffer count.
    #[must_use]
    pub const fn with_buffer_count(mut self, buffer_count: usize) -> Self {
        self.buffer_count = buffer_count;
        self
    }

    /// Create options with looping enabled/disabled.
    #[must_use]
    pub const fn with_looping(mut self, looped: bool) -> Self {
        self.looped = looped;
        self
    }

    /// Create options with an initial volume.
    #[must_use]
    pub const fn with_volume(mut self, volume: f32) -> Self {
        self.volume = volume;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_streamer_config_default() {
        let config = StreamerConfig::default();
        assert_eq!(config.buffer_size, 44_100);
        assert_eq!(config.tick_interval(), Duration::from_millis(100));
        assert!(config.check().is_ok());
    }

    #[test]
    fn test_streamer_config_check() {
        assert!(StreamerConfig::default().with_buffer_size(0).check().is_err());
        assert!(StreamerConfig::default().with_update_rate(0.0).check().is_err());
        assert!(StreamerConfig::default()
            .with_update_rate(f32::NAN)
            .check()
            .is_err());
    }

    #[test]
    fn test_streamer_config_check_bounds() {
        let tiny_rate = StreamerConfig::default().with_update_rate(1e-30);
        assert!(tiny_rate.check().is_err());
        assert_eq!(tiny_rate.tick_interval(), Duration::from_millis(100));

        assert!(StreamerConfig::default().with_update_rate(5000.0).check().is_err());
        assert!(StreamerConfig::default().with_buffer_size(1).check().is_err());

        let edge = StreamerConfig::default()
            .with_buffer_size(MIN_BUFFER_SIZE)
            .with_update_rate(MAX_UPDATE_RATE);
        assert!(edge.check().is_ok());
        assert!(edge.tick_interval() <= Duration::from_millis(1));
    }

    #[test]
    fn test_streamer_config_validation() {
        let mut config = StreamerConfig::default()
            .with_buffer_size(1)
            .with_update_rate(f32::INFINITY);
        config.validate();
        assert_eq!(config.buffer_size, 256);
        assert!((config.update_rate - DEFAULT_UPDATE_RATE).abs() < f32::EPSILON);
    }

    #[test]
    fn test_stream_options_builder() {
        let options = StreamOptions::default()
            .with_buffer_count(4)
            .with_looping(false)
            .with_volume(0.5);
        assert_eq!(options.buffer_count, 4);
        assert!(!options.looped);
        assert!((options.volume - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: StreamerConfig = toml::from_str("update_rate = 20.0").expect("parse");
        assert_eq!(config.buffer_size, DEFAULT_BUFFER_SIZE);
        assert_eq!(config.tick_interval(), Duration::from_millis(50));
    }
}
