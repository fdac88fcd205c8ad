//! Error types for Undertow.

use thiserror::Error;

use crate::ids::{BufferId, FilterId, VoiceId};

/// Top-level error type for Undertow operations.
#[derive(Debug, Error)]
pub enum UndertowError {
    /// Audio device errors
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    /// Decoder errors
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Streamer lifecycle errors
    #[error("Streamer error: {0}")]
    Streamer(#[from] StreamerError),

    /// The stream has already been disposed
    #[error("Stream has been disposed")]
    Disposed,

    /// A refill was requested while no decoder binding is open
    #[error("Decoder binding is not open")]
    DecoderClosed,

    /// Invalid stream construction parameters
    #[error("Invalid stream options: {0}")]
    InvalidOptions(String),
}

/// Audio device errors.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// Failed to initialize the output device
    #[error("Audio device initialization failed: {0}")]
    InitFailed(String),

    /// Unknown voice handle
    #[error("Unknown voice {0}")]
    InvalidVoice(VoiceId),

    /// Unknown buffer handle
    #[error("Unknown buffer {0}")]
    InvalidBuffer(BufferId),

    /// Unknown filter handle
    #[error("Unknown filter {0}")]
    InvalidFilter(FilterId),

    /// The device refused the command in the current voice state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Host output stream failure
    #[error("Audio output error: {0}")]
    Output(String),
}

impl DeviceError {
    /// Whether the caller can salvage device state and retry.
    ///
    /// Only state mismatches qualify; unknown handles and output failures
    /// usually mean the device is gone.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::InvalidOperation(_))
    }
}

/// Decoder errors.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The byte stream is not in a supported format
    #[error("Unsupported audio format: {0}")]
    Unsupported(String),

    /// The byte stream is damaged
    #[error("Corrupt audio data: {0}")]
    Corrupt(String),

    /// IO errors while reading the source
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Streamer lifecycle errors.
#[derive(Debug, Error)]
pub enum StreamerError {
    /// A second streamer was constructed while one is alive
    #[error("A streamer is already running")]
    AlreadyRunning,

    /// The streamer was accessed before construction or after disposal
    #[error("No streamer is running")]
    NotRunning,

    /// The background thread could not be started
    #[error("Failed to spawn streamer thread: {0}")]
    Spawn(std::io::Error),

    /// Invalid configuration values
    #[error("Invalid streamer configuration: {0}")]
    InvalidConfig(String),
}

/// Result type alias for Undertow operations.
pub type UndertowResult<T> = Result<T, UndertowError>;

/// Result type alias for device commands.
pub type DeviceResult<T> = Result<T, DeviceError>;
