//! Hardware Voice Abstraction
//!
//! The streaming core talks to the audio device exclusively through
//! [`AudioBackend`], an OpenAL-shaped interface built around three kinds of
//! device objects:
//!
//! - **Buffers**: fixed blocks of PCM16 samples owned by the device
//! - **Voices**: playback handles that consume a queue of buffers in order
//! - **Filters**: optional per-voice low-pass filters
//!
//! A voice plays its queued buffers in submission order. Buffers it has
//! finished with are reported as *processed* and can be unqueued, refilled
//! and queued again.
//!
//! ```text
//!   submit_buffer      queue_buffers              unqueue_buffers
//!  ┌──────────┐      ┌──────────────────────────┐      ┌──────────┐
//!  │  free    │ ───▶ │ processed │   pending    │ ───▶ │  free    │
//!  └──────────┘      └──────────────────────────┘      └──────────┘
//!                      oldest ◀──────── newest
//! ```

use undertow_common::{BufferId, DeviceResult, FilterId, VoiceId};

/// Playback state reported by a voice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VoiceState {
    /// Never started since creation.
    #[default]
    Initial,
    /// Consuming queued buffers.
    Playing,
    /// Suspended; resumes where it left off.
    Paused,
    /// Stopped explicitly or ran out of queued buffers.
    Stopped,
}

impl VoiceState {
    /// Check if the voice holds a playback position (playing or paused).
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Playing | Self::Paused)
    }
}

/// PCM layout of a submitted buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    /// One channel of signed 16-bit samples.
    Mono16,
    /// Two interleaved channels of signed 16-bit samples.
    Stereo16,
}

impl SampleFormat {
    /// Picks the format tag for a decoder's channel count.
    #[must_use]
    pub const fn for_channels(channels: u16) -> Self {
        if channels == 1 {
            Self::Mono16
        } else {
            Self::Stereo16
        }
    }

    /// Number of interleaved channels.
    #[must_use]
    pub const fn channels(self) -> u16 {
        match self {
            Self::Mono16 => 1,
            Self::Stereo16 => 2,
        }
    }
}

/// Device interface consumed by streams and the streamer.
///
/// Implementations must be thread-safe: the caller thread and the streamer
/// thread both issue commands, serialized per voice by the stream's own locks.
pub trait AudioBackend: Send + Sync {
    /// Allocate `count` empty buffers.
    fn create_buffers(&self, count: usize) -> DeviceResult<Vec<BufferId>>;

    /// Release buffers. Buffers still queued on a voice are rejected.
    fn delete_buffers(&self, buffers: &[BufferId]) -> DeviceResult<()>;

    /// Allocate a voice in the [`VoiceState::Initial`] state.
    fn create_voice(&self) -> DeviceResult<VoiceId>;

    /// Release a voice, dropping its queue.
    fn delete_voice(&self, voice: VoiceId) -> DeviceResult<()>;

    /// Replace a buffer's contents with interleaved PCM16 data.
    fn submit_buffer(
        &self,
        buffer: BufferId,
        format: SampleFormat,
        pcm: &[i16],
        sample_rate: u32,
    ) -> DeviceResult<()>;

    /// Append buffers to a voice's queue, preserving slice order.
    fn queue_buffers(&self, voice: VoiceId, buffers: &[BufferId]) -> DeviceResult<()>;

    /// Remove the `count` oldest buffers from a voice's queue.
    ///
    /// Fails with `DeviceError::InvalidOperation` if fewer than `count`
    /// buffers have been processed.
    fn unqueue_buffers(&self, voice: VoiceId, count: usize) -> DeviceResult<Vec<BufferId>>;

    /// Number of buffers queued on the voice, processed ones included.
    fn queued_count(&self, voice: VoiceId) -> DeviceResult<usize>;

    /// Number of queued buffers the voice has finished playing.
    fn processed_count(&self, voice: VoiceId) -> DeviceResult<usize>;

    /// Start or resume playback.
    fn play(&self, voice: VoiceId) -> DeviceResult<()>;

    /// Pause playback.
    fn pause(&self, voice: VoiceId) -> DeviceResult<()>;

    /// Stop playback; every queued buffer becomes processed.
    fn stop(&self, voice: VoiceId) -> DeviceResult<()>;

    /// Current playback state of the voice.
    fn voice_state(&self, voice: VoiceId) -> DeviceResult<VoiceState>;

    /// Set the voice gain (linear, 1.0 = unity).
    fn set_gain(&self, voice: VoiceId, gain: f32) -> DeviceResult<()>;

    /// Allocate a low-pass filter, or `None` if the device has no filters.
    fn create_filter(&self) -> DeviceResult<Option<FilterId>>;

    /// Set the high-frequency gain of a low-pass filter.
    fn set_filter_gain_hf(&self, filter: FilterId, gain: f32) -> DeviceResult<()>;

    /// Attach a filter to a voice's direct path.
    fn bind_filter(&self, voice: VoiceId, filter: FilterId) -> DeviceResult<()>;

    /// Release a filter, detaching it from any voice.
    fn delete_filter(&self, filter: FilterId) -> DeviceResult<()>;
}
