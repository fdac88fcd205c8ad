//! Host Audio Output
//!
//! Runs the in-memory [`SoftwareBackend`] through rodio so streams are
//! audible. Every voice gets its own rodio [`Sink`] fed by a
//! [`VoiceSource`] that pulls rendered blocks from the device.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      AudioOutput                         │
//! │   OutputStream ◀── Sink[voice] ◀── VoiceSource ◀──┐      │
//! │                                                   │      │
//! │   RodioBackend ──────────────▶ SoftwareBackend ───┘      │
//! └──────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rodio::{OutputStream, OutputStreamHandle, Sink, Source};
use tracing::{debug, info, warn};
use undertow_common::{BufferId, DeviceError, DeviceResult, FilterId, VoiceId};

use crate::backend::{AudioBackend, SampleFormat, VoiceState};
use crate::software::SoftwareBackend;

/// Largest block pulled from the device per render call.
const RENDER_BLOCK: usize = 4096;

/// Frames of silence emitted while a voice is not playing.
const SILENCE_FRAMES: usize = 441;

/// Default output device.
///
/// Owns the host stream, which must stay on the thread that opened it.
/// Hand [`Self::backend`] to streams.
pub struct AudioOutput {
    /// The output stream (must be kept alive).
    _stream: OutputStream,
    backend: Arc<RodioBackend>,
}

impl std::fmt::Debug for AudioOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioOutput")
            .field("voices", &self.backend.sinks.lock().len())
            .finish_non_exhaustive()
    }
}

impl AudioOutput {
    /// Open the default host output device.
    pub fn open() -> DeviceResult<Self> {
        let (stream, handle) =
            OutputStream::try_default().map_err(|e| DeviceError::InitFailed(e.to_string()))?;
        info!("Audio output initialized");
        Ok(Self {
            _stream: stream,
            backend: Arc::new(RodioBackend::new(handle)),
        })
    }

    /// Device interface for streams playing through this output.
    #[must_use]
    pub fn backend(&self) -> Arc<RodioBackend> {
        Arc::clone(&self.backend)
    }
}

/// [`AudioBackend`] that mixes voices to a rodio output.
pub struct RodioBackend {
    device: Arc<SoftwareBackend>,
    handle: OutputStreamHandle,
    sinks: Mutex<HashMap<VoiceId, Sink>>,
}

impl RodioBackend {
    /// Create a backend mixing into an already open output.
    #[must_use]
    pub fn new(handle: OutputStreamHandle) -> Self {
        Self {
            device: Arc::new(SoftwareBackend::new()),
            handle,
            sinks: Mutex::new(HashMap::new()),
        }
    }
}

impl AudioBackend for RodioBackend {
    fn create_buffers(&self, count: usize) -> DeviceResult<Vec<BufferId>> {
        self.device.create_buffers(count)
    }

    fn delete_buffers(&self, buffers: &[BufferId]) -> DeviceResult<()> {
        self.device.delete_buffers(buffers)
    }

    fn create_voice(&self) -> DeviceResult<VoiceId> {
        let voice = self.device.create_voice()?;
        let sink = match Sink::try_new(&self.handle) {
            Ok(sink) => sink,
            Err(e) => {
                let _ = self.device.delete_voice(voice);
                return Err(DeviceError::Output(e.to_string()));
            },
        };
        sink.append(VoiceSource::new(Arc::clone(&self.device), voice));
        self.sinks.lock().insert(voice, sink);
        debug!("Attached {} to a host sink", voice);
        Ok(voice)
    }

    fn delete_voice(&self, voice: VoiceId) -> DeviceResult<()> {
        if let Some(sink) = self.sinks.lock().remove(&voice) {
            sink.stop();
        }
        self.device.delete_voice(voice)
    }

    fn submit_buffer(
        &self,
        buffer: BufferId,
        format: SampleFormat,
        pcm: &[i16],
        sample_rate: u32,
    ) -> DeviceResult<()> {
        self.device.submit_buffer(buffer, format, pcm, sample_rate)
    }

    fn queue_buffers(&self, voice: VoiceId, buffers: &[BufferId]) -> DeviceResult<()> {
        self.device.queue_buffers(voice, buffers)
    }

    fn unqueue_buffers(&self, voice: VoiceId, count: usize) -> DeviceResult<Vec<BufferId>> {
        self.device.unqueue_buffers(voice, count)
    }

    fn queued_count(&self, voice: VoiceId) -> DeviceResult<usize> {
        self.device.queued_count(voice)
    }

    fn processed_count(&self, voice: VoiceId) -> DeviceResult<usize> {
        self.device.processed_count(voice)
    }

    fn play(&self, voice: VoiceId) -> DeviceResult<()> {
        self.device.play(voice)
    }

    fn pause(&self, voice: VoiceId) -> DeviceResult<()> {
        self.device.pause(voice)
    }

    fn stop(&self, voice: VoiceId) -> DeviceResult<()> {
        self.device.stop(voice)
    }

    fn voice_state(&self, voice: VoiceId) -> DeviceResult<VoiceState> {
        self.device.voice_state(voice)
    }

    fn set_gain(&self, voice: VoiceId, gain: f32) -> DeviceResult<()> {
        self.device.set_gain(voice, gain)
    }

    fn create_filter(&self) -> DeviceResult<Option<FilterId>> {
        self.device.create_filter()
    }

    fn set_filter_gain_hf(&self, filter: FilterId, gain: f32) -> DeviceResult<()> {
        self.device.set_filter_gain_hf(filter, gain)
    }

    fn bind_filter(&self, voice: VoiceId, filter: FilterId) -> DeviceResult<()> {
        self.device.bind_filter(voice, filter)
    }

    fn delete_filter(&self, filter: FilterId) -> DeviceResult<()> {
        self.device.delete_filter(filter)
    }
}

/// rodio source pulling one voice's rendered output.
///
/// Emits silence while the voice is idle and ends once the voice is
/// deleted. The next block is fetched as soon as the current one runs out,
/// so the reported frame length is exact.
pub struct VoiceSource {
    device: Arc<SoftwareBackend>,
    voice: VoiceId,
    block: Vec<i16>,
    position: usize,
    channels: u16,
    sample_rate: u32,
    finished: bool,
}

impl VoiceSource {
    /// Create a source for `voice` and fetch its first block.
    #[must_use]
    pub fn new(device: Arc<SoftwareBackend>, voice: VoiceId) -> Self {
        let mut source = Self {
            device,
            voice,
            block: Vec::with_capacity(RENDER_BLOCK),
            position: 0,
            channels: 1,
            sample_rate: 44_100,
            finished: false,
        };
        source.fetch();
        source
    }

    fn fetch(&mut self) {
        self.position = 0;
        match self.device.render(self.voice, &mut self.block, RENDER_BLOCK) {
            Ok(Some(format)) => {
                self.channels = format.channels;
                self.sample_rate = format.sample_rate;
            },
            Ok(None) => {
                self.block
                    .resize(SILENCE_FRAMES * usize::from(self.channels), 0);
            },
            Err(DeviceError::InvalidVoice(_)) => {
                self.block.clear();
                self.finished = true;
            },
            Err(e) => {
                warn!("Rendering {} failed: {}", self.voice, e);
                self.block.clear();
                self.finished = true;
            },
        }
    }
}

impl Iterator for VoiceSource {
    type Item = i16;

    fn next(&mut self) -> Option<i16> {
        if self.finished {
            return None;
        }
        let sample = *self.block.get(self.position)?;
        self.position += 1;
        if self.position >= self.block.len() {
            self.fetch();
        }
        Some(sample)
    }
}

impl Source for VoiceSource {
    fn current_frame_len(&self) -> Option<usize> {
        Some(self.block.len().saturating_sub(self.position))
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn total_duration(&self) -> Option<Duration> {
        None
    }
}
