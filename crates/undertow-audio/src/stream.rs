//! Streams
//!
//! A [`Stream`] pairs one device voice with a small ring of device buffers
//! and a decoder. The caller drives its lifecycle; the
//! [`Streamer`](crate::Streamer) keeps its buffers full while it plays.
//!
//! ```text
//!  Initial ──prepare──▶ Preparing ──play──▶ Playing ◀──resume── Paused
//!     ▲                                      │  │                  ▲
//!     └────────── dispose ◀── Stopped ◀─stop─┘  └──────pause───────┘
//! ```

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};
use undertow_common::{
    BufferId, DecodeError, DeviceError, DeviceResult, FilterId, StreamId, UndertowError,
    UndertowResult, VoiceId,
};

use crate::backend::{AudioBackend, VoiceState};
use crate::config::{StreamOptions, MIN_BUFFER_COUNT};
use crate::decoder::{DecoderFactory, EncodedAudio, SampleReader};
use crate::streamer::StreamerHandle;

/// Lifecycle state of a stream as seen by its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Created, nothing decoded yet.
    Initial,
    /// First buffer primed; waiting for `play`.
    Preparing,
    /// Voice is consuming buffers.
    Playing,
    /// Voice is paused and the streamer is not refilling.
    Paused,
    /// Stopped by the owner or played to the end. `play` restarts from the
    /// first sample.
    Stopped,
    /// Device resources have been released.
    Disposed,
}

/// Decoder binding plus the buffer slots not currently queued.
pub(crate) struct RingState {
    pub(crate) reader: Option<Box<dyn SampleReader>>,
    pub(crate) free: Vec<BufferId>,
    /// End of stream reached; waiting for queued buffers to play out
    pub(crate) draining: bool,
}

impl RingState {
    pub(crate) fn is_open(&self) -> bool {
        self.reader.is_some()
    }

    pub(crate) fn reopen(&mut self, source: &dyn DecoderFactory) -> Result<(), DecodeError> {
        self.reader = Some(source.open()?);
        Ok(())
    }

    pub(crate) fn close(&mut self) {
        self.reader = None;
        self.draining = false;
    }
}

/// The part of a stream the streamer holds on to.
pub(crate) struct StreamCore {
    pub(crate) id: StreamId,
    pub(crate) backend: Arc<dyn AudioBackend>,
    pub(crate) voice: VoiceId,
    pub(crate) buffers: Vec<BufferId>,
    pub(crate) filter: Option<FilterId>,
    pub(crate) source: Box<dyn DecoderFactory>,
    pub(crate) stop_lock: Mutex<()>,
    pub(crate) ring: Mutex<RingState>,
    preparing: AtomicBool,
    looped: AtomicBool,
}

impl StreamCore {
    pub(crate) fn is_preparing(&self) -> bool {
        self.preparing.load(Ordering::Acquire)
    }

    pub(crate) fn is_looped(&self) -> bool {
        self.looped.load(Ordering::Acquire)
    }

    /// Unqueue `count` processed buffers into `into`.
    ///
    /// If the device refuses, salvage what it reports as processed, stop the
    /// voice so everything else becomes processed, and retry. Buffers
    /// recovered before a final failure are still pushed to `into`.
    pub(crate) fn reclaim(&self, count: usize, into: &mut Vec<BufferId>) -> DeviceResult<()> {
        let mut wanted = count;
        for _ in 0..=self.buffers.len() {
            if wanted == 0 {
                return Ok(());
            }
            match self.backend.unqueue_buffers(self.voice, wanted) {
                Ok(freed) => {
                    into.extend(freed);
                    return Ok(());
                },
                Err(e) if e.is_recoverable() => {
                    warn!("{}: unqueue of {} buffers refused ({}); salvaging", self.id, wanted, e);
                    let processed = self.backend.processed_count(self.voice)?;
                    if processed > 0 {
                        into.extend(self.backend.unqueue_buffers(self.voice, processed)?);
                    }
                    self.backend.stop(self.voice)?;
                    wanted = self.backend.queued_count(self.voice)?;
                },
                Err(e) => return Err(e),
            }
        }
        Err(DeviceError::InvalidOperation(format!(
            "{}: device kept refusing to release its buffers",
            self.id
        )))
    }

    /// Unqueue every buffer on a voice that is not playing.
    fn empty(&self, into: &mut Vec<BufferId>) -> DeviceResult<()> {
        let queued = self.backend.queued_count(self.voice)?;
        self.reclaim(queued, into)
    }
}

#[derive(Debug, Clone, Copy)]
struct StreamParams {
    volume: f32,
    low_pass_gain: f32,
}

/// One streamed sound.
///
/// Dropping a stream disposes it.
pub struct Stream {
    core: Arc<StreamCore>,
    streamer: StreamerHandle,
    params: Mutex<StreamParams>,
    disposed: AtomicBool,
}

impl Stream {
    /// Create a stream over `source`, allocating its voice, buffers and (if
    /// the device supports one) a low-pass filter.
    pub fn new(
        streamer: &StreamerHandle,
        backend: Arc<dyn AudioBackend>,
        source: impl DecoderFactory + 'static,
        options: StreamOptions,
    ) -> UndertowResult<Self> {
        if options.buffer_count < MIN_BUFFER_COUNT {
            return Err(UndertowError::InvalidOptions(format!(
                "buffer_count must be at least {MIN_BUFFER_COUNT}, got {}",
                options.buffer_count
            )));
        }
        streamer.ensure_running()?;

        let buffers = backend.create_buffers(options.buffer_count)?;
        let voice = match backend.create_voice() {
            Ok(voice) => voice,
            Err(e) => {
                let _ = backend.delete_buffers(&buffers);
                return Err(e.into());
            },
        };
        let filter = match Self::init_voice(backend.as_ref(), voice, options.volume) {
            Ok(filter) => filter,
            Err(e) => {
                let _ = backend.delete_voice(voice);
                let _ = backend.delete_buffers(&buffers);
                return Err(e.into());
            },
        };

        let core = StreamCore {
            id: StreamId::new(),
            backend,
            voice,
            buffers: buffers.clone(),
            filter,
            source: Box::new(source),
            stop_lock: Mutex::new(()),
            ring: Mutex::new(RingState {
                reader: None,
                free: buffers,
                draining: false,
            }),
            preparing: AtomicBool::new(false),
            looped: AtomicBool::new(options.looped),
        };
        debug!(
            "Created {} on {} with {} buffers{}",
            core.id,
            core.voice,
            core.buffers.len(),
            if core.filter.is_some() { " and a low-pass filter" } else { "" }
        );

        Ok(Self {
            core: Arc::new(core),
            streamer: streamer.clone(),
            params: Mutex::new(StreamParams {
                volume: options.volume,
                low_pass_gain: 1.0,
            }),
            disposed: AtomicBool::new(false),
        })
    }

    fn init_voice(
        backend: &dyn AudioBackend,
        voice: VoiceId,
        volume: f32,
    ) -> DeviceResult<Option<FilterId>> {
        backend.set_gain(voice, volume)?;
        let filter = backend.create_filter()?;
        if let Some(filter) = filter {
            let bound = backend
                .set_filter_gain_hf(filter, 1.0)
                .and_then(|()| backend.bind_filter(voice, filter));
            if let Err(e) = bound {
                let _ = backend.delete_filter(filter);
                return Err(e);
            }
        }
        Ok(filter)
    }

    /// Create a stream over an encoded file, read fully into memory.
    pub fn from_path(
        streamer: &StreamerHandle,
        backend: Arc<dyn AudioBackend>,
        path: impl AsRef<Path>,
        options: StreamOptions,
    ) -> UndertowResult<Self> {
        let audio = EncodedAudio::from_path(path)?;
        Self::new(streamer, backend, audio, options)
    }

    /// Create a stream over encoded bytes from any reader.
    pub fn from_reader(
        streamer: &StreamerHandle,
        backend: Arc<dyn AudioBackend>,
        reader: impl std::io::Read,
        options: StreamOptions,
    ) -> UndertowResult<Self> {
        let audio = EncodedAudio::from_reader(reader)?;
        Self::new(streamer, backend, audio, options)
    }

    /// Unique stream identifier.
    #[must_use]
    pub fn id(&self) -> StreamId {
        self.core.id
    }

    /// Device voice this stream plays on.
    #[must_use]
    pub fn voice(&self) -> VoiceId {
        self.core.voice
    }

    /// Number of buffer slots in the ring.
    #[must_use]
    pub fn buffer_count(&self) -> usize {
        self.core.buffers.len()
    }

    /// Whether [`Self::dispose`] has run.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn ensure_alive(&self) -> UndertowResult<()> {
        if self.is_disposed() {
            Err(UndertowError::Disposed)
        } else {
            Ok(())
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> UndertowResult<StreamState> {
        if self.is_disposed() {
            return Ok(StreamState::Disposed);
        }
        if self.core.is_preparing() {
            return Ok(StreamState::Preparing);
        }
        Ok(match self.core.backend.voice_state(self.core.voice)? {
            VoiceState::Initial => StreamState::Initial,
            VoiceState::Playing => StreamState::Playing,
            VoiceState::Paused => StreamState::Paused,
            VoiceState::Stopped => StreamState::Stopped,
        })
    }

    /// Whether the stream restarts at end of stream.
    #[must_use]
    pub fn is_looped(&self) -> bool {
        self.core.is_looped()
    }

    /// Enable or disable looping; takes effect at the next end of stream.
    pub fn set_looped(&self, looped: bool) {
        self.core.looped.store(looped, Ordering::Release);
    }

    /// Last volume set on the voice.
    #[must_use]
    pub fn volume(&self) -> f32 {
        self.params.lock().volume
    }

    /// Set the voice gain.
    pub fn set_volume(&self, volume: f32) -> UndertowResult<()> {
        self.ensure_alive()?;
        self.core.backend.set_gain(self.core.voice, volume)?;
        self.params.lock().volume = volume;
        Ok(())
    }

    /// High-frequency gain of the low-pass filter (1.0 = unfiltered).
    #[must_use]
    pub fn low_pass_gain(&self) -> f32 {
        self.params.lock().low_pass_gain
    }

    /// Set the low-pass filter's high-frequency gain. Without a device
    /// filter the value is only recorded.
    pub fn set_low_pass_gain(&self, gain: f32) -> UndertowResult<()> {
        self.ensure_alive()?;
        match self.core.filter {
            Some(filter) => {
                self.core.backend.set_filter_gain_hf(filter, gain)?;
                self.core.backend.bind_filter(self.core.voice, filter)?;
            },
            None => debug!("{} has no low-pass filter; gain {} recorded only", self.core.id, gain),
        }
        self.params.lock().low_pass_gain = gain;
        Ok(())
    }

    /// Open the decoder and queue the first buffer.
    ///
    /// No-op while playing, paused or already prepared. A stopped stream is
    /// rewound to its first sample.
    pub fn prepare(&self) -> UndertowResult<()> {
        self.ensure_alive()?;
        let core = &self.core;
        if core.is_preparing() {
            return Ok(());
        }
        let _stop = core.stop_lock.lock();
        let state = core.backend.voice_state(core.voice)?;
        if state.is_active() {
            return Ok(());
        }
        let mut ring = core.ring.lock();

        if state == VoiceState::Stopped || ring.is_open() {
            ring.close();
            core.empty(&mut ring.free)?;
        }

        core.preparing.store(true, Ordering::Release);
        if let Err(e) = self.prime(&mut ring) {
            ring.close();
            core.preparing.store(false, Ordering::Release);
            return Err(e);
        }
        debug!("{} prepared", core.id);
        Ok(())
    }

    fn prime(&self, ring: &mut RingState) -> UndertowResult<()> {
        let core = &self.core;
        ring.reopen(core.source.as_ref())?;
        if ring.free.is_empty() {
            return Ok(());
        }
        let slot = ring.free.remove(0);

        let fill = match self.streamer.fill_buffer(core, ring, slot) {
            Ok(fill) => fill,
            Err(e) => {
                ring.free.insert(0, slot);
                return Err(e);
            },
        };
        if fill.samples > 0 {
            if let Err(e) = core.backend.queue_buffers(core.voice, &[slot]) {
                ring.free.insert(0, slot);
                return Err(e.into());
            }
        } else {
            ring.free.insert(0, slot);
        }

        if fill.end_of_stream {
            if core.is_looped() && fill.samples > 0 {
                ring.reopen(core.source.as_ref())?;
            } else {
                ring.draining = true;
            }
        }
        Ok(())
    }

    /// Start playback, preparing first if needed. Resumes a paused stream.
    pub fn play(&self) -> UndertowResult<()> {
        self.ensure_alive()?;
        match self.core.backend.voice_state(self.core.voice)? {
            VoiceState::Playing => return Ok(()),
            VoiceState::Paused => return self.resume(),
            VoiceState::Initial | VoiceState::Stopped => {},
        }
        self.streamer.ensure_running()?;

        self.prepare()?;
        self.core.backend.play(self.core.voice)?;
        self.core.preparing.store(false, Ordering::Release);
        self.streamer.add(&self.core)?;
        info!("{} playing", self.core.id);
        Ok(())
    }

    /// Pause playback and stop refilling. No-op unless playing.
    pub fn pause(&self) -> UndertowResult<()> {
        if self.is_disposed() {
            return Ok(());
        }
        let core = &self.core;
        if core.backend.voice_state(core.voice)? != VoiceState::Playing {
            return Ok(());
        }

        let _stop = core.stop_lock.lock();
        self.streamer.remove(core.id);
        core.backend.pause(core.voice)?;
        debug!("{} paused", core.id);
        Ok(())
    }

    /// Resume a paused stream. No-op unless paused.
    pub fn resume(&self) -> UndertowResult<()> {
        if self.is_disposed() {
            return Ok(());
        }
        let core = &self.core;
        if core.backend.voice_state(core.voice)? != VoiceState::Paused {
            return Ok(());
        }

        self.streamer.add(core)?;
        core.backend.play(core.voice)?;
        debug!("{} resumed", core.id);
        Ok(())
    }

    /// Stop playback and close the decoder. A later `play` starts from the
    /// first sample.
    pub fn stop(&self) -> UndertowResult<()> {
        if self.is_disposed() {
            return Ok(());
        }
        let core = &self.core;
        let state = core.backend.voice_state(core.voice)?;

        let _stop = core.stop_lock.lock();
        let mut ring = core.ring.lock();
        self.streamer.remove(core.id);
        if state.is_active() || ring.is_open() {
            core.backend.stop(core.voice)?;
            debug!("{} stopped", core.id);
        }
        ring.close();
        core.preparing.store(false, Ordering::Release);
        Ok(())
    }

    /// Stop and release every device object. Idempotent; the first error
    /// is returned after all releases have been attempted.
    pub fn dispose(&self) -> UndertowResult<()> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let core = &self.core;
        let mut first_error: Option<UndertowError> = None;
        let mut record = |result: DeviceResult<()>| {
            if let Err(e) = result {
                warn!("{} release step failed: {}", core.id, e);
                first_error.get_or_insert(e.into());
            }
        };

        {
            let _stop = core.stop_lock.lock();
            let mut ring = core.ring.lock();
            self.streamer.remove(core.id);
            record(core.backend.stop(core.voice));
            record(core.empty(&mut ring.free));
            ring.close();
            core.preparing.store(false, Ordering::Release);
        }

        record(core.backend.delete_voice(core.voice));
        record(core.backend.delete_buffers(&core.buffers));
        if let Some(filter) = core.filter {
            record(core.backend.delete_filter(filter));
        }

        info!("{} disposed", core.id);
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if let Err(e) = self.dispose() {
            warn!("Disposing {} on drop failed: {}", self.core.id, e);
        }
    }
}
