//! Buffer Streamer
//!
//! One [`Streamer`] per process keeps every playing [`Stream`](crate::Stream)
//! fed. Each pass (a *tick*) walks the registry and, for every stream:
//!
//! 1. reclaims the buffers its voice has finished with,
//! 2. decodes the next chunk into each free slot and queues it,
//! 3. restarts the voice if it ran dry while the stream should be playing.
//!
//! Passes run on a background thread at [`StreamerConfig::update_rate`], or
//! on demand through [`Streamer::update`] for manual streamers.
//!
//! Locks nest as `stop_lock -> ring -> registry`. The shared decode scratch
//! is only ever taken while a ring lock is held.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use parking_lot::{const_mutex, Mutex};
use tracing::{debug, error, info, trace, warn};
use undertow_common::{BufferId, StreamId, StreamerError, UndertowError, UndertowResult};

use crate::backend::{SampleFormat, VoiceState};
use crate::config::StreamerConfig;
use crate::decoder::frame_aligned;
use crate::pcm::cast_buffer;
use crate::stream::{RingState, StreamCore};

/// The live streamer, if any.
static INSTANCE: Mutex<Option<Weak<StreamerShared>>> = const_mutex(None);

/// Decode scratch reused by every refill.
struct Scratch {
    samples: Vec<f32>,
    pcm: Vec<i16>,
}

/// Result of decoding one chunk into one buffer slot.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Fill {
    /// Samples submitted to the slot (0 means nothing was submitted)
    pub samples: usize,
    /// The reader returned fewer samples than requested
    pub end_of_stream: bool,
}

pub(crate) struct StreamerShared {
    config: StreamerConfig,
    registry: Mutex<HashMap<StreamId, Arc<StreamCore>>>,
    scratch: Mutex<Scratch>,
    cancelled: AtomicBool,
}

impl StreamerShared {
    fn new(config: StreamerConfig) -> Self {
        let scratch = Scratch {
            samples: vec![0.0; config.buffer_size],
            pcm: vec![0; config.buffer_size],
        };
        Self {
            config,
            registry: Mutex::new(HashMap::new()),
            scratch: Mutex::new(scratch),
            cancelled: AtomicBool::new(false),
        }
    }

    fn is_running(&self) -> bool {
        !self.cancelled.load(Ordering::Acquire)
    }

    fn run(self: Arc<Self>) {
        let interval = self.config.tick_interval();
        let mut snapshot = Vec::new();
        debug!("Streamer thread started ({:?} per tick)", interval);
        while self.is_running() {
            thread::sleep(interval);
            if !self.is_running() {
                break;
            }
            self.pass(&mut snapshot);
        }
        debug!("Streamer thread exiting");
    }

    /// Service every registered stream once.
    fn pass(&self, snapshot: &mut Vec<Arc<StreamCore>>) -> usize {
        snapshot.clear();
        snapshot.extend(self.registry.lock().values().cloned());

        let mut refilled = 0;
        for stream in snapshot.drain(..) {
            match self.service(&stream) {
                Ok(count) => refilled += count,
                Err(e) => error!("Streaming {} failed: {}", stream.id, e),
            }
        }
        refilled
    }

    fn service(&self, stream: &StreamCore) -> UndertowResult<usize> {
        let backend = &stream.backend;
        let voice = stream.voice;

        let refilled = {
            let mut ring = stream.ring.lock();
            if !self.contains(stream.id) {
                return Ok(0);
            }

            let queued = backend.queued_count(voice)?;
            let processed = backend.processed_count(voice)?;

            if ring.draining {
                if processed > 0 {
                    stream.reclaim(processed, &mut ring.free)?;
                }
                if queued == processed {
                    self.remove(stream.id);
                    info!("{} finished playing", stream.id);
                    return Ok(0);
                }
                0
            } else {
                if processed == 0 && queued == stream.buffers.len() {
                    return Ok(0);
                }
                if processed > 0 {
                    stream.reclaim(processed, &mut ring.free)?;
                }

                let (filled, finished) = self.refill(stream, &mut ring)?;
                if !filled.is_empty() {
                    if let Err(e) = backend.queue_buffers(voice, &filled) {
                        ring.free.extend(filled);
                        return Err(e.into());
                    }
                    trace!("{} queued {} buffers", stream.id, filled.len());
                }
                if finished {
                    ring.draining = true;
                    debug!("{} reached end of stream; draining", stream.id);
                    return Ok(filled.len());
                }
                filled.len()
            }
        };

        let _stop = stream.stop_lock.lock();
        if stream.is_preparing() || !self.contains(stream.id) {
            return Ok(refilled);
        }
        if backend.voice_state(voice)? == VoiceState::Stopped {
            warn!("{} starved; restarting voice", stream.id);
            backend.play(voice)?;
        }
        Ok(refilled)
    }

    /// Fill free slots in order. Returns the slots that received data and
    /// whether the stream ran out for good.
    ///
    /// On error every slot taken from the free list goes back to it, filled
    /// or not.
    fn refill(
        &self,
        stream: &StreamCore,
        ring: &mut RingState,
    ) -> UndertowResult<(Vec<BufferId>, bool)> {
        let mut pending = std::mem::take(&mut ring.free).into_iter();
        let mut filled = Vec::with_capacity(pending.len());
        let mut finished = false;

        while let Some(slot) = pending.next() {
            if finished {
                ring.free.push(slot);
                continue;
            }

            match self.fill_slot(stream, ring, slot) {
                Ok((has_data, done)) => {
                    if has_data {
                        filled.push(slot);
                    } else {
                        ring.free.push(slot);
                    }
                    finished = done;
                },
                Err(e) => {
                    ring.free.push(slot);
                    ring.free.extend(filled);
                    ring.free.extend(pending);
                    return Err(e);
                },
            }
        }
        Ok((filled, finished))
    }

    /// Fill one slot, rewinding a looping stream at end of stream. Returns
    /// whether the slot holds data and whether the stream is finished.
    fn fill_slot(
        &self,
        stream: &StreamCore,
        ring: &mut RingState,
        slot: BufferId,
    ) -> UndertowResult<(bool, bool)> {
        let mut fill = self.fill_buffer(stream, ring, slot)?;
        if fill.samples == 0 && stream.is_looped() {
            ring.reopen(stream.source.as_ref())?;
            fill = self.fill_buffer(stream, ring, slot)?;
            if fill.samples == 0 {
                warn!("{} produced no samples after rewinding", stream.id);
                return Ok((false, true));
            }
        }

        let mut finished = false;
        if fill.end_of_stream {
            if stream.is_looped() {
                ring.reopen(stream.source.as_ref())?;
                debug!("{} looped", stream.id);
            } else {
                finished = true;
            }
        }
        Ok((fill.samples > 0, finished))
    }

    /// Decode one chunk and submit it to `slot`. Zero-length reads are not
    /// submitted.
    pub(crate) fn fill_buffer(
        &self,
        stream: &StreamCore,
        ring: &mut RingState,
        slot: BufferId,
    ) -> UndertowResult<Fill> {
        let reader = ring.reader.as_mut().ok_or(UndertowError::DecoderClosed)?;
        let channels = reader.channels();
        let sample_rate = reader.sample_rate();

        let mut scratch = self.scratch.lock();
        let Scratch { samples, pcm } = &mut *scratch;
        let requested = frame_aligned(samples.len(), channels);
        let read = reader.read_samples(&mut samples[..requested])?.min(requested);

        if read > 0 {
            cast_buffer(&samples[..read], &mut pcm[..read]);
            stream.backend.submit_buffer(
                slot,
                SampleFormat::for_channels(channels),
                &pcm[..read],
                sample_rate,
            )?;
        }
        trace!("{} filled {} with {}/{} samples", stream.id, slot, read, requested);

        Ok(Fill {
            samples: read,
            end_of_stream: read < requested,
        })
    }

    fn contains(&self, id: StreamId) -> bool {
        self.registry.lock().contains_key(&id)
    }

    fn remove(&self, id: StreamId) -> bool {
        self.registry.lock().remove(&id).is_some()
    }
}

/// Cloneable reference to a running streamer, used to attach streams.
#[derive(Clone)]
pub struct StreamerHandle {
    shared: Arc<StreamerShared>,
}

impl StreamerHandle {
    /// Scheduler configuration in use.
    #[must_use]
    pub fn config(&self) -> &StreamerConfig {
        &self.shared.config
    }

    /// Whether the streamer has not been disposed.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Whether a stream is currently being serviced.
    #[must_use]
    pub fn is_registered(&self, id: StreamId) -> bool {
        self.shared.contains(id)
    }

    /// Number of streams currently being serviced.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.shared.registry.lock().len()
    }

    /// Run one pass immediately. Returns the number of buffers queued.
    pub fn update(&self) -> usize {
        self.shared.pass(&mut Vec::new())
    }

    pub(crate) fn ensure_running(&self) -> Result<(), StreamerError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(StreamerError::NotRunning)
        }
    }

    /// Register a stream. Registering twice is a no-op.
    pub(crate) fn add(&self, stream: &Arc<StreamCore>) -> Result<(), StreamerError> {
        self.ensure_running()?;
        self.shared
            .registry
            .lock()
            .entry(stream.id)
            .or_insert_with(|| Arc::clone(stream));
        Ok(())
    }

    pub(crate) fn remove(&self, id: StreamId) -> bool {
        self.shared.remove(id)
    }

    pub(crate) fn fill_buffer(
        &self,
        stream: &StreamCore,
        ring: &mut RingState,
        slot: BufferId,
    ) -> UndertowResult<Fill> {
        self.shared.fill_buffer(stream, ring, slot)
    }
}

/// Process-wide streaming scheduler.
///
/// Only one streamer may be live at a time; constructing a second fails
/// with [`StreamerError::AlreadyRunning`]. Dropping the streamer stops its
/// thread and forgets every registered stream.
pub struct Streamer {
    handle: StreamerHandle,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Streamer {
    /// Start the streamer with its background thread.
    pub fn new(config: StreamerConfig) -> UndertowResult<Self> {
        Self::start(config, true)
    }

    /// Start a streamer without a thread; passes run on [`Self::update`].
    pub fn manual(config: StreamerConfig) -> UndertowResult<Self> {
        Self::start(config, false)
    }

    fn start(config: StreamerConfig, spawn: bool) -> UndertowResult<Self> {
        config.check()?;

        let mut instance = INSTANCE.lock();
        let live = instance
            .as_ref()
            .and_then(Weak::upgrade)
            .is_some_and(|shared| shared.is_running());
        if live {
            return Err(StreamerError::AlreadyRunning.into());
        }

        let shared = Arc::new(StreamerShared::new(config));
        let worker = if spawn {
            let thread_shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name("undertow-streamer".to_string())
                .spawn(move || thread_shared.run())
                .map_err(StreamerError::Spawn)?;
            Some(handle)
        } else {
            None
        };
        *instance = Some(Arc::downgrade(&shared));

        info!(
            "Streamer started: {} samples per buffer, {} Hz{}",
            shared.config.buffer_size,
            shared.config.update_rate,
            if spawn { "" } else { " (manual)" }
        );
        Ok(Self {
            handle: StreamerHandle { shared },
            worker: Mutex::new(worker),
        })
    }

    /// Handle to the live streamer.
    pub fn current() -> Result<StreamerHandle, StreamerError> {
        INSTANCE
            .lock()
            .as_ref()
            .and_then(Weak::upgrade)
            .filter(|shared| shared.is_running())
            .map(|shared| StreamerHandle { shared })
            .ok_or(StreamerError::NotRunning)
    }

    /// Handle for attaching streams to this streamer.
    #[must_use]
    pub fn handle(&self) -> StreamerHandle {
        self.handle.clone()
    }

    /// Scheduler configuration in use.
    #[must_use]
    pub fn config(&self) -> &StreamerConfig {
        self.handle.config()
    }

    /// Run one pass on the calling thread.
    pub fn update(&self) -> usize {
        self.handle.update()
    }

    /// Whether a stream is currently being serviced.
    #[must_use]
    pub fn is_registered(&self, id: StreamId) -> bool {
        self.handle.is_registered(id)
    }

    /// Number of streams currently being serviced.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.handle.active_count()
    }

    /// Stop the thread and forget every stream. Idempotent.
    pub fn dispose(&self) {
        let shared = &self.handle.shared;
        {
            let mut instance = INSTANCE.lock();
            if shared.cancelled.swap(true, Ordering::AcqRel) {
                return;
            }
            shared.registry.lock().clear();
            let ours = instance
                .as_ref()
                .is_some_and(|weak| weak.as_ptr() == Arc::as_ptr(shared));
            if ours {
                *instance = None;
            }
        }

        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                error!("Streamer thread panicked");
            }
        }
        info!("Streamer stopped");
    }
}

impl Drop for Streamer {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use proptest::test_runner::{Config, TestRunner};
    use serial_test::serial;

    use super::*;
    use crate::config::StreamOptions;
    use crate::stream::Stream;
    use crate::testing::{ramp_source, FlakySource, ScriptedBackend};
    use crate::AudioBackend;

    fn manual(buffer_size: usize) -> Streamer {
        Streamer::manual(StreamerConfig::default().with_buffer_size(buffer_size))
            .expect("manual streamer")
    }

    fn stream(
        streamer: &Streamer,
        backend: &Arc<ScriptedBackend>,
        len: usize,
        options: StreamOptions,
    ) -> Stream {
        Stream::new(
            &streamer.handle(),
            Arc::clone(backend) as Arc<dyn AudioBackend>,
            ramp_source(len),
            options,
        )
        .expect("stream")
    }

    #[test]
    #[serial]
    fn test_second_streamer_rejected() {
        let first = manual(64);
        let second = Streamer::manual(StreamerConfig::default());
        assert!(matches!(
            second,
            Err(UndertowError::Streamer(StreamerError::AlreadyRunning))
        ));
        assert!(Streamer::current().is_ok());

        first.dispose();
        assert!(matches!(Streamer::current(), Err(StreamerError::NotRunning)));
        let third = manual(64);
        assert!(third.handle().is_running());
    }

    #[test]
    #[serial]
    fn test_current_without_streamer() {
        assert!(matches!(Streamer::current(), Err(StreamerError::NotRunning)));
    }

    #[test]
    #[serial]
    fn test_invalid_config_rejected() {
        let result = Streamer::manual(StreamerConfig::default().with_buffer_size(0));
        assert!(matches!(
            result,
            Err(UndertowError::Streamer(StreamerError::InvalidConfig(_)))
        ));

        let result = Streamer::new(StreamerConfig::default().with_update_rate(1e-30));
        assert!(matches!(
            result,
            Err(UndertowError::Streamer(StreamerError::InvalidConfig(_)))
        ));
        assert!(matches!(Streamer::current(), Err(StreamerError::NotRunning)));
    }

    #[test]
    #[serial]
    fn test_idle_pass_is_noop() {
        let streamer = manual(64);
        assert_eq!(streamer.update(), 0);
        assert_eq!(streamer.update(), 0);
        assert_eq!(streamer.active_count(), 0);
    }

    #[test]
    #[serial]
    fn test_short_stream_plays_out_and_deregisters() {
        let streamer = manual(4);
        let backend = ScriptedBackend::new();
        let stream = stream(
            &streamer,
            &backend,
            10,
            StreamOptions::default().with_looping(false),
        );
        let voice = stream.voice();

        stream.play().expect("play");
        assert!(streamer.is_registered(stream.id()));
        assert_eq!(streamer.update(), 2);

        let lengths: Vec<usize> = backend.submissions().iter().map(|s| s.samples).collect();
        assert_eq!(lengths, vec![4, 4, 2]);

        // Still draining while buffers are pending
        assert_eq!(streamer.update(), 0);
        assert!(streamer.is_registered(stream.id()));

        assert_eq!(backend.consume_all(voice), 10);
        streamer.update();
        assert!(!streamer.is_registered(stream.id()));
        assert_eq!(backend.submissions().len(), 3);
        assert_eq!(backend.voice_state(voice).expect("state"), VoiceState::Stopped);
    }

    #[test]
    #[serial]
    fn test_chunk_count_matches_stream_length() {
        let mut runner = TestRunner::new(Config::with_cases(48));
        runner
            .run(&(1usize..200, 2usize..16, 2usize..5), |(total, chunk, count)| {
                let streamer = manual(chunk);
                let backend = ScriptedBackend::new();
                let stream = stream(
                    &streamer,
                    &backend,
                    total,
                    StreamOptions::default()
                        .with_looping(false)
                        .with_buffer_count(count),
                );
                stream.play().expect("play");

                let mut played = 0;
                for _ in 0..1000 {
                    if !streamer.is_registered(stream.id()) {
                        break;
                    }
                    streamer.update();
                    played += backend.consume_all(stream.voice());
                }

                let submissions = backend.submissions();
                let expected_last = if total % chunk == 0 { chunk } else { total % chunk };
                assert!(!streamer.is_registered(stream.id()));
                assert_eq!(submissions.len(), total.div_ceil(chunk));
                assert_eq!(submissions.last().map(|s| s.samples), Some(expected_last));
                assert_eq!(played, total);
                Ok(())
            })
            .expect("property holds");
    }

    #[test]
    #[serial]
    fn test_looping_stream_rewinds() {
        let streamer = manual(4);
        let backend = ScriptedBackend::new();
        let stream = stream(&streamer, &backend, 10, StreamOptions::default());
        stream.play().expect("play");
        streamer.update();

        assert_eq!(backend.consume_one(stream.voice()), 4);
        assert_eq!(streamer.update(), 1);

        let submissions = backend.submissions();
        let first = submissions.first().and_then(|s| s.first);
        assert_eq!(submissions.len(), 4);
        assert_eq!(submissions[3].first, first);
        assert_eq!(submissions[3].samples, 4);
        assert!(streamer.is_registered(stream.id()));
    }

    #[test]
    #[serial]
    fn test_looping_stream_skips_empty_chunk() {
        let streamer = manual(4);
        let backend = ScriptedBackend::new();
        let stream = stream(&streamer, &backend, 8, StreamOptions::default());
        stream.play().expect("play");
        streamer.update();

        // 8 samples split into two full chunks; the third slot rewinds
        let submissions = backend.submissions();
        assert_eq!(submissions.len(), 3);
        assert!(submissions.iter().all(|s| s.samples == 4));
        assert_eq!(submissions[2].first, submissions[0].first);
    }

    #[test]
    #[serial]
    fn test_starved_voice_restarted() {
        let streamer = manual(4);
        let backend = ScriptedBackend::new();
        let stream = stream(&streamer, &backend, 100, StreamOptions::default());
        stream.play().expect("play");
        let first = backend.submissions()[0];
        let plays = backend.play_calls();

        backend.force_state(Some(VoiceState::Stopped));
        streamer.update();

        assert_eq!(backend.play_calls(), plays + 1);
        assert_eq!(backend.inner.buffer_len(first.buffer).expect("len"), 4);
        assert_eq!(
            backend
                .submissions()
                .iter()
                .filter(|s| s.buffer == first.buffer)
                .count(),
            1
        );
    }

    #[test]
    #[serial]
    fn test_stopped_stream_not_restarted() {
        let streamer = manual(4);
        let backend = ScriptedBackend::new();
        let stream = stream(&streamer, &backend, 100, StreamOptions::default());
        stream.play().expect("play");
        stream.stop().expect("stop");
        let plays = backend.play_calls();

        backend.force_state(Some(VoiceState::Stopped));
        streamer.update();
        assert_eq!(backend.play_calls(), plays);
        assert!(!streamer.is_registered(stream.id()));
    }

    #[test]
    #[serial]
    fn test_failed_unqueue_salvaged() {
        let streamer = manual(4);
        let backend = ScriptedBackend::new();
        let stream = stream(
            &streamer,
            &backend,
            100,
            StreamOptions::default().with_looping(false),
        );
        let voice = stream.voice();
        stream.play().expect("play");
        streamer.update();
        assert_eq!(backend.queued_count(voice).expect("queued"), 3);

        backend.consume_one(voice);
        backend.fail_next_unqueues(1);
        let plays = backend.play_calls();
        assert_eq!(streamer.update(), 3);

        assert_eq!(backend.queued_count(voice).expect("queued"), 3);
        assert_eq!(backend.processed_count(voice).expect("processed"), 0);
        assert_eq!(backend.voice_state(voice).expect("state"), VoiceState::Playing);
        assert_eq!(backend.play_calls(), plays + 1);
    }

    #[test]
    #[serial]
    fn test_decode_error_keeps_free_slots() {
        let streamer = manual(4);
        let backend = ScriptedBackend::new();
        let stream = Stream::new(
            &streamer.handle(),
            Arc::clone(&backend) as Arc<dyn AudioBackend>,
            FlakySource {
                inner: ramp_source(100),
                fail_on: 2,
            },
            StreamOptions::default().with_looping(false),
        )
        .expect("stream");
        let voice = stream.voice();
        stream.play().expect("play");
        assert_eq!(backend.queued_count(voice).expect("queued"), 1);

        assert_eq!(streamer.update(), 0);
        assert_eq!(backend.queued_count(voice).expect("queued"), 1);
        assert!(streamer.is_registered(stream.id()));

        assert_eq!(streamer.update(), 2);
        assert_eq!(backend.queued_count(voice).expect("queued"), 3);
        let lengths: Vec<usize> = backend.submissions().iter().map(|s| s.samples).collect();
        assert_eq!(lengths, vec![4, 4, 4]);
    }

    #[test]
    #[serial]
    fn test_refused_queue_keeps_filled_slots() {
        let streamer = manual(4);
        let backend = ScriptedBackend::new();
        let stream = stream(
            &streamer,
            &backend,
            100,
            StreamOptions::default().with_looping(false),
        );
        let voice = stream.voice();
        stream.play().expect("play");

        backend.fail_next_queues(1);
        assert_eq!(streamer.update(), 0);
        assert_eq!(backend.queued_count(voice).expect("queued"), 1);

        assert_eq!(streamer.update(), 2);
        assert_eq!(backend.queued_count(voice).expect("queued"), 3);
        assert_eq!(backend.submissions().len(), 5);
    }

    #[test]
    #[serial]
    fn test_dispose_clears_registry() {
        let streamer = manual(4);
        let backend = ScriptedBackend::new();
        let stream = stream(&streamer, &backend, 100, StreamOptions::default());
        stream.play().expect("play");
        assert_eq!(streamer.active_count(), 1);

        streamer.dispose();
        streamer.dispose();
        assert_eq!(streamer.active_count(), 0);
        assert!(matches!(
            stream.play(),
            Ok(()) | Err(UndertowError::Streamer(StreamerError::NotRunning))
        ));
        assert!(!streamer.is_registered(stream.id()));
    }

    #[test]
    #[serial]
    fn test_background_thread_plays_stream_to_end() {
        let streamer = Streamer::new(
            StreamerConfig::default()
                .with_buffer_size(64)
                .with_update_rate(200.0),
        )
        .expect("streamer");
        let backend = ScriptedBackend::new();
        let stream = stream(
            &streamer,
            &backend,
            1000,
            StreamOptions::default().with_looping(false),
        );
        stream.play().expect("play");

        let deadline = Instant::now() + Duration::from_secs(5);
        while streamer.is_registered(stream.id()) && Instant::now() < deadline {
            backend.consume_all(stream.voice());
            thread::sleep(Duration::from_millis(2));
        }

        assert!(!streamer.is_registered(stream.id()));
        let total: usize = backend.submissions().iter().map(|s| s.samples).sum();
        assert_eq!(total, 1000);
    }
}
