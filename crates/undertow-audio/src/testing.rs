//! Test doubles shared by the stream and streamer tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use undertow_common::{BufferId, DecodeError, DeviceError, DeviceResult, FilterId, VoiceId};

use crate::backend::{AudioBackend, SampleFormat, VoiceState};
use crate::decoder::{DecoderFactory, PcmSource, SampleReader};
use crate::software::SoftwareBackend;

/// One `submit_buffer` call as seen by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submission {
    pub buffer: BufferId,
    pub samples: usize,
    pub first: Option<i16>,
}

/// Software device that records traffic and can be told to misbehave.
#[derive(Default)]
pub struct ScriptedBackend {
    pub inner: SoftwareBackend,
    submissions: Mutex<Vec<Submission>>,
    forced_state: Mutex<Option<VoiceState>>,
    unqueue_failures: AtomicUsize,
    queue_failures: AtomicUsize,
    fail_play: AtomicBool,
    play_calls: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.submissions.lock().clone()
    }

    pub fn play_calls(&self) -> usize {
        self.play_calls.load(Ordering::SeqCst)
    }

    /// Report `state` for every voice until cleared with `None`.
    pub fn force_state(&self, state: Option<VoiceState>) {
        *self.forced_state.lock() = state;
    }

    /// Refuse the next `count` unqueue commands.
    pub fn fail_next_unqueues(&self, count: usize) {
        self.unqueue_failures.store(count, Ordering::SeqCst);
    }

    /// Refuse the next `count` queue commands.
    pub fn fail_next_queues(&self, count: usize) {
        self.queue_failures.store(count, Ordering::SeqCst);
    }

    pub fn fail_play(&self, fail: bool) {
        self.fail_play.store(fail, Ordering::SeqCst);
    }

    /// Play through every buffer currently pending on the voice.
    pub fn consume_all(&self, voice: VoiceId) -> usize {
        let mut out = Vec::new();
        let mut consumed = 0;
        while let Ok(Some(_)) = self.inner.render(voice, &mut out, usize::MAX) {
            consumed += out.len();
        }
        consumed
    }

    /// Play through exactly one pending buffer.
    pub fn consume_one(&self, voice: VoiceId) -> usize {
        let mut out = Vec::new();
        match self.inner.render(voice, &mut out, usize::MAX) {
            Ok(Some(_)) => out.len(),
            _ => 0,
        }
    }
}

impl AudioBackend for ScriptedBackend {
    fn create_buffers(&self, count: usize) -> DeviceResult<Vec<BufferId>> {
        self.inner.create_buffers(count)
    }

    fn delete_buffers(&self, buffers: &[BufferId]) -> DeviceResult<()> {
        self.inner.delete_buffers(buffers)
    }

    fn create_voice(&self) -> DeviceResult<VoiceId> {
        self.inner.create_voice()
    }

    fn delete_voice(&self, voice: VoiceId) -> DeviceResult<()> {
        self.inner.delete_voice(voice)
    }

    fn submit_buffer(
        &self,
        buffer: BufferId,
        format: SampleFormat,
        pcm: &[i16],
        sample_rate: u32,
    ) -> DeviceResult<()> {
        self.inner.submit_buffer(buffer, format, pcm, sample_rate)?;
        self.submissions.lock().push(Submission {
            buffer,
            samples: pcm.len(),
            first: pcm.first().copied(),
        });
        Ok(())
    }

    fn queue_buffers(&self, voice: VoiceId, buffers: &[BufferId]) -> DeviceResult<()> {
        if take_failure(&self.queue_failures) {
            return Err(DeviceError::Output("scripted queue failure".to_string()));
        }
        self.inner.queue_buffers(voice, buffers)
    }

    fn unqueue_buffers(&self, voice: VoiceId, count: usize) -> DeviceResult<Vec<BufferId>> {
        if take_failure(&self.unqueue_failures) {
            return Err(DeviceError::InvalidOperation(
                "scripted unqueue failure".to_string(),
            ));
        }
        self.inner.unqueue_buffers(voice, count)
    }

    fn queued_count(&self, voice: VoiceId) -> DeviceResult<usize> {
        self.inner.queued_count(voice)
    }

    fn processed_count(&self, voice: VoiceId) -> DeviceResult<usize> {
        self.inner.processed_count(voice)
    }

    fn play(&self, voice: VoiceId) -> DeviceResult<()> {
        self.play_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_play.load(Ordering::SeqCst) {
            return Err(DeviceError::Output("scripted device loss".to_string()));
        }
        *self.forced_state.lock() = None;
        self.inner.play(voice)
    }

    fn pause(&self, voice: VoiceId) -> DeviceResult<()> {
        self.inner.pause(voice)
    }

    fn stop(&self, voice: VoiceId) -> DeviceResult<()> {
        self.inner.stop(voice)
    }

    fn voice_state(&self, voice: VoiceId) -> DeviceResult<VoiceState> {
        match *self.forced_state.lock() {
            Some(state) => Ok(state),
            None => self.inner.voice_state(voice),
        }
    }

    fn set_gain(&self, voice: VoiceId, gain: f32) -> DeviceResult<()> {
        self.inner.set_gain(voice, gain)
    }

    fn create_filter(&self) -> DeviceResult<Option<FilterId>> {
        self.inner.create_filter()
    }

    fn set_filter_gain_hf(&self, filter: FilterId, gain: f32) -> DeviceResult<()> {
        self.inner.set_filter_gain_hf(filter, gain)
    }

    fn bind_filter(&self, voice: VoiceId, filter: FilterId) -> DeviceResult<()> {
        self.inner.bind_filter(voice, filter)
    }

    fn delete_filter(&self, filter: FilterId) -> DeviceResult<()> {
        self.inner.delete_filter(filter)
    }
}

fn take_failure(remaining: &AtomicUsize) -> bool {
    remaining
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Source whose readers fail exactly once, on their `fail_on`-th read.
pub struct FlakySource {
    pub inner: PcmSource,
    pub fail_on: usize,
}

impl DecoderFactory for FlakySource {
    fn open(&self) -> Result<Box<dyn SampleReader>, DecodeError> {
        Ok(Box::new(FlakyReader {
            inner: self.inner.open()?,
            reads: 0,
            fail_on: self.fail_on,
        }))
    }
}

struct FlakyReader {
    inner: Box<dyn SampleReader>,
    reads: usize,
    fail_on: usize,
}

impl SampleReader for FlakyReader {
    fn read_samples(&mut self, buffer: &mut [f32]) -> Result<usize, DecodeError> {
        self.reads += 1;
        if self.reads == self.fail_on {
            return Err(DecodeError::Corrupt("scripted decode failure".to_string()));
        }
        self.inner.read_samples(buffer)
    }

    fn channels(&self) -> u16 {
        self.inner.channels()
    }

    fn sample_rate(&self) -> u32 {
        self.inner.sample_rate()
    }
}

/// Mono source whose sample `i` is `(i + 1) / 1000`, so every chunk starts
/// with a distinguishable PCM value.
pub fn ramp_source(len: usize) -> PcmSource {
    let samples: Vec<f32> = (0..len).map(|i| (i + 1) as f32 / 1000.0).collect();
    PcmSource::new(samples, 1, 8000)
}
