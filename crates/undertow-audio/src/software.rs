//! Software Voice Backend
//!
//! An in-memory implementation of [`AudioBackend`] with OpenAL source
//! semantics. Voices consume their buffer queue through [`SoftwareBackend::render`],
//! which the rodio output calls from the host audio thread.
//!
//! Rules enforced here, matching what real drivers reject:
//! - a buffer queued on any voice cannot be rewritten or queued again
//! - only processed buffers can be unqueued
//! - a voice that consumes its last queued buffer stops by itself

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use tracing::debug;
use undertow_common::{BufferId, DeviceError, DeviceResult, FilterId, VoiceId};

use crate::backend::{AudioBackend, SampleFormat, VoiceState};

/// Smoothing coefficient of the one-pole low-pass filter.
const LOW_PASS_ALPHA: f32 = 0.2;

/// Format of a block produced by [`SoftwareBackend::render`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderFormat {
    /// Interleaved channel count.
    pub channels: u16,
    /// Samples per second per channel.
    pub sample_rate: u32,
}

#[derive(Debug)]
struct BufferSlot {
    format: SampleFormat,
    sample_rate: u32,
    pcm: Vec<i16>,
    queued_on: Option<VoiceId>,
}

impl BufferSlot {
    fn empty() -> Self {
        Self {
            format: SampleFormat::Mono16,
            sample_rate: 0,
            pcm: Vec::new(),
            queued_on: None,
        }
    }
}

#[derive(Debug, Default)]
struct Voice {
    state: VoiceState,
    queue: VecDeque<BufferId>,
    /// Index of the buffer being played; everything before it is processed.
    cursor: usize,
    /// Sample offset inside the current buffer.
    offset: usize,
    gain: f32,
    filter: Option<FilterId>,
    /// Low-pass history per channel.
    history: [f32; 2],
}

impl Voice {
    fn new() -> Self {
        Self {
            gain: 1.0,
            ..Self::default()
        }
    }

    fn rewind(&mut self) {
        self.cursor = 0;
        self.offset = 0;
        self.history = [0.0; 2];
    }
}

#[derive(Debug, Default)]
struct DeviceState {
    next_id: u32,
    buffers: HashMap<BufferId, BufferSlot>,
    voices: HashMap<VoiceId, Voice>,
    /// High-frequency gain per filter.
    filters: HashMap<FilterId, f32>,
}

impl DeviceState {
    fn next_raw(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn voice_mut(&mut self, voice: VoiceId) -> DeviceResult<&mut Voice> {
        self.voices
            .get_mut(&voice)
            .ok_or(DeviceError::InvalidVoice(voice))
    }

    fn voice(&self, voice: VoiceId) -> DeviceResult<&Voice> {
        self.voices.get(&voice).ok_or(DeviceError::InvalidVoice(voice))
    }
}

/// In-memory device with OpenAL-style voices.
#[derive(Debug, Default)]
pub struct SoftwareBackend {
    state: Mutex<DeviceState>,
}

impl SoftwareBackend {
    /// Create an empty device.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live voices.
    #[must_use]
    pub fn voice_count(&self) -> usize {
        self.state.lock().voices.len()
    }

    /// Number of live buffers.
    #[must_use]
    pub fn buffer_count(&self) -> usize {
        self.state.lock().buffers.len()
    }

    /// Number of PCM samples currently stored in a buffer.
    pub fn buffer_len(&self, buffer: BufferId) -> DeviceResult<usize> {
        self.state
            .lock()
            .buffers
            .get(&buffer)
            .map(|slot| slot.pcm.len())
            .ok_or(DeviceError::InvalidBuffer(buffer))
    }

    /// Pull up to `max_samples` rendered samples from a voice into `out`.
    ///
    /// A block never crosses a buffer boundary, so it has a single format.
    /// Returns `None` (with `out` empty) while the voice is not playing.
    /// Consuming the last queued buffer moves the voice to
    /// [`VoiceState::Stopped`].
    pub fn render(
        &self,
        voice: VoiceId,
        out: &mut Vec<i16>,
        max_samples: usize,
    ) -> DeviceResult<Option<RenderFormat>> {
        let mut guard = self.state.lock();
        let DeviceState {
            buffers,
            voices,
            filters,
            ..
        } = &mut *guard;
        let voice_state = voices
            .get_mut(&voice)
            .ok_or(DeviceError::InvalidVoice(voice))?;

        out.clear();
        if voice_state.state != VoiceState::Playing {
            return Ok(None);
        }

        loop {
            let Some(&buffer_id) = voice_state.queue.get(voice_state.cursor) else {
                voice_state.state = VoiceState::Stopped;
                voice_state.offset = 0;
                return Ok(None);
            };
            let slot = buffers
                .get(&buffer_id)
                .ok_or(DeviceError::InvalidBuffer(buffer_id))?;

            if voice_state.offset >= slot.pcm.len() {
                // Empty or exhausted buffer: move on without emitting anything
                voice_state.cursor += 1;
                voice_state.offset = 0;
                continue;
            }

            let channels = usize::from(slot.format.channels());
            let budget = (max_samples - max_samples % channels).max(channels);
            let start = voice_state.offset;
            let end = (start + budget).min(slot.pcm.len());

            let gain_hf = voice_state
                .filter
                .and_then(|filter| filters.get(&filter).copied())
                .unwrap_or(1.0);
            for (i, &sample) in slot.pcm[start..end].iter().enumerate() {
                let channel = (start + i) % channels;
                let mut value = f32::from(sample);
                if gain_hf < 1.0 {
                    let history = &mut voice_state.history[channel.min(1)];
                    *history += LOW_PASS_ALPHA * (value - *history);
                    value = *history + gain_hf * (value - *history);
                }
                value *= voice_state.gain;
                out.push(value.clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16);
            }

            voice_state.offset = end;
            if end == slot.pcm.len() {
                voice_state.cursor += 1;
                voice_state.offset = 0;
                if voice_state.cursor >= voice_state.queue.len() {
                    voice_state.state = VoiceState::Stopped;
                    debug!("{} consumed its last queued buffer", voice);
                }
            }

            return Ok(Some(RenderFormat {
                channels: slot.format.channels(),
                sample_rate: slot.sample_rate,
            }));
        }
    }
}

impl AudioBackend for SoftwareBackend {
    fn create_buffers(&self, count: usize) -> DeviceResult<Vec<BufferId>> {
        let mut state = self.state.lock();
        let ids: Vec<BufferId> = (0..count)
            .map(|_| BufferId::new(state.next_raw()))
            .collect();
        for id in &ids {
            state.buffers.insert(*id, BufferSlot::empty());
        }
        Ok(ids)
    }

    fn delete_buffers(&self, buffers: &[BufferId]) -> DeviceResult<()> {
        let mut state = self.state.lock();
        for id in buffers {
            let slot = state
                .buffers
                .get(id)
                .ok_or(DeviceError::InvalidBuffer(*id))?;
            if let Some(voice) = slot.queued_on {
                return Err(DeviceError::InvalidOperation(format!(
                    "{id} is still queued on {voice}"
                )));
            }
        }
        for id in buffers {
            state.buffers.remove(id);
        }
        Ok(())
    }

    fn create_voice(&self) -> DeviceResult<VoiceId> {
        let mut state = self.state.lock();
        let id = VoiceId::new(state.next_raw());
        state.voices.insert(id, Voice::new());
        Ok(id)
    }

    fn delete_voice(&self, voice: VoiceId) -> DeviceResult<()> {
        let mut state = self.state.lock();
        let removed = state
            .voices
            .remove(&voice)
            .ok_or(DeviceError::InvalidVoice(voice))?;
        for id in removed.queue {
            if let Some(slot) = state.buffers.get_mut(&id) {
                slot.queued_on = None;
            }
        }
        Ok(())
    }

    fn submit_buffer(
        &self,
        buffer: BufferId,
        format: SampleFormat,
        pcm: &[i16],
        sample_rate: u32,
    ) -> DeviceResult<()> {
        if sample_rate == 0 {
            return Err(DeviceError::InvalidOperation(format!(
                "zero sample rate for {buffer}"
            )));
        }
        let mut state = self.state.lock();
        let slot = state
            .buffers
            .get_mut(&buffer)
            .ok_or(DeviceError::InvalidBuffer(buffer))?;
        if let Some(voice) = slot.queued_on {
            return Err(DeviceError::InvalidOperation(format!(
                "{buffer} is queued on {voice} and cannot be rewritten"
            )));
        }
        slot.format = format;
        slot.sample_rate = sample_rate;
        slot.pcm.clear();
        slot.pcm.extend_from_slice(pcm);
        Ok(())
    }

    fn queue_buffers(&self, voice: VoiceId, buffers: &[BufferId]) -> DeviceResult<()> {
        let mut state = self.state.lock();
        state.voice(voice)?;
        for (i, id) in buffers.iter().enumerate() {
            let slot = state
                .buffers
                .get(id)
                .ok_or(DeviceError::InvalidBuffer(*id))?;
            if slot.queued_on.is_some() || buffers[..i].contains(id) {
                return Err(DeviceError::InvalidOperation(format!(
                    "{id} is already queued"
                )));
            }
        }
        for id in buffers {
            if let Some(slot) = state.buffers.get_mut(id) {
                slot.queued_on = Some(voice);
            }
        }
        state.voice_mut(voice)?.queue.extend(buffers.iter().copied());
        Ok(())
    }

    fn unqueue_buffers(&self, voice: VoiceId, count: usize) -> DeviceResult<Vec<BufferId>> {
        let mut state = self.state.lock();
        let voice_state = state.voice_mut(voice)?;
        if count > voice_state.cursor {
            return Err(DeviceError::InvalidOperation(format!(
                "cannot unqueue {count} buffers from {voice}: only {} processed",
                voice_state.cursor
            )));
        }
        let removed: Vec<BufferId> = voice_state.queue.drain(..count).collect();
        voice_state.cursor -= count;
        for id in &removed {
            if let Some(slot) = state.buffers.get_mut(id) {
                slot.queued_on = None;
            }
        }
        Ok(removed)
    }

    fn queued_count(&self, voice: VoiceId) -> DeviceResult<usize> {
        Ok(self.state.lock().voice(voice)?.queue.len())
    }

    fn processed_count(&self, voice: VoiceId) -> DeviceResult<usize> {
        Ok(self.state.lock().voice(voice)?.cursor)
    }

    fn play(&self, voice: VoiceId) -> DeviceResult<()> {
        let mut state = self.state.lock();
        let voice_state = state.voice_mut(voice)?;
        match voice_state.state {
            VoiceState::Playing => {},
            VoiceState::Paused => voice_state.state = VoiceState::Playing,
            VoiceState::Initial | VoiceState::Stopped => {
                voice_state.rewind();
                voice_state.state = if voice_state.queue.is_empty() {
                    VoiceState::Stopped
                } else {
                    VoiceState::Playing
                };
            },
        }
        Ok(())
    }

    fn pause(&self, voice: VoiceId) -> DeviceResult<()> {
        let mut state = self.state.lock();
        let voice_state = state.voice_mut(voice)?;
        if voice_state.state == VoiceState::Playing {
            voice_state.state = VoiceState::Paused;
        }
        Ok(())
    }

    fn stop(&self, voice: VoiceId) -> DeviceResult<()> {
        let mut state = self.state.lock();
        let voice_state = state.voice_mut(voice)?;
        voice_state.state = VoiceState::Stopped;
        voice_state.cursor = voice_state.queue.len();
        voice_state.offset = 0;
        Ok(())
    }

    fn voice_state(&self, voice: VoiceId) -> DeviceResult<VoiceState> {
        Ok(self.state.lock().voice(voice)?.state)
    }

    fn set_gain(&self, voice: VoiceId, gain: f32) -> DeviceResult<()> {
        self.state.lock().voice_mut(voice)?.gain = gain.max(0.0);
        Ok(())
    }

    fn create_filter(&self) -> DeviceResult<Option<FilterId>> {
        let mut state = self.state.lock();
        let id = FilterId::new(state.next_raw());
        state.filters.insert(id, 1.0);
        Ok(Some(id))
    }

    fn set_filter_gain_hf(&self, filter: FilterId, gain: f32) -> DeviceResult<()> {
        let mut state = self.state.lock();
        let slot = state
            .filters
            .get_mut(&filter)
            .ok_or(DeviceError::InvalidFilter(filter))?;
        *slot = gain.clamp(0.0, 1.0);
        Ok(())
    }

    fn bind_filter(&self, voice: VoiceId, filter: FilterId) -> DeviceResult<()> {
        let mut state = self.state.lock();
        if !state.filters.contains_key(&filter) {
            return Err(DeviceError::InvalidFilter(filter));
        }
        state.voice_mut(voice)?.filter = Some(filter);
        Ok(())
    }

    fn delete_filter(&self, filter: FilterId) -> DeviceResult<()> {
        let mut state = self.state.lock();
        state
            .filters
            .remove(&filter)
            .ok_or(DeviceError::InvalidFilter(filter))?;
        for voice in state.voices.values_mut() {
            if voice.filter == Some(filter) {
                voice.filter = None;
            }
        }
        Ok(())
    }
}
