//! Decoder Bindings
//!
//! A stream owns one [`DecoderFactory`] (the encoded byte source) and opens a
//! [`SampleReader`] from it whenever playback starts or loops. Readers hand
//! out interleaved `f32` samples on demand until end of stream; dropping a
//! reader closes the binding.
//!
//! - [`EncodedAudio`]: compressed bytes (Ogg Vorbis, WAV, FLAC, MP3) decoded
//!   through rodio
//! - [`PcmSource`]: already-decoded samples held in memory

use std::fmt;
use std::fs;
use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::Arc;

use rodio::source::SamplesConverter;
use rodio::{Decoder, Source};
use tracing::debug;
use undertow_common::DecodeError;

/// An open decoder binding positioned somewhere in its stream.
pub trait SampleReader: Send {
    /// Read up to `buffer.len()` interleaved samples, rounded down to whole
    /// frames. Returns the number of samples written; 0 means end of stream.
    fn read_samples(&mut self, buffer: &mut [f32]) -> Result<usize, DecodeError>;

    /// Interleaved channel count.
    fn channels(&self) -> u16;

    /// Samples per second per channel.
    fn sample_rate(&self) -> u32;
}

/// Something a stream can (re)open a decoder binding on.
pub trait DecoderFactory: Send + Sync {
    /// Open a reader positioned at the first sample.
    fn open(&self) -> Result<Box<dyn SampleReader>, DecodeError>;
}

pub(crate) fn frame_aligned(len: usize, channels: u16) -> usize {
    let channels = usize::from(channels.max(1));
    len - len % channels
}

/// Compressed audio bytes held in memory.
///
/// The bytes are shared, so reopening for a loop does not copy them.
#[derive(Clone)]
pub struct EncodedAudio {
    bytes: Arc<[u8]>,
}

impl fmt::Debug for EncodedAudio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncodedAudio")
            .field("len", &self.bytes.len())
            .finish()
    }
}

impl EncodedAudio {
    /// Wrap bytes already in memory.
    #[must_use]
    pub fn from_bytes(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    /// Read a whole byte stream into memory.
    pub fn from_reader(mut reader: impl Read) -> Result<Self, DecodeError> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        Ok(Self::from_bytes(bytes))
    }

    /// Read a file into memory.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, DecodeError> {
        let path = path.as_ref();
        let bytes = fs::read(path)?;
        debug!("Loaded {} bytes from {}", bytes.len(), path.display());
        Ok(Self::from_bytes(bytes))
    }

    /// Size of the encoded data in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether there is no encoded data at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl DecoderFactory for EncodedAudio {
    fn open(&self) -> Result<Box<dyn SampleReader>, DecodeError> {
        let cursor = Cursor::new(Arc::clone(&self.bytes));
        let decoder =
            Decoder::new(cursor).map_err(|e| DecodeError::Unsupported(e.to_string()))?;
        let channels = decoder.channels();
        let sample_rate = decoder.sample_rate();
        if channels == 0 || channels > 2 {
            return Err(DecodeError::Unsupported(format!(
                "{channels} channels (only mono and stereo are streamed)"
            )));
        }
        if sample_rate == 0 {
            return Err(DecodeError::Corrupt("zero sample rate".to_string()));
        }

        Ok(Box::new(RodioReader {
            source: decoder.convert_samples::<f32>(),
            channels,
            sample_rate,
        }))
    }
}

/// Reader over a rodio decoder converted to `f32`.
struct RodioReader {
    source: SamplesConverter<Decoder<Cursor<Arc<[u8]>>>, f32>,
    channels: u16,
    sample_rate: u32,
}

impl SampleReader for RodioReader {
    fn read_samples(&mut self, buffer: &mut [f32]) -> Result<usize, DecodeError> {
        let wanted = frame_aligned(buffer.len(), self.channels);
        for (written, slot) in buffer[..wanted].iter_mut().enumerate() {
            match self.source.next() {
                Some(sample) => *slot = sample,
                None => return Ok(written),
            }
        }
        Ok(wanted)
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// Decoded interleaved samples held in memory.
#[derive(Debug, Clone)]
pub struct PcmSource {
    samples: Arc<[f32]>,
    channels: u16,
    sample_rate: u32,
}

impl PcmSource {
    /// Create a source from interleaved samples.
    #[must_use]
    pub fn new(samples: impl Into<Arc<[f32]>>, channels: u16, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            channels: channels.max(1),
            sample_rate,
        }
    }

    /// Total number of interleaved samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the source holds no samples.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl DecoderFactory for PcmSource {
    fn open(&self) -> Result<Box<dyn SampleReader>, DecodeError> {
        if self.channels > 2 {
            return Err(DecodeError::Unsupported(format!(
                "{} channels (only mono and stereo are streamed)",
                self.channels
            )));
        }
        Ok(Box::new(PcmReader {
            source: self.clone(),
            position: 0,
        }))
    }
}

struct PcmReader {
    source: PcmSource,
    position: usize,
}

impl SampleReader for PcmReader {
    fn read_samples(&mut self, buffer: &mut [f32]) -> Result<usize, DecodeError> {
        let wanted = frame_aligned(buffer.len(), self.source.channels);
        let remaining = &self.source.samples[self.position..];
        let count = wanted.min(remaining.len());
        buffer[..count].copy_from_slice(&remaining[..count]);
        self.position += count;
        Ok(count)
    }

    fn channels(&self) -> u16 {
        self.source.channels
    }

    fn sample_rate(&self) -> u32 {
        self.source.sample_rate
    }
}
