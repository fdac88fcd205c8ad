//! # Undertow Audio
//!
//! Streams long sounds to hardware voices a few buffers at a time.
//!
//! This crate provides:
//! - [`Stream`]: one streamed sound with a Prepare/Play/Pause/Resume/Stop
//!   lifecycle, looping, gain and a low-pass filter
//! - [`Streamer`]: the process-wide background scheduler that keeps every
//!   playing stream's buffers full
//! - [`AudioBackend`]: the device interface, with an in-memory
//!   [`SoftwareBackend`] and a rodio-driven [`RodioBackend`]
//! - Decoder bindings for encoded files and in-memory PCM
//!
//! ## Buffer Ring
//!
//! Each stream owns a fixed ring of device buffers (three by default):
//! - The first buffer is decoded and queued on `prepare`
//! - Every streamer tick unqueues what the voice has played, decodes the
//!   next chunk into each freed slot and queues it again
//! - At end of stream a looping stream rewinds its decoder; a one-shot
//!   stream lets its queued buffers play out and leaves the registry
//!
//! ## Threading
//!
//! Control calls come from the owner's thread while refills run on the
//! streamer thread. A per-stream stop lock keeps Stop/Pause from racing the
//! scheduler's starvation restart.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]

pub mod backend;
pub mod config;
pub mod decoder;
pub mod output;
pub mod pcm;
pub mod software;
pub mod stream;
pub mod streamer;

#[cfg(test)]
mod testing;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::backend::*;
    pub use crate::config::*;
    pub use crate::decoder::*;
    pub use crate::output::*;
    pub use crate::pcm::*;
    pub use crate::software::*;
    pub use crate::stream::*;
    pub use crate::streamer::*;
}

pub use prelude::*;
