//! # Undertow Common
//!
//! Common types shared by the Undertow streaming audio crates.
//!
//! This crate provides:
//! - Handle types for device objects (buffers, voices, filters) and streams
//! - The error taxonomy used across the engine
//! - Prelude for convenient imports

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]

pub mod error;
pub mod ids;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::error::*;
    pub use crate::ids::*;
}

pub use prelude::*;
