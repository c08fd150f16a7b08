//! Block decoder abstraction.
//!
//! The `BlockDecoder` trait decouples the decode loop from any specific
//! codec. A decoder is handed a blob that is a prefix of the compressed
//! stream starting at a buffer boundary and returns every sample it can
//! decode from it.
//!
//! `&mut self` on `decode` lets implementations keep scratch buffers or
//! codec state between calls. The decoder is owned by the
//! [`DecodeWorker`] thread, so no locking is needed.

pub mod pcm;
pub mod worker;

#[cfg(feature = "symphonia")]
pub mod symphonia;

pub use pcm::PcmDecoder;
pub use worker::DecodeWorker;

#[cfg(feature = "symphonia")]
pub use self::symphonia::{StreamFormat, SymphoniaDecoder};

use std::time::Duration;

use thiserror::Error;

use crate::buffering::chunk::AudioChunk;

/// Why one decode attempt produced nothing.
///
/// All variants are transient: the loop skips the cycle and tries again
/// with the next, larger blob.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("blob does not yet contain a complete frame")]
    Incomplete,

    #[error("malformed stream data: {0}")]
    Malformed(String),

    #[error("unsupported stream: {0}")]
    Unsupported(String),

    #[error("decode exceeded its {0:?} budget")]
    Timeout(Duration),

    #[error("previous decode is still running")]
    Busy,
}

/// Contract for compressed-audio decoders.
pub trait BlockDecoder: Send + 'static {
    /// Decode a stream prefix.
    ///
    /// Given the same bytes the result must be the same; the loop relies on
    /// re-decoding overlapping prefixes and keeping only the new tail.
    ///
    /// # Errors
    /// `DecodeError::Incomplete` when no full frame is available yet,
    /// `DecodeError::Malformed` / `Unsupported` for data it cannot read.
    fn decode(&mut self, blob: &[u8]) -> Result<AudioChunk, DecodeError>;
}
