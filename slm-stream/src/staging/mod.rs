//! Dual staging buffers that turn compressed fragments into decode-ready blobs.
//!
//! A block decoder wants a self-contained prefix of the stream, not the
//! newest fragment on its own. [`DualBufferStager`] keeps the stream in one
//! of two [`StagingBuffer`]s and hands out the content accumulated *before*
//! the newest fragment, so the blob never ends mid-fragment.
//!
//! ```text
//!   Init ──len(A) > T1──► RotatingToB ──len > T2──► UsingB
//!                            ▲                         │
//!                       len > T1                   len > T1
//!                            │                         ▼
//!                         UsingA ◄──len > T2──── RotatingToA
//! ```
//!
//! While rotating, every fragment is written to both buffers, so the new
//! buffer already holds `T2 - T1` bytes of history when the old one is
//! dropped.

pub mod buffer;
pub mod stager;

pub use buffer::StagingBuffer;
pub use stager::DualBufferStager;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StreamError};

/// Rotation thresholds and storage limit for a [`DualBufferStager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StagerConfig {
    /// `T1`: once the read-back blob exceeds this many bytes, start filling
    /// the other buffer. Default: 20 KiB.
    pub rotate_at: usize,
    /// `T2`: once the read-back blob of a rotating buffer exceeds this many
    /// bytes, drop it and continue on the new one. Default: 30 KiB.
    pub retire_at: usize,
    /// Hard limit per staging buffer. `None` lets buffers grow until the
    /// allocator refuses. Default: 16 MiB.
    pub max_buffer_bytes: Option<usize>,
}

impl Default for StagerConfig {
    fn default() -> Self {
        Self {
            rotate_at: 20 * 1024,
            retire_at: 30 * 1024,
            max_buffer_bytes: Some(16 * 1024 * 1024),
        }
    }
}

impl StagerConfig {
    /// Reject thresholds the state machine cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.rotate_at == 0 {
            return Err(StreamError::InvalidConfig(
                "rotate_at must be greater than zero".into(),
            ));
        }
        if self.retire_at <= self.rotate_at {
            return Err(StreamError::InvalidConfig(format!(
                "retire_at ({}) must be greater than rotate_at ({})",
                self.retire_at, self.rotate_at
            )));
        }
        if let Some(limit) = self.max_buffer_bytes {
            if limit <= self.retire_at {
                return Err(StreamError::InvalidConfig(format!(
                    "max_buffer_bytes ({limit}) must be greater than retire_at ({})",
                    self.retire_at
                )));
            }
        }
        Ok(())
    }
}

/// Which buffer(s) the stager is writing and which one it reads back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StagerState {
    /// Warm-up: only buffer A exists.
    Init,
    /// Steady state on A.
    UsingA,
    /// A is read back, A and B are both written.
    RotatingToB,
    /// Steady state on B.
    UsingB,
    /// B is read back, B and A are both written.
    RotatingToA,
}

/// A decode-ready view into a staging buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Blob<'a> {
    /// Absolute stream offset of the first byte of the owning buffer.
    pub origin: u64,
    /// Buffer content from its start, taken before the newest fragment.
    pub bytes: &'a [u8],
}

impl Blob<'_> {
    /// Absolute stream offset just past the last byte of this blob.
    pub fn end(&self) -> u64 {
        self.origin + self.bytes.len() as u64
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Outcome of one [`DualBufferStager::advance`] call.
#[derive(Debug, Clone, Copy)]
pub struct Staged<'a> {
    /// The blob to hand to the decoder this round.
    pub primary: Blob<'a>,
    /// While rotating: the matching snapshot of the buffer being built.
    /// Ends at the same stream offset as `primary`.
    pub standby: Option<Blob<'a>>,
    /// Set when this call moved the state machine.
    pub transition: Option<(StagerState, StagerState)>,
}
