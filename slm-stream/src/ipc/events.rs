//! Event types published by a running `StreamSession`.
//!
//! | Event | Subscription |
//! |-------|--------------|
//! | `SessionStatusEvent` | `StreamSession::subscribe_status` |
//! | `LevelEvent` | `StreamSession::subscribe_levels` |

use serde::{Deserialize, Serialize};

use crate::metering::LevelReport;

// ---------------------------------------------------------------------------
// Status events
// ---------------------------------------------------------------------------

/// Emitted when the session changes state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusEvent {
    pub status: SessionStatus,
    /// Optional human-readable detail (e.g. the fatal error).
    pub detail: Option<String>,
}

/// Current state of a stream session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Accepting fragments and decoding.
    Streaming,
    /// Stopped on request; buffers and samples discarded.
    Stopped,
    /// Ended by a fatal error (storage exhausted, ordering broken,
    /// decoder gone). The detail carries the error text.
    Error,
}

// ---------------------------------------------------------------------------
// Level events
// ---------------------------------------------------------------------------

/// Emitted by the metering thread once per interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    #[serde(flatten)]
    pub report: LevelReport,
}
