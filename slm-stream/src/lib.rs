//! # slm-stream
//!
//! Incremental decoding of compressed audio that arrives one fragment per
//! network message, as streamed by a sound level meter.
//!
//! ## Architecture
//!
//! ```text
//! push_fragment → bounded queue → ingest thread
//!                                     │
//!                           DualBufferStager::advance
//!                                     │  pre-append blob (+ standby)
//!                           DecodeWorker (time budget)
//!                                     │
//!                             SampleTimeline: new samples only
//!                                     │
//!                                SampleRing ──► get_last(n)
//!                                     │
//!                            meter thread → broadcast::Sender<LevelEvent>
//! ```
//!
//! A decoder always sees a prefix of the stream starting at a staging
//! buffer boundary. Two buffers alternate so neither grows without bound.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod buffering;
pub mod decode;
pub mod error;
pub mod ipc;
pub mod metering;
pub mod session;
pub mod staging;

// Convenience re-exports for downstream crates
pub use buffering::{chunk::AudioChunk, SampleRing};
pub use decode::{BlockDecoder, DecodeError, DecodeWorker, PcmDecoder};
pub use error::{Result, StreamError};
pub use ipc::events::{LevelEvent, SessionStatus, SessionStatusEvent};
pub use metering::{Calibration, LevelReport, Meter};
pub use session::decode_loop::{DiagnosticsSnapshot, FragmentOutcome, StreamDecodeLoop};
pub use session::{StreamConfig, StreamSession};
pub use staging::{DualBufferStager, StagerConfig, StagerState};

#[cfg(feature = "symphonia")]
pub use decode::{StreamFormat, SymphoniaDecoder};
