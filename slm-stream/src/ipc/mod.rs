//! Serialisable events for external consumers (UI, logging, orchestration).
//!
//! All types derive `serde::Serialize` + `serde::Deserialize` so they can be
//! forwarded as JSON without translation.

pub mod events;
