use thiserror::Error;

/// All errors produced by slm-stream.
///
/// Transient decode failures are not part of this enum; they are
/// [`DecodeError`](crate::decode::DecodeError)s and never end a session.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error(
        "staging storage exhausted: buffer holds {buffered} bytes, cannot add {requested} more (limit {limit:?})"
    )]
    StagingStorageExhausted {
        buffered: usize,
        requested: usize,
        limit: Option<usize>,
    },

    #[error("fragment delivered out of order: expected #{expected}, got #{got}")]
    OrderingViolation { expected: u64, got: u64 },

    #[error("decoder worker is no longer running")]
    DecoderUnavailable,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("stream session is not running")]
    NotRunning,

    #[error("config parse error: {0}")]
    Config(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StreamError {
    /// Whether this error ends the session it occurred in.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StreamError::StagingStorageExhausted { .. }
                | StreamError::OrderingViolation { .. }
                | StreamError::DecoderUnavailable
        )
    }
}

pub type Result<T> = std::result::Result<T, StreamError>;
