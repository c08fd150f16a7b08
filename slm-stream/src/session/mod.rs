//! `StreamSession` — lifecycle of one incoming audio stream.
//!
//! ## Lifecycle
//!
//! ```text
//! StreamSession::start(config, decoder)
//!     └─► decode worker + ingest thread (+ meter thread), status = Streaming
//!         ├─► push_fragment() …   fragments queued in arrival order
//!         ├─► fatal error         → status = Error, ring closed
//!         └─► stop()              → threads joined, ring closed, status = Stopped
//! ```
//!
//! ## Threading
//!
//! The ingest thread owns the stager and the decode loop, so staging needs
//! no locking. Decoding happens on a separate worker thread so a slow
//! decoder costs at most one time budget per fragment. Readers only touch
//! the `SampleRing`.

pub mod decode_loop;

use std::path::Path;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, info_span, Span};

use crate::{
    buffering::{SampleRing, DEFAULT_RING_CAPACITY},
    decode::{BlockDecoder, DecodeWorker},
    error::{Result, StreamError},
    ipc::events::{LevelEvent, SessionStatus, SessionStatusEvent},
    metering::{Meter, REFERENCE_PRESSURE},
    staging::{DualBufferStager, StagerConfig},
};

use decode_loop::{DiagnosticsSnapshot, IngestContext, IngestDiagnostics, QueuedFragment};

/// Broadcast channel capacity for status and level events.
const BROADCAST_CAP: usize = 256;

/// Configuration for a `StreamSession`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamConfig {
    /// Start rotating once the read-back blob exceeds this. Default: 20 KiB.
    pub rotate_at_bytes: usize,
    /// Retire the old buffer once its read-back blob exceeds this.
    /// Default: 30 KiB.
    pub retire_at_bytes: usize,
    /// Per staging buffer limit. `None` = unbounded. Default: 16 MiB.
    pub max_buffer_bytes: Option<usize>,
    /// Decode budget per call. Default: 250 ms.
    pub decode_timeout_ms: u64,
    /// Decoded samples retained for readers. Default: 4 Mi samples.
    pub ring_capacity: usize,
    /// Fragments that may wait for the ingest thread before
    /// `push_fragment` blocks. Default: 256.
    pub fragment_queue_capacity: usize,
    /// Gain applied to every decoded sample (e.g. Pa per full scale).
    /// Default: 1.0.
    pub calibration_factor: f32,
    pub meter_enabled: bool,
    /// Default: 100 ms.
    pub meter_interval_ms: u64,
    /// Samples per metering read, also the FFT size. Default: 32768.
    pub meter_window: usize,
    /// dB reference. Default: 20 µPa.
    pub meter_reference: f32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        let stager = StagerConfig::default();
        Self {
            rotate_at_bytes: stager.rotate_at,
            retire_at_bytes: stager.retire_at,
            max_buffer_bytes: stager.max_buffer_bytes,
            decode_timeout_ms: 250,
            ring_capacity: DEFAULT_RING_CAPACITY,
            fragment_queue_capacity: 256,
            calibration_factor: 1.0,
            meter_enabled: true,
            meter_interval_ms: 100,
            meter_window: 32_768,
            meter_reference: REFERENCE_PRESSURE,
        }
    }
}

impl StreamConfig {
    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config = Self::from_json_str(&raw)?;
        debug!(path = %path.display(), "stream config loaded");
        Ok(config)
    }

    pub fn stager(&self) -> StagerConfig {
        StagerConfig {
            rotate_at: self.rotate_at_bytes,
            retire_at: self.retire_at_bytes,
            max_buffer_bytes: self.max_buffer_bytes,
        }
    }

    pub fn decode_timeout(&self) -> Duration {
        Duration::from_millis(self.decode_timeout_ms)
    }

    pub fn meter_interval(&self) -> Duration {
        Duration::from_millis(self.meter_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        self.stager().validate()?;
        let invalid = |msg: &str| Err(StreamError::InvalidConfig(msg.to_string()));
        if self.decode_timeout_ms == 0 {
            return invalid("decode_timeout_ms must be greater than zero");
        }
        if self.ring_capacity == 0 {
            return invalid("ring_capacity must be greater than zero");
        }
        if self.fragment_queue_capacity == 0 {
            return invalid("fragment_queue_capacity must be greater than zero");
        }
        if !self.calibration_factor.is_finite() || self.calibration_factor <= 0.0 {
            return invalid("calibration_factor must be a positive number");
        }
        if self.meter_enabled {
            if self.meter_interval_ms == 0 || self.meter_window == 0 {
                return invalid("meter_interval_ms and meter_window must be greater than zero");
            }
            if !self.meter_reference.is_finite() || self.meter_reference <= 0.0 {
                return invalid("meter_reference must be a positive number");
            }
        }
        Ok(())
    }
}

/// Set the canonical status and broadcast the change.
pub(crate) fn publish_status(
    status: &Mutex<SessionStatus>,
    tx: &broadcast::Sender<SessionStatusEvent>,
    new_status: SessionStatus,
    detail: Option<String>,
) {
    *status.lock() = new_status;
    let _ = tx.send(SessionStatusEvent {
        status: new_status,
        detail,
    });
}

/// Producer side of the fragment queue. Sequence numbers are assigned under
/// the same lock that sends, so queue order and `seq` order agree.
struct Ingress {
    tx: Sender<QueuedFragment>,
    next_seq: u64,
}

struct Workers {
    ingest: JoinHandle<()>,
    /// Meter thread and the sender whose drop wakes it for shutdown.
    meter: Option<(JoinHandle<()>, Sender<()>)>,
}

/// Handle to a running stream. `Send + Sync`; share it behind an `Arc` if
/// fragments arrive on one task and samples are read on another.
pub struct StreamSession {
    config: StreamConfig,
    ring: Arc<SampleRing>,
    running: Arc<AtomicBool>,
    status: Arc<Mutex<SessionStatus>>,
    status_tx: broadcast::Sender<SessionStatusEvent>,
    level_tx: broadcast::Sender<LevelEvent>,
    diagnostics: Arc<IngestDiagnostics>,
    ingress: Mutex<Option<Ingress>>,
    workers: Mutex<Option<Workers>>,
    span: Span,
}

impl StreamSession {
    /// Validate `config`, spawn the decode worker and the ingest thread and
    /// start accepting fragments.
    ///
    /// # Errors
    /// - `StreamError::InvalidConfig` for inconsistent settings.
    /// - `StreamError::Io` if a thread cannot be spawned.
    pub fn start<D: BlockDecoder>(config: StreamConfig, decoder: D) -> Result<Self> {
        config.validate()?;

        let span = info_span!("stream_session");
        let enter = span.enter();

        let stager = DualBufferStager::new(config.stager())?;
        let worker = DecodeWorker::spawn(decoder, config.decode_timeout())?;
        let ring = Arc::new(SampleRing::new(config.ring_capacity));
        let running = Arc::new(AtomicBool::new(true));
        let status = Arc::new(Mutex::new(SessionStatus::Streaming));
        let (status_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (level_tx, _) = broadcast::channel(BROADCAST_CAP);
        let diagnostics = Arc::new(IngestDiagnostics::default());
        let (fragment_tx, fragment_rx) = bounded(config.fragment_queue_capacity);

        let ctx = IngestContext {
            decode_loop: decode_loop::StreamDecodeLoop::new(
                stager,
                worker,
                Arc::clone(&ring),
                config.calibration_factor,
                Arc::clone(&diagnostics),
            ),
            fragments: fragment_rx,
            running: Arc::clone(&running),
            status: Arc::clone(&status),
            status_tx: status_tx.clone(),
        };
        let ingest_span = span.clone();
        let ingest = thread::Builder::new()
            .name("slm-ingest".into())
            .spawn(move || {
                let _guard = ingest_span.entered();
                if let Err(e) = decode_loop::run(ctx) {
                    debug!("ingest thread exiting after fatal error: {e}");
                }
            })?;

        let meter = if config.meter_enabled {
            let (stop_tx, stop_rx) = bounded::<()>(0);
            let mut meter = Meter::new(config.meter_window, config.meter_reference);
            let meter_ring = Arc::clone(&ring);
            let meter_running = Arc::clone(&running);
            let meter_tx = level_tx.clone();
            let interval = config.meter_interval();
            let window = config.meter_window;
            let meter_span = span.clone();

            let spawned = thread::Builder::new()
                .name("slm-meter".into())
                .spawn(move || {
                    let _guard = meter_span.entered();
                    let mut seq = 0u64;
                    while meter_running.load(Ordering::Relaxed) {
                        match stop_rx.recv_timeout(interval) {
                            Err(RecvTimeoutError::Timeout) => {}
                            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                        }
                        let samples = meter_ring.get_last(window);
                        if let Some(report) = meter.measure(&samples, meter_ring.sample_rate()) {
                            let _ = meter_tx.send(LevelEvent { seq, report });
                            seq += 1;
                        }
                    }
                    debug!("meter thread stopped");
                });
            match spawned {
                Ok(handle) => Some((handle, stop_tx)),
                Err(e) => {
                    // Unwind the ingest thread before reporting.
                    running.store(false, Ordering::SeqCst);
                    drop(fragment_tx);
                    let _ = ingest.join();
                    ring.close();
                    return Err(e.into());
                }
            }
        } else {
            None
        };

        publish_status(&status, &status_tx, SessionStatus::Streaming, None);
        info!(
            rotate_at = config.rotate_at_bytes,
            retire_at = config.retire_at_bytes,
            decode_timeout_ms = config.decode_timeout_ms,
            "stream session started"
        );
        drop(enter);

        Ok(Self {
            config,
            ring,
            running,
            status,
            status_tx,
            level_tx,
            diagnostics,
            ingress: Mutex::new(Some(Ingress {
                tx: fragment_tx,
                next_seq: 0,
            })),
            workers: Mutex::new(Some(Workers { ingest, meter })),
            span,
        })
    }

    /// Queue one fragment. Returns its sequence number.
    ///
    /// Blocks while the fragment queue is full.
    ///
    /// # Errors
    /// `StreamError::NotRunning` after `stop()` or a fatal error.
    pub fn push_fragment(&self, fragment: impl Into<Vec<u8>>) -> Result<u64> {
        let mut ingress = self.ingress.lock();
        let ingress = ingress.as_mut().ok_or(StreamError::NotRunning)?;
        if !self.running.load(Ordering::Relaxed) {
            return Err(StreamError::NotRunning);
        }

        let seq = ingress.next_seq;
        ingress
            .tx
            .send(QueuedFragment {
                seq,
                bytes: fragment.into(),
            })
            .map_err(|_| StreamError::NotRunning)?;
        ingress.next_seq += 1;
        Ok(seq)
    }

    /// Stop ingestion, join the threads and discard buffered data.
    ///
    /// Also releases the threads of a session that ended with a fatal error;
    /// its status stays `Error`.
    ///
    /// # Errors
    /// `StreamError::NotRunning` if already stopped.
    pub fn stop(&self) -> Result<()> {
        let _enter = self.span.enter();
        let was_running = self.running.swap(false, Ordering::SeqCst);

        // A producer blocked on a full queue holds the ingress lock. The
        // ingest thread sees the cleared flag, exits and drops the receiver,
        // which fails that send and releases the lock.
        drop(self.ingress.lock().take());
        let workers = self.workers.lock().take().ok_or(StreamError::NotRunning)?;

        if let Some((handle, stop_tx)) = workers.meter {
            drop(stop_tx);
            let _ = handle.join();
        }
        let _ = workers.ingest.join();
        self.ring.close();

        if was_running {
            publish_status(&self.status, &self.status_tx, SessionStatus::Stopped, None);
        }
        let diag = self.diagnostics.snapshot();
        info!(
            fragments = diag.fragments_in,
            samples = diag.samples_appended,
            "stream session stopped"
        );
        Ok(())
    }

    /// Shared handle to the decoded samples.
    pub fn ring(&self) -> Arc<SampleRing> {
        Arc::clone(&self.ring)
    }

    /// The most recent `n` decoded samples (fewer if not yet available).
    pub fn get_last(&self, n: usize) -> Vec<f32> {
        self.ring.get_last(n)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.lock()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<SessionStatusEvent> {
        self.status_tx.subscribe()
    }

    /// Periodic level reports; nothing is sent when metering is disabled.
    pub fn subscribe_levels(&self) -> broadcast::Receiver<LevelEvent> {
        self.level_tx.subscribe()
    }

    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = StreamConfig::default();
        config.validate().unwrap();
        assert_eq!(config.stager(), StagerConfig::default());
        assert_eq!(config.decode_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn json_fills_missing_fields_with_defaults() {
        let config =
            StreamConfig::from_json_str(r#"{ "rotateAtBytes": 4096, "retireAtBytes": 8192 }"#)
                .unwrap();
        assert_eq!(config.rotate_at_bytes, 4096);
        assert_eq!(config.retire_at_bytes, 8192);
        assert_eq!(config.ring_capacity, DEFAULT_RING_CAPACITY);
        assert!(config.meter_enabled);
    }

    #[test]
    fn inconsistent_values_are_rejected() {
        let err = StreamConfig::from_json_str(r#"{ "rotateAtBytes": 100, "retireAtBytes": 50 }"#)
            .unwrap_err();
        assert!(matches!(err, StreamError::InvalidConfig(_)));

        let err = StreamConfig::from_json_str(r#"{ "calibrationFactor": 0.0 }"#).unwrap_err();
        assert!(matches!(err, StreamError::InvalidConfig(_)));

        let err = StreamConfig::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, StreamError::Config(_)));
    }

    #[test]
    fn metering_limits_only_apply_when_enabled() {
        let config = StreamConfig {
            meter_enabled: false,
            meter_window: 0,
            ..StreamConfig::default()
        };
        config.validate().unwrap();
        assert!(StreamConfig {
            meter_enabled: true,
            ..config
        }
        .validate()
        .is_err());
    }

    #[test]
    fn load_reports_missing_file_as_io_error() {
        let err = StreamConfig::load("/nonexistent/slm-stream.json").unwrap_err();
        assert!(matches!(err, StreamError::Io(_)));
    }
}
