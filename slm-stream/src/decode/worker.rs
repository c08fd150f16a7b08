//! `DecodeWorker` — runs a `BlockDecoder` on its own thread with a time budget.
//!
//! ## Design
//!
//! ```text
//! ingest thread ── DecodeJob{id, blob} ──► worker thread (owns decoder)
//!      ▲                                          │
//!      └──────── DecodeReply{id, result} ─────────┘
//! ```
//!
//! The caller waits at most `timeout` for the reply. A job that overruns
//! keeps running; until it finishes every new request is answered with
//! `DecodeError::Busy` without blocking. The late reply is discarded by id.
//! Dropping the worker closes the job channel; the thread exits once its
//! current job (if any) completes.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use tracing::{debug, warn};

use crate::buffering::chunk::AudioChunk;
use crate::decode::{BlockDecoder, DecodeError};
use crate::error::{Result, StreamError};

struct DecodeJob {
    id: u64,
    blob: Arc<[u8]>,
}

struct DecodeReply {
    id: u64,
    result: std::result::Result<AudioChunk, DecodeError>,
}

/// Handle to the decoder thread.
pub struct DecodeWorker {
    job_tx: Option<Sender<DecodeJob>>,
    reply_rx: Receiver<DecodeReply>,
    next_id: u64,
    /// Id of a job that overran its budget and has not replied yet.
    in_flight: Option<u64>,
    timeout: Duration,
    handle: Option<JoinHandle<()>>,
}

impl DecodeWorker {
    /// Spawn the worker thread, moving `decoder` onto it.
    ///
    /// # Errors
    /// `StreamError::Io` if the thread cannot be spawned.
    pub fn spawn<D: BlockDecoder>(mut decoder: D, timeout: Duration) -> Result<Self> {
        let (job_tx, job_rx) = bounded::<DecodeJob>(1);
        let (reply_tx, reply_rx) = bounded::<DecodeReply>(1);

        let handle = thread::Builder::new()
            .name("slm-decode".into())
            .spawn(move || {
                while let Ok(job) = job_rx.recv() {
                    let started = Instant::now();
                    let result = decoder.decode(&job.blob);
                    debug!(
                        id = job.id,
                        bytes = job.blob.len(),
                        elapsed_us = started.elapsed().as_micros() as u64,
                        ok = result.is_ok(),
                        "decode job finished"
                    );
                    if reply_tx.send(DecodeReply { id: job.id, result }).is_err() {
                        break;
                    }
                }
                debug!("decode worker exiting");
            })?;

        Ok(Self {
            job_tx: Some(job_tx),
            reply_rx,
            next_id: 0,
            in_flight: None,
            timeout,
            handle: Some(handle),
        })
    }

    /// Decode `blob` within the configured budget.
    ///
    /// Returns `Ok(Err(_))` for transient decode failures (including
    /// `Timeout` and `Busy`) and `Err(StreamError::DecoderUnavailable)` if
    /// the worker thread is gone.
    pub fn decode(
        &mut self,
        blob: &[u8],
    ) -> Result<std::result::Result<AudioChunk, DecodeError>> {
        if self.still_busy()? {
            return Ok(Err(DecodeError::Busy));
        }

        let id = self.next_id;
        self.next_id += 1;
        let job_tx = self.job_tx.as_ref().ok_or(StreamError::DecoderUnavailable)?;
        job_tx
            .send(DecodeJob {
                id,
                blob: Arc::from(blob),
            })
            .map_err(|_| StreamError::DecoderUnavailable)?;

        let deadline = Instant::now() + self.timeout;
        loop {
            match self.reply_rx.recv_deadline(deadline) {
                Ok(reply) if reply.id == id => return Ok(reply.result),
                Ok(stale) => debug!(id = stale.id, "discarding stale decode reply"),
                Err(RecvTimeoutError::Timeout) => {
                    warn!(id, budget_ms = self.timeout.as_millis() as u64, "decode overran budget");
                    self.in_flight = Some(id);
                    return Ok(Err(DecodeError::Timeout(self.timeout)));
                }
                Err(RecvTimeoutError::Disconnected) => return Err(StreamError::DecoderUnavailable),
            }
        }
    }

    /// True while an overrun job is still being decoded.
    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Collect a late reply if one arrived; report whether the overrun job
    /// is still running.
    fn still_busy(&mut self) -> Result<bool> {
        let Some(pending) = self.in_flight else {
            return Ok(false);
        };
        loop {
            match self.reply_rx.try_recv() {
                Ok(reply) => {
                    debug!(id = reply.id, "discarding late decode reply");
                    if reply.id == pending {
                        self.in_flight = None;
                        return Ok(false);
                    }
                }
                Err(TryRecvError::Empty) => return Ok(true),
                Err(TryRecvError::Disconnected) => return Err(StreamError::DecoderUnavailable),
            }
        }
    }
}

impl Drop for DecodeWorker {
    fn drop(&mut self) {
        // Closing the job channel lets the thread exit; an in-flight decode
        // finishes on its own and its reply is dropped with the channel.
        self.job_tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.is_finished() {
                let _ = handle.join();
            }
        }
    }
}

impl std::fmt::Debug for DecodeWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodeWorker")
            .field("timeout", &self.timeout)
            .field("in_flight", &self.in_flight)
            .finish_non_exhaustive()
    }
}
