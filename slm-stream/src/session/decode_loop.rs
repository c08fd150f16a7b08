//! Ingestion loop: stage → decode → append new samples.
//!
//! ## Per fragment
//!
//! ```text
//! 1. DualBufferStager::advance(fragment) → primary blob (+ standby while rotating)
//! 2. Skip empty blobs (first fragment of a session)
//! 3. DecodeWorker::decode(primary) within the time budget
//!    └─ DecodeError → count, log, skip the cycle (stager untouched)
//! 4. Place the decoded samples on the absolute sample timeline
//! 5. Append only samples beyond what earlier cycles already emitted
//! 6. While rotating: decode the standby blob once it holds data and anchor
//!    its first sample by the shared end offset
//! ```
//!
//! Every blob is a prefix of its buffer, so decoding it again next cycle
//! reproduces the same samples plus new ones. The loop remembers how many
//! samples it has emitted and drops the overlap.

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::{
    buffering::SampleRing,
    decode::{DecodeError, DecodeWorker},
    error::{Result, StreamError},
    ipc::events::{SessionStatus, SessionStatusEvent},
    staging::{DualBufferStager, StagerState, Staged},
};

/// How long the ingest thread waits on an empty queue before re-checking
/// the running flag.
const IDLE_POLL: Duration = Duration::from_millis(20);

pub struct IngestDiagnostics {
    pub fragments_in: AtomicUsize,
    pub bytes_in: AtomicUsize,
    pub decode_calls: AtomicUsize,
    pub decode_errors: AtomicUsize,
    pub decode_timeouts: AtomicUsize,
    pub decoder_busy: AtomicUsize,
    pub samples_appended: AtomicUsize,
    pub rotations: AtomicUsize,
    pub unaligned_rotations: AtomicUsize,
}

impl Default for IngestDiagnostics {
    fn default() -> Self {
        Self {
            fragments_in: AtomicUsize::new(0),
            bytes_in: AtomicUsize::new(0),
            decode_calls: AtomicUsize::new(0),
            decode_errors: AtomicUsize::new(0),
            decode_timeouts: AtomicUsize::new(0),
            decoder_busy: AtomicUsize::new(0),
            samples_appended: AtomicUsize::new(0),
            rotations: AtomicUsize::new(0),
            unaligned_rotations: AtomicUsize::new(0),
        }
    }
}

impl IngestDiagnostics {
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            fragments_in: self.fragments_in.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            decode_calls: self.decode_calls.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            decode_timeouts: self.decode_timeouts.load(Ordering::Relaxed),
            decoder_busy: self.decoder_busy.load(Ordering::Relaxed),
            samples_appended: self.samples_appended.load(Ordering::Relaxed),
            rotations: self.rotations.load(Ordering::Relaxed),
            unaligned_rotations: self.unaligned_rotations.load(Ordering::Relaxed),
        }
    }

    fn record_decode_error(&self, err: &DecodeError) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
        match err {
            DecodeError::Timeout(_) => {
                self.decode_timeouts.fetch_add(1, Ordering::Relaxed);
            }
            DecodeError::Busy => {
                self.decoder_busy.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiagnosticsSnapshot {
    pub fragments_in: usize,
    pub bytes_in: usize,
    pub decode_calls: usize,
    pub decode_errors: usize,
    pub decode_timeouts: usize,
    pub decoder_busy: usize,
    pub samples_appended: usize,
    pub rotations: usize,
    pub unaligned_rotations: usize,
}

/// What one `on_fragment` call did.
#[derive(Debug, Clone, PartialEq)]
pub enum FragmentOutcome {
    /// Staged only; the blob was empty so there was nothing to decode.
    Staged,
    /// Decoding failed this cycle; the fragment stays staged.
    DecodeFailed(DecodeError),
    /// Decoded; this many new samples went into the ring (may be 0).
    Appended(usize),
}

/// Maps decoder output onto one absolute sample timeline.
///
/// Each staging buffer decodes from its own start, so sample 0 of a blob
/// means different things for A and B. `base` is the absolute index of
/// sample 0 for the buffer currently read; `standby` holds the buffer being
/// built during a rotation and, once known, its base.
#[derive(Debug, Default)]
struct SampleTimeline {
    origin: u64,
    base: u64,
    emitted: u64,
    standby: Option<(u64, Option<u64>)>,
}

impl SampleTimeline {
    fn expect_standby(&mut self, origin: u64) {
        if !matches!(self.standby, Some((o, _)) if o == origin) {
            self.standby = Some((origin, None));
        }
    }

    fn needs_anchor(&self, origin: u64) -> bool {
        matches!(self.standby, Some((o, None)) if o == origin)
    }

    fn resolve_anchor(&mut self, origin: u64, base: u64) {
        self.standby = Some((origin, Some(base)));
    }

    /// Base for a blob from the buffer at `origin`. Returns `false` as the
    /// second value when the switch to a new buffer had no resolved anchor.
    fn base_for(&mut self, origin: u64, decoded: usize) -> (u64, bool) {
        if origin == self.origin {
            return (self.base, true);
        }
        let (base, aligned) = match self.standby.take() {
            Some((o, Some(base))) if o == origin => (base, true),
            // Unknown alignment: treat everything decoded so far as already
            // emitted. Costs at most one cycle of samples, never duplicates.
            _ => (self.emitted.saturating_sub(decoded as u64), false),
        };
        self.origin = origin;
        self.base = base;
        (base, aligned)
    }

    /// The part of `samples` (starting at absolute index `base`) not yet emitted.
    fn take_new<'s>(&mut self, base: u64, samples: &'s [f32]) -> &'s [f32] {
        let end = base + samples.len() as u64;
        if end <= self.emitted {
            return &[];
        }
        let start = self.emitted.saturating_sub(base) as usize;
        self.emitted = end;
        &samples[start..]
    }
}

/// Drives fragments through staging and decoding into the sample ring.
///
/// Owned by a single ingestion thread; nothing here is shared except the
/// ring and the diagnostics counters.
pub struct StreamDecodeLoop {
    stager: DualBufferStager,
    worker: DecodeWorker,
    ring: Arc<SampleRing>,
    calibration: f32,
    diagnostics: Arc<IngestDiagnostics>,
    timeline: SampleTimeline,
}

impl StreamDecodeLoop {
    pub fn new(
        stager: DualBufferStager,
        worker: DecodeWorker,
        ring: Arc<SampleRing>,
        calibration: f32,
        diagnostics: Arc<IngestDiagnostics>,
    ) -> Self {
        Self {
            stager,
            worker,
            ring,
            calibration,
            diagnostics,
            timeline: SampleTimeline::default(),
        }
    }

    /// Process one fragment.
    ///
    /// # Errors
    /// Only fatal errors: `StagingStorageExhausted` and
    /// `DecoderUnavailable`. Decode failures are reported through
    /// [`FragmentOutcome::DecodeFailed`].
    pub fn on_fragment(&mut self, fragment: &[u8]) -> Result<FragmentOutcome> {
        self.diagnostics.fragments_in.fetch_add(1, Ordering::Relaxed);
        self.diagnostics
            .bytes_in
            .fetch_add(fragment.len(), Ordering::Relaxed);

        let Staged {
            primary,
            standby,
            transition,
        } = self.stager.advance(fragment)?;

        if matches!(
            transition,
            Some((_, StagerState::UsingA | StagerState::UsingB))
        ) {
            self.diagnostics.rotations.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(standby) = standby {
            self.timeline.expect_standby(standby.origin);
        }
        if primary.is_empty() {
            return Ok(FragmentOutcome::Staged);
        }
        let blob_len = primary.len();

        self.diagnostics.decode_calls.fetch_add(1, Ordering::Relaxed);
        let chunk = match self.worker.decode(primary.bytes)? {
            Ok(chunk) => chunk,
            Err(err) => {
                self.diagnostics.record_decode_error(&err);
                debug!(blob_len, %err, "decode skipped this cycle");
                return Ok(FragmentOutcome::DecodeFailed(err));
            }
        };

        let (base, aligned) = self.timeline.base_for(primary.origin, chunk.len());
        if !aligned {
            self.diagnostics
                .unaligned_rotations
                .fetch_add(1, Ordering::Relaxed);
            warn!(
                origin = primary.origin,
                "switched staging buffer without sample alignment; dropping overlap"
            );
        }
        let primary_end = base + chunk.len() as u64;

        // Primary and standby blobs end at the same stream offset, so their
        // decodes end on the same sample. An empty standby says nothing about
        // where its first decodable frame will start.
        if let Some(standby) = standby.filter(|s| !s.is_empty()) {
            if self.timeline.needs_anchor(standby.origin) {
                self.diagnostics.decode_calls.fetch_add(1, Ordering::Relaxed);
                match self.worker.decode(standby.bytes)? {
                    Ok(decoded) if decoded.len() as u64 <= primary_end => {
                        let anchor = primary_end - decoded.len() as u64;
                        self.timeline.resolve_anchor(standby.origin, anchor);
                        debug!(origin = standby.origin, anchor, "standby buffer anchored");
                    }
                    Ok(decoded) => warn!(
                        standby_samples = decoded.len(),
                        primary_end, "standby decoded past primary; anchor unresolved"
                    ),
                    Err(err) => {
                        self.diagnostics.record_decode_error(&err);
                        debug!(%err, "standby decode failed; anchor unresolved");
                    }
                }
            }
        }

        let fresh = self.timeline.take_new(base, &chunk.samples);
        let appended = fresh.len();
        if appended > 0 {
            if self.calibration == 1.0 {
                self.ring.append(fresh);
            } else {
                let scaled: Vec<f32> = fresh.iter().map(|s| s * self.calibration).collect();
                self.ring.append(&scaled);
            }
            self.ring.set_sample_rate(chunk.sample_rate);
            self.diagnostics
                .samples_appended
                .fetch_add(appended, Ordering::Relaxed);
        }

        debug!(
            blob_len,
            decoded = chunk.len(),
            appended,
            state = ?self.stager.state(),
            "fragment processed"
        );
        Ok(FragmentOutcome::Appended(appended))
    }

    pub fn stager(&self) -> &DualBufferStager {
        &self.stager
    }

    pub fn ring(&self) -> &Arc<SampleRing> {
        &self.ring
    }

    /// Samples emitted into the ring so far.
    pub fn emitted(&self) -> u64 {
        self.timeline.emitted
    }
}

/// A fragment tagged with its position in arrival order.
#[derive(Debug)]
pub struct QueuedFragment {
    pub seq: u64,
    pub bytes: Vec<u8>,
}

/// All context the ingestion thread needs.
pub struct IngestContext {
    pub decode_loop: StreamDecodeLoop,
    pub fragments: Receiver<QueuedFragment>,
    pub running: Arc<AtomicBool>,
    pub status: Arc<Mutex<SessionStatus>>,
    pub status_tx: broadcast::Sender<SessionStatusEvent>,
}

/// Run the ingestion loop until `ctx.running` clears, the queue closes, or a
/// fatal error occurs.
///
/// A fatal error clears the running flag, closes the ring and publishes
/// `SessionStatus::Error` before being returned.
pub fn run(mut ctx: IngestContext) -> Result<()> {
    info!("ingestion started");
    let mut expected = 0u64;

    let outcome = loop {
        if !ctx.running.load(Ordering::Relaxed) {
            break Ok(());
        }

        let fragment = match ctx.fragments.recv_timeout(IDLE_POLL) {
            Ok(fragment) => fragment,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break Ok(()),
        };

        if fragment.seq != expected {
            break Err(StreamError::OrderingViolation {
                expected,
                got: fragment.seq,
            });
        }
        expected += 1;

        // Stop may have been requested while this fragment was queued.
        if !ctx.running.load(Ordering::Relaxed) {
            break Ok(());
        }

        match ctx.decode_loop.on_fragment(&fragment.bytes) {
            Ok(FragmentOutcome::DecodeFailed(err)) => {
                debug!(seq = fragment.seq, %err, "fragment staged, decode pending");
            }
            Ok(_) => {}
            Err(e) => break Err(e),
        }
    };

    if let Err(ref e) = outcome {
        error!("ingestion failed: {e}");
        ctx.running.store(false, Ordering::SeqCst);
        ctx.decode_loop.ring().close();
        super::publish_status(
            &ctx.status,
            &ctx.status_tx,
            SessionStatus::Error,
            Some(e.to_string()),
        );
    }

    info!(
        fragments = ctx.decode_loop.stager().fragments(),
        emitted = ctx.decode_loop.emitted(),
        "ingestion stopped"
    );
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    use approx::assert_relative_eq;
    use crossbeam_channel::bounded;

    use crate::buffering::chunk::AudioChunk;
    use crate::decode::{BlockDecoder, PcmDecoder};
    use crate::staging::StagerConfig;

    const BUDGET: Duration = Duration::from_secs(2);

    /// Fails every call whose index is in `fail_on`, otherwise decodes PCM.
    struct FlakyDecoder {
        inner: PcmDecoder,
        calls: usize,
        fail_on: Vec<usize>,
    }

    impl BlockDecoder for FlakyDecoder {
        fn decode(&mut self, blob: &[u8]) -> std::result::Result<AudioChunk, DecodeError> {
            let call = self.calls;
            self.calls += 1;
            if self.fail_on.contains(&call) {
                return Err(DecodeError::Malformed(format!("scripted failure #{call}")));
            }
            self.inner.decode(blob)
        }
    }

    const FRAME_SYNC: u8 = 0xFF;

    /// Fixed 4-byte frames `[sync, value, 0, 0]`. Like MP3, decoding starts
    /// at the first sync byte and a cut-off frame at either end is dropped.
    struct FramedDecoder;

    impl FramedDecoder {
        fn encode(values: &[u8]) -> Vec<u8> {
            values.iter().flat_map(|&v| [FRAME_SYNC, v, 0, 0]).collect()
        }
    }

    impl BlockDecoder for FramedDecoder {
        fn decode(&mut self, blob: &[u8]) -> std::result::Result<AudioChunk, DecodeError> {
            let mut samples = Vec::new();
            let mut pos = 0;
            while pos + 4 <= blob.len() {
                if blob[pos] == FRAME_SYNC {
                    samples.push(blob[pos + 1] as f32 / 128.0 - 1.0);
                    pos += 4;
                } else {
                    pos += 1;
                }
            }
            if samples.is_empty() {
                return Err(DecodeError::Incomplete);
            }
            Ok(AudioChunk::new(samples, 8_000))
        }
    }

    fn small_stager() -> DualBufferStager {
        DualBufferStager::new(StagerConfig {
            rotate_at: 400,
            retire_at: 700,
            max_buffer_bytes: None,
        })
        .unwrap()
    }

    fn make_loop<D: BlockDecoder>(decoder: D, calibration: f32) -> StreamDecodeLoop {
        StreamDecodeLoop::new(
            small_stager(),
            DecodeWorker::spawn(decoder, BUDGET).unwrap(),
            Arc::new(SampleRing::new(1 << 16)),
            calibration,
            Arc::new(IngestDiagnostics::default()),
        )
    }

    /// A ramp long enough to force several rotations, sliced into
    /// even-length fragments of varying size.
    fn signal_and_fragments() -> (Vec<f32>, Vec<Vec<u8>>) {
        let signal: Vec<f32> = (0..3_000).map(|i| ((i % 200) as f32 - 100.0) / 128.0).collect();
        let bytes = PcmDecoder::encode(&signal);
        let mut fragments = Vec::new();
        let mut pos = 0;
        let mut i = 0;
        while pos < bytes.len() {
            let len = (40 + (i * 14) % 60).min(bytes.len() - pos);
            fragments.push(bytes[pos..pos + len].to_vec());
            pos += len;
            i += 1;
        }
        (signal, fragments)
    }

    #[test]
    fn incremental_decode_matches_one_shot_decode() {
        let (signal, fragments) = signal_and_fragments();
        let mut decode_loop = make_loop(PcmDecoder::default(), 1.0);

        for f in &fragments {
            decode_loop.on_fragment(f).unwrap();
        }
        // The newest fragment is only decoded on the call after it arrives.
        decode_loop.on_fragment(&[]).unwrap();

        let one_shot = PcmDecoder::default()
            .decode(&fragments.concat())
            .unwrap()
            .samples;
        let incremental = decode_loop.ring().get_last(usize::MAX);

        assert!(decode_loop.stager().rotations() >= 3);
        assert_eq!(incremental.len(), one_shot.len());
        assert_eq!(incremental.len(), signal.len());
        for (a, b) in incremental.iter().zip(&one_shot) {
            assert_relative_eq!(*a, *b, epsilon = 1e-6);
        }
        let diag = decode_loop.diagnostics.snapshot();
        assert_eq!(diag.unaligned_rotations, 0);
        assert_eq!(diag.samples_appended, signal.len());
    }

    #[test]
    fn frame_synced_stream_is_not_cut_at_rotation_points() {
        // 7-byte fragments never line up with the 4-byte frames, so every
        // new buffer starts inside a frame and resyncs past it.
        let values: Vec<u8> = (0..2_000).map(|i| (i % 200) as u8).collect();
        let bytes = FramedDecoder::encode(&values);
        let mut decode_loop = make_loop(FramedDecoder, 1.0);

        for fragment in bytes.chunks(7) {
            decode_loop.on_fragment(fragment).unwrap();
        }
        decode_loop.on_fragment(&[]).unwrap();

        let one_shot = FramedDecoder.decode(&bytes).unwrap().samples;
        let incremental = decode_loop.ring().get_last(usize::MAX);

        assert!(decode_loop.stager().rotations() >= 10);
        assert_eq!(one_shot.len(), values.len());
        assert_eq!(incremental, one_shot);
        assert_eq!(decode_loop.diagnostics.snapshot().unaligned_rotations, 0);
    }

    #[test]
    fn decode_failures_skip_the_cycle_without_losing_samples() {
        let (_, fragments) = signal_and_fragments();
        let decoder = FlakyDecoder {
            inner: PcmDecoder::default(),
            calls: 0,
            fail_on: vec![1, 2, 7, 8, 9, 15],
        };
        let mut decode_loop = make_loop(decoder, 1.0);

        let mut failures = 0;
        for f in &fragments {
            if let FragmentOutcome::DecodeFailed(_) = decode_loop.on_fragment(f).unwrap() {
                failures += 1;
            }
        }
        decode_loop.on_fragment(&[]).unwrap();

        let one_shot = PcmDecoder::default()
            .decode(&fragments.concat())
            .unwrap()
            .samples;
        let incremental = decode_loop.ring().get_last(usize::MAX);

        assert!(failures > 0);
        assert!(decode_loop.diagnostics.snapshot().decode_errors >= failures);
        // Failures may cost the alignment of one rotation, but never
        // produce duplicates: the ring is never longer than the truth and
        // its tail always matches.
        assert!(incremental.len() <= one_shot.len());
        let tail = &one_shot[one_shot.len() - 200..];
        assert_eq!(&incremental[incremental.len() - 200..], tail);
    }

    #[test]
    fn first_fragment_is_only_staged() {
        let mut decode_loop = make_loop(PcmDecoder::default(), 1.0);
        let outcome = decode_loop
            .on_fragment(&PcmDecoder::encode(&[0.5; 10]))
            .unwrap();
        assert_eq!(outcome, FragmentOutcome::Staged);
        assert!(decode_loop.ring().is_empty());

        let outcome = decode_loop
            .on_fragment(&PcmDecoder::encode(&[0.25; 10]))
            .unwrap();
        assert_eq!(outcome, FragmentOutcome::Appended(10));
        assert_eq!(decode_loop.ring().get_last(100), vec![0.5; 10]);
    }

    #[test]
    fn calibration_scales_appended_samples() {
        let mut decode_loop = make_loop(PcmDecoder::new(48_000), 2.0);
        decode_loop
            .on_fragment(&PcmDecoder::encode(&[0.25; 4]))
            .unwrap();
        decode_loop.on_fragment(&[]).unwrap();

        for s in decode_loop.ring().get_last(4) {
            assert_relative_eq!(s, 0.5, epsilon = 1e-6);
        }
        assert_eq!(decode_loop.ring().sample_rate(), 48_000);
    }

    #[test]
    fn timeline_never_reemits_overlap() {
        let mut t = SampleTimeline::default();
        let samples = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(t.take_new(0, &samples[..2]), &[1.0, 2.0]);
        assert_eq!(t.take_new(0, &samples), &[3.0, 4.0]);
        assert!(t.take_new(0, &samples[..3]).is_empty());
        assert_eq!(t.emitted, 4);
    }

    #[test]
    fn run_rejects_out_of_order_fragments() {
        let (tx, rx) = bounded(8);
        let running = Arc::new(AtomicBool::new(true));
        let status = Arc::new(Mutex::new(SessionStatus::Streaming));
        let (status_tx, mut status_rx) = broadcast::channel(8);
        let decode_loop = make_loop(PcmDecoder::default(), 1.0);
        let ring = Arc::clone(decode_loop.ring());

        tx.send(QueuedFragment {
            seq: 0,
            bytes: vec![0; 4],
        })
        .unwrap();
        tx.send(QueuedFragment {
            seq: 2,
            bytes: vec![0; 4],
        })
        .unwrap();

        let ctx = IngestContext {
            decode_loop,
            fragments: rx,
            running: Arc::clone(&running),
            status: Arc::clone(&status),
            status_tx,
        };
        let handle = thread::spawn(move || run(ctx));
        let result = handle.join().expect("ingest thread panicked");

        assert!(matches!(
            result,
            Err(StreamError::OrderingViolation {
                expected: 1,
                got: 2
            })
        ));
        assert!(!running.load(Ordering::SeqCst));
        assert!(ring.is_closed());
        assert_eq!(*status.lock(), SessionStatus::Error);
        let event = status_rx.try_recv().expect("status event");
        assert_eq!(event.status, SessionStatus::Error);
        drop(tx);
    }

    #[test]
    fn run_reports_exhausted_staging_as_fatal() {
        let (tx, rx) = bounded(8);
        let running = Arc::new(AtomicBool::new(true));
        let status = Arc::new(Mutex::new(SessionStatus::Streaming));
        let (status_tx, _) = broadcast::channel(8);
        let stager = DualBufferStager::new(StagerConfig {
            rotate_at: 8,
            retire_at: 16,
            max_buffer_bytes: Some(32),
        })
        .unwrap();
        let decode_loop = StreamDecodeLoop::new(
            stager,
            DecodeWorker::spawn(PcmDecoder::default(), BUDGET).unwrap(),
            Arc::new(SampleRing::new(64)),
            1.0,
            Arc::new(IngestDiagnostics::default()),
        );

        tx.send(QueuedFragment {
            seq: 0,
            bytes: vec![0; 64],
        })
        .unwrap();
        drop(tx);

        let result = run(IngestContext {
            decode_loop,
            fragments: rx,
            running: Arc::clone(&running),
            status: Arc::clone(&status),
            status_tx,
        });

        assert!(matches!(
            result,
            Err(StreamError::StagingStorageExhausted { .. })
        ));
        assert_eq!(*status.lock(), SessionStatus::Error);
    }
}
