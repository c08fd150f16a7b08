//! Shared store of decoded samples.
//!
//! `SampleRing` wraps a `ringbuf::HeapRb<f32>` in a `parking_lot::Mutex`.
//! The ingestion thread appends, any number of readers (metering, display)
//! copy out the most recent samples on their own schedule. Every operation
//! takes the one lock, so a reader never sees half of an append.

pub mod chunk;

use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;
use ringbuf::{
    traits::{Consumer, Observer, RingBuffer},
    HeapRb,
};

/// Default retention: 2^22 = 4 194 304 samples ≈ 64 s at 65.5 kHz.
pub const DEFAULT_RING_CAPACITY: usize = 1 << 22;

struct RingState {
    rb: HeapRb<f32>,
    /// Samples appended over the lifetime of the ring, including overwritten ones.
    total: u64,
    closed: bool,
}

/// Bounded, thread-safe store of decoded samples with "last N" reads.
pub struct SampleRing {
    state: Mutex<RingState>,
    sample_rate: AtomicU32,
}

impl SampleRing {
    /// Create a ring retaining up to `capacity` samples.
    ///
    /// # Panics
    /// If `capacity` is zero. `StreamConfig::validate` rejects that earlier.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(RingState {
                rb: HeapRb::new(capacity),
                total: 0,
                closed: false,
            }),
            sample_rate: AtomicU32::new(0),
        }
    }

    /// Append samples in time order. Once the ring is full the oldest
    /// samples are overwritten. Ignored after [`close`](Self::close).
    pub fn append(&self, samples: &[f32]) {
        if samples.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        let capacity = state.rb.capacity().get();
        let tail = &samples[samples.len().saturating_sub(capacity)..];
        state.rb.push_slice_overwrite(tail);
        state.total += samples.len() as u64;
    }

    /// The most recent `n` samples in time order.
    ///
    /// If the ring holds fewer than `n` samples, all of them are returned:
    /// the result is short, never zero-padded. An empty ring yields an
    /// empty vector.
    pub fn get_last(&self, n: usize) -> Vec<f32> {
        let state = self.state.lock();
        let (head, tail) = state.rb.as_slices();
        let len = head.len() + tail.len();
        let skip = len - n.min(len);

        let mut out = Vec::with_capacity(len - skip);
        if skip < head.len() {
            out.extend_from_slice(&head[skip..]);
            out.extend_from_slice(tail);
        } else {
            out.extend_from_slice(&tail[skip - head.len()..]);
        }
        out
    }

    /// Samples currently retained.
    pub fn len(&self) -> usize {
        self.state.lock().rb.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().rb.capacity().get()
    }

    /// Samples appended since creation, including ones already overwritten.
    pub fn total_appended(&self) -> u64 {
        self.state.lock().total
    }

    /// Sample rate of the most recently appended block, 0 if unknown.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate.load(Ordering::Relaxed)
    }

    pub fn set_sample_rate(&self, sample_rate: u32) {
        self.sample_rate.store(sample_rate, Ordering::Relaxed);
    }

    /// Discard all samples and refuse further appends.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.rb.clear();
        state.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

impl Default for SampleRing {
    fn default() -> Self {
        Self::new(DEFAULT_RING_CAPACITY)
    }
}

impl std::fmt::Debug for SampleRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SampleRing")
            .field("len", &state.rb.occupied_len())
            .field("capacity", &state.rb.capacity().get())
            .field("total", &state.total)
            .field("closed", &state.closed)
            .finish()
    }
}
