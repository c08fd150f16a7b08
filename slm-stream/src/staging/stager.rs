//! `DualBufferStager` — the five-state rotation machine.

use tracing::debug;

use super::{Blob, StagerConfig, StagerState, Staged, StagingBuffer};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    A,
    B,
}

impl Slot {
    fn other(self) -> Slot {
        match self {
            Slot::A => Slot::B,
            Slot::B => Slot::A,
        }
    }
}

/// Per-call bookkeeping returned by the state handlers.
struct Step {
    read: Slot,
    read_len: usize,
    standby: Option<(Slot, usize)>,
    next: StagerState,
}

/// Stages fragments into two rotating buffers.
///
/// Owned by the single ingestion path; `advance` takes `&mut self`, so
/// fragments are processed strictly one after another.
#[derive(Debug)]
pub struct DualBufferStager {
    config: StagerConfig,
    state: StagerState,
    a: Option<StagingBuffer>,
    b: Option<StagingBuffer>,
    /// Total bytes staged so far (absolute stream offset of the next fragment).
    written: u64,
    fragments: u64,
    rotations: u64,
}

impl DualBufferStager {
    /// # Errors
    /// `StreamError::InvalidConfig` when `retire_at <= rotate_at` or the
    /// buffer limit cannot hold a full rotation.
    pub fn new(config: StagerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            state: StagerState::Init,
            a: None,
            b: None,
            written: 0,
            fragments: 0,
            rotations: 0,
        })
    }

    /// Stage one fragment and return the blob that is ready for decoding.
    ///
    /// The returned blob is the buffer content from *before* this fragment
    /// was appended; the newest fragment becomes decodable on the next call.
    ///
    /// # Errors
    /// `StreamError::StagingStorageExhausted` if a buffer cannot grow. This
    /// is fatal for the stream: the stager must not be advanced again.
    pub fn advance(&mut self, fragment: &[u8]) -> Result<Staged<'_>> {
        let before = self.state;
        let step = match before {
            StagerState::Init => self.on_init(fragment)?,
            StagerState::UsingA => self.on_steady(Slot::A, fragment, StagerState::RotatingToB)?,
            StagerState::UsingB => self.on_steady(Slot::B, fragment, StagerState::RotatingToA)?,
            StagerState::RotatingToB => {
                self.on_rotating(Slot::A, fragment, StagerState::UsingB)?
            }
            StagerState::RotatingToA => {
                self.on_rotating(Slot::B, fragment, StagerState::UsingA)?
            }
        };

        self.written += fragment.len() as u64;
        self.fragments += 1;

        let transition = (step.next != before).then_some((before, step.next));
        if let Some((from, to)) = transition {
            self.state = to;
            if matches!(to, StagerState::UsingA | StagerState::UsingB) {
                self.rotations += 1;
            }
            debug!(
                ?from,
                ?to,
                fragment = self.fragments,
                blob_len = step.read_len,
                "stager state transition"
            );
        }

        Ok(Staged {
            primary: self.blob(step.read, step.read_len),
            standby: step.standby.map(|(slot, len)| self.blob(slot, len)),
            transition,
        })
    }

    pub fn state(&self) -> StagerState {
        self.state
    }

    pub fn config(&self) -> &StagerConfig {
        &self.config
    }

    /// The buffer that `advance` currently reads back.
    pub fn active_buffer(&self) -> Option<&StagingBuffer> {
        self.slot(self.active_slot())
    }

    /// Full content of the active buffer, including the newest fragment.
    pub fn read_active(&self) -> &[u8] {
        self.active_buffer()
            .map(StagingBuffer::read_from_start)
            .unwrap_or(&[])
    }

    /// Number of staging buffers currently allocated (0, 1 or 2).
    pub fn live_buffers(&self) -> usize {
        usize::from(self.a.is_some()) + usize::from(self.b.is_some())
    }

    /// Total bytes staged since construction.
    pub fn stream_len(&self) -> u64 {
        self.written
    }

    pub fn fragments(&self) -> u64 {
        self.fragments
    }

    /// Completed rotations (transitions into `UsingA` / `UsingB`).
    pub fn rotations(&self) -> u64 {
        self.rotations
    }

    // ── State handlers ───────────────────────────────────────────────────

    /// Like every state, returns the pre-append snapshot; only the
    /// transition test uses the post-append length.
    fn on_init(&mut self, fragment: &[u8]) -> Result<Step> {
        let rotate_at = self.config.rotate_at;
        let buf = self.open(Slot::A);
        let read_len = buf.len();
        buf.append(fragment)?;
        let next = if buf.len() > rotate_at {
            StagerState::RotatingToB
        } else {
            StagerState::Init
        };
        Ok(Step {
            read: Slot::A,
            read_len,
            standby: None,
            next,
        })
    }

    fn on_steady(&mut self, active: Slot, fragment: &[u8], full: StagerState) -> Result<Step> {
        let (current, rotate_at) = (self.state, self.config.rotate_at);
        if let Some(old) = self.slot_mut(active.other()).take() {
            debug!(
                retired = ?active.other(),
                origin = old.origin(),
                bytes = old.len(),
                "staging buffer retired"
            );
        }

        let buf = self.open(active);
        let read_len = buf.len();
        buf.append(fragment)?;
        Ok(Step {
            read: active,
            read_len,
            standby: None,
            next: if read_len > rotate_at { full } else { current },
        })
    }

    fn on_rotating(&mut self, reading: Slot, fragment: &[u8], full: StagerState) -> Result<Step> {
        let (current, retire_at) = (self.state, self.config.retire_at);
        let building = reading.other();

        let read_len = self.open(reading).len();
        let standby_len = self.open(building).len();
        self.open(reading).append(fragment)?;
        self.open(building).append(fragment)?;

        Ok(Step {
            read: reading,
            read_len,
            standby: Some((building, standby_len)),
            next: if read_len > retire_at { full } else { current },
        })
    }

    // ── Slot helpers ─────────────────────────────────────────────────────

    fn active_slot(&self) -> Slot {
        match self.state {
            StagerState::Init | StagerState::UsingA | StagerState::RotatingToB => Slot::A,
            StagerState::UsingB | StagerState::RotatingToA => Slot::B,
        }
    }

    fn slot(&self, slot: Slot) -> Option<&StagingBuffer> {
        match slot {
            Slot::A => self.a.as_ref(),
            Slot::B => self.b.as_ref(),
        }
    }

    fn slot_mut(&mut self, slot: Slot) -> &mut Option<StagingBuffer> {
        match slot {
            Slot::A => &mut self.a,
            Slot::B => &mut self.b,
        }
    }

    /// Get the buffer in `slot`, creating it at the current stream offset.
    fn open(&mut self, slot: Slot) -> &mut StagingBuffer {
        let (origin, limit) = (self.written, self.config.max_buffer_bytes);
        self.slot_mut(slot).get_or_insert_with(|| {
            debug!(?slot, origin, "staging buffer opened");
            StagingBuffer::new(origin, limit)
        })
    }

    fn blob(&self, slot: Slot, len: usize) -> Blob<'_> {
        match self.slot(slot) {
            Some(buf) => Blob {
                origin: buf.origin(),
                bytes: &buf.read_from_start()[..len],
            },
            None => Blob {
                origin: self.written,
                bytes: &[],
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StreamError;

    const KIB: usize = 1024;

    fn stager(rotate_at: usize, retire_at: usize) -> DualBufferStager {
        DualBufferStager::new(StagerConfig {
            rotate_at,
            retire_at,
            max_buffer_bytes: None,
        })
        .expect("valid config")
    }

    /// Fragment `i` filled with a byte pattern unique to its index.
    fn fragment(i: usize, len: usize) -> Vec<u8> {
        (0..len).map(|j| (i * 31 + j) as u8).collect()
    }

    #[test]
    fn rejects_retire_threshold_not_above_rotate_threshold() {
        for (rotate_at, retire_at) in [(20 * KIB, 20 * KIB), (30 * KIB, 20 * KIB), (0, 10)] {
            let err = DualBufferStager::new(StagerConfig {
                rotate_at,
                retire_at,
                max_buffer_bytes: None,
            })
            .unwrap_err();
            assert!(matches!(err, StreamError::InvalidConfig(_)), "{err}");
        }
    }

    #[test]
    fn rejects_buffer_limit_below_retire_threshold() {
        let err = DualBufferStager::new(StagerConfig {
            rotate_at: 10,
            retire_at: 20,
            max_buffer_bytes: Some(20),
        })
        .unwrap_err();
        assert!(matches!(err, StreamError::InvalidConfig(_)));
    }

    #[test]
    fn init_scenario_returns_pre_append_snapshot() {
        let mut s = stager(20 * KIB, 30 * KIB);
        let f1 = fragment(1, 10 * KIB);
        let f2 = fragment(2, 15 * KIB);
        let f3 = fragment(3, 6 * KIB);

        let staged = s.advance(&f1).unwrap();
        assert!(staged.primary.is_empty());
        assert_eq!(s.state(), StagerState::Init);

        let staged = s.advance(&f2).unwrap();
        assert_eq!(staged.primary.bytes, f1.as_slice());
        assert_eq!(
            staged.transition,
            Some((StagerState::Init, StagerState::RotatingToB))
        );
        assert_eq!(s.state(), StagerState::RotatingToB);

        let staged = s.advance(&f3).unwrap();
        assert_eq!(staged.primary.len(), 25 * KIB);
        let standby = staged.standby.expect("standby while rotating");
        assert!(standby.is_empty());
        assert_eq!(standby.origin, 25 * KIB as u64);
        assert_eq!(s.live_buffers(), 2);
    }

    #[test]
    fn transitions_happen_at_expected_fragment_indices() {
        let mut s = stager(20 * KIB, 30 * KIB);
        let mut transitions = Vec::new();

        for i in 1..=50 {
            let staged = s.advance(&fragment(i, KIB)).unwrap();
            if let Some((_, to)) = staged.transition {
                transitions.push((i, to));
            }
        }

        assert_eq!(
            transitions,
            vec![
                (21, StagerState::RotatingToB),
                (32, StagerState::UsingB),
                (43, StagerState::RotatingToA),
            ]
        );
        assert_eq!(s.rotations(), 1);
    }

    #[test]
    fn active_buffer_holds_full_stream_before_first_retirement() {
        let mut s = stager(20 * KIB, 30 * KIB);
        let mut stream = Vec::new();

        for i in 1..=31 {
            let f = fragment(i, 1000 + i);
            stream.extend_from_slice(&f);
            s.advance(&f).unwrap();
            assert_eq!(s.read_active(), stream.as_slice(), "after fragment {i}");
        }
    }

    #[test]
    fn new_buffer_holds_stream_suffix_after_retirement() {
        let mut s = stager(4 * KIB, 6 * KIB);
        let mut stream = Vec::new();
        let mut previous_end = 0u64;

        for i in 1..=200 {
            let f = fragment(i, 300 + (i * 7) % 200);
            stream.extend_from_slice(&f);
            let staged = s.advance(&f).unwrap();

            // Snapshots never include the newest fragment and always end
            // where the previous call's stream ended.
            assert_eq!(staged.primary.end(), previous_end);
            let origin = staged.primary.origin as usize;
            assert_eq!(staged.primary.bytes, &stream[origin..previous_end as usize]);
            if let Some(standby) = staged.standby {
                assert_eq!(standby.end(), staged.primary.end());
            }
            previous_end = stream.len() as u64;

            let active = s.active_buffer().expect("active buffer");
            assert_eq!(active.read_from_start(), &stream[active.origin() as usize..]);
        }

        assert!(s.rotations() >= 4);
        assert_eq!(s.stream_len(), stream.len() as u64);
    }

    #[test]
    fn old_buffer_is_dropped_on_the_call_after_retirement() {
        let mut s = stager(2 * KIB, 3 * KIB);
        let mut i = 0;
        loop {
            i += 1;
            let staged = s.advance(&fragment(i, 512)).unwrap();
            if staged.transition == Some((StagerState::RotatingToB, StagerState::UsingB)) {
                break;
            }
        }
        assert_eq!(s.live_buffers(), 2);

        let b_content = s.read_active().to_vec();
        let staged = s.advance(&fragment(i + 1, 512)).unwrap();
        assert_eq!(staged.primary.bytes, b_content.as_slice());
        assert!(staged.standby.is_none());
        assert_eq!(s.live_buffers(), 1);
        assert_eq!(s.state(), StagerState::UsingB);
    }

    #[test]
    fn exhausted_storage_is_reported_and_nothing_is_returned() {
        let mut s = DualBufferStager::new(StagerConfig {
            rotate_at: 16,
            retire_at: 32,
            max_buffer_bytes: Some(40),
        })
        .unwrap();

        s.advance(&[0u8; 10]).unwrap();
        let err = s.advance(&[0u8; 64]).unwrap_err();
        assert!(matches!(err, StreamError::StagingStorageExhausted { .. }));
        assert_eq!(s.fragments(), 1);
        assert_eq!(s.stream_len(), 10);
    }
}
