//! Append-only byte accumulator readable from its start.

use crate::error::{Result, StreamError};

/// One staging buffer.
///
/// Writes only ever append; reads always start at offset 0. `origin` records
/// where in the overall stream the first byte sits, which lets the decode
/// loop line up the outputs of two buffers during rotation.
#[derive(Debug)]
pub struct StagingBuffer {
    origin: u64,
    data: Vec<u8>,
    limit: Option<usize>,
}

impl StagingBuffer {
    /// Create an empty buffer whose first byte will be stream byte `origin`.
    pub fn new(origin: u64, limit: Option<usize>) -> Self {
        Self {
            origin,
            data: Vec::new(),
            limit,
        }
    }

    /// Append a fragment.
    ///
    /// # Errors
    /// `StreamError::StagingStorageExhausted` if the limit would be exceeded
    /// or the allocation cannot grow. The buffer is unchanged in that case.
    pub fn append(&mut self, fragment: &[u8]) -> Result<()> {
        let (buffered, limit) = (self.data.len(), self.limit);
        let exhausted = || StreamError::StagingStorageExhausted {
            buffered,
            requested: fragment.len(),
            limit,
        };

        let new_len = self
            .data
            .len()
            .checked_add(fragment.len())
            .ok_or_else(exhausted)?;
        if self.limit.is_some_and(|limit| new_len > limit) {
            return Err(exhausted());
        }
        self.data
            .try_reserve(fragment.len())
            .map_err(|_| exhausted())?;
        self.data.extend_from_slice(fragment);
        Ok(())
    }

    /// Everything accumulated since the buffer was created.
    pub fn read_from_start(&self) -> &[u8] {
        &self.data
    }

    pub fn origin(&self) -> u64 {
        self.origin
    }

    /// Absolute stream offset just past the last buffered byte.
    pub fn end(&self) -> u64 {
        self.origin + self.data.len() as u64
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_accumulates_in_order() {
        let mut buf = StagingBuffer::new(100, None);
        buf.append(b"abc").unwrap();
        buf.append(b"").unwrap();
        buf.append(b"de").unwrap();
        assert_eq!(buf.read_from_start(), b"abcde");
        assert_eq!(buf.origin(), 100);
        assert_eq!(buf.end(), 105);
    }

    #[test]
    fn append_past_limit_fails_without_partial_write() {
        let mut buf = StagingBuffer::new(0, Some(4));
        buf.append(b"abc").unwrap();

        let err = buf.append(b"de").unwrap_err();
        assert!(matches!(
            err,
            StreamError::StagingStorageExhausted {
                buffered: 3,
                requested: 2,
                limit: Some(4)
            }
        ));
        assert!(err.is_fatal());
        assert_eq!(buf.read_from_start(), b"abc");

        // Exactly filling the limit is fine.
        buf.append(b"d").unwrap();
        assert_eq!(buf.len(), 4);
    }
}
