//! `PcmDecoder`: trivial decoder for raw 16-bit little-endian mono PCM.
//!
//! Used by tests and demos in place of a real codec. Raw PCM is
//! prefix-stable, so the output for a longer prefix always extends the
//! output for a shorter one, which is exactly the property a block decoder
//! must have to be driven by the decode loop.

use crate::buffering::chunk::AudioChunk;
use crate::decode::{BlockDecoder, DecodeError};

const FULL_SCALE: f32 = 32_768.0;

/// s16le mono "decoder".
#[derive(Debug, Clone)]
pub struct PcmDecoder {
    sample_rate: u32,
}

impl PcmDecoder {
    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }

    /// Encode samples as s16le, the inverse of `decode`. Handy for fixtures.
    pub fn encode(samples: &[f32]) -> Vec<u8> {
        samples
            .iter()
            .flat_map(|&s| {
                let v = (s * FULL_SCALE).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16;
                v.to_le_bytes()
            })
            .collect()
    }
}

impl Default for PcmDecoder {
    fn default() -> Self {
        Self::new(32_000)
    }
}

impl BlockDecoder for PcmDecoder {
    fn decode(&mut self, blob: &[u8]) -> Result<AudioChunk, DecodeError> {
        if blob.len() < 2 {
            return Err(DecodeError::Incomplete);
        }
        // A trailing odd byte is half a sample; it completes on a later call.
        let samples = blob
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / FULL_SCALE)
            .collect();
        Ok(AudioChunk::new(samples, self.sample_rate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_complete_samples_and_ignores_trailing_byte() {
        let mut bytes = PcmDecoder::encode(&[0.5, -0.25]);
        bytes.push(0x7f);

        let chunk = PcmDecoder::new(16_000).decode(&bytes).unwrap();
        assert_eq!(chunk.samples, vec![0.5, -0.25]);
        assert_eq!(chunk.sample_rate, 16_000);
    }

    #[test]
    fn too_short_blob_is_incomplete() {
        let mut dec = PcmDecoder::default();
        assert_eq!(dec.decode(&[]), Err(DecodeError::Incomplete));
        assert_eq!(dec.decode(&[1]), Err(DecodeError::Incomplete));
    }
}
