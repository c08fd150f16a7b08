//! `SymphoniaDecoder`: MP3 / FLAC block decoding via symphonia.
//!
//! Each call probes the blob from scratch and decodes every packet in it.
//! The blob is a prefix of the stream, so the last packet is often cut
//! short; decoding stops quietly at the first truncated packet and the
//! remainder is picked up on a later, longer prefix.
//!
//! MP3 frames resynchronise anywhere, so blobs starting at a rotation point
//! decode fine. FLAC needs its stream header, which only the first staging
//! buffer contains: the decoder keeps the header of the first blob that
//! starts with `fLaC` and prepends it to later blobs that lack one. The
//! FLAC reader then skips the partial frame at the rotation point and
//! resynchronises on the next frame header.

use std::io::{Cursor, ErrorKind};

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::{MediaSourceStream, MediaSourceStreamOptions};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, trace};

use crate::buffering::chunk::AudioChunk;
use crate::decode::{BlockDecoder, DecodeError};

/// Container hint passed to the probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFormat {
    Mp3,
    Flac,
    /// Let symphonia guess from the data.
    Auto,
}

impl StreamFormat {
    fn extension(self) -> Option<&'static str> {
        match self {
            StreamFormat::Mp3 => Some("mp3"),
            StreamFormat::Flac => Some("flac"),
            StreamFormat::Auto => None,
        }
    }

    /// Guess from a file extension; unknown extensions fall back to `Auto`.
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_ascii_lowercase().as_str() {
            "mp3" => StreamFormat::Mp3,
            "flac" => StreamFormat::Flac,
            _ => StreamFormat::Auto,
        }
    }
}

const FLAC_MARKER: &[u8; 4] = b"fLaC";

/// Length of the `fLaC` marker plus every metadata block, or `None` if the
/// blob does not start with a complete FLAC stream header.
fn flac_header_len(blob: &[u8]) -> Option<usize> {
    if !blob.starts_with(FLAC_MARKER) {
        return None;
    }
    let mut pos = FLAC_MARKER.len();
    loop {
        let block = blob.get(pos..pos + 4)?;
        let len = u32::from_be_bytes([0, block[1], block[2], block[3]]) as usize;
        pos += 4 + len;
        if pos > blob.len() {
            return None;
        }
        // Bit 7 flags the last metadata block.
        if block[0] & 0x80 != 0 {
            return Some(pos);
        }
    }
}

/// Decodes a compressed prefix into mono f32 samples (channels averaged).
#[derive(Debug, Clone)]
pub struct SymphoniaDecoder {
    format: StreamFormat,
    /// FLAC marker and metadata blocks, once seen.
    stream_header: Option<Vec<u8>>,
}

impl SymphoniaDecoder {
    pub fn new(format: StreamFormat) -> Self {
        Self {
            format,
            stream_header: None,
        }
    }

    /// Bytes to probe and the hint to probe them with.
    fn prepare(&mut self, blob: &[u8]) -> (Vec<u8>, StreamFormat) {
        if blob.starts_with(FLAC_MARKER) {
            if self.stream_header.is_none() {
                if let Some(len) = flac_header_len(blob) {
                    debug!(header_bytes = len, "flac stream header cached");
                    self.stream_header = Some(blob[..len].to_vec());
                }
            }
            return (blob.to_vec(), self.format);
        }
        match &self.stream_header {
            Some(header) => {
                let mut data = Vec::with_capacity(header.len() + blob.len());
                data.extend_from_slice(header);
                data.extend_from_slice(blob);
                (data, StreamFormat::Flac)
            }
            None => (blob.to_vec(), self.format),
        }
    }
}

impl BlockDecoder for SymphoniaDecoder {
    fn decode(&mut self, blob: &[u8]) -> Result<AudioChunk, DecodeError> {
        if blob.is_empty() {
            return Err(DecodeError::Incomplete);
        }

        let (data, format) = self.prepare(blob);
        let source = Box::new(Cursor::new(data));
        let mss = MediaSourceStream::new(source, MediaSourceStreamOptions::default());
        let mut hint = Hint::new();
        if let Some(ext) = format.extension() {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(map_error)?;
        let mut reader = probed.format;

        let track = reader
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| DecodeError::Unsupported("no audio track".into()))?;
        let track_id = track.id;
        let mut sample_rate = track.codec_params.sample_rate.unwrap_or(0);

        let mut decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|e| DecodeError::Unsupported(e.to_string()))?;

        let mut samples = Vec::new();
        let mut interleaved: Option<SampleBuffer<f32>> = None;

        loop {
            let packet = match reader.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e)) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(e) if !samples.is_empty() => {
                    trace!("stopping at unreadable packet: {e}");
                    break;
                }
                Err(e) => return Err(map_error(e)),
            };
            if packet.track_id() != track_id {
                continue;
            }

            let decoded = match decoder.decode(&packet) {
                Ok(decoded) => decoded,
                // Corrupt or truncated frame: skip it, keep the rest.
                Err(SymphoniaError::DecodeError(e)) => {
                    trace!("skipping undecodable packet: {e}");
                    continue;
                }
                Err(SymphoniaError::IoError(e)) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(map_error(e)),
            };

            let spec = *decoded.spec();
            sample_rate = spec.rate;
            let channels = spec.channels.count().max(1);
            let frames = decoded.frames();

            let mut buf = match interleaved.take() {
                Some(buf) if buf.capacity() >= frames * channels => buf,
                _ => SampleBuffer::new(decoded.capacity() as u64, spec),
            };
            buf.copy_interleaved_ref(decoded);

            samples.extend(
                buf.samples()
                    .chunks_exact(channels)
                    .map(|frame| frame.iter().sum::<f32>() / channels as f32),
            );
            interleaved = Some(buf);
        }

        if samples.is_empty() {
            return Err(DecodeError::Incomplete);
        }
        Ok(AudioChunk::new(samples, sample_rate))
    }
}

fn map_error(err: SymphoniaError) -> DecodeError {
    match err {
        SymphoniaError::IoError(e) if e.kind() == ErrorKind::UnexpectedEof => {
            DecodeError::Incomplete
        }
        SymphoniaError::Unsupported(what) => DecodeError::Unsupported(what.to_string()),
        other => DecodeError::Malformed(other.to_string()),
    }
}
