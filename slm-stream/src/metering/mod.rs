//! Periodic level metering over the most recent decoded samples.
//!
//! ## Algorithm (per refresh)
//!
//! 1. Read the last `window` samples from the `SampleRing`.
//! 2. Apply a Hamming window and take a one-sided dB spectrum relative to
//!    the reference pressure (20 µPa by default).
//! 3. Average with the two previous spectra, one third each, to steady the
//!    display.
//! 4. Report min/max sample value, spectrum peak and floor, peak frequency.

pub mod calibration;
pub mod spectrum;

pub use calibration::Calibration;

use std::sync::Arc;

use rustfft::{num_complex::Complex, Fft, FftPlanner};
use serde::{Deserialize, Serialize};

/// Reference sound pressure for dB SPL, in pascal.
pub const REFERENCE_PRESSURE: f32 = 20e-6;

/// Spectra averaged per report (current + previous).
const AVERAGED_SPECTRA: usize = 3;

/// One metering result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelReport {
    /// Smallest sample value in the window (Pa once calibrated).
    pub min: f32,
    /// Largest sample value in the window.
    pub max: f32,
    /// Highest level of the averaged spectrum, dB re reference.
    pub peak_db: f32,
    /// Lowest level of the averaged spectrum, dB re reference.
    pub floor_db: f32,
    /// Frequency of the spectrum peak in Hz.
    pub peak_freq_hz: f32,
    /// Number of samples that went into this report.
    pub samples: usize,
    pub sample_rate: u32,
}

/// Stateful meter: holds the FFT plan, the window and spectrum history.
pub struct Meter {
    window: Vec<f32>,
    reference: f32,
    fft: Arc<dyn Fft<f32>>,
    scratch: Vec<Complex<f32>>,
    /// Most recent spectra, newest last.
    history: Vec<Vec<f32>>,
}

impl Meter {
    /// `fft_size` is both the window length and the FFT length.
    ///
    /// # Panics
    /// If `fft_size` is zero. `StreamConfig::validate` rejects that earlier.
    pub fn new(fft_size: usize, reference: f32) -> Self {
        assert!(fft_size > 0, "fft_size must be non-zero");
        Self {
            window: spectrum::hamming(fft_size),
            reference,
            fft: FftPlanner::<f32>::new().plan_fft_forward(fft_size),
            scratch: Vec::with_capacity(fft_size),
            history: Vec::with_capacity(AVERAGED_SPECTRA),
        }
    }

    pub fn fft_size(&self) -> usize {
        self.window.len()
    }

    /// Measure a block. Returns `None` for an empty block or unknown rate.
    pub fn measure(&mut self, samples: &[f32], sample_rate: u32) -> Option<LevelReport> {
        if samples.is_empty() || sample_rate == 0 {
            return None;
        }

        let (min, max) = samples
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &s| {
                (lo.min(s), hi.max(s))
            });

        let current = spectrum::db_spectrum(
            self.fft.as_ref(),
            &self.window,
            samples,
            self.reference,
            &mut self.scratch,
        );
        if self.history.len() == AVERAGED_SPECTRA {
            self.history.remove(0);
        }
        self.history.push(current);

        let count = self.history.len() as f32;
        let bins = self.window.len() / 2 + 1;
        let averaged: Vec<f32> = (0..bins)
            .map(|k| self.history.iter().map(|s| s[k]).sum::<f32>() / count)
            .collect();

        let (peak_bin, peak_db) = averaged
            .iter()
            .copied()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |best, (k, v)| {
                if v > best.1 {
                    (k, v)
                } else {
                    best
                }
            });
        let floor_db = averaged.iter().copied().fold(f32::INFINITY, f32::min);
        let resolution = sample_rate as f32 / self.window.len() as f32;

        Some(LevelReport {
            min,
            max,
            peak_db,
            floor_db,
            peak_freq_hz: peak_bin as f32 * resolution,
            samples: samples.len(),
            sample_rate,
        })
    }

    /// Forget the spectrum history (e.g. after a stream restart).
    pub fn reset(&mut self) {
        self.history.clear();
    }
}

impl std::fmt::Debug for Meter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Meter")
            .field("fft_size", &self.window.len())
            .field("reference", &self.reference)
            .field("history", &self.history.len())
            .finish()
    }
}
