//! One-sided dB magnitude spectrum of a windowed block.

use std::f32::consts::PI;

use rustfft::{num_complex::Complex, Fft};

/// Symmetric Hamming window of length `n`.
pub fn hamming(n: usize) -> Vec<f32> {
    if n == 1 {
        return vec![1.0];
    }
    let denom = (n - 1) as f32;
    (0..n)
        .map(|i| 0.54 - 0.46 * (2.0 * PI * i as f32 / denom).cos())
        .collect()
}

/// Centre frequency of each of the `fft_size / 2 + 1` bins.
pub fn bin_frequencies(fft_size: usize, sample_rate: u32) -> Vec<f32> {
    let resolution = sample_rate as f32 / fft_size as f32;
    (0..=fft_size / 2).map(|k| k as f32 * resolution).collect()
}

/// Amplitude spectrum in dB relative to `reference`.
///
/// The most recent `window.len()` samples are used; shorter input is
/// zero-padded at the end. Magnitudes are scaled by `2 / sum(window)` so a
/// bin-centred sine of amplitude `A` peaks at `20·log10(A / reference)`.
///
/// `scratch` is resized to the FFT length and reused between calls.
pub fn db_spectrum(
    fft: &dyn Fft<f32>,
    window: &[f32],
    samples: &[f32],
    reference: f32,
    scratch: &mut Vec<Complex<f32>>,
) -> Vec<f32> {
    let n = window.len();
    scratch.clear();
    scratch.resize(n, Complex::new(0.0, 0.0));

    let recent = &samples[samples.len().saturating_sub(n)..];
    for ((slot, &s), &w) in scratch.iter_mut().zip(recent).zip(window) {
        *slot = Complex::new(s * w, 0.0);
    }
    fft.process(scratch);

    let scale = 2.0 / window.iter().sum::<f32>();
    scratch[..=n / 2]
        .iter()
        .map(|bin| {
            let magnitude = (bin.norm() * scale).max(f32::MIN_POSITIVE);
            20.0 * (magnitude / reference).log10()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rustfft::FftPlanner;

    #[test]
    fn hamming_is_symmetric_with_expected_edges() {
        let w = hamming(65);
        assert_abs_diff_eq!(w[0], 0.08, epsilon = 1e-6);
        assert_abs_diff_eq!(w[32], 1.0, epsilon = 1e-6);
        for i in 0..65 {
            assert_abs_diff_eq!(w[i], w[64 - i], epsilon = 1e-6);
        }
    }

    #[test]
    fn bin_centred_sine_peaks_at_its_amplitude() {
        const N: usize = 1024;
        const FS: u32 = 8_192;
        let freq = 512.0f32; // bin 64
        let amplitude = 0.5f32;
        let samples: Vec<f32> = (0..N)
            .map(|i| amplitude * (2.0 * PI * freq * i as f32 / FS as f32).sin())
            .collect();

        let fft = FftPlanner::<f32>::new().plan_fft_forward(N);
        let window = hamming(N);
        let mut scratch = Vec::new();
        let db = db_spectrum(fft.as_ref(), &window, &samples, 1.0, &mut scratch);

        assert_eq!(db.len(), N / 2 + 1);
        let (peak_bin, peak_db) = db
            .iter()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |best, (k, &v)| if v > best.1 { (k, v) } else { best });
        assert_eq!(peak_bin, 64);
        assert_abs_diff_eq!(peak_db, 20.0 * amplitude.log10(), epsilon = 0.1);
        assert_abs_diff_eq!(bin_frequencies(N, FS)[peak_bin], freq, epsilon = 1e-3);
    }

    #[test]
    fn silence_stays_finite() {
        let fft = FftPlanner::<f32>::new().plan_fft_forward(64);
        let window = hamming(64);
        let db = db_spectrum(fft.as_ref(), &window, &[], 20e-6, &mut Vec::new());
        assert!(db.iter().all(|v| v.is_finite()));
    }
}
