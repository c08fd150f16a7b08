//! Microphone calibration: converts raw sample values to pascal.
//!
//! A capture chain is described by the RMS voltage at digital full scale
//! and the microphone sensitivity in V/Pa. From those follow the maximum
//! measurable level and the pascal value of one ADC count.

use crate::error::{Result, StreamError};
use crate::metering::REFERENCE_PRESSURE;

/// Full-scale input of the reference recorder, 15.6263 V peak as RMS.
pub const DEFAULT_MAX_INPUT_VRMS: f64 = 15.6263 / std::f64::consts::SQRT_2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    max_input_vrms: f64,
    sensitivity_v_per_pa: f64,
}

impl Calibration {
    pub fn from_sensitivity(max_input_vrms: f64, sensitivity_v_per_pa: f64) -> Result<Self> {
        let positive = |v: f64| v.is_finite() && v > 0.0;
        if !positive(max_input_vrms) || !positive(sensitivity_v_per_pa) {
            return Err(StreamError::InvalidConfig(format!(
                "calibration needs positive input range and sensitivity \
                 (got {max_input_vrms} Vrms, {sensitivity_v_per_pa} V/Pa)"
            )));
        }
        Ok(Self {
            max_input_vrms,
            sensitivity_v_per_pa,
        })
    }

    /// Level of a full-scale sine, dB SPL.
    pub fn max_level_db_spl(&self) -> f64 {
        let pa_rms = self.max_input_vrms / self.sensitivity_v_per_pa;
        20.0 * (pa_rms / REFERENCE_PRESSURE as f64).log10()
    }

    /// Pascal per ADC count for signed integers of `bits` width.
    pub fn pascal_per_count(&self, bits: u32) -> f64 {
        let full_scale_counts = ((1u64 << (bits.clamp(2, 32) - 1)) - 1) as f64;
        let pa_rms = REFERENCE_PRESSURE as f64 * 10f64.powf(self.max_level_db_spl() / 20.0);
        pa_rms / full_scale_counts * std::f64::consts::SQRT_2
    }

    /// Pascal for a normalised sample of 1.0, the factor for f32 decoders.
    pub fn pascal_per_full_scale(&self) -> f64 {
        self.max_input_vrms / self.sensitivity_v_per_pa * std::f64::consts::SQRT_2
    }

    /// `pascal_per_full_scale` narrowed for `StreamConfig::calibration_factor`.
    pub fn factor(&self) -> f32 {
        self.pascal_per_full_scale() as f32
    }
}
