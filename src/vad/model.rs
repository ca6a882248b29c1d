//! # Speech Probability Models
//!
//! The detector asks a model "how likely is it that this window contains
//! speech?" and combines the answer with energy checks. The model sits behind a
//! trait so a neural model can replace the built-in energy heuristic without
//! touching the detector.
//!
//! ## Contract:
//! - `speech_probability` receives exactly `window_size` normalized samples
//!   (the detector pads or windows the frame) and returns a value in [0, 1]
//! - It is synchronous; models that need async work should do it in `initialize`

use crate::error::VoiceResult;

/// A model that scores a window of normalized samples for speech.
pub trait SpeechProbabilityModel: Send + Sync {
    /// Load weights or warm up. Called once when the detector is built.
    fn initialize(&self) -> VoiceResult<()> {
        Ok(())
    }

    /// Probability in [0, 1] that the window contains speech.
    fn speech_probability(&self, window: &[f32]) -> VoiceResult<f32>;

    /// Clear any recurrent state between utterances.
    fn reset(&self) {}

    /// Free resources on shutdown.
    fn close(&self) {}
}

/// Default model: a logistic curve over the window's RMS level in dBFS.
///
/// ## How it works:
/// `p = 1 / (1 + e^(-slope × (dBFS - midpoint)))`
///
/// With the defaults (midpoint -35 dBFS, slope 0.3) a quiet room at -60 dBFS
/// scores about 0.0006 and normal speech at -20 dBFS scores about 0.99.
#[derive(Debug, Clone)]
pub struct EnergyProbabilityModel {
    midpoint_dbfs: f32,
    slope: f32,
}

impl Default for EnergyProbabilityModel {
    fn default() -> Self {
        Self {
            midpoint_dbfs: -35.0,
            slope: 0.3,
        }
    }
}

impl EnergyProbabilityModel {
    pub fn new(midpoint_dbfs: f32, slope: f32) -> Self {
        Self {
            midpoint_dbfs,
            slope,
        }
    }

    fn rms_dbfs(window: &[f32]) -> f32 {
        if window.is_empty() {
            return f32::NEG_INFINITY;
        }
        let mean_square = window.iter().map(|s| s * s).sum::<f32>() / window.len() as f32;
        // -120 dBFS is well below anything a 16-bit source can produce
        10.0 * mean_square.max(1e-12).log10()
    }
}

impl SpeechProbabilityModel for EnergyProbabilityModel {
    fn speech_probability(&self, window: &[f32]) -> VoiceResult<f32> {
        let level = Self::rms_dbfs(window);
        if level == f32::NEG_INFINITY {
            return Ok(0.0);
        }
        Ok(1.0 / (1.0 + (-self.slope * (level - self.midpoint_dbfs)).exp()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silence_scores_low() {
        let model = EnergyProbabilityModel::default();
        assert!(model.speech_probability(&[0.0; 512]).unwrap() < 0.01);
        assert_eq!(model.speech_probability(&[]).unwrap(), 0.0);
    }

    #[test]
    fn test_loud_window_scores_high() {
        let model = EnergyProbabilityModel::default();
        // constant 0.1 is -20 dBFS
        let p = model.speech_probability(&[0.1; 512]).unwrap();
        assert!(p > 0.95, "got {}", p);
    }

    #[test]
    fn test_midpoint_is_half() {
        let model = EnergyProbabilityModel::new(-20.0, 0.3);
        let p = model.speech_probability(&[0.1; 512]).unwrap();
        assert!((p - 0.5).abs() < 0.01);
    }
}
