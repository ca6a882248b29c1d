//! # Adaptive Noise Gate
//!
//! A light per-session noise suppressor that runs on decoded PCM before the VAD
//! looks at it. It has two phases:
//!
//! 1. **Training**: the first `estimation_frames` blocks of a session are
//!    assumed to be background noise. Each sample position gets a floor
//!    estimate (an exponential moving average of `|x|`). Audio passes through
//!    unchanged while this happens.
//! 2. **Gating**: afterwards, any sample quieter than
//!    `floor × spectral_subtraction_factor` is attenuated by `(|x|/threshold)²`,
//!    a soft knee instead of a hard cut. Whatever is still below the absolute
//!    noise floor is scaled down by a further 10×.
//!
//! ## Key Rust Concepts:
//! - **RwLock for settings**: read on every block, written only from the config API
//! - **DashMap of Arc<Mutex<NoiseProfile>>**: one profile per session, locked
//!   independently of all others

use crate::audio::processor::{bytes_to_samples, samples_to_bytes};
use crate::config::NoiseConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::session::SessionResource;
use dashmap::DashMap;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info};

/// Learned noise floor for one session.
#[derive(Debug)]
struct NoiseProfile {
    floor: Vec<f32>,
    trained_blocks: usize,
}

impl NoiseProfile {
    fn new(block_size: usize) -> Self {
        Self {
            floor: vec![0.0; block_size],
            trained_blocks: 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct NoiseSettings {
    estimation_frames: usize,
    subtraction_factor: f32,
}

/// Per-session adaptive noise gate.
pub struct NoiseSuppressor {
    block_size: usize,
    noise_floor: f32,
    settings: RwLock<NoiseSettings>,
    profiles: DashMap<String, Arc<Mutex<NoiseProfile>>>,
}

impl NoiseSuppressor {
    pub fn new(config: &NoiseConfig) -> Self {
        Self {
            block_size: config.block_size.max(1),
            noise_floor: config.noise_floor,
            settings: RwLock::new(NoiseSettings {
                estimation_frames: config.estimation_frames,
                subtraction_factor: config.spectral_subtraction_factor,
            }),
            profiles: DashMap::new(),
        }
    }

    /// Denoise a buffer of little-endian 16-bit PCM for a session.
    ///
    /// Buffers shorter than one sample are returned as they are.
    pub fn process(&self, session_id: &str, pcm: &[u8]) -> Vec<u8> {
        if pcm.len() < 2 {
            return pcm.to_vec();
        }

        let settings = *self.settings.read().unwrap_or_else(|e| e.into_inner());
        let profile = self
            .profiles
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(NoiseProfile::new(self.block_size))))
            .clone();
        let mut profile = profile.lock().unwrap_or_else(|e| e.into_inner());

        let samples = bytes_to_samples(pcm);
        let mut output = Vec::with_capacity(samples.len());
        let mut block = vec![0.0f32; self.block_size];

        for chunk in samples.chunks(self.block_size) {
            block.fill(0.0);
            for (slot, &s) in block.iter_mut().zip(chunk) {
                *slot = s as f32 / 32767.0;
            }

            if profile.trained_blocks < settings.estimation_frames {
                let first = profile.trained_blocks == 0;
                for (floor, &x) in profile.floor.iter_mut().zip(&block) {
                    *floor = if first { x.abs() } else { 0.8 * *floor + 0.2 * x.abs() };
                }
                profile.trained_blocks += 1;
                output.extend_from_slice(chunk);
                continue;
            }

            for (i, &x) in block.iter().take(chunk.len()).enumerate() {
                let gated = self.gate(x, profile.floor[i] * settings.subtraction_factor);
                output.push((gated * 32767.0) as i16);
            }
        }

        samples_to_bytes(&output)
    }

    fn gate(&self, x: f32, threshold: f32) -> f32 {
        let magnitude = x.abs();
        let mut y = if magnitude < threshold {
            let gain = magnitude / threshold;
            x * gain * gain
        } else {
            x
        };
        if y.abs() < self.noise_floor {
            y *= 0.1;
        }
        y
    }

    /// Set how strongly quiet samples are pushed down. Accepts 1.0 to 3.0.
    pub fn set_spectral_subtraction_factor(&self, factor: f32) -> VoiceResult<()> {
        if !(1.0..=3.0).contains(&factor) {
            return Err(VoiceError::out_of_range(
                "spectral_subtraction_factor",
                factor as f64,
                1.0,
                3.0,
            ));
        }
        self.settings.write().unwrap_or_else(|e| e.into_inner()).subtraction_factor = factor;
        info!(factor, "Noise subtraction factor updated");
        Ok(())
    }

    /// Set how many blocks are used to learn the noise floor. Accepts 1 to 50.
    pub fn set_noise_estimation_frames(&self, frames: usize) -> VoiceResult<()> {
        if !(1..=50).contains(&frames) {
            return Err(VoiceError::out_of_range(
                "noise_estimation_frames",
                frames as f64,
                1.0,
                50.0,
            ));
        }
        self.settings.write().unwrap_or_else(|e| e.into_inner()).estimation_frames = frames;
        info!(frames, "Noise estimation window updated");
        Ok(())
    }

    /// Forget the learned floor so the next blocks train it again.
    pub fn reset_noise_estimate(&self, session_id: &str) {
        self.profiles.insert(
            session_id.to_string(),
            Arc::new(Mutex::new(NoiseProfile::new(self.block_size))),
        );
        debug!(session_id, "Noise estimate reset");
    }

    pub fn is_trained(&self, session_id: &str) -> bool {
        let estimation_frames = self
            .settings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .estimation_frames;
        self.profiles
            .get(session_id)
            .map(|p| p.lock().unwrap_or_else(|e| e.into_inner()).trained_blocks >= estimation_frames)
            .unwrap_or(false)
    }

    pub fn has_profile(&self, session_id: &str) -> bool {
        self.profiles.contains_key(session_id)
    }
}

impl SessionResource for NoiseSuppressor {
    fn release(&self, session_id: &str) {
        self.profiles.remove(session_id);
    }
}
