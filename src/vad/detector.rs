//! # Voice Activity Detector
//!
//! Turns a stream of Opus frames into speech-boundary events. For each frame it:
//!
//! 1. Decodes Opus to PCM (per-session decoder in `CodecBridge`)
//! 2. Optionally runs the noise gate
//! 3. Measures the frame's mean absolute energy and updates a running average
//! 4. Asks the probability model about 512-sample windows of the frame
//! 5. Feeds both into a small hysteresis state machine
//!
//! ## State machine:
//! ```text
//!   not speaking ── speech ──────────────────────────▶ SpeechStart (pre-roll + frame)
//!   speaking     ── silence for > min_silence_ms ────▶ SpeechEnd   (frame)
//!   speaking     ── anything else ───────────────────▶ SpeechContinue (frame)
//!   not speaking ── anything else ───────────────────▶ NoSpeech (frame kept as pre-roll)
//! ```
//!
//! A frame only counts as speech if the model is confident *and* the frame is
//! clearly louder than the recent average *and* above an absolute floor. The
//! relative check stops steady background noise (a fan, traffic) from ever
//! starting an utterance.
//!
//! ## Key Rust Concepts:
//! - **tokio::time::Instant**: lets tests drive silence timing with a paused clock
//! - **DashMap<String, Arc<Mutex<_>>>**: per-session state without a global lock

use crate::audio::buffer::PreRollBuffer;
use crate::audio::codec::CodecBridge;
use crate::audio::denoise::NoiseSuppressor;
use crate::audio::processor::{bytes_to_samples, mean_abs_energy, pcm_to_float};
use crate::config::VadConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::session::SessionResource;
use crate::vad::model::SpeechProbabilityModel;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How many recent probabilities are kept per session.
const PROBABILITY_HISTORY: usize = 10;

/// Weight of the existing average when folding in a new energy reading.
const ENERGY_SMOOTHING: f32 = 0.95;

/// A frame must be this many times louder than the running average to start speech.
const ENERGY_RISE_FACTOR: f32 = 1.5;

/// Distance between the speech and derived silence thresholds.
const THRESHOLD_GAP: f32 = 0.15;

/// Outcome of processing one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadStatus {
    NoSpeech,
    SpeechStart,
    SpeechContinue,
    SpeechEnd,
    Error,
}

/// Status plus the PCM that belongs to the utterance (empty unless speaking).
#[derive(Debug, Clone)]
pub struct VadResult {
    pub status: VadStatus,
    pub pcm: Vec<u8>,
}

impl VadResult {
    fn empty(status: VadStatus) -> Self {
        Self {
            status,
            pcm: Vec::new(),
        }
    }
}

/// Runtime-tunable detector settings.
#[derive(Debug, Clone, Copy)]
pub struct VadSettings {
    pub speech_threshold: f32,
    pub silence_threshold: f32,
    pub energy_threshold: f32,
    pub min_silence_duration_ms: u64,
    pub pre_buffer_duration_ms: u32,
    pub enable_noise_reduction: bool,
    pub window_size: usize,
}

impl From<&VadConfig> for VadSettings {
    fn from(config: &VadConfig) -> Self {
        Self {
            speech_threshold: config.speech_threshold,
            silence_threshold: config.silence_threshold,
            energy_threshold: config.energy_threshold,
            min_silence_duration_ms: config.min_silence_duration_ms,
            pre_buffer_duration_ms: config.pre_buffer_duration_ms,
            enable_noise_reduction: config.enable_noise_reduction,
            window_size: config.window_size.max(1),
        }
    }
}

/// Detector state for one session.
#[derive(Debug)]
struct VadSessionState {
    speaking: bool,
    average_energy: Option<f32>,
    probabilities: VecDeque<f32>,
    pre_roll: PreRollBuffer,
    silence_start: Option<Instant>,
}

impl VadSessionState {
    fn new(pre_roll_bytes: usize) -> Self {
        Self {
            speaking: false,
            average_energy: None,
            probabilities: VecDeque::with_capacity(PROBABILITY_HISTORY),
            pre_roll: PreRollBuffer::new(pre_roll_bytes),
            silence_start: None,
        }
    }

    fn reset(&mut self) {
        self.speaking = false;
        self.average_energy = None;
        self.probabilities.clear();
        self.pre_roll.clear();
        self.silence_start = None;
    }

    /// Fold a reading into the running average and return the new average.
    fn update_energy(&mut self, energy: f32) -> f32 {
        let average = match self.average_energy {
            None => energy,
            Some(avg) => ENERGY_SMOOTHING * avg + (1.0 - ENERGY_SMOOTHING) * energy,
        };
        self.average_energy = Some(average);
        average
    }

    fn record_probability(&mut self, probability: f32) {
        if self.probabilities.len() == PROBABILITY_HISTORY {
            self.probabilities.pop_front();
        }
        self.probabilities.push_back(probability);
    }

    fn silence_duration(&self) -> Duration {
        self.silence_start
            .map(|start| Instant::now().saturating_duration_since(start))
            .unwrap_or_default()
    }
}

/// Per-session voice activity detection.
pub struct VadEngine {
    codec: Arc<CodecBridge>,
    noise: Arc<NoiseSuppressor>,
    model: Arc<dyn SpeechProbabilityModel>,
    settings: RwLock<VadSettings>,
    bytes_per_ms: usize,
    sessions: DashMap<String, Arc<Mutex<VadSessionState>>>,
}

impl VadEngine {
    /// Build the detector and initialize the model.
    ///
    /// A model that fails to initialize is logged and kept; every inference
    /// error later counts as probability 0.0, so the session just never hears speech.
    pub fn new(
        config: &VadConfig,
        codec: Arc<CodecBridge>,
        noise: Arc<NoiseSuppressor>,
        model: Arc<dyn SpeechProbabilityModel>,
    ) -> Self {
        if let Err(e) = model.initialize() {
            warn!("Speech probability model failed to initialize: {}", e);
        }
        let bytes_per_ms = codec.format().bytes_per_ms();
        Self {
            codec,
            noise,
            model,
            settings: RwLock::new(VadSettings::from(config)),
            bytes_per_ms,
            sessions: DashMap::new(),
        }
    }

    pub fn settings(&self) -> VadSettings {
        *self.settings.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Decode one Opus frame and run it through the detector.
    pub fn process_audio(&self, session_id: &str, opus_frame: &[u8]) -> VadResult {
        match self.codec.decode(session_id, opus_frame) {
            Ok(pcm) if !pcm.is_empty() => self.process_pcm(session_id, &pcm),
            Ok(_) => VadResult::empty(VadStatus::NoSpeech),
            Err(e) => {
                debug!(session_id, "Dropping undecodable frame: {}", e);
                VadResult::empty(VadStatus::Error)
            }
        }
    }

    /// Run already-decoded PCM through the detector.
    pub fn process_pcm(&self, session_id: &str, pcm: &[u8]) -> VadResult {
        let settings = self.settings();
        let state = self.state_for(session_id, &settings);
        let mut state = state.lock().unwrap_or_else(|e| e.into_inner());

        state
            .pre_roll
            .set_capacity(settings.pre_buffer_duration_ms as usize * self.bytes_per_ms);

        let processed = if settings.enable_noise_reduction {
            self.noise.process(session_id, pcm)
        } else {
            pcm.to_vec()
        };

        let samples = pcm_to_float(&bytes_to_samples(&processed));
        let energy = mean_abs_energy(&samples);
        let average_energy = state.update_energy(energy);

        let probability = self.probability(&samples, settings.window_size);
        state.record_probability(probability);

        let is_speech = probability > settings.speech_threshold
            && energy > average_energy * ENERGY_RISE_FACTOR
            && energy > settings.energy_threshold;
        let is_silence = probability < settings.silence_threshold;

        if is_silence {
            if state.silence_start.is_none() {
                state.silence_start = Some(Instant::now());
            }
        } else {
            state.silence_start = None;
        }

        if !state.speaking && is_speech {
            state.speaking = true;
            let mut combined = state.pre_roll.drain();
            let pre_roll_ms = combined.len() / self.bytes_per_ms.max(1);
            combined.extend_from_slice(&processed);
            info!(session_id, probability, energy, pre_roll_ms, "Speech started");
            return VadResult {
                status: VadStatus::SpeechStart,
                pcm: combined,
            };
        }

        if state.speaking {
            let silence = state.silence_duration();
            if is_silence && silence > Duration::from_millis(settings.min_silence_duration_ms) {
                state.speaking = false;
                info!(session_id, silence_ms = silence.as_millis() as u64, "Speech ended");
                return VadResult {
                    status: VadStatus::SpeechEnd,
                    pcm: processed,
                };
            }
            return VadResult {
                status: VadStatus::SpeechContinue,
                pcm: processed,
            };
        }

        state.pre_roll.push(pcm);
        VadResult::empty(VadStatus::NoSpeech)
    }

    /// Score the frame: zero-pad short frames, take the max over half-overlapping
    /// windows for long ones.
    fn probability(&self, samples: &[f32], window: usize) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }

        let score = |w: &[f32]| match self.model.speech_probability(w) {
            Ok(p) => p.clamp(0.0, 1.0),
            Err(e) => {
                warn!("Speech probability inference failed: {}", e);
                0.0
            }
        };

        if samples.len() <= window {
            let mut padded = vec![0.0f32; window];
            padded[..samples.len()].copy_from_slice(samples);
            return score(&padded);
        }

        let step = (window / 2).max(1);
        (0..=samples.len() - window)
            .step_by(step)
            .map(|offset| score(&samples[offset..offset + window]))
            .fold(0.0, f32::max)
    }

    fn state_for(&self, session_id: &str, settings: &VadSettings) -> Arc<Mutex<VadSessionState>> {
        let cap = settings.pre_buffer_duration_ms as usize * self.bytes_per_ms;
        self.sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(VadSessionState::new(cap))))
            .clone()
    }

    /// Start a fresh listening period: reset existing state or create it.
    pub fn initialize_session(&self, session_id: &str) {
        let settings = self.settings();
        let state = self.state_for(session_id, &settings);
        state.lock().unwrap_or_else(|e| e.into_inner()).reset();
        debug!(session_id, "VAD session initialized");
    }

    /// Drop the detector state and the learned noise profile.
    pub fn reset_session(&self, session_id: &str) {
        self.sessions.remove(session_id);
        self.noise.release(session_id);
        debug!(session_id, "VAD session reset");
    }

    pub fn is_speaking(&self, session_id: &str) -> bool {
        self.sessions
            .get(session_id)
            .map(|s| s.lock().unwrap_or_else(|e| e.into_inner()).speaking)
            .unwrap_or(false)
    }

    /// Most recent probability for a session, 0.0 if none yet.
    pub fn current_probability(&self, session_id: &str) -> f32 {
        self.sessions
            .get(session_id)
            .and_then(|s| s.lock().unwrap_or_else(|e| e.into_inner()).probabilities.back().copied())
            .unwrap_or(0.0)
    }

    pub fn has_session(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn pre_roll_len(&self, session_id: &str) -> usize {
        self.sessions
            .get(session_id)
            .map(|s| s.lock().unwrap_or_else(|e| e.into_inner()).pre_roll.len_bytes())
            .unwrap_or(0)
    }

    /// Set the speech threshold; the silence threshold follows 0.15 below it.
    pub fn set_speech_threshold(&self, threshold: f32) -> VoiceResult<()> {
        check_unit_range("speech_threshold", threshold)?;
        let mut settings = self.settings.write().unwrap_or_else(|e| e.into_inner());
        settings.speech_threshold = threshold;
        settings.silence_threshold = (threshold - THRESHOLD_GAP).max(0.0);
        info!(
            threshold,
            silence_threshold = settings.silence_threshold,
            "VAD speech threshold updated"
        );
        Ok(())
    }

    /// Set the silence threshold directly. Must not exceed the speech threshold.
    pub fn set_silence_threshold(&self, threshold: f32) -> VoiceResult<()> {
        check_unit_range("silence_threshold", threshold)?;
        let mut settings = self.settings.write().unwrap_or_else(|e| e.into_inner());
        if threshold > settings.speech_threshold {
            return Err(VoiceError::out_of_range(
                "silence_threshold",
                threshold as f64,
                0.0,
                settings.speech_threshold as f64,
            ));
        }
        settings.silence_threshold = threshold;
        Ok(())
    }

    pub fn set_energy_threshold(&self, threshold: f32) -> VoiceResult<()> {
        check_unit_range("energy_threshold", threshold)?;
        self.settings.write().unwrap_or_else(|e| e.into_inner()).energy_threshold = threshold;
        info!(threshold, "VAD energy threshold updated");
        Ok(())
    }

    pub fn set_min_silence_duration(&self, duration_ms: u64) {
        self.settings.write().unwrap_or_else(|e| e.into_inner()).min_silence_duration_ms =
            duration_ms;
        info!(duration_ms, "VAD minimum silence updated");
    }

    /// Takes effect on the next processed frame.
    pub fn set_pre_buffer_duration(&self, duration_ms: u32) {
        self.settings.write().unwrap_or_else(|e| e.into_inner()).pre_buffer_duration_ms =
            duration_ms;
        info!(duration_ms, "VAD pre-roll duration updated");
    }

    pub fn set_noise_reduction(&self, enabled: bool) {
        self.settings.write().unwrap_or_else(|e| e.into_inner()).enable_noise_reduction = enabled;
        info!(enabled, "Noise reduction toggled");
    }
}

fn check_unit_range(name: &'static str, value: f32) -> VoiceResult<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(VoiceError::out_of_range(name, value as f64, 0.0, 1.0))
    }
}

impl SessionResource for VadEngine {
    fn release(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }
}

impl Drop for VadEngine {
    fn drop(&mut self) {
        self.model.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::processor::{samples_to_bytes, AudioFormat};
    use crate::config::NoiseConfig;

    /// Model whose answer the test sets before each frame.
    struct ScriptedModel {
        probability: Mutex<f32>,
    }

    impl ScriptedModel {
        fn set(&self, p: f32) {
            *self.probability.lock().unwrap() = p;
        }
    }

    impl SpeechProbabilityModel for ScriptedModel {
        fn speech_probability(&self, _window: &[f32]) -> VoiceResult<f32> {
            Ok(*self.probability.lock().unwrap())
        }
    }

    struct FailingModel;

    impl SpeechProbabilityModel for FailingModel {
        fn speech_probability(&self, _window: &[f32]) -> VoiceResult<f32> {
            Err(VoiceError::Model("no weights".to_string()))
        }
    }

    fn engine(model: Arc<dyn SpeechProbabilityModel>) -> VadEngine {
        let config = VadConfig {
            enable_noise_reduction: false,
            ..VadConfig::default()
        };
        VadEngine::new(
            &config,
            Arc::new(CodecBridge::new(AudioFormat::new(16000, 1))),
            Arc::new(NoiseSuppressor::new(&NoiseConfig::default())),
            model,
        )
    }

    /// 32ms frame (512 samples) at a constant amplitude.
    fn frame(amplitude: i16) -> Vec<u8> {
        samples_to_bytes(&vec![amplitude; 512])
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_machine_start_continue_end() {
        let model = Arc::new(ScriptedModel {
            probability: Mutex::new(0.0),
        });
        let vad = engine(model.clone());

        model.set(0.1);
        for _ in 0..3 {
            assert_eq!(vad.process_pcm("s1", &frame(30)).status, VadStatus::NoSpeech);
        }
        assert_eq!(vad.pre_roll_len("s1"), 3 * 1024);

        model.set(0.9);
        let start = vad.process_pcm("s1", &frame(8000));
        assert_eq!(start.status, VadStatus::SpeechStart);
        // pre-roll first, then the onset frame exactly once
        assert_eq!(start.pcm.len(), 4 * 1024);
        assert_eq!(&start.pcm[3 * 1024..], &frame(8000)[..]);
        assert_eq!(vad.pre_roll_len("s1"), 0);

        for _ in 0..5 {
            assert_eq!(vad.process_pcm("s1", &frame(8000)).status, VadStatus::SpeechContinue);
        }

        model.set(0.1);
        assert_eq!(vad.process_pcm("s1", &frame(30)).status, VadStatus::SpeechContinue);
        tokio::time::advance(Duration::from_millis(300)).await;
        assert_eq!(vad.process_pcm("s1", &frame(30)).status, VadStatus::SpeechContinue);
        tokio::time::advance(Duration::from_millis(300)).await;

        let end = vad.process_pcm("s1", &frame(30));
        assert_eq!(end.status, VadStatus::SpeechEnd);
        assert_eq!(end.pcm.len(), 1024);
        assert!(!vad.is_speaking("s1"));

        assert_eq!(vad.process_pcm("s1", &frame(30)).status, VadStatus::NoSpeech);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_silent_frame_resets_silence_timer() {
        let model = Arc::new(ScriptedModel {
            probability: Mutex::new(0.1),
        });
        let vad = engine(model.clone());
        vad.process_pcm("s1", &frame(30));
        model.set(0.9);
        assert_eq!(vad.process_pcm("s1", &frame(8000)).status, VadStatus::SpeechStart);

        model.set(0.1);
        vad.process_pcm("s1", &frame(30));
        tokio::time::advance(Duration::from_millis(400)).await;
        // between the thresholds: neither speech nor silence
        model.set(0.4);
        vad.process_pcm("s1", &frame(30));
        model.set(0.1);
        vad.process_pcm("s1", &frame(30));
        tokio::time::advance(Duration::from_millis(400)).await;
        assert_eq!(vad.process_pcm("s1", &frame(30)).status, VadStatus::SpeechContinue);
    }

    #[tokio::test]
    async fn test_steady_noise_never_starts_speech() {
        let model = Arc::new(ScriptedModel {
            probability: Mutex::new(0.9),
        });
        let vad = engine(model);
        // constant loudness never rises 1.5x above its own average
        for _ in 0..20 {
            assert_eq!(vad.process_pcm("s1", &frame(8000)).status, VadStatus::NoSpeech);
        }
    }

    #[test]
    fn test_pre_roll_stays_capped() {
        let vad = engine(Arc::new(FailingModel));
        for _ in 0..50 {
            vad.process_pcm("s1", &frame(100));
            // 300ms at 32 bytes/ms
            assert!(vad.pre_roll_len("s1") <= 9600);
        }
        assert_eq!(vad.current_probability("s1"), 0.0);
    }

    #[test]
    fn test_threshold_setters() {
        let vad = engine(Arc::new(FailingModel));
        assert!(vad.set_speech_threshold(1.2).is_err());
        assert!(vad.set_speech_threshold(0.6).is_ok());
        assert!((vad.settings().silence_threshold - 0.45).abs() < 1e-6);

        vad.set_speech_threshold(0.1).unwrap();
        assert_eq!(vad.settings().silence_threshold, 0.0);

        assert!(vad.set_energy_threshold(-0.1).is_err());
        assert!(vad.set_silence_threshold(0.5).is_err());
    }

    #[test]
    fn test_undecodable_frame_is_error() {
        let vad = engine(Arc::new(FailingModel));
        assert_eq!(vad.process_audio("s1", &[]).status, VadStatus::Error);
    }

    #[test]
    fn test_reset_and_release() {
        let vad = engine(Arc::new(FailingModel));
        vad.process_pcm("s1", &frame(100));
        vad.initialize_session("s1");
        assert_eq!(vad.pre_roll_len("s1"), 0);
        assert!(vad.has_session("s1"));

        vad.reset_session("s1");
        assert!(!vad.has_session("s1"));

        vad.process_pcm("s2", &frame(100));
        vad.release("s2");
        assert!(!vad.has_session("s2"));
    }
}
