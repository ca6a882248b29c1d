//! # Application State Management
//!
//! Everything HTTP handlers and WebSocket actors share: the configuration, the
//! session registry and one instance of every pipeline component.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! - **Purpose**: the codec, the VAD and the dispatch queue are used by every
//!   connection at once; `Arc` lets them all own the same instance
//! - **Cloning AppState**: only bumps reference counts, nothing is copied
//!
//! ### Arc<RwLock<AppConfig>>
//! - **RwLock**: many readers or one writer
//! - Readers clone the config out and release the lock immediately
//!
//! ### Atomics for counters
//! - **AtomicU64**: counters bumped from many actors without any lock
//!
//! ## Component wiring:
//! ```text
//! CodecBridge ──▶ VadEngine ◀── NoiseSuppressor
//!      │
//!      └────────▶ TtsPipelineCoordinator ──▶ AudioDispatchQueue
//!                          ▲
//!   SttOrchestrator ──▶ DialogueService ◀── LanguageModelReplyStream
//! ```
//! Every component with per-session state is registered with the
//! `SessionRegistry`, so closing a session releases it everywhere.

use crate::audio::{AudioFormat, CodecBridge, NoiseSuppressor};
use crate::config::AppConfig;
use crate::device::{DeviceDirectory, InMemoryDeviceDirectory};
use crate::dialogue::DialogueService;
use crate::pipeline::segmenter::SegmenterConfig;
use crate::pipeline::{
    AudioDispatchQueue, LanguageModelReplyStream, SpeechSynthesizer, StreamingSpeechRecognizer,
    SttOrchestrator, TtsPipelineCoordinator,
};
use crate::providers::{OpenAiChatStream, OpenAiClient, OpenAiSpeechRecognizer, OpenAiSpeechSynthesizer};
use crate::session::SessionRegistry;
use crate::vad::{EnergyProbabilityModel, SpeechProbabilityModel, VadEngine};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::info;

/// Shared state handed to every handler through `web::Data`.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (runtime-tunable sections can change)
    pub config: Arc<RwLock<AppConfig>>,
    pub registry: Arc<SessionRegistry>,
    pub codec: Arc<CodecBridge>,
    pub noise: Arc<NoiseSuppressor>,
    pub vad: Arc<VadEngine>,
    pub dispatch: Arc<AudioDispatchQueue>,
    pub tts: Arc<TtsPipelineCoordinator>,
    pub dialogue: Arc<DialogueService>,
    pub devices: Arc<dyn DeviceDirectory>,
    pub metrics: Arc<PipelineMetrics>,
    /// When the server started (never changes)
    pub start_time: Instant,
}

/// Connection and traffic counters since start.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    pub connections_accepted: AtomicU64,
    pub connections_rejected: AtomicU64,
    pub text_messages: AtomicU64,
    pub audio_frames: AtomicU64,
    pub protocol_errors: AtomicU64,
}

/// Plain copy of `PipelineMetrics` for JSON responses.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub connections_accepted: u64,
    pub connections_rejected: u64,
    pub text_messages: u64,
    pub audio_frames: u64,
    pub protocol_errors: u64,
}

impl PipelineMetrics {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            text_messages: self.text_messages.load(Ordering::Relaxed),
            audio_frames: self.audio_frames.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
        }
    }
}

impl AppState {
    /// Build the state with the OpenAI-compatible providers from `[providers]`.
    pub fn new(config: AppConfig) -> anyhow::Result<Self> {
        let format = AudioFormat::new(config.audio.sample_rate, config.audio.channels);
        let client = OpenAiClient::new(&config.providers)?;
        if config.providers.api_key.is_empty() {
            info!("No provider API key configured; requests go out unauthenticated");
        }

        let recognizer = Arc::new(OpenAiSpeechRecognizer::new(client.clone(), &config.providers, format));
        let synthesizer = Arc::new(OpenAiSpeechSynthesizer::new(client.clone(), &config.providers));
        let llm = Arc::new(OpenAiChatStream::new(client, &config.providers));

        let state = Self::with_providers(
            config,
            recognizer,
            synthesizer,
            llm.clone(),
            Arc::new(EnergyProbabilityModel::default()),
            Arc::new(InMemoryDeviceDirectory::new()),
        )?;
        // chat history is dropped with the last session of its conversation
        state.registry.register_resource(llm);
        Ok(state)
    }

    /// Build the state around the given external capabilities.
    pub fn with_providers(
        config: AppConfig,
        recognizer: Arc<dyn StreamingSpeechRecognizer>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        llm: Arc<dyn LanguageModelReplyStream>,
        model: Arc<dyn SpeechProbabilityModel>,
        devices: Arc<dyn DeviceDirectory>,
    ) -> anyhow::Result<Self> {
        model.initialize()?;

        let format = AudioFormat::new(config.audio.sample_rate, config.audio.channels);
        let frame_ms = config.audio.frame_duration_ms;

        let codec = Arc::new(CodecBridge::new(format));
        let noise = Arc::new(NoiseSuppressor::new(&config.noise));
        let vad = Arc::new(VadEngine::new(&config.vad, codec.clone(), noise.clone(), model));
        let registry = Arc::new(SessionRegistry::new(config.session.max_concurrent_sessions));
        let dispatch = Arc::new(AudioDispatchQueue::with_activity(
            Duration::from_millis(frame_ms as u64),
            &registry,
        ));
        let tts = Arc::new(TtsPipelineCoordinator::new(
            synthesizer,
            codec.clone(),
            dispatch.clone(),
            frame_ms,
            config.tts.delete_audio_files,
        ));
        let stt = Arc::new(SttOrchestrator::new(
            recognizer,
            Duration::from_secs(config.session.stt_finalize_timeout_secs),
        ));
        let dialogue = Arc::new(DialogueService::new(
            vad.clone(),
            stt,
            llm,
            tts.clone(),
            dispatch.clone(),
            SegmenterConfig::new(&config.segmenter)?,
        ));

        registry.register_resource(codec.clone());
        registry.register_resource(noise.clone());
        registry.register_resource(vad.clone());
        registry.register_resource(dispatch.clone());
        registry.register_resource(tts.clone());

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            registry,
            codec,
            noise,
            vad,
            dispatch,
            tts,
            dialogue,
            devices,
            metrics: Arc::new(PipelineMetrics::default()),
            start_time: Instant::now(),
        })
    }

    /// Get a copy of the current configuration.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Validate a new configuration, push its runtime-tunable values into the
    /// live components, then store it.
    ///
    /// Server, audio format, session and provider settings are read at startup
    /// only; changing them here takes effect on restart.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;
        let segmenter = SegmenterConfig::new(&new_config.segmenter).map_err(|e| e.to_string())?;

        let vad = &new_config.vad;
        self.vad
            .set_speech_threshold(vad.speech_threshold)
            .and_then(|_| self.vad.set_silence_threshold(vad.silence_threshold))
            .and_then(|_| self.vad.set_energy_threshold(vad.energy_threshold))
            .and_then(|_| {
                self.noise
                    .set_spectral_subtraction_factor(new_config.noise.spectral_subtraction_factor)
            })
            .and_then(|_| self.noise.set_noise_estimation_frames(new_config.noise.estimation_frames))
            .map_err(|e| e.to_string())?;
        self.vad.set_min_silence_duration(vad.min_silence_duration_ms);
        self.vad.set_pre_buffer_duration(vad.pre_buffer_duration_ms);
        self.vad.set_noise_reduction(vad.enable_noise_reduction);
        self.dialogue.set_segmenter_config(segmenter);
        self.tts.set_delete_audio_files(new_config.tts.delete_audio_files);

        *self.config.write().unwrap_or_else(|e| e.into_inner()) = new_config;
        info!("Runtime configuration updated");
        Ok(())
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::pipeline::testing::{ScriptedRecognizer, ScriptedReplyStream, ScriptedSynthesizer};

    pub(crate) fn test_state() -> AppState {
        AppState::with_providers(
            AppConfig::default(),
            ScriptedRecognizer::new(&["hello"]),
            ScriptedSynthesizer::new(16000),
            ScriptedReplyStream::replying("Hello there, nice to meet you."),
            Arc::new(EnergyProbabilityModel::default()),
            Arc::new(InMemoryDeviceDirectory::new()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_update_config_reaches_live_components() {
        let state = test_state();
        let mut config = state.get_config();
        config
            .update_from_json(
                r#"{"vad":{"speech_threshold":0.7,"min_silence_duration_ms":800},
                    "segmenter":{"fallback_reply":"Oops."},
                    "tts":{"delete_audio_files":false}}"#,
            )
            .unwrap();
        state.update_config(config).unwrap();

        let settings = state.vad.settings();
        assert!((settings.speech_threshold - 0.7).abs() < 1e-6);
        assert!((settings.silence_threshold - 0.55).abs() < 1e-6);
        assert_eq!(settings.min_silence_duration_ms, 800);
        assert_eq!(state.dialogue.segmenter_config().fallback_reply, "Oops.");
        assert!(!state.tts.delete_audio_files());
        assert_eq!(state.get_config().vad.min_silence_duration_ms, 800);
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected_and_not_stored() {
        let state = test_state();
        let mut config = state.get_config();
        config.noise.spectral_subtraction_factor = 9.0;
        assert!(state.update_config(config).is_err());
        assert!((state.get_config().noise.spectral_subtraction_factor - 1.5).abs() < 1e-6);
    }

    #[test]
    fn test_metrics_snapshot() {
        let metrics = PipelineMetrics::default();
        PipelineMetrics::incr(&metrics.audio_frames);
        PipelineMetrics::incr(&metrics.audio_frames);
        PipelineMetrics::incr(&metrics.connections_accepted);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.audio_frames, 2);
        assert_eq!(snapshot.connections_accepted, 1);
        assert_eq!(snapshot.protocol_errors, 0);
    }
}
