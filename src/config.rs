//! # Configuration Management
//!
//! Loads the service configuration from several sources, in increasing priority:
//! 1. Default values (the `Default` impl below)
//! 2. An optional `config` file next to the binary (`config.toml` by convention)
//! 3. Environment variables with the `APP` prefix and `__` between path segments,
//!    e.g. `APP__VAD__SPEECH_THRESHOLD=0.6` or `APP__SESSION__INACTIVITY_TIMEOUT_SECS=90`
//! 4. Deployment-platform shortcuts: `HOST`, `PORT` and `OPENAI_API_KEY`
//!
//! ## Why `__` and not `_`:
//! Our keys contain underscores (`min_silence_duration_ms`), so a single `_`
//! separator would split them into nested tables that don't exist.
//!
//! ## Runtime updates:
//! The VAD, noise, segmenter and TTS sections can be changed while the server
//! runs (`PUT /api/v1/config`). Server, audio, session and provider sections
//! are only read at startup.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Opus frame durations we accept for encoding and for client audio params.
pub const SUPPORTED_FRAME_DURATIONS_MS: [u32; 4] = [10, 20, 40, 60];

/// Sample rates Opus can run at natively.
pub const SUPPORTED_SAMPLE_RATES: [u32; 5] = [8000, 12000, 16000, 24000, 48000];

/// Main application configuration.
///
/// ## Rust Concepts:
/// - **#[derive(Serialize, Deserialize)]**: lets the `config` crate build this
///   struct from TOML/env sources, and lets us echo it back as JSON
/// - **#[serde(default)]**: a config file only needs the keys it overrides
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub audio: AudioConfig,
    pub vad: VadConfig,
    pub noise: NoiseConfig,
    pub segmenter: SegmenterSettings,
    pub session: SessionConfig,
    pub tts: TtsConfig,
    pub providers: ProviderConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Path the device WebSocket is served on
    pub ws_path: String,
}

/// PCM format shared by decoding, synthesis and encoding.
///
/// The device sends Opus at this rate and receives reply audio at the same rate,
/// so there is only one format to keep track of.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    /// Duration of each outbound Opus frame, also the playback pacing interval
    pub frame_duration_ms: u32,
}

/// Voice-activity detection thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// Probability above which a frame may count as speech
    pub speech_threshold: f32,
    /// Probability below which a frame counts as silence
    pub silence_threshold: f32,
    /// Minimum mean absolute amplitude for a speech frame
    pub energy_threshold: f32,
    /// Silence longer than this ends the utterance
    pub min_silence_duration_ms: u64,
    /// Audio kept from before speech onset
    pub pre_buffer_duration_ms: u32,
    pub enable_noise_reduction: bool,
    /// Samples per probability-model window
    pub window_size: usize,
}

/// Adaptive noise gate settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NoiseConfig {
    pub block_size: usize,
    pub estimation_frames: usize,
    pub spectral_subtraction_factor: f32,
    pub noise_floor: f32,
}

/// Thresholds for cutting a streamed reply into speakable sentences.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmenterSettings {
    pub min_sentence_length: usize,
    pub new_sentence_threshold: usize,
    pub context_chars: usize,
    /// Spoken when the language model fails mid-turn
    pub fallback_reply: String,
}

/// Session lifecycle and timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub max_concurrent_sessions: usize,
    pub inactivity_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub stt_finalize_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
}

/// Synthesized audio handling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// Remove audio files returned by the synthesizer once they are encoded
    pub delete_audio_files: bool,
}

/// OpenAI-compatible speech and chat endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_key: String,
    pub stt_model: String,
    pub tts_model: String,
    pub tts_voice: String,
    pub llm_model: String,
    pub system_prompt: String,
    pub language: Option<String>,
    pub max_history_messages: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            audio: AudioConfig::default(),
            vad: VadConfig::default(),
            noise: NoiseConfig::default(),
            segmenter: SegmenterSettings::default(),
            session: SessionConfig::default(),
            tts: TtsConfig::default(),
            providers: ProviderConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            ws_path: "/xiaozhi/v1/".to_string(),
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            channels: 1,
            frame_duration_ms: 60,
        }
    }
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            speech_threshold: 0.5,
            silence_threshold: 0.35,
            energy_threshold: 0.01,
            min_silence_duration_ms: 500,
            pre_buffer_duration_ms: 300,
            enable_noise_reduction: true,
            window_size: 512,
        }
    }
}

impl Default for NoiseConfig {
    fn default() -> Self {
        Self {
            block_size: 512,
            estimation_frames: 10,
            spectral_subtraction_factor: 1.5,
            noise_floor: 0.01,
        }
    }
}

impl Default for SegmenterSettings {
    fn default() -> Self {
        Self {
            min_sentence_length: 5,
            new_sentence_threshold: 8,
            context_chars: 20,
            fallback_reply: "Sorry, something went wrong while I was answering.".to_string(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 100,
            inactivity_timeout_secs: 60,
            sweep_interval_secs: 10,
            stt_finalize_timeout_secs: 10,
            heartbeat_interval_secs: 30,
            client_timeout_secs: 120,
        }
    }
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            delete_audio_files: true,
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            stt_model: "whisper-1".to_string(),
            tts_model: "tts-1".to_string(),
            tts_voice: "alloy".to_string(),
            llm_model: "gpt-4o-mini".to_string(),
            system_prompt: "You are a friendly voice assistant. Answer briefly in plain spoken sentences.".to_string(),
            language: None,
            max_history_messages: 20,
        }
    }
}

impl AudioConfig {
    /// Bytes of 16-bit PCM per millisecond (32 for 16 kHz mono).
    pub fn bytes_per_ms(&self) -> usize {
        self.sample_rate as usize * self.channels as usize * 2 / 1000
    }
}

impl AppConfig {
    /// Load configuration from defaults, the optional config file and the environment.
    ///
    /// ## Environment Variable Examples:
    /// - `APP__SERVER__HOST=0.0.0.0`
    /// - `APP__VAD__MIN_SILENCE_DURATION_MS=700`
    /// - `HOST=0.0.0.0`, `PORT=3000` for deployment platforms
    /// - `OPENAI_API_KEY=...` for the provider key
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("__")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Ok(key) = env::var("OPENAI_API_KEY") {
            settings = settings.set_override("providers.api_key", key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - the audio format is one Opus can encode at the configured frame size
    /// - VAD thresholds are probabilities and silence sits below speech
    /// - noise-gate settings are inside the ranges the gate accepts
    /// - timers and limits are non-zero
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if !self.server.ws_path.starts_with('/') {
            return Err(anyhow::anyhow!("WebSocket path must start with '/'"));
        }

        if !SUPPORTED_SAMPLE_RATES.contains(&self.audio.sample_rate) {
            return Err(anyhow::anyhow!(
                "Unsupported sample rate {} (expected one of {:?})",
                self.audio.sample_rate,
                SUPPORTED_SAMPLE_RATES
            ));
        }

        if !(1..=2).contains(&self.audio.channels) {
            return Err(anyhow::anyhow!("Audio channels must be 1 or 2"));
        }

        if !SUPPORTED_FRAME_DURATIONS_MS.contains(&self.audio.frame_duration_ms) {
            return Err(anyhow::anyhow!(
                "Unsupported frame duration {}ms (expected one of {:?})",
                self.audio.frame_duration_ms,
                SUPPORTED_FRAME_DURATIONS_MS
            ));
        }

        for (name, value) in [
            ("vad.speech_threshold", self.vad.speech_threshold),
            ("vad.silence_threshold", self.vad.silence_threshold),
            ("vad.energy_threshold", self.vad.energy_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(anyhow::anyhow!("{} must be between 0 and 1", name));
            }
        }

        if self.vad.silence_threshold > self.vad.speech_threshold {
            return Err(anyhow::anyhow!(
                "vad.silence_threshold must not exceed vad.speech_threshold"
            ));
        }

        if self.vad.window_size == 0 {
            return Err(anyhow::anyhow!("vad.window_size must be greater than 0"));
        }

        if self.noise.block_size == 0 {
            return Err(anyhow::anyhow!("noise.block_size must be greater than 0"));
        }

        if !(1..=50).contains(&self.noise.estimation_frames) {
            return Err(anyhow::anyhow!("noise.estimation_frames must be between 1 and 50"));
        }

        if !(1.0..=3.0).contains(&self.noise.spectral_subtraction_factor) {
            return Err(anyhow::anyhow!(
                "noise.spectral_subtraction_factor must be between 1.0 and 3.0"
            ));
        }

        if self.segmenter.min_sentence_length == 0 || self.segmenter.new_sentence_threshold == 0 {
            return Err(anyhow::anyhow!("Segmenter thresholds must be greater than 0"));
        }

        if self.segmenter.context_chars < 4 {
            return Err(anyhow::anyhow!("segmenter.context_chars must be at least 4"));
        }

        if self.session.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.session.inactivity_timeout_secs == 0
            || self.session.sweep_interval_secs == 0
            || self.session.stt_finalize_timeout_secs == 0
            || self.session.heartbeat_interval_secs == 0
        {
            return Err(anyhow::anyhow!("Session timers must be greater than 0"));
        }

        Ok(())
    }

    /// Apply a partial JSON update to the runtime-tunable sections.
    ///
    /// For example `{"vad": {"speech_threshold": 0.6}}` changes only the speech
    /// threshold. Changing the speech threshold without an explicit silence
    /// threshold derives the silence threshold as `speech - 0.15`, the same rule
    /// the detector applies.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(vad) = partial.get("vad") {
            if let Some(v) = vad.get("speech_threshold").and_then(|v| v.as_f64()) {
                self.vad.speech_threshold = v as f32;
                self.vad.silence_threshold = (v as f32 - 0.15).max(0.0);
            }
            if let Some(v) = vad.get("silence_threshold").and_then(|v| v.as_f64()) {
                self.vad.silence_threshold = v as f32;
            }
            if let Some(v) = vad.get("energy_threshold").and_then(|v| v.as_f64()) {
                self.vad.energy_threshold = v as f32;
            }
            if let Some(v) = vad.get("min_silence_duration_ms").and_then(|v| v.as_u64()) {
                self.vad.min_silence_duration_ms = v;
            }
            if let Some(v) = vad.get("pre_buffer_duration_ms").and_then(|v| v.as_u64()) {
                self.vad.pre_buffer_duration_ms = v as u32;
            }
            if let Some(v) = vad.get("enable_noise_reduction").and_then(|v| v.as_bool()) {
                self.vad.enable_noise_reduction = v;
            }
        }

        if let Some(noise) = partial.get("noise") {
            if let Some(v) = noise.get("spectral_subtraction_factor").and_then(|v| v.as_f64()) {
                self.noise.spectral_subtraction_factor = v as f32;
            }
            if let Some(v) = noise.get("estimation_frames").and_then(|v| v.as_u64()) {
                self.noise.estimation_frames = v as usize;
            }
        }

        if let Some(segmenter) = partial.get("segmenter") {
            if let Some(v) = segmenter.get("min_sentence_length").and_then(|v| v.as_u64()) {
                self.segmenter.min_sentence_length = v as usize;
            }
            if let Some(v) = segmenter.get("new_sentence_threshold").and_then(|v| v.as_u64()) {
                self.segmenter.new_sentence_threshold = v as usize;
            }
            if let Some(v) = segmenter.get("fallback_reply").and_then(|v| v.as_str()) {
                self.segmenter.fallback_reply = v.to_string();
            }
        }

        if let Some(tts) = partial.get("tts") {
            if let Some(v) = tts.get("delete_audio_files").and_then(|v| v.as_bool()) {
                self.tts.delete_audio_files = v;
            }
        }

        self.validate()?;
        Ok(())
    }
}
