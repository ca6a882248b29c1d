//! # Audio Module
//!
//! Everything that touches raw audio before it reaches speech recognition or
//! after it leaves speech synthesis.
//!
//! ## Key Components:
//! - **CodecBridge**: Opus decode (per session) and encode (per sentence)
//! - **NoiseSuppressor**: adaptive noise gate trained on the first blocks of a session
//! - **PreRollBuffer**: keeps the audio just before speech onset
//! - **processor**: PCM/WAV conversion helpers
//!
//! ## Audio Format:
//! - **Encoding**: 16-bit signed little-endian PCM internally, Opus on the wire
//! - **Sample Rate**: configured in `[audio]`, 16kHz by default
//! - **Channels**: mono by default

pub mod buffer; // Byte-capped pre-roll FIFO
pub mod codec; // Opus encode/decode
pub mod denoise; // Adaptive noise gate
pub mod processor; // PCM and WAV helpers

pub use buffer::PreRollBuffer;
pub use codec::CodecBridge;
pub use denoise::NoiseSuppressor;
pub use processor::AudioFormat;
