//! # Voice Pipeline
//!
//! The stages between a device's microphone and its speaker, after the VAD:
//!
//! ```text
//! PCM ─▶ stt ─▶ (LLM) reply ─▶ segmenter ─▶ tts ─▶ dispatch ─▶ device
//! ```
//!
//! - **stt**: streaming recognition with a finalization ceiling
//! - **reply**: the language-model token stream
//! - **segmenter**: tokens to speakable sentences
//! - **tts**: parallel synthesis, in-order handoff
//! - **dispatch**: paced playback with abort
//! - **channel**: the outbound half of the device connection

pub mod channel;
pub mod dispatch;
pub mod reply;
pub mod segmenter;
pub mod stt;
pub mod tts;

#[cfg(test)]
pub mod testing;

pub use channel::OutboundChannel;
pub use dispatch::{AudioDispatchQueue, AudioMessageTask};
pub use reply::{LanguageModelReplyStream, ReplyEvent, ReplyRequest};
pub use segmenter::{SegmenterConfig, Sentence, SentenceSegmenter};
pub use stt::{StreamingSpeechRecognizer, SttOrchestrator, SttOutcome};
pub use tts::{AudioHandle, SpeechSynthesizer, TtsPipelineCoordinator};
