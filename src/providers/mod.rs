//! # Speech and Language Providers
//!
//! Concrete implementations of the pipeline's external capabilities:
//! - `StreamingSpeechRecognizer`: what the device said
//! - `SpeechSynthesizer`: audio for a reply sentence
//! - `LanguageModelReplyStream`: the reply itself, token by token
//!
//! Only OpenAI-compatible HTTP endpoints ship here. Any server speaking the same
//! API (a local whisper server, vLLM, Ollama's OpenAI shim) works by changing
//! `providers.base_url`.

pub mod openai;

pub use openai::{OpenAiChatStream, OpenAiClient, OpenAiSpeechRecognizer, OpenAiSpeechSynthesizer};
