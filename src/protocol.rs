//! # Device Wire Protocol
//!
//! JSON text frames exchanged with the device over the WebSocket. Binary frames
//! (one Opus frame per message) carry the audio and are not modelled here.
//!
//! ## Client → Server:
//! - `hello`: opens the conversation and announces the device's audio format
//! - `listen`: `start` / `stop` the microphone, or `detect` a wake word
//! - `abort`: stop whatever the server is saying right now
//! - `iot`: device descriptors and state updates (logged only)
//!
//! ## Server → Client:
//! - `hello`: echo of the audio params plus the server-assigned session id
//! - `stt`: recognized text (`interim`, `final`, or `start` for a wake word)
//! - `tts`: playback markers (`start`, `sentence_start`, `stop`)
//!
//! ## Rust Concepts:
//! - **#[serde(tag = "type")]**: the enum variant is picked from the `type` field,
//!   so `{"type":"listen","state":"start"}` becomes `ClientMessage::Listen { .. }`

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Audio format the device announces in `hello`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioParams {
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub sample_rate: u32,
    #[serde(default)]
    pub channels: u16,
    #[serde(default)]
    pub frame_duration: u32,
}

/// Messages the device sends.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Hello {
        #[serde(default)]
        audio_params: Option<AudioParams>,
    },
    Listen {
        state: ListenState,
        #[serde(default)]
        mode: Option<String>,
        #[serde(default)]
        text: Option<String>,
    },
    Abort {
        #[serde(default)]
        reason: Option<String>,
    },
    Iot {
        #[serde(default)]
        descriptors: Option<Value>,
        #[serde(default)]
        states: Option<Value>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenState {
    Start,
    Stop,
    Detect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtsState {
    Start,
    SentenceStart,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SttState {
    Interim,
    Final,
    Start,
}

/// Messages the server sends.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Hello {
        transport: &'static str,
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        audio_params: Option<AudioParams>,
    },
    Tts {
        session_id: String,
        state: TtsState,
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    Stt {
        session_id: String,
        state: SttState,
        text: String,
    },
}

impl ServerMessage {
    pub fn hello(session_id: &str, audio_params: Option<AudioParams>) -> Self {
        ServerMessage::Hello {
            transport: "websocket",
            session_id: session_id.to_string(),
            audio_params,
        }
    }

    pub fn tts(session_id: &str, state: TtsState, text: Option<String>) -> Self {
        ServerMessage::Tts {
            session_id: session_id.to_string(),
            state,
            text,
        }
    }

    pub fn stt(session_id: &str, state: SttState, text: impl Into<String>) -> Self {
        ServerMessage::Stt {
            session_id: session_id.to_string(),
            state,
            text: text.into(),
        }
    }

    /// Serialize to the JSON text sent over the wire.
    pub fn to_json(&self) -> String {
        // Only strings, enums and plain numbers; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Parse an inbound text frame. Unknown types and malformed JSON are errors.
pub fn parse_client_message(text: &str) -> Result<ClientMessage, serde_json::Error> {
    serde_json::from_str(text)
}
