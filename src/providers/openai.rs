//! OpenAI-compatible providers over `reqwest`.
//!
//! - Speech recognition: the utterance is collected, wrapped as WAV and posted
//!   to `/audio/transcriptions` in one request once the audio completes
//! - Speech synthesis: `/audio/speech` with `response_format = "wav"`
//! - Chat: `/chat/completions` with `stream = true`, parsed from server-sent
//!   events, with a bounded history per conversation that is dropped once
//!   the last session speaking in it closes

use crate::audio::processor::{bytes_to_samples, encode_wav, AudioFormat};
use crate::config::ProviderConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::pipeline::reply::{LanguageModelReplyStream, ReplyEvent, ReplyRequest};
use crate::pipeline::stt::StreamingSpeechRecognizer;
use crate::pipeline::tts::{AudioHandle, SpeechSynthesizer};
use crate::session::SessionResource;
use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Shared HTTP client, base URL and key.
#[derive(Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl OpenAiClient {
    pub fn new(config: &ProviderConfig) -> VoiceResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let request = self.http.post(format!("{}{}", self.base_url, path));
        if self.api_key.is_empty() {
            request
        } else {
            request.bearer_auth(&self.api_key)
        }
    }

    /// Turn a non-2xx response into an error carrying the body.
    async fn check(response: reqwest::Response) -> Result<reqwest::Response, String> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(format!("HTTP {}: {}", status, body))
    }
}

pub struct OpenAiSpeechRecognizer {
    client: OpenAiClient,
    model: String,
    language: Option<String>,
    format: AudioFormat,
}

impl OpenAiSpeechRecognizer {
    pub fn new(client: OpenAiClient, config: &ProviderConfig, format: AudioFormat) -> Self {
        Self {
            client,
            model: config.stt_model.clone(),
            language: config.language.clone(),
            format,
        }
    }
}

#[async_trait]
impl StreamingSpeechRecognizer for OpenAiSpeechRecognizer {
    async fn recognize(
        &self,
        mut audio: mpsc::UnboundedReceiver<Vec<u8>>,
        transcripts: mpsc::UnboundedSender<String>,
    ) -> VoiceResult<()> {
        let mut pcm = Vec::new();
        while let Some(chunk) = audio.recv().await {
            pcm.extend_from_slice(&chunk);
        }
        if pcm.is_empty() {
            return Ok(());
        }

        let wav = encode_wav(&bytes_to_samples(&pcm), self.format)?;
        let file = reqwest::multipart::Part::bytes(wav)
            .file_name("utterance.wav")
            .mime_str("audio/wav")?;
        let mut form = reqwest::multipart::Form::new()
            .part("file", file)
            .text("model", self.model.clone());
        if let Some(language) = &self.language {
            form = form.text("language", language.clone());
        }

        let response = self
            .client
            .post("/audio/transcriptions")
            .multipart(form)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        let response = OpenAiClient::check(response).await.map_err(VoiceError::Stt)?;
        let body: Value = response.json().await?;
        let text = body
            .get("text")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .trim()
            .to_string();

        debug!(audio_bytes = pcm.len(), chars = text.len(), "Transcription received");
        if !text.is_empty() {
            let _ = transcripts.send(text);
        }
        Ok(())
    }
}

pub struct OpenAiSpeechSynthesizer {
    client: OpenAiClient,
    model: String,
    voice: String,
}

impl OpenAiSpeechSynthesizer {
    pub fn new(client: OpenAiClient, config: &ProviderConfig) -> Self {
        Self {
            client,
            model: config.tts_model.clone(),
            voice: config.tts_voice.clone(),
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for OpenAiSpeechSynthesizer {
    async fn synthesize(&self, text: &str) -> VoiceResult<AudioHandle> {
        let response = self
            .client
            .post("/audio/speech")
            .json(&json!({
                "model": self.model,
                "voice": self.voice,
                "input": text,
                "response_format": "wav",
            }))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        let response = OpenAiClient::check(response).await.map_err(VoiceError::Tts)?;
        let bytes = response.bytes().await?;
        Ok(AudioHandle::Wav(bytes.to_vec()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

impl ChatMessage {
    fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }
}

/// One parsed server-sent-events line.
#[derive(Debug, PartialEq)]
enum SseLine {
    Token(String),
    Done,
    Ignore,
}

fn parse_sse_line(line: &str) -> SseLine {
    let Some(data) = line.strip_prefix("data:") else {
        return SseLine::Ignore;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseLine::Done;
    }
    match serde_json::from_str::<Value>(data) {
        Ok(chunk) => chunk["choices"][0]["delta"]["content"]
            .as_str()
            .filter(|t| !t.is_empty())
            .map(|t| SseLine::Token(t.to_string()))
            .unwrap_or(SseLine::Ignore),
        Err(e) => {
            debug!("Skipping malformed stream chunk: {}", e);
            SseLine::Ignore
        }
    }
}

/// Keep at most `max` messages, dropping the oldest.
fn trim_history(history: &mut Vec<ChatMessage>, max: usize) {
    if history.len() > max {
        let excess = history.len() - max;
        history.drain(..excess);
    }
}

pub struct OpenAiChatStream {
    client: OpenAiClient,
    model: String,
    system_prompt: String,
    max_history: usize,
    history: Arc<DashMap<String, Vec<ChatMessage>>>,
    /// session id -> conversation id it last spoke in
    sessions: Arc<DashMap<String, String>>,
}

impl OpenAiChatStream {
    pub fn new(client: OpenAiClient, config: &ProviderConfig) -> Self {
        Self {
            client,
            model: config.llm_model.clone(),
            system_prompt: config.system_prompt.clone(),
            max_history: config.max_history_messages,
            history: Arc::new(DashMap::new()),
            sessions: Arc::new(DashMap::new()),
        }
    }

    fn track(&self, session_id: &str, conversation_id: &str) {
        self.sessions
            .insert(session_id.to_string(), conversation_id.to_string());
    }

    fn is_live(sessions: &DashMap<String, String>, conversation_id: &str) -> bool {
        sessions.iter().any(|entry| entry.value() == conversation_id)
    }

    fn remember(
        history: &DashMap<String, Vec<ChatMessage>>,
        conversation_id: &str,
        message: ChatMessage,
        max: usize,
    ) {
        let mut entry = history.entry(conversation_id.to_string()).or_default();
        entry.push(message);
        trim_history(&mut entry, max);
    }
}

#[async_trait]
impl LanguageModelReplyStream for OpenAiChatStream {
    async fn stream_reply(&self, request: ReplyRequest) -> VoiceResult<mpsc::Receiver<ReplyEvent>> {
        let mut messages = vec![ChatMessage::new("system", self.system_prompt.clone())];
        if let Some(previous) = self.history.get(&request.conversation_id) {
            messages.extend(previous.iter().cloned());
        }
        messages.push(ChatMessage::new("user", request.user_text.clone()));

        let response = self
            .client
            .post("/chat/completions")
            .json(&json!({
                "model": self.model,
                "messages": messages,
                "stream": true,
            }))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        let response = OpenAiClient::check(response).await.map_err(VoiceError::Llm)?;

        self.track(&request.session_id, &request.conversation_id);
        Self::remember(
            &self.history,
            &request.conversation_id,
            ChatMessage::new("user", request.user_text.clone()),
            self.max_history,
        );
        info!(
            session_id = %request.session_id,
            conversation_id = %request.conversation_id,
            history = messages.len() - 1,
            "Chat completion stream opened"
        );

        let (tx, rx) = mpsc::channel(64);
        let history = Arc::clone(&self.history);
        let sessions = Arc::clone(&self.sessions);
        let max_history = self.max_history;
        let conversation_id = request.conversation_id;
        let mut stream = Box::pin(response.bytes_stream());

        tokio::spawn(async move {
            let mut pending: Vec<u8> = Vec::new();
            let mut reply = String::new();

            let terminal = 'read: loop {
                let chunk = match stream.next().await {
                    Some(Ok(chunk)) => chunk,
                    Some(Err(e)) => break 'read ReplyEvent::Failed(e.to_string()),
                    None => break 'read ReplyEvent::Completed,
                };
                pending.extend_from_slice(&chunk);

                while let Some(newline) = pending.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = pending.drain(..=newline).collect();
                    let line = String::from_utf8_lossy(&line);
                    match parse_sse_line(line.trim_end()) {
                        SseLine::Token(token) => {
                            reply.push_str(&token);
                            if tx.send(ReplyEvent::Token(token)).await.is_err() {
                                // receiver gone: the turn was aborted
                                return;
                            }
                        }
                        SseLine::Done => break 'read ReplyEvent::Completed,
                        SseLine::Ignore => {}
                    }
                }
            };

            let completed = matches!(terminal, ReplyEvent::Completed) && !reply.is_empty();
            // a reply finishing after its session closed must not revive the history
            if completed && Self::is_live(&sessions, &conversation_id) {
                Self::remember(
                    &history,
                    &conversation_id,
                    ChatMessage::new("assistant", reply),
                    max_history,
                );
            } else if let ReplyEvent::Failed(reason) = &terminal {
                warn!(conversation_id = %conversation_id, "Chat stream failed: {}", reason);
            }
            let _ = tx.send(terminal).await;
        });

        Ok(rx)
    }
}

impl SessionResource for OpenAiChatStream {
    fn release(&self, session_id: &str) {
        let Some((_, conversation_id)) = self.sessions.remove(session_id) else {
            return;
        };
        if !Self::is_live(&self.sessions, &conversation_id) {
            if let Some((_, dropped)) = self.history.remove(&conversation_id) {
                debug!(
                    session_id,
                    conversation_id = %conversation_id,
                    messages = dropped.len(),
                    "Chat history released"
                );
            }
        }
    }
}
