//! Shared fakes for pipeline tests.

use crate::error::{VoiceError, VoiceResult};
use crate::pipeline::channel::OutboundChannel;
use crate::pipeline::reply::{LanguageModelReplyStream, ReplyEvent, ReplyRequest};
use crate::pipeline::stt::StreamingSpeechRecognizer;
use crate::pipeline::tts::{AudioHandle, SpeechSynthesizer};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// One message as seen by the device.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Hello,
    TtsStart,
    SentenceStart(String),
    TtsStop,
    Stt { state: String, text: String },
    Frame(Vec<u8>),
    Other(String),
}

impl Outbound {
    fn from_text(text: &str) -> Self {
        let Ok(json) = serde_json::from_str::<Value>(text) else {
            return Outbound::Other(text.to_string());
        };
        let field = |name: &str| json[name].as_str().unwrap_or_default().to_string();
        match (field("type").as_str(), field("state").as_str()) {
            ("hello", _) => Outbound::Hello,
            ("tts", "start") => Outbound::TtsStart,
            ("tts", "sentence_start") => Outbound::SentenceStart(field("text")),
            ("tts", "stop") => Outbound::TtsStop,
            ("stt", state) => Outbound::Stt {
                state: state.to_string(),
                text: field("text"),
            },
            _ => Outbound::Other(text.to_string()),
        }
    }
}

/// Records everything sent to it. Sends fail once closed.
pub struct RecordingChannel {
    open: AtomicBool,
    events: Mutex<Vec<Outbound>>,
}

impl RecordingChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            open: AtomicBool::new(true),
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn events(&self) -> Vec<Outbound> {
        self.events.lock().unwrap().clone()
    }

    pub fn frames(&self) -> usize {
        self.count(|e| matches!(e, Outbound::Frame(_)))
    }

    pub fn stop_markers(&self) -> usize {
        self.count(|e| matches!(e, Outbound::TtsStop))
    }

    pub fn stt(&self, state: &str) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Outbound::Stt { state: s, text } if s == state => Some(text),
                _ => None,
            })
            .collect()
    }

    fn count(&self, pred: impl Fn(&Outbound) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| pred(e)).count()
    }

    pub async fn wait_for_stop_markers(&self, count: usize) {
        self.wait_until(|| self.stop_markers() >= count).await;
    }

    /// Poll until `done` holds, panicking after a minute of (virtual) time.
    pub async fn wait_until(&self, done: impl Fn() -> bool) {
        let waited = tokio::time::timeout(Duration::from_secs(60), async {
            while !done() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "timed out waiting, events: {:?}", self.events());
    }

    fn record(&self, event: Outbound) -> VoiceResult<()> {
        if !self.is_open() {
            return Err(VoiceError::ChannelClosed);
        }
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

impl OutboundChannel for RecordingChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn send_text(&self, text: String) -> VoiceResult<()> {
        self.record(Outbound::from_text(&text))
    }

    fn send_binary(&self, frame: Vec<u8>) -> VoiceResult<()> {
        self.record(Outbound::Frame(frame))
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

/// Produces a short tone per sentence, with optional per-text delays and failures.
pub struct ScriptedSynthesizer {
    sample_rate: u32,
    delays: Mutex<HashMap<String, Duration>>,
    failures: Mutex<HashSet<String>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedSynthesizer {
    pub fn new(sample_rate: u32) -> Arc<Self> {
        Arc::new(Self {
            sample_rate,
            delays: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn delay(&self, text: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(text.to_string(), delay);
    }

    pub fn fail(&self, text: &str) {
        self.failures.lock().unwrap().insert(text.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SpeechSynthesizer for ScriptedSynthesizer {
    async fn synthesize(&self, text: &str) -> VoiceResult<AudioHandle> {
        self.calls.lock().unwrap().push(text.to_string());
        let delay = self.delays.lock().unwrap().get(text).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failures.lock().unwrap().contains(text) {
            return Err(VoiceError::Tts(format!("scripted failure for {:?}", text)));
        }
        // 120ms of a quiet square wave
        let samples = (0..self.sample_rate as usize * 120 / 1000)
            .map(|i| if (i / 20) % 2 == 0 { 2000 } else { -2000 })
            .collect();
        Ok(AudioHandle::Pcm {
            samples,
            sample_rate: self.sample_rate,
            channels: 1,
        })
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Ending {
    Complete,
    Fail,
    Hang,
}

/// Emits one scripted transcript per received chunk, the rest when the audio ends.
pub struct ScriptedRecognizer {
    transcripts: Vec<String>,
    ending: Ending,
    chunks: AtomicUsize,
}

impl ScriptedRecognizer {
    fn build(transcripts: &[&str], ending: Ending) -> Arc<Self> {
        Arc::new(Self {
            transcripts: transcripts.iter().map(|t| t.to_string()).collect(),
            ending,
            chunks: AtomicUsize::new(0),
        })
    }

    pub fn new(transcripts: &[&str]) -> Arc<Self> {
        Self::build(transcripts, Ending::Complete)
    }

    pub fn failing(transcripts: &[&str]) -> Arc<Self> {
        Self::build(transcripts, Ending::Fail)
    }

    /// Never returns after the audio ends.
    pub fn hanging(transcripts: &[&str]) -> Arc<Self> {
        Self::build(transcripts, Ending::Hang)
    }

    pub fn chunks_received(&self) -> usize {
        self.chunks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StreamingSpeechRecognizer for ScriptedRecognizer {
    async fn recognize(
        &self,
        mut audio: mpsc::UnboundedReceiver<Vec<u8>>,
        transcripts: mpsc::UnboundedSender<String>,
    ) -> VoiceResult<()> {
        let mut script = self.transcripts.iter();
        while audio.recv().await.is_some() {
            self.chunks.fetch_add(1, Ordering::SeqCst);
            if let Some(text) = script.next() {
                let _ = transcripts.send(text.clone());
            }
        }
        for text in script {
            let _ = transcripts.send(text.clone());
        }
        match self.ending {
            Ending::Complete => Ok(()),
            Ending::Fail => Err(VoiceError::Stt("scripted recognizer failure".into())),
            Ending::Hang => std::future::pending().await,
        }
    }
}

/// Streams a scripted list of events for every request.
pub struct ScriptedReplyStream {
    events: Vec<ReplyEvent>,
    token_delay: Duration,
    unavailable: bool,
    requests: Mutex<Vec<ReplyRequest>>,
}

impl ScriptedReplyStream {
    /// Tokens are the whitespace-inclusive words of `reply`, followed by `Completed`.
    pub fn replying(reply: &str) -> Arc<Self> {
        let mut events: Vec<ReplyEvent> = reply
            .split_inclusive(' ')
            .map(|t| ReplyEvent::Token(t.to_string()))
            .collect();
        events.push(ReplyEvent::Completed);
        Self::with_events(events, Duration::ZERO)
    }

    pub fn with_events(events: Vec<ReplyEvent>, token_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            events,
            token_delay,
            unavailable: false,
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Every request fails before any event is produced.
    pub fn unavailable() -> Arc<Self> {
        Arc::new(Self {
            events: Vec::new(),
            token_delay: Duration::ZERO,
            unavailable: true,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<ReplyRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl LanguageModelReplyStream for ScriptedReplyStream {
    async fn stream_reply(&self, request: ReplyRequest) -> VoiceResult<mpsc::Receiver<ReplyEvent>> {
        self.requests.lock().unwrap().push(request);
        if self.unavailable {
            return Err(VoiceError::Llm("scripted model unavailable".into()));
        }
        let (tx, rx) = mpsc::channel(16);
        let events = self.events.clone();
        let delay = self.token_delay;
        tokio::spawn(async move {
            for event in events {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }
}
