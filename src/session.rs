//! # Session Registry
//!
//! Tracks every connected device session and everything that belongs to it.
//!
//! ## Ownership model:
//! - The registry owns one `Session` per connection: device binding, listening
//!   and streaming flags, counters, the activity timestamp and the audio sink
//!   that feeds speech recognition.
//! - Components with their own per-session maps (codec, noise gate, VAD,
//!   dispatch queue, TTS coordinator) register as a `SessionResource`. Closing
//!   a session releases it from every one of them, so nothing leaks when a
//!   device disappears.
//!
//! ## Session Lifecycle:
//! 1. **Registered**: the WebSocket actor starts and registers its channel
//! 2. **Bound**: the device identity is attached
//! 3. **Listening / Streaming**: toggled by `listen` messages and the VAD
//! 4. **Closed**: on disconnect, forced close, or the inactivity sweep
//!
//! ## Key Rust Concepts:
//! - **DashMap<String, Arc<Session>>**: lookups clone the `Arc` out, so the map
//!   shard lock is held only for the lookup itself
//! - **Mutex<SessionState>**: each session has its own lock; sessions never
//!   contend with each other
//! - **tokio::sync::mpsc**: the audio sink is an unbounded channel whose
//!   closing marks the end of an utterance

use crate::error::{VoiceError, VoiceResult};
use crate::pipeline::channel::OutboundChannel;
use crate::protocol::AudioParams;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

/// A component holding per-session state that must be dropped on close.
pub trait SessionResource: Send + Sync {
    fn release(&self, session_id: &str);
}

/// The device (and its conversation) a session speaks for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceBinding {
    pub device_id: String,
    pub conversation_id: String,
}

#[derive(Debug)]
struct SessionState {
    device: Option<DeviceBinding>,
    listening: bool,
    streaming: bool,
    listen_mode: Option<String>,
    audio_params: Option<AudioParams>,
    last_activity: Instant,
    turn: u64,
    messages: u64,
    audio_sink: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

/// One connected device session.
pub struct Session {
    id: String,
    created_at: DateTime<Utc>,
    channel: Arc<dyn OutboundChannel>,
    state: Mutex<SessionState>,
}

impl Session {
    fn new(id: String, channel: Arc<dyn OutboundChannel>) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            channel,
            state: Mutex::new(SessionState {
                device: None,
                listening: false,
                streaming: false,
                listen_mode: None,
                audio_params: None,
                last_activity: Instant::now(),
                turn: 0,
                messages: 0,
                audio_sink: None,
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn channel(&self) -> Arc<dyn OutboundChannel> {
        self.channel.clone()
    }

    pub fn device(&self) -> Option<DeviceBinding> {
        self.state().device.clone()
    }

    pub fn is_listening(&self) -> bool {
        self.state().listening
    }

    pub fn set_listening(&self, listening: bool) {
        self.state().listening = listening;
    }

    pub fn is_streaming(&self) -> bool {
        self.state().streaming
    }

    pub fn set_streaming(&self, streaming: bool) {
        self.state().streaming = streaming;
    }

    pub fn listen_mode(&self) -> Option<String> {
        self.state().listen_mode.clone()
    }

    pub fn set_listen_mode(&self, mode: Option<String>) {
        self.state().listen_mode = mode;
    }

    pub fn audio_params(&self) -> Option<AudioParams> {
        self.state().audio_params.clone()
    }

    pub fn set_audio_params(&self, params: Option<AudioParams>) {
        self.state().audio_params = params;
    }

    /// Mark the session as active now.
    pub fn touch(&self) {
        self.state().last_activity = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        Instant::now().saturating_duration_since(self.state().last_activity)
    }

    /// Count an inbound message and return the running total.
    pub fn record_message(&self) -> u64 {
        let mut state = self.state();
        state.messages += 1;
        state.messages
    }

    /// Open a fresh audio sink, completing the previous one if any.
    pub fn open_audio_sink(&self) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        // dropping the old sender completes the old stream
        self.state().audio_sink = Some(tx);
        rx
    }

    /// Push PCM into the active sink. Returns false when there is none.
    pub fn push_audio(&self, pcm: Vec<u8>) -> bool {
        let state = self.state();
        match &state.audio_sink {
            Some(sink) => sink.send(pcm).is_ok(),
            None => false,
        }
    }

    /// Complete the active sink, ending the current utterance's audio stream.
    pub fn close_audio_sink(&self) -> bool {
        self.state().audio_sink.take().is_some()
    }

    pub fn has_audio_sink(&self) -> bool {
        self.state().audio_sink.is_some()
    }

    /// Start a new turn and return its id.
    pub fn begin_turn(&self) -> u64 {
        let mut state = self.state();
        state.turn += 1;
        state.turn
    }

    /// Invalidate the current turn so its reply loop stops submitting.
    pub fn abort_turn(&self) {
        self.state().turn += 1;
    }

    pub fn current_turn(&self) -> u64 {
        self.state().turn
    }

    pub fn is_current_turn(&self, turn: u64) -> bool {
        self.state().turn == turn
    }

    pub fn summary(&self) -> SessionSummary {
        let state = self.state();
        SessionSummary {
            session_id: self.id.clone(),
            device_id: state.device.as_ref().map(|d| d.device_id.clone()),
            conversation_id: state.device.as_ref().map(|d| d.conversation_id.clone()),
            listening: state.listening,
            streaming: state.streaming,
            turn: state.turn,
            messages: state.messages,
            idle_secs: Instant::now()
                .saturating_duration_since(state.last_activity)
                .as_secs(),
            created_at: self.created_at,
        }
    }
}

/// Snapshot of a session for the HTTP API.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub device_id: Option<String>,
    pub conversation_id: Option<String>,
    pub listening: bool,
    pub streaming: bool,
    pub turn: u64,
    pub messages: u64,
    pub idle_secs: u64,
    pub created_at: DateTime<Utc>,
}

/// Registry of live sessions.
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
    devices: DashMap<String, String>,
    resources: RwLock<Vec<Arc<dyn SessionResource>>>,
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            devices: DashMap::new(),
            resources: RwLock::new(Vec::new()),
            max_sessions,
        }
    }

    /// Add a component whose per-session state is released on close.
    pub fn register_resource(&self, resource: Arc<dyn SessionResource>) {
        self.resources
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(resource);
    }

    /// Register a new session for an outbound channel.
    pub fn register(
        &self,
        session_id: &str,
        channel: Arc<dyn OutboundChannel>,
    ) -> VoiceResult<Arc<Session>> {
        if self.sessions.len() >= self.max_sessions {
            return Err(VoiceError::SessionLimit(self.max_sessions));
        }
        let session = Arc::new(Session::new(session_id.to_string(), channel));
        self.sessions.insert(session_id.to_string(), session.clone());
        info!(session_id, active = self.sessions.len(), "Session registered");
        Ok(session)
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    pub fn session_by_device(&self, device_id: &str) -> Option<Arc<Session>> {
        let session_id = self.devices.get(device_id)?.clone();
        self.get(&session_id)
    }

    /// Attach a device to a session. A device reconnecting moves to the new session.
    pub fn bind_device(&self, session_id: &str, binding: DeviceBinding) -> VoiceResult<()> {
        let session = self
            .get(session_id)
            .ok_or_else(|| VoiceError::SessionNotFound(session_id.to_string()))?;
        if let Some(previous) = self.devices.insert(binding.device_id.clone(), session_id.to_string())
        {
            if previous != session_id {
                debug!(device_id = %binding.device_id, previous = %previous, "Device moved to a new session");
            }
        }
        info!(session_id, device_id = %binding.device_id, "Device bound");
        session.state().device = Some(binding);
        Ok(())
    }

    /// Mark a session active. Returns false for an unknown session.
    pub fn touch(&self, session_id: &str) -> bool {
        match self.get(session_id) {
            Some(session) => {
                session.touch();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn summaries(&self) -> Vec<SessionSummary> {
        let mut list: Vec<SessionSummary> =
            self.sessions.iter().map(|entry| entry.value().summary()).collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        list
    }

    /// Close a session and release everything it owns. Idempotent.
    pub fn close(&self, session_id: &str) -> bool {
        let Some((_, session)) = self.sessions.remove(session_id) else {
            return false;
        };

        if let Some(binding) = session.device() {
            self.devices
                .remove_if(&binding.device_id, |_, bound| bound == session_id);
        }

        session.close_audio_sink();
        session.channel.close();

        let resources = self.resources.read().unwrap_or_else(|e| e.into_inner());
        for resource in resources.iter() {
            resource.release(session_id);
        }

        info!(session_id, active = self.sessions.len(), "Session closed");
        true
    }

    /// Close every session idle for longer than `timeout`. Returns the closed ids.
    pub fn sweep_inactive(&self, timeout: Duration) -> Vec<String> {
        let idle: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().idle_for() > timeout)
            .map(|entry| entry.key().clone())
            .collect();

        for session_id in &idle {
            if self.close(session_id) {
                info!(session_id = %session_id, timeout_secs = timeout.as_secs(), "Evicted inactive session");
            }
        }
        idle
    }

    /// Run `sweep_inactive` every `interval` on the tokio runtime.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, timeout: Duration) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let closed = registry.sweep_inactive(timeout);
                if !closed.is_empty() {
                    debug!(closed = closed.len(), "Inactivity sweep finished");
                }
            }
        })
    }
}
