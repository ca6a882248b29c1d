//! # Dialogue Service
//!
//! Wires the pipeline stages together for a session. The WebSocket actor hands
//! every inbound frame and message to this service; everything that happens in
//! a turn is driven from here.
//!
//! ## A turn, end to end:
//! 1. Binary frames run through the VAD while the session is listening
//! 2. `SpeechStart` opens a fresh audio sink and spawns the turn task
//! 3. The turn task streams the sink into the STT orchestrator, echoing
//!    interim transcripts to the device
//! 4. `SpeechEnd` completes the sink; the final transcript goes to the
//!    language model
//! 5. Reply tokens are segmented into sentences and submitted to the TTS
//!    coordinator, which plays them through the dispatch queue
//!
//! ## Abort:
//! The device may interrupt at any time. Abort completes the audio sink,
//! drops pending sentences and queued audio, sends one stop marker, and bumps
//! the turn id so the reply loop of the aborted turn stops submitting.
//!
//! ## Key Rust Concepts:
//! - **self: &Arc<Self>**: turn tasks are spawned with their own clone of the
//!   service so they can outlive the actor message that started them
//! - **RwLock<Arc<SegmenterConfig>>**: readers clone the `Arc` and drop the lock;
//!   a config update swaps the whole value

use crate::pipeline::reply::{segment_reply, LanguageModelReplyStream, ReplyEvent, ReplyRequest};
use crate::pipeline::segmenter::{SegmenterConfig, SentenceSegmenter};
use crate::pipeline::stt::{SttOrchestrator, SttOutcome};
use crate::pipeline::{AudioDispatchQueue, TtsPipelineCoordinator};
use crate::protocol::{ClientMessage, ListenState, ServerMessage, SttState};
use crate::session::Session;
use crate::vad::{VadEngine, VadStatus};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

pub struct DialogueService {
    vad: Arc<VadEngine>,
    stt: Arc<SttOrchestrator>,
    llm: Arc<dyn LanguageModelReplyStream>,
    tts: Arc<TtsPipelineCoordinator>,
    dispatch: Arc<AudioDispatchQueue>,
    segmenter: RwLock<Arc<SegmenterConfig>>,
}

impl DialogueService {
    pub fn new(
        vad: Arc<VadEngine>,
        stt: Arc<SttOrchestrator>,
        llm: Arc<dyn LanguageModelReplyStream>,
        tts: Arc<TtsPipelineCoordinator>,
        dispatch: Arc<AudioDispatchQueue>,
        segmenter: SegmenterConfig,
    ) -> Self {
        Self {
            vad,
            stt,
            llm,
            tts,
            dispatch,
            segmenter: RwLock::new(Arc::new(segmenter)),
        }
    }

    pub fn segmenter_config(&self) -> Arc<SegmenterConfig> {
        self.segmenter
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Applies to turns started after the call.
    pub fn set_segmenter_config(&self, config: SegmenterConfig) {
        *self.segmenter.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(config);
    }

    /// Route one parsed text message from the device.
    pub fn handle_message(self: &Arc<Self>, session: &Arc<Session>, message: ClientMessage) {
        match message {
            ClientMessage::Hello { audio_params } => {
                info!(session_id = session.id(), ?audio_params, "Hello from device");
                session.set_audio_params(audio_params.clone());
                let reply = ServerMessage::hello(session.id(), audio_params);
                if let Err(e) = session.channel().send_message(&reply) {
                    debug!(session_id = session.id(), "Hello reply not sent: {}", e);
                }
            }
            ClientMessage::Listen { state, mode, text } => match state {
                ListenState::Start => self.listen_start(session, mode),
                ListenState::Stop => self.listen_stop(session),
                ListenState::Detect => match text.filter(|t| !t.trim().is_empty()) {
                    Some(text) => self.handle_wake_word(session, text),
                    None => debug!(session_id = session.id(), "Detect without text ignored"),
                },
            },
            ClientMessage::Abort { reason } => self.abort(session, reason.as_deref()),
            ClientMessage::Iot {
                descriptors,
                states,
            } => {
                info!(
                    session_id = session.id(),
                    has_descriptors = descriptors.is_some(),
                    has_states = states.is_some(),
                    "IoT update received"
                );
            }
        }
    }

    pub fn listen_start(&self, session: &Session, mode: Option<String>) {
        info!(session_id = session.id(), mode = ?mode, "Listening started");
        session.set_listening(true);
        session.set_listen_mode(mode);
        self.vad.initialize_session(session.id());
    }

    pub fn listen_stop(&self, session: &Session) {
        info!(session_id = session.id(), "Listening stopped");
        session.set_listening(false);
        session.close_audio_sink();
        session.set_streaming(false);
        self.vad.reset_session(session.id());
    }

    /// Run one inbound Opus frame through the VAD and feed the active utterance.
    pub fn handle_audio_frame(self: &Arc<Self>, session: &Arc<Session>, frame: &[u8]) {
        if !session.is_listening() {
            trace!(session_id = session.id(), "Frame ignored, not listening");
            return;
        }

        let result = self.vad.process_audio(session.id(), frame);
        match result.status {
            VadStatus::SpeechStart => {
                session.touch();
                let audio = session.open_audio_sink();
                session.set_streaming(true);
                self.spawn_turn(session.clone(), audio);
                session.push_audio(result.pcm);
            }
            VadStatus::SpeechContinue => {
                session.touch();
                if session.is_streaming() {
                    session.push_audio(result.pcm);
                }
            }
            VadStatus::SpeechEnd => {
                session.touch();
                if session.is_streaming() {
                    session.push_audio(result.pcm);
                }
                session.close_audio_sink();
                session.set_streaming(false);
            }
            VadStatus::NoSpeech | VadStatus::Error => {}
        }
    }

    /// The device heard its wake word; answer it directly.
    pub fn handle_wake_word(self: &Arc<Self>, session: &Arc<Session>, text: String) {
        info!(session_id = session.id(), text = %text, "Wake word detected");
        let notice = ServerMessage::stt(session.id(), SttState::Start, text.clone());
        if session.channel().send_message(&notice).is_err() {
            return;
        }
        session.set_listening(false);

        let service = Arc::clone(self);
        let session = Arc::clone(session);
        tokio::spawn(async move { service.respond(&session, text).await });
    }

    /// Interrupt whatever the session is doing.
    pub fn abort(&self, session: &Session, reason: Option<&str>) {
        session.close_audio_sink();
        session.set_streaming(false);
        session.abort_turn();
        let dropped = self.tts.abort(session.id());
        self.dispatch.abort(session.id(), session.channel().as_ref());
        info!(
            session_id = session.id(),
            reason = reason.unwrap_or("client"),
            dropped_sentences = dropped,
            "Turn aborted"
        );
    }

    fn spawn_turn(self: &Arc<Self>, session: Arc<Session>, audio: mpsc::UnboundedReceiver<Vec<u8>>) {
        let service = Arc::clone(self);
        tokio::spawn(async move { service.run_turn(session, audio).await });
    }

    async fn run_turn(self: Arc<Self>, session: Arc<Session>, audio: mpsc::UnboundedReceiver<Vec<u8>>) {
        let session_id = session.id().to_string();
        let channel = session.channel();

        let outcome = self
            .stt
            .run(&session_id, audio, |text| {
                if let Err(e) =
                    channel.send_message(&ServerMessage::stt(&session_id, SttState::Interim, text))
                {
                    warn!(session_id = %session_id, "Interim transcript not sent: {}", e);
                }
            })
            .await;

        let text = match outcome {
            SttOutcome::Final(text) => text.trim().to_string(),
            SttOutcome::Failed(e) => {
                warn!(session_id = %session_id, "Transcript attempt abandoned: {}", e);
                return;
            }
        };
        if text.is_empty() {
            debug!(session_id = %session_id, "Empty transcript, nothing to answer");
            return;
        }

        session.set_listening(false);
        if channel
            .send_message(&ServerMessage::stt(&session_id, SttState::Final, text.clone()))
            .is_err()
        {
            return;
        }
        self.respond(&session, text).await;
    }

    /// Stream a reply to `user_text` into the TTS coordinator.
    async fn respond(&self, session: &Arc<Session>, user_text: String) {
        let turn = session.begin_turn();
        let session_id = session.id().to_string();
        info!(session_id = %session_id, turn, text = %user_text, "Turn started");

        let binding = session.device();
        let request = ReplyRequest {
            session_id: session_id.clone(),
            device_id: binding
                .as_ref()
                .map(|b| b.device_id.clone())
                .unwrap_or_else(|| session_id.clone()),
            conversation_id: binding
                .map(|b| b.conversation_id)
                .unwrap_or_else(|| session_id.clone()),
            user_text,
        };

        let events = match self.llm.stream_reply(request).await {
            Ok(events) => events,
            Err(e) => {
                // speak the fallback through the normal path
                let (tx, rx) = mpsc::channel(1);
                if let Err(send_err) = tx.try_send(ReplyEvent::Failed(e.to_string())) {
                    warn!(session_id = %session_id, "Fallback reply not queued: {}", send_err);
                }
                rx
            }
        };

        let channel = session.channel();
        let segmenter = SentenceSegmenter::new(self.segmenter_config());
        let outcome = segment_reply(events, segmenter, |sentence| {
            if !session.is_current_turn(turn) || !channel.is_open() {
                return false;
            }
            self.tts.submit(&session_id, channel.clone(), turn, sentence);
            true
        })
        .await;
        debug!(session_id = %session_id, turn, ?outcome, "Reply stream finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::processor::{samples_to_bytes, AudioFormat};
    use crate::audio::{CodecBridge, NoiseSuppressor};
    use crate::config::{NoiseConfig, SegmenterSettings, VadConfig};
    use crate::pipeline::channel::OutboundChannel;
    use crate::pipeline::testing::{
        Outbound, RecordingChannel, ScriptedRecognizer, ScriptedReplyStream, ScriptedSynthesizer,
    };
    use crate::protocol::parse_client_message;
    use crate::session::{DeviceBinding, SessionRegistry};
    use crate::vad::EnergyProbabilityModel;
    use std::time::Duration;

    struct Harness {
        service: Arc<DialogueService>,
        session: Arc<Session>,
        channel: Arc<RecordingChannel>,
        codec: Arc<CodecBridge>,
        vad: Arc<VadEngine>,
        tts: Arc<TtsPipelineCoordinator>,
        dispatch: Arc<AudioDispatchQueue>,
        llm: Arc<ScriptedReplyStream>,
    }

    fn harness(recognizer: Arc<ScriptedRecognizer>, llm: Arc<ScriptedReplyStream>) -> Harness {
        let format = AudioFormat::new(16000, 1);
        let codec = Arc::new(CodecBridge::new(format));
        let vad_config = VadConfig {
            enable_noise_reduction: false,
            ..VadConfig::default()
        };
        let vad = Arc::new(VadEngine::new(
            &vad_config,
            codec.clone(),
            Arc::new(NoiseSuppressor::new(&NoiseConfig::default())),
            Arc::new(EnergyProbabilityModel::default()),
        ));
        let dispatch = Arc::new(AudioDispatchQueue::new(Duration::from_millis(60)));
        let tts = Arc::new(TtsPipelineCoordinator::new(
            ScriptedSynthesizer::new(16000),
            codec.clone(),
            dispatch.clone(),
            60,
            true,
        ));
        let stt = Arc::new(SttOrchestrator::new(recognizer, Duration::from_secs(10)));
        let service = Arc::new(DialogueService::new(
            vad.clone(),
            stt,
            llm.clone(),
            tts.clone(),
            dispatch.clone(),
            SegmenterConfig::new(&SegmenterSettings::default()).unwrap(),
        ));

        let registry = SessionRegistry::new(10);
        let channel = RecordingChannel::new();
        let session = registry.register("s1", channel.clone()).unwrap();
        registry
            .bind_device(
                "s1",
                DeviceBinding {
                    device_id: "aa:bb".into(),
                    conversation_id: "conv-1".into(),
                },
            )
            .unwrap();

        Harness {
            service,
            session,
            channel,
            codec,
            vad,
            tts,
            dispatch,
            llm,
        }
    }

    /// Opus frames of a 440Hz tone (loud) or near-silence.
    fn frames(codec: &CodecBridge, count: usize, loud: bool) -> Vec<Vec<u8>> {
        let samples: Vec<i16> = (0..count * 960)
            .map(|i| {
                if loud {
                    let t = i as f32 / 16000.0;
                    ((t * 440.0 * std::f32::consts::TAU).sin() * 8000.0) as i16
                } else {
                    if i % 2 == 0 { 20 } else { -20 }
                }
            })
            .collect();
        codec.encode(&samples_to_bytes(&samples), 60).unwrap()
    }

    async fn speak(h: &Harness) {
        for frame in frames(&h.codec, 3, false) {
            h.service.handle_audio_frame(&h.session, &frame);
        }
        for frame in frames(&h.codec, 6, true) {
            h.service.handle_audio_frame(&h.session, &frame);
        }
        for frame in frames(&h.codec, 12, false) {
            h.service.handle_audio_frame(&h.session, &frame);
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    fn listen(h: &Harness, json: &str) {
        h.service
            .handle_message(&h.session, parse_client_message(json).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_turn_from_speech_to_playback() {
        let h = harness(
            ScriptedRecognizer::new(&["what is", "what is the weather"]),
            ScriptedReplyStream::replying("It is sunny today. Enjoy the nice weather outside."),
        );
        listen(&h, r#"{"type":"listen","state":"start","mode":"auto"}"#);
        speak(&h).await;
        assert!(!h.session.has_audio_sink());

        h.channel.wait_for_stop_markers(1).await;

        assert_eq!(h.channel.stt("interim"), vec!["what is", "what is the weather"]);
        assert_eq!(h.channel.stt("final"), vec!["what is the weather"]);
        let starts: Vec<String> = h
            .channel
            .events()
            .into_iter()
            .filter_map(|e| match e {
                Outbound::SentenceStart(text) => Some(text),
                _ => None,
            })
            .collect();
        assert_eq!(starts, vec!["It is sunny today.", "Enjoy the nice weather outside."]);
        assert!(h.channel.frames() > 0);

        let request = &h.llm.requests()[0];
        assert_eq!(request.user_text, "what is the weather");
        assert_eq!(request.conversation_id, "conv-1");
        assert_eq!(request.device_id, "aa:bb");
        assert!(!h.session.is_listening());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_transcript_abandons_turn() {
        let h = harness(
            ScriptedRecognizer::new(&[]),
            ScriptedReplyStream::replying("Should never be spoken."),
        );
        listen(&h, r#"{"type":"listen","state":"start"}"#);
        speak(&h).await;
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert!(h.channel.stt("final").is_empty());
        assert!(h.llm.requests().is_empty());
        assert!(h.session.is_listening());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_during_playback() {
        let reply = "The first sentence is long enough. The second one follows right after. \
                     A third sentence keeps going. And a fourth one to finish.";
        let mut events: Vec<ReplyEvent> = reply
            .split_inclusive(' ')
            .map(|t| ReplyEvent::Token(t.to_string()))
            .collect();
        events.push(ReplyEvent::Completed);
        let h = harness(
            ScriptedRecognizer::new(&[]),
            ScriptedReplyStream::with_events(events, Duration::from_millis(50)),
        );

        listen(&h, r#"{"type":"listen","state":"detect","text":"hello robot"}"#);
        h.channel.wait_until(|| h.channel.frames() > 0).await;
        assert_eq!(h.channel.stt("start"), vec!["hello robot"]);

        listen(&h, r#"{"type":"abort","reason":"wake_word_detected"}"#);
        let frames_at_abort = h.channel.frames();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(h.channel.stop_markers(), 1);
        assert_eq!(h.tts.pending_len("s1"), 0);
        assert_eq!(h.dispatch.queued_len("s1"), 0);
        assert!(h.channel.frames() <= frames_at_abort + 1);
        assert!(!h.session.is_current_turn(1));
    }

    #[tokio::test]
    async fn test_frames_ignored_until_listening() {
        let h = harness(ScriptedRecognizer::new(&[]), ScriptedReplyStream::replying("Hi."));
        for frame in frames(&h.codec, 2, true) {
            h.service.handle_audio_frame(&h.session, &frame);
        }
        assert!(!h.vad.has_session("s1"));
        assert!(!h.session.has_audio_sink());

        listen(&h, r#"{"type":"listen","state":"start"}"#);
        assert!(h.vad.has_session("s1"));
        listen(&h, r#"{"type":"listen","state":"stop"}"#);
        assert!(!h.vad.has_session("s1"));
        assert!(!h.session.is_listening());
    }

    #[tokio::test]
    async fn test_hello_is_echoed_with_session_id() {
        let h = harness(ScriptedRecognizer::new(&[]), ScriptedReplyStream::replying("Hi."));
        listen(
            &h,
            r#"{"type":"hello","audio_params":{"format":"opus","sample_rate":16000,"channels":1,"frame_duration":60}}"#,
        );
        assert_eq!(h.channel.events(), vec![Outbound::Hello]);
        assert_eq!(h.session.audio_params().unwrap().frame_duration, 60);
    }

    #[tokio::test(start_paused = true)]
    async fn test_model_error_speaks_fallback_reply() {
        let h = harness(ScriptedRecognizer::new(&[]), ScriptedReplyStream::unavailable());
        listen(&h, r#"{"type":"listen","state":"detect","text":"hello robot"}"#);
        h.channel.wait_for_stop_markers(1).await;

        assert_eq!(h.llm.requests().len(), 1);
        let fallback = SegmenterSettings::default().fallback_reply;
        let spoken: Vec<Outbound> = h
            .channel
            .events()
            .into_iter()
            .filter(|e| matches!(e, Outbound::SentenceStart(_)))
            .collect();
        assert_eq!(spoken, vec![Outbound::SentenceStart(fallback)]);
        assert!(h.channel.events().contains(&Outbound::TtsStart));
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_channel_stops_reply() {
        let h = harness(
            ScriptedRecognizer::new(&[]),
            ScriptedReplyStream::replying("One sentence here. Another sentence there."),
        );
        h.channel.close();
        h.service.handle_wake_word(&h.session, "hey".into());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(h.llm.requests().is_empty());
        assert!(!h.channel.is_open());
    }
}
