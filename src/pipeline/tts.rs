//! # TTS Pipeline Coordinator
//!
//! Synthesizes the sentences of a reply in parallel but hands them to playback
//! strictly in order.
//!
//! ## How ordering works:
//! Every submitted sentence gets an entry at the tail of the session's pending
//! list and its own synthesis task. When any task finishes, its entry is marked
//! `Ready` (or `Failed`) and the list is scanned from the head: completed
//! entries are popped and handed to the `AudioDispatchQueue` until the scan
//! reaches one that is still `Pending`. Sentence 3 finishing before sentence 1
//! simply waits at its place in the list.
//!
//! ## Audio handles:
//! A synthesizer may hand back a WAV file on disk, WAV bytes, or raw PCM. All
//! three are brought to mono 16-bit PCM at the codec's rate and encoded to
//! Opus frames inside the synthesis task, off the hot path of the head scan.
//!
//! ## Key Rust Concepts:
//! - **#[async_trait]**: lets `SpeechSynthesizer` have an async method behind `dyn`
//! - **self: &Arc<Self>**: `submit` clones the `Arc` into the spawned task so the
//!   coordinator outlives every job it starts

use crate::audio::processor::{
    decode_wav, downmix_to_mono, resample_linear, samples_to_bytes, AudioFormat,
};
use crate::audio::CodecBridge;
use crate::error::VoiceResult;
use crate::pipeline::channel::OutboundChannel;
use crate::pipeline::dispatch::{AudioDispatchQueue, AudioMessageTask};
use crate::pipeline::segmenter::Sentence;
use crate::session::SessionResource;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// What a synthesizer produced for one sentence.
#[derive(Debug, Clone)]
pub enum AudioHandle {
    /// A WAV file written by the synthesizer
    File(PathBuf),
    /// An in-memory WAV container
    Wav(Vec<u8>),
    /// Raw interleaved 16-bit samples
    Pcm {
        samples: Vec<i16>,
        sample_rate: u32,
        channels: u16,
    },
}

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> VoiceResult<AudioHandle>;
}

enum SynthesisState {
    Pending,
    Ready(Vec<Vec<u8>>),
    Failed,
}

struct PendingSentence {
    job_id: u64,
    turn_id: u64,
    sentence: Sentence,
    channel: Arc<dyn OutboundChannel>,
    state: SynthesisState,
}

type PendingList = Arc<Mutex<VecDeque<PendingSentence>>>;

fn lock(list: &PendingList) -> std::sync::MutexGuard<'_, VecDeque<PendingSentence>> {
    list.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct TtsPipelineCoordinator {
    synthesizer: Arc<dyn SpeechSynthesizer>,
    codec: Arc<CodecBridge>,
    dispatch: Arc<AudioDispatchQueue>,
    frame_duration_ms: u32,
    delete_audio_files: AtomicBool,
    pending: DashMap<String, PendingList>,
    next_job: AtomicU64,
}

impl TtsPipelineCoordinator {
    pub fn new(
        synthesizer: Arc<dyn SpeechSynthesizer>,
        codec: Arc<CodecBridge>,
        dispatch: Arc<AudioDispatchQueue>,
        frame_duration_ms: u32,
        delete_audio_files: bool,
    ) -> Self {
        Self {
            synthesizer,
            codec,
            dispatch,
            frame_duration_ms,
            delete_audio_files: AtomicBool::new(delete_audio_files),
            pending: DashMap::new(),
            next_job: AtomicU64::new(1),
        }
    }

    /// Queue a sentence for synthesis and start its job immediately.
    pub fn submit(
        self: &Arc<Self>,
        session_id: &str,
        channel: Arc<dyn OutboundChannel>,
        turn_id: u64,
        sentence: Sentence,
    ) {
        let job_id = self.next_job.fetch_add(1, Ordering::Relaxed);
        let text = sentence.text.clone();
        debug!(
            session_id,
            turn_id,
            sequence = sentence.sequence,
            is_first = sentence.is_first,
            is_last = sentence.is_last,
            "Submitting sentence for synthesis"
        );

        let list = self
            .pending
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(VecDeque::new())))
            .clone();
        lock(&list).push_back(PendingSentence {
            job_id,
            turn_id,
            sentence,
            channel,
            state: SynthesisState::Pending,
        });

        let coordinator = Arc::clone(self);
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            let result = coordinator.synthesize_frames(&text).await;
            coordinator.complete(&session_id, job_id, result);
        });
    }

    /// Drop every pending sentence of a session. Jobs still running are
    /// discarded when they finish. Returns how many entries were dropped.
    pub fn abort(&self, session_id: &str) -> usize {
        match self.pending.get(session_id).map(|list| list.clone()) {
            Some(list) => {
                let mut entries = lock(&list);
                let dropped = entries.len();
                entries.clear();
                dropped
            }
            None => 0,
        }
    }

    pub fn pending_len(&self, session_id: &str) -> usize {
        self.pending
            .get(session_id)
            .map(|list| lock(&list).len())
            .unwrap_or(0)
    }

    /// Pending sentences across all sessions, for the health endpoint.
    pub fn total_pending(&self) -> usize {
        self.pending.iter().map(|entry| lock(entry.value()).len()).sum()
    }

    pub fn set_delete_audio_files(&self, delete: bool) {
        self.delete_audio_files.store(delete, Ordering::Relaxed);
    }

    pub fn delete_audio_files(&self) -> bool {
        self.delete_audio_files.load(Ordering::Relaxed)
    }

    async fn synthesize_frames(&self, text: &str) -> VoiceResult<Vec<Vec<u8>>> {
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        let handle = self.synthesizer.synthesize(text).await?;
        let samples = self.handle_to_pcm(handle).await?;
        self.codec
            .encode(&samples_to_bytes(&samples), self.frame_duration_ms)
    }

    /// Mono PCM at the codec's sample rate.
    async fn handle_to_pcm(&self, handle: AudioHandle) -> VoiceResult<Vec<i16>> {
        let (samples, format) = match handle {
            AudioHandle::Wav(bytes) => decode_wav(&bytes)?,
            AudioHandle::File(path) => {
                let bytes = tokio::fs::read(&path).await?;
                if self.delete_audio_files() {
                    if let Err(e) = tokio::fs::remove_file(&path).await {
                        warn!("Failed to delete synthesized audio {}: {}", path.display(), e);
                    }
                }
                decode_wav(&bytes)?
            }
            AudioHandle::Pcm {
                samples,
                sample_rate,
                channels,
            } => (
                downmix_to_mono(&samples, channels),
                AudioFormat::new(sample_rate, 1),
            ),
        };

        let target = self.codec.format().sample_rate;
        Ok(resample_linear(&samples, format.sample_rate, target))
    }

    fn complete(&self, session_id: &str, job_id: u64, result: VoiceResult<Vec<Vec<u8>>>) {
        let Some(list) = self.pending.get(session_id).map(|list| list.clone()) else {
            debug!(session_id, job_id, "Discarding synthesis result for a released session");
            return;
        };
        let mut entries = lock(&list);

        let Some(entry) = entries.iter_mut().find(|e| e.job_id == job_id) else {
            debug!(session_id, job_id, "Discarding late synthesis result");
            return;
        };
        entry.state = match result {
            Ok(frames) => SynthesisState::Ready(frames),
            Err(e) => {
                warn!(
                    session_id,
                    turn_id = entry.turn_id,
                    sequence = entry.sentence.sequence,
                    "Synthesis failed, dropping sentence: {}",
                    e
                );
                SynthesisState::Failed
            }
        };

        self.release_ready(session_id, &mut entries);
    }

    /// Pop completed entries off the head until one is still pending.
    fn release_ready(&self, session_id: &str, entries: &mut VecDeque<PendingSentence>) {
        while entries
            .front()
            .is_some_and(|e| !matches!(e.state, SynthesisState::Pending))
        {
            let Some(entry) = entries.pop_front() else {
                break;
            };
            let Sentence {
                sequence,
                text,
                is_first,
                is_last,
            } = entry.sentence;

            let task = match entry.state {
                SynthesisState::Ready(frames) => {
                    AudioMessageTask::new(frames, Some(text), is_first, is_last, sequence)
                }
                // the client still needs the turn's start/stop markers
                SynthesisState::Failed if is_first || is_last => {
                    AudioMessageTask::new(Vec::new(), None, is_first, is_last, sequence)
                }
                _ => continue,
            };
            self.dispatch.enqueue(session_id, entry.channel, task);
        }
    }
}

impl SessionResource for TtsPipelineCoordinator {
    fn release(&self, session_id: &str) {
        self.pending.remove(session_id);
    }
}
