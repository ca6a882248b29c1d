//! # Streaming STT Orchestrator
//!
//! Feeds the VAD-gated PCM of one utterance into a streaming recognizer and
//! turns whatever it reports into interim and final transcripts.
//!
//! ## Flow:
//! 1. The session's audio sink is forwarded chunk by chunk to the recognizer
//! 2. Every transcript the recognizer emits is surfaced as interim text
//! 3. When the sink completes (speech ended) a finalization timer starts
//! 4. The recognizer finishing `Ok` makes the last transcript final
//!
//! If the timer fires first, the recognizer task is aborted and the best partial
//! transcript is used. A recognizer error fails the attempt.
//!
//! ## Key Rust Concepts:
//! - **tokio::select!**: waits on audio, transcripts, task completion and the
//!   deadline at once; whichever is ready first wins
//! - **JoinHandle::abort**: cancels the recognizer at its next `.await`

use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

#[async_trait]
pub trait StreamingSpeechRecognizer: Send + Sync {
    /// Consume PCM until `audio` completes, sending transcripts as they improve.
    async fn recognize(
        &self,
        audio: mpsc::UnboundedReceiver<Vec<u8>>,
        transcripts: mpsc::UnboundedSender<String>,
    ) -> VoiceResult<()>;
}

/// Result of one recognition attempt.
#[derive(Debug)]
pub enum SttOutcome {
    /// Final transcript, possibly empty
    Final(String),
    Failed(VoiceError),
}

pub struct SttOrchestrator {
    recognizer: Arc<dyn StreamingSpeechRecognizer>,
    finalize_timeout: Duration,
}

impl SttOrchestrator {
    pub fn new(recognizer: Arc<dyn StreamingSpeechRecognizer>, finalize_timeout: Duration) -> Self {
        Self {
            recognizer,
            finalize_timeout,
        }
    }

    pub fn finalize_timeout(&self) -> Duration {
        self.finalize_timeout
    }

    /// Recognize one utterance. `on_interim` sees every transcript as it arrives.
    pub async fn run<F>(
        &self,
        session_id: &str,
        audio: mpsc::UnboundedReceiver<Vec<u8>>,
        mut on_interim: F,
    ) -> SttOutcome
    where
        F: FnMut(&str) + Send,
    {
        let (pcm_tx, pcm_rx) = mpsc::unbounded_channel();
        let (text_tx, mut text_rx) = mpsc::unbounded_channel::<String>();

        let recognizer = Arc::clone(&self.recognizer);
        let mut task = tokio::spawn(async move { recognizer.recognize(pcm_rx, text_tx).await });

        let mut audio = Some(audio);
        let mut pcm_tx = Some(pcm_tx);
        let mut deadline: Option<Instant> = None;
        let mut transcripts_open = true;
        let mut last = String::new();
        let mut chunks = 0usize;

        loop {
            tokio::select! {
                biased;

                text = text_rx.recv(), if transcripts_open => match text {
                    Some(text) => {
                        on_interim(&text);
                        last = text;
                    }
                    None => transcripts_open = false,
                },

                chunk = next_chunk(&mut audio) => match chunk {
                    Some(pcm) => {
                        chunks += 1;
                        if let Some(tx) = &pcm_tx {
                            // the recognizer may already be done with its input
                            let _ = tx.send(pcm);
                        }
                    }
                    None => {
                        audio = None;
                        pcm_tx = None;
                        deadline = Some(Instant::now() + self.finalize_timeout);
                        debug!(session_id, chunks, "Utterance audio complete, finalizing");
                    }
                },

                result = &mut task => {
                    while let Ok(text) = text_rx.try_recv() {
                        on_interim(&text);
                        last = text;
                    }
                    return match result {
                        Ok(Ok(())) => SttOutcome::Final(last),
                        Ok(Err(e)) => {
                            warn!(session_id, "Speech recognition failed: {}", e);
                            SttOutcome::Failed(e)
                        }
                        Err(e) => SttOutcome::Failed(VoiceError::Stt(format!(
                            "recognizer task ended abnormally: {}",
                            e
                        ))),
                    };
                }

                _ = wait_until(deadline) => {
                    task.abort();
                    warn!(
                        session_id,
                        timeout_secs = self.finalize_timeout.as_secs(),
                        "Speech recognition finalization timed out, using best partial"
                    );
                    return SttOutcome::Final(last);
                }
            }
        }
    }
}

async fn next_chunk(audio: &mut Option<mpsc::UnboundedReceiver<Vec<u8>>>) -> Option<Vec<u8>> {
    match audio {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testing::ScriptedRecognizer;

    fn feed(chunks: usize) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        for i in 0..chunks {
            tx.send(vec![i as u8; 32]).unwrap();
        }
        rx
    }

    #[tokio::test]
    async fn test_interim_transcripts_then_final() {
        let recognizer = ScriptedRecognizer::new(&["turn", "turn on", "turn on the light"]);
        let orchestrator = SttOrchestrator::new(recognizer.clone(), Duration::from_secs(10));

        let mut interim = Vec::new();
        let outcome = orchestrator
            .run("s1", feed(2), |text| interim.push(text.to_string()))
            .await;

        assert!(matches!(outcome, SttOutcome::Final(ref t) if t == "turn on the light"));
        assert_eq!(interim, vec!["turn", "turn on", "turn on the light"]);
        assert_eq!(recognizer.chunks_received(), 2);
    }

    #[tokio::test]
    async fn test_no_transcript_is_empty_final() {
        let orchestrator =
            SttOrchestrator::new(ScriptedRecognizer::new(&[]), Duration::from_secs(10));
        let outcome = orchestrator.run("s1", feed(3), |_| {}).await;
        assert!(matches!(outcome, SttOutcome::Final(ref t) if t.is_empty()));
    }

    #[tokio::test]
    async fn test_recognizer_error_fails_attempt() {
        let orchestrator =
            SttOrchestrator::new(ScriptedRecognizer::failing(&["partial"]), Duration::from_secs(10));
        let outcome = orchestrator.run("s1", feed(1), |_| {}).await;
        assert!(matches!(outcome, SttOutcome::Failed(VoiceError::Stt(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_finalize_timeout_uses_best_partial() {
        let orchestrator =
            SttOrchestrator::new(ScriptedRecognizer::hanging(&["what time", "what time is it"]), Duration::from_secs(10));
        let started = Instant::now();
        let outcome = orchestrator.run("s1", feed(2), |_| {}).await;

        assert!(matches!(outcome, SttOutcome::Final(ref t) if t == "what time is it"));
        assert!(started.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_starts_only_after_audio_completes() {
        let recognizer = ScriptedRecognizer::new(&["hello"]);
        let orchestrator = SttOrchestrator::new(recognizer, Duration::from_secs(1));
        let (tx, rx) = mpsc::unbounded_channel();

        let feeder = tokio::spawn(async move {
            for _ in 0..5 {
                tx.send(vec![0u8; 32]).unwrap();
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        });
        let outcome = orchestrator.run("s1", rx, |_| {}).await;
        feeder.await.unwrap();
        assert!(matches!(outcome, SttOutcome::Final(ref t) if t == "hello"));
    }
}
