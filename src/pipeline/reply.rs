//! Streaming language-model replies and their segmentation into sentences.
//!
//! A reply stream is a `tokio::sync::mpsc` channel of `ReplyEvent`s. `Completed`
//! and `Failed` are terminal; a channel that closes without either counts as
//! completed.

use crate::error::VoiceResult;
use crate::pipeline::segmenter::{Sentence, SentenceSegmenter};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum ReplyEvent {
    Token(String),
    Completed,
    Failed(String),
}

/// What the model is asked to answer.
#[derive(Debug, Clone)]
pub struct ReplyRequest {
    pub session_id: String,
    pub device_id: String,
    pub conversation_id: String,
    pub user_text: String,
}

#[async_trait]
pub trait LanguageModelReplyStream: Send + Sync {
    async fn stream_reply(&self, request: ReplyRequest) -> VoiceResult<mpsc::Receiver<ReplyEvent>>;
}

/// How a segmented reply ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyOutcome {
    Completed,
    Failed,
    /// The sink refused a sentence, usually because the turn was aborted
    Cancelled,
}

/// Drive a reply stream through the segmenter, handing each sentence to `sink`.
///
/// `sink` returns `false` to stop early; no further sentences are produced.
pub async fn segment_reply<F>(
    mut events: mpsc::Receiver<ReplyEvent>,
    mut segmenter: SentenceSegmenter,
    mut sink: F,
) -> ReplyOutcome
where
    F: FnMut(Sentence) -> bool + Send,
{
    let mut deliver = |sentences: Vec<Sentence>| sentences.into_iter().all(&mut sink);

    loop {
        let (sentences, outcome) = match events.recv().await {
            Some(ReplyEvent::Token(token)) => (segmenter.push_token(&token), None),
            Some(ReplyEvent::Completed) | None => (segmenter.finish(), Some(ReplyOutcome::Completed)),
            Some(ReplyEvent::Failed(reason)) => {
                warn!("Reply stream failed: {}", reason);
                (segmenter.fail(), Some(ReplyOutcome::Failed))
            }
        };

        if !deliver(sentences) {
            debug!(emitted = segmenter.emitted(), "Reply cancelled by sink");
            return ReplyOutcome::Cancelled;
        }
        if let Some(outcome) = outcome {
            return outcome;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SegmenterSettings;
    use crate::pipeline::segmenter::SegmenterConfig;
    use std::sync::Arc;

    fn segmenter() -> SentenceSegmenter {
        SentenceSegmenter::new(Arc::new(
            SegmenterConfig::new(&SegmenterSettings::default()).unwrap(),
        ))
    }

    async fn events(list: Vec<ReplyEvent>) -> mpsc::Receiver<ReplyEvent> {
        let (tx, rx) = mpsc::channel(list.len().max(1));
        for event in list {
            tx.send(event).await.unwrap();
        }
        rx
    }

    fn tokens(text: &str) -> Vec<ReplyEvent> {
        text.split_inclusive(' ')
            .map(|t| ReplyEvent::Token(t.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_closed_channel_counts_as_completion() {
        let rx = events(tokens("Sure thing. It is sunny today.")).await;
        let mut out = Vec::new();
        let outcome = segment_reply(rx, segmenter(), |s| {
            out.push(s);
            true
        })
        .await;

        assert_eq!(outcome, ReplyOutcome::Completed);
        assert_eq!(out.len(), 2);
        assert!(out[1].is_last);
    }

    #[tokio::test]
    async fn test_failure_speaks_fallback() {
        let mut list = tokens("Let me think ");
        list.push(ReplyEvent::Failed("upstream 500".into()));
        let mut out = Vec::new();
        let outcome = segment_reply(events(list).await, segmenter(), |s| {
            out.push(s);
            true
        })
        .await;

        assert_eq!(outcome, ReplyOutcome::Failed);
        let last = out.last().unwrap();
        assert!(last.is_last);
        assert_eq!(last.text, SegmenterSettings::default().fallback_reply);
    }

    #[tokio::test]
    async fn test_sink_can_cancel() {
        let mut list = tokens("First sentence here. Second sentence here. Third one here.");
        list.push(ReplyEvent::Completed);
        let mut count = 0;
        let outcome = segment_reply(events(list).await, segmenter(), |_| {
            count += 1;
            false
        })
        .await;

        assert_eq!(outcome, ReplyOutcome::Cancelled);
        assert_eq!(count, 1);
    }
}
