//! # Audio Dispatch Queue
//!
//! Plays synthesized sentences back to the device, one at a time, at real-time
//! speed.
//!
//! ## How playback works:
//! Each session has a FIFO of `AudioMessageTask`s and at most one pump task
//! draining it. For every task the pump sends:
//! 1. `tts start` if this is the first sentence of the reply
//! 2. `tts sentence_start` with the sentence text
//! 3. every Opus frame, sleeping one frame duration after each one
//! 4. `tts stop` if this is the last sentence of the reply
//!
//! Sleeping between frames keeps the device's jitter buffer small; sending a
//! whole reply at once would overflow cheap devices.
//!
//! ## Abort:
//! `abort` clears the FIFO and bumps a generation counter. The pump compares
//! generations before every frame, so an in-flight sentence stops at the next
//! frame boundary without sending its own stop marker. `abort` itself sends
//! exactly one stop marker.
//!
//! ## Activity:
//! Playback counts as session activity. A queue built with `with_activity`
//! refreshes the session in the registry as each sentence starts and ends, so
//! a long reply is never swept as idle.

use crate::pipeline::channel::OutboundChannel;
use crate::protocol::{ServerMessage, TtsState};
use crate::session::{SessionRegistry, SessionResource};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// One sentence worth of playback. Immutable once built.
#[derive(Debug, Clone)]
pub struct AudioMessageTask {
    frames: Vec<Vec<u8>>,
    text: Option<String>,
    is_first: bool,
    is_last: bool,
    sequence: u64,
}

impl AudioMessageTask {
    pub fn new(
        frames: Vec<Vec<u8>>,
        text: Option<String>,
        is_first: bool,
        is_last: bool,
        sequence: u64,
    ) -> Self {
        Self {
            frames,
            text,
            is_first,
            is_last,
            sequence,
        }
    }

    pub fn frames(&self) -> &[Vec<u8>] {
        &self.frames
    }

    pub fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }

    pub fn is_first(&self) -> bool {
        self.is_first
    }

    pub fn is_last(&self) -> bool {
        self.is_last
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

#[derive(Default)]
struct SessionQueue {
    tasks: VecDeque<AudioMessageTask>,
    pumping: bool,
    generation: u64,
}

type SharedQueue = Arc<Mutex<SessionQueue>>;

fn lock(queue: &SharedQueue) -> std::sync::MutexGuard<'_, SessionQueue> {
    queue.lock().unwrap_or_else(|e| e.into_inner())
}

/// How a single task's playback ended.
enum Playback {
    Finished,
    Aborted,
    ChannelClosed,
}

/// Per-session FIFO of playback tasks with real-time pacing.
pub struct AudioDispatchQueue {
    frame_duration: Duration,
    queues: DashMap<String, SharedQueue>,
    // weak: the registry owns this queue as a session resource
    activity: Option<Weak<SessionRegistry>>,
}

impl AudioDispatchQueue {
    pub fn new(frame_duration: Duration) -> Self {
        Self {
            frame_duration,
            queues: DashMap::new(),
            activity: None,
        }
    }

    /// Like `new`, but playback keeps the session alive in `registry`.
    pub fn with_activity(frame_duration: Duration, registry: &Arc<SessionRegistry>) -> Self {
        Self {
            activity: Some(Arc::downgrade(registry)),
            ..Self::new(frame_duration)
        }
    }

    fn queue_for(&self, session_id: &str) -> SharedQueue {
        self.queues
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(SessionQueue::default())))
            .clone()
    }

    /// Append a task and start the pump if it is idle.
    pub fn enqueue(
        &self,
        session_id: &str,
        channel: Arc<dyn OutboundChannel>,
        task: AudioMessageTask,
    ) {
        let queue = self.queue_for(session_id);
        let start_pump = {
            let mut q = lock(&queue);
            debug!(
                session_id,
                sequence = task.sequence,
                frames = task.frames.len(),
                "Queued audio task"
            );
            q.tasks.push_back(task);
            !std::mem::replace(&mut q.pumping, true)
        };

        if start_pump {
            tokio::spawn(pump(
                session_id.to_string(),
                queue,
                channel,
                self.frame_duration,
                self.activity.clone(),
            ));
        }
    }

    /// Drop all queued audio, stop the in-flight sentence, and send one stop marker.
    pub fn abort(&self, session_id: &str, channel: &dyn OutboundChannel) {
        let dropped = {
            let queue = self.queue_for(session_id);
            let mut q = lock(&queue);
            q.generation += 1;
            let dropped = q.tasks.len();
            q.tasks.clear();
            dropped
        };

        info!(session_id, dropped, "Audio playback aborted");
        if let Err(e) = channel.send_message(&ServerMessage::tts(session_id, TtsState::Stop, None)) {
            debug!(session_id, "Stop marker not sent: {}", e);
        }
    }

    pub fn queued_len(&self, session_id: &str) -> usize {
        self.queues
            .get(session_id)
            .map(|q| lock(&q).tasks.len())
            .unwrap_or(0)
    }

    pub fn is_playing(&self, session_id: &str) -> bool {
        self.queues
            .get(session_id)
            .map(|q| lock(&q).pumping)
            .unwrap_or(false)
    }

    pub fn has_session(&self, session_id: &str) -> bool {
        self.queues.contains_key(session_id)
    }
}

impl SessionResource for AudioDispatchQueue {
    fn release(&self, session_id: &str) {
        if let Some((_, queue)) = self.queues.remove(session_id) {
            let mut q = lock(&queue);
            // a running pump sees the new generation and exits
            q.generation += 1;
            q.tasks.clear();
        }
    }
}

/// Drain one session's queue until it is empty or the channel closes.
async fn pump(
    session_id: String,
    queue: SharedQueue,
    channel: Arc<dyn OutboundChannel>,
    frame_duration: Duration,
    activity: Option<Weak<SessionRegistry>>,
) {
    let touch = || {
        if let Some(registry) = activity.as_ref().and_then(Weak::upgrade) {
            registry.touch(&session_id);
        }
    };

    loop {
        let next = {
            let mut q = lock(&queue);
            match q.tasks.pop_front() {
                Some(task) => Some((task, q.generation)),
                None => {
                    q.pumping = false;
                    None
                }
            }
        };
        let Some((task, generation)) = next else {
            return;
        };

        touch();
        let outcome =
            play(&session_id, &queue, channel.as_ref(), &task, generation, frame_duration).await;
        touch();

        match outcome {
            Playback::Finished => {}
            Playback::Aborted => {
                debug!(session_id = %session_id, sequence = task.sequence, "Playback interrupted");
            }
            Playback::ChannelClosed => {
                warn!(session_id = %session_id, "Channel closed during playback, dropping queue");
                let mut q = lock(&queue);
                q.tasks.clear();
                q.pumping = false;
                return;
            }
        }
    }
}

async fn play(
    session_id: &str,
    queue: &SharedQueue,
    channel: &dyn OutboundChannel,
    task: &AudioMessageTask,
    generation: u64,
    frame_duration: Duration,
) -> Playback {
    let current = || lock(queue).generation == generation;

    if !channel.is_open() {
        return Playback::ChannelClosed;
    }
    if !current() {
        return Playback::Aborted;
    }

    if task.is_first {
        let msg = ServerMessage::tts(session_id, TtsState::Start, None);
        if channel.send_message(&msg).is_err() {
            return Playback::ChannelClosed;
        }
    }

    if let Some(text) = task.text.as_ref().filter(|t| !t.is_empty()) {
        let msg = ServerMessage::tts(session_id, TtsState::SentenceStart, Some(text.clone()));
        if channel.send_message(&msg).is_err() {
            return Playback::ChannelClosed;
        }
    }

    for frame in &task.frames {
        if !current() {
            return Playback::Aborted;
        }
        if channel.send_binary(frame.clone()).is_err() {
            return Playback::ChannelClosed;
        }
        tokio::time::sleep(frame_duration).await;
    }

    if !current() {
        return Playback::Aborted;
    }

    if task.is_last {
        let msg = ServerMessage::tts(session_id, TtsState::Stop, None);
        if channel.send_message(&msg).is_err() {
            return Playback::ChannelClosed;
        }
    }

    Playback::Finished
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testing::{Outbound, RecordingChannel};
    use tokio::time::Instant;

    fn task(seq: u64, frames: usize, first: bool, last: bool) -> AudioMessageTask {
        AudioMessageTask::new(
            (0..frames).map(|i| vec![seq as u8, i as u8]).collect(),
            Some(format!("sentence {}", seq)),
            first,
            last,
            seq,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_plays_tasks_in_order_with_markers_and_pacing() {
        let queue = AudioDispatchQueue::new(Duration::from_millis(60));
        let channel = RecordingChannel::new();
        let started = Instant::now();

        queue.enqueue("s1", channel.clone(), task(1, 2, true, false));
        queue.enqueue("s1", channel.clone(), task(2, 1, false, true));
        channel.wait_for_stop_markers(1).await;

        assert_eq!(
            channel.events(),
            vec![
                Outbound::TtsStart,
                Outbound::SentenceStart("sentence 1".into()),
                Outbound::Frame(vec![1, 0]),
                Outbound::Frame(vec![1, 1]),
                Outbound::SentenceStart("sentence 2".into()),
                Outbound::Frame(vec![2, 0]),
                Outbound::TtsStop,
            ]
        );
        // three frames at 60ms each
        assert!(started.elapsed() >= Duration::from_millis(180));
        assert_eq!(queue.queued_len("s1"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_stops_playback_with_single_stop_marker() {
        let queue = AudioDispatchQueue::new(Duration::from_millis(60));
        let channel = RecordingChannel::new();

        queue.enqueue("s1", channel.clone(), task(1, 50, true, false));
        queue.enqueue("s1", channel.clone(), task(2, 50, false, true));
        tokio::time::sleep(Duration::from_millis(200)).await;

        queue.abort("s1", channel.as_ref());
        assert_eq!(queue.queued_len("s1"), 0);
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(channel.stop_markers(), 1);
        assert!(channel.frames() < 10);
        assert!(!queue.is_playing("s1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_channel_clears_queue() {
        let queue = AudioDispatchQueue::new(Duration::from_millis(20));
        let channel = RecordingChannel::new();
        queue.enqueue("s1", channel.clone(), task(1, 20, true, false));
        queue.enqueue("s1", channel.clone(), task(2, 20, false, true));

        tokio::time::sleep(Duration::from_millis(50)).await;
        channel.close();
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(queue.queued_len("s1"), 0);
        assert!(!queue.is_playing("s1"));
        assert_eq!(channel.stop_markers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_frameless_task_still_sends_markers() {
        let queue = AudioDispatchQueue::new(Duration::from_millis(60));
        let channel = RecordingChannel::new();
        queue.enqueue("s1", channel.clone(), AudioMessageTask::new(Vec::new(), None, true, true, 1));
        channel.wait_for_stop_markers(1).await;
        assert_eq!(channel.events(), vec![Outbound::TtsStart, Outbound::TtsStop]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_playback_keeps_session_from_idle_sweep() {
        let registry = Arc::new(SessionRegistry::new(10));
        let queue = AudioDispatchQueue::with_activity(Duration::from_secs(1), &registry);
        let channel = RecordingChannel::new();
        registry.register("s1", channel.clone()).unwrap();
        let timeout = Duration::from_secs(40);

        tokio::time::sleep(Duration::from_secs(30)).await;
        queue.enqueue("s1", channel.clone(), task(1, 30, true, false));
        queue.enqueue("s1", channel.clone(), task(2, 30, false, true));

        // 85 s since the last inbound message, 25 s since the second sentence started
        tokio::time::sleep(Duration::from_secs(55)).await;
        assert!(registry.sweep_inactive(timeout).is_empty());
        assert!(registry.get("s1").is_some());

        channel.wait_for_stop_markers(1).await;
        tokio::time::sleep(Duration::from_secs(45)).await;
        assert_eq!(registry.sweep_inactive(timeout), vec!["s1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_plain_queue_does_not_touch_sessions() {
        let registry = Arc::new(SessionRegistry::new(10));
        let queue = AudioDispatchQueue::new(Duration::from_secs(1));
        let channel = RecordingChannel::new();
        registry.register("s1", channel.clone()).unwrap();

        tokio::time::sleep(Duration::from_secs(30)).await;
        queue.enqueue("s1", channel.clone(), task(1, 30, true, true));
        tokio::time::sleep(Duration::from_secs(15)).await;

        assert_eq!(registry.sweep_inactive(Duration::from_secs(40)), vec!["s1".to_string()]);
    }

    #[tokio::test]
    async fn test_release_drops_session_queue() {
        let queue = AudioDispatchQueue::new(Duration::from_millis(60));
        let channel = RecordingChannel::new();
        queue.enqueue("s1", channel.clone(), task(1, 1, false, false));
        assert!(queue.has_session("s1"));
        queue.release("s1");
        assert!(!queue.has_session("s1"));
    }
}
