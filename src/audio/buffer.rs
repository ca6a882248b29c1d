//! # Pre-roll Buffer
//!
//! Keeps the audio that arrived just *before* the VAD decided someone is talking.
//! Speech onsets are quiet and the detector needs a frame or two to become
//! confident, so without this buffer the first syllable would be cut off.
//!
//! ## How it works:
//! - While the session is silent, every decoded frame is pushed as a chunk
//! - Once the total size exceeds the cap, the oldest chunks are dropped
//! - On speech start the whole buffer is drained and prepended to the utterance
//!
//! ## Rust Concepts:
//! - **VecDeque**: a ring buffer with cheap push at the back and pop at the front
//! - **std::mem::take**: moves the contents out and leaves an empty value behind

use std::collections::VecDeque;

/// Byte-capped FIFO of PCM chunks.
#[derive(Debug, Default)]
pub struct PreRollBuffer {
    chunks: VecDeque<Vec<u8>>,
    total_bytes: usize,
    max_bytes: usize,
}

impl PreRollBuffer {
    /// Create an empty buffer that holds at most `max_bytes` of PCM.
    pub fn new(max_bytes: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            total_bytes: 0,
            max_bytes,
        }
    }

    /// Append a chunk, then drop the oldest chunks until the cap holds again.
    ///
    /// Whole chunks are dropped, so the buffer may end up a little below the
    /// cap. It never ends up above it: a single chunk larger than the cap is
    /// dropped too.
    pub fn push(&mut self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        self.chunks.push_back(chunk.to_vec());
        self.total_bytes += chunk.len();
        self.trim();
    }

    /// Take everything out, oldest first, as one contiguous buffer.
    pub fn drain(&mut self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_bytes);
        for chunk in std::mem::take(&mut self.chunks) {
            out.extend_from_slice(&chunk);
        }
        self.total_bytes = 0;
        out
    }

    /// Change the cap. A smaller cap trims right away.
    pub fn set_capacity(&mut self, max_bytes: usize) {
        self.max_bytes = max_bytes;
        self.trim();
    }

    pub fn len_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.total_bytes == 0
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.total_bytes = 0;
    }

    fn trim(&mut self) {
        while self.total_bytes > self.max_bytes {
            match self.chunks.pop_front() {
                Some(oldest) => self.total_bytes -= oldest.len(),
                None => break,
            }
        }
    }
}
