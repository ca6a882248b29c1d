//! # Streaming Sentence Segmenter
//!
//! Language models stream their reply a few characters at a time. Speech
//! synthesis wants whole sentences, and the first one as early as possible so the
//! device starts talking quickly. This module cuts the token stream into
//! speakable chunks as it arrives.
//!
//! ## The one-sentence lag:
//! A finished sentence is not emitted right away; it is held as *pending* until
//! the next boundary (or enough new text) proves it really was the end. This
//! lets the segmenter mark the final sentence of a reply `is_last` without
//! waiting for anything extra, and it avoids cutting on things like "e.g.".
//!
//! ## Boundaries:
//! - **End marks** (`。！？!?.`) and whitespace right after one
//! - **Newlines**
//! - **Pause and special marks** (commas, colons, quotes), only
//!   when the sentence is long enough and there is no pending sentence or enough
//!   text has passed since the last boundary
//!
//! ## Decimal points:
//! A `.` right after a digit is held until the next character arrives. If that
//! completes a decimal number ("3.14") it is an ordinary character, otherwise it
//! ends the sentence. "3.14 is pi." is never split at the decimal point.
//!
//! Everything else, including math operators and emoji, is ordinary text.

use crate::config::SegmenterSettings;
use crate::error::{VoiceError, VoiceResult};
use regex::Regex;

const END_MARKS: &[char] = &['。', '！', '？', '!', '?', '.'];
const PAUSE_MARKS: &[char] = &['，', '、', '；', ',', ';'];
const SPECIAL_MARKS: &[char] = &['：', ':', '"', '\'', '“', '”', '‘', '’'];

/// Thresholds, fallback text and compiled patterns. Shared, never mutated.
#[derive(Debug, Clone)]
pub struct SegmenterConfig {
    pub min_sentence_length: usize,
    pub new_sentence_threshold: usize,
    pub context_chars: usize,
    pub fallback_reply: String,
    decimal: Regex,
    punctuation_or_space: Regex,
}

impl SegmenterConfig {
    pub fn new(settings: &SegmenterSettings) -> VoiceResult<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| VoiceError::Config(format!("segmenter pattern: {}", e)))
        };
        Ok(Self {
            min_sentence_length: settings.min_sentence_length,
            new_sentence_threshold: settings.new_sentence_threshold,
            context_chars: settings.context_chars,
            fallback_reply: settings.fallback_reply.clone(),
            decimal: compile(r"\d+\.\d+$")?,
            punctuation_or_space: compile(r"[\p{P}\s]")?,
        })
    }

    /// At least the minimum length and two characters that are not punctuation or space.
    fn is_substantial(&self, text: &str) -> bool {
        let trimmed = text.trim();
        if trimmed.chars().count() < self.min_sentence_length {
            return false;
        }
        self.punctuation_or_space
            .replace_all(trimmed, "")
            .chars()
            .count()
            >= 2
    }
}

/// One speakable chunk of a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sentence {
    /// 1-based position within the turn
    pub sequence: u64,
    pub text: String,
    pub is_first: bool,
    pub is_last: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CharClass {
    End,
    Pause,
    Special,
    Newline,
    Other,
}

/// Segmentation state for one turn.
pub struct SentenceSegmenter {
    config: std::sync::Arc<SegmenterConfig>,
    current: String,
    context: String,
    pending: Option<String>,
    chars_since_boundary: usize,
    last_was_end: bool,
    deferred_dot: bool,
    emitted: u64,
    finished: bool,
}

impl SentenceSegmenter {
    pub fn new(config: std::sync::Arc<SegmenterConfig>) -> Self {
        Self {
            config,
            current: String::new(),
            context: String::new(),
            pending: None,
            chars_since_boundary: 0,
            last_was_end: false,
            deferred_dot: false,
            emitted: 0,
            finished: false,
        }
    }

    /// Number of sentences emitted so far.
    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    /// Feed one token; returns the sentences it completed.
    pub fn push_token(&mut self, token: &str) -> Vec<Sentence> {
        let mut out = Vec::new();
        if self.finished {
            return out;
        }
        for ch in token.chars() {
            self.push_char(ch, &mut out);
        }
        out
    }

    /// The reply completed normally: flush everything, marking the last sentence.
    pub fn finish(&mut self) -> Vec<Sentence> {
        let mut out = Vec::new();
        if self.finished {
            return out;
        }
        self.finished = true;
        self.resolve_deferred_as_end(&mut out);

        let trailing = std::mem::take(&mut self.current);
        if self.config.is_substantial(&trailing) {
            if let Some(previous) = self.pending.take() {
                self.emit(previous, false, &mut out);
            }
            self.pending = Some(trailing.trim().to_string());
        } else if !trailing.trim().is_empty() {
            let merged = match self.pending.take() {
                Some(previous) => format!("{}{}", previous, trailing),
                None => trailing,
            };
            self.pending = Some(merged.trim().to_string());
        }

        if let Some(last) = self.pending.take() {
            self.emit(last, true, &mut out);
        }
        out
    }

    /// The reply failed: flush what we have, then the fallback apology as the last sentence.
    pub fn fail(&mut self) -> Vec<Sentence> {
        let mut out = Vec::new();
        if self.finished {
            return out;
        }
        self.finished = true;
        self.resolve_deferred_as_end(&mut out);

        if let Some(previous) = self.pending.take() {
            self.emit(previous, false, &mut out);
        }
        let trailing = std::mem::take(&mut self.current);
        let trailing = trailing.trim();
        if !trailing.is_empty() {
            self.emit(trailing.to_string(), false, &mut out);
        }
        let fallback = self.config.fallback_reply.clone();
        self.emit(fallback, true, &mut out);
        out
    }

    fn push_char(&mut self, ch: char, out: &mut Vec<Sentence>) {
        let previous = self.context.chars().last();
        self.remember(ch);

        if std::mem::take(&mut self.deferred_dot) {
            if self.config.decimal.is_match(&self.context) {
                // the held '.' sits inside a number
                self.on_other(out);
            } else {
                self.on_end(out);
            }
        }

        self.current.push(ch);

        if ch == '.' && previous.is_some_and(|p| p.is_ascii_digit()) {
            self.deferred_dot = true;
            return;
        }

        match self.classify(ch) {
            CharClass::End => self.on_end(out),
            _ if self.last_was_end && ch.is_whitespace() => self.on_end(out),
            CharClass::Newline => {
                self.last_was_end = false;
                if self.flush_current(out) {
                    self.chars_since_boundary = 0;
                }
            }
            CharClass::Pause | CharClass::Special => self.on_soft_boundary(out),
            CharClass::Other => self.on_other(out),
        }
    }

    fn classify(&self, ch: char) -> CharClass {
        if END_MARKS.contains(&ch) {
            CharClass::End
        } else if PAUSE_MARKS.contains(&ch) {
            CharClass::Pause
        } else if SPECIAL_MARKS.contains(&ch) {
            CharClass::Special
        } else if ch == '\n' || ch == '\r' {
            CharClass::Newline
        } else {
            CharClass::Other
        }
    }

    fn remember(&mut self, ch: char) {
        self.context.push(ch);
        while self.context.chars().count() > self.config.context_chars {
            self.context.remove(0);
        }
    }

    fn on_end(&mut self, out: &mut Vec<Sentence>) {
        self.chars_since_boundary = 0;
        // whitespace after an end mark closes the run of end marks
        self.last_was_end = self.current.chars().last().is_some_and(|c| END_MARKS.contains(&c));
        self.flush_current(out);
    }

    fn on_soft_boundary(&mut self, out: &mut Vec<Sentence>) {
        self.last_was_end = false;
        let long_enough =
            self.current.trim().chars().count() >= self.config.min_sentence_length;
        let may_split = self.pending.is_none()
            || self.chars_since_boundary >= self.config.new_sentence_threshold;
        if long_enough && may_split && self.flush_current(out) {
            self.chars_since_boundary = 0;
        }
    }

    fn on_other(&mut self, out: &mut Vec<Sentence>) {
        self.last_was_end = false;
        self.chars_since_boundary += 1;
        if self.chars_since_boundary >= self.config.new_sentence_threshold {
            if let Some(previous) = self.pending.take() {
                self.emit(previous, false, out);
            }
        }
    }

    fn resolve_deferred_as_end(&mut self, out: &mut Vec<Sentence>) {
        if std::mem::take(&mut self.deferred_dot) {
            self.on_end(out);
        }
    }

    /// Move the current sentence to pending if it is long enough, emitting the
    /// old pending sentence first. Returns whether anything moved.
    fn flush_current(&mut self, out: &mut Vec<Sentence>) -> bool {
        let sentence = self.current.trim();
        if sentence.chars().count() < self.config.min_sentence_length {
            return false;
        }
        let sentence = sentence.to_string();
        if let Some(previous) = self.pending.take() {
            self.emit(previous, false, out);
        }
        self.pending = Some(sentence);
        self.current.clear();
        true
    }

    fn emit(&mut self, text: String, is_last: bool, out: &mut Vec<Sentence>) {
        self.emitted += 1;
        out.push(Sentence {
            sequence: self.emitted,
            text,
            is_first: self.emitted == 1,
            is_last,
        });
    }
}
