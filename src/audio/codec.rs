//! # Opus Codec Bridge
//!
//! Converts between the Opus frames that travel over the WebSocket and the
//! 16-bit PCM that the rest of the pipeline works on.
//!
//! ## Decoding (device → server):
//! Opus decoders are stateful (they carry prediction state from frame to frame),
//! so every session gets its own decoder. It is created on the first frame and
//! lives until the session is released.
//!
//! ## Encoding (server → device):
//! Reply audio is encoded in one batch per synthesized sentence, so a fresh
//! encoder per call is enough and nothing has to be cleaned up afterwards.
//!
//! ## Key Rust Concepts:
//! - **DashMap**: a concurrent HashMap; each shard has its own lock
//! - **Arc<Mutex<Decoder>>**: the decoder is cloned out of the map before it is
//!   locked, so two sessions never wait on each other

use crate::audio::processor::{bytes_to_samples, samples_to_bytes, AudioFormat};
use crate::config::SUPPORTED_FRAME_DURATIONS_MS;
use crate::error::{VoiceError, VoiceResult};
use crate::session::SessionResource;
use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

/// Largest frame Opus can produce, in milliseconds.
const MAX_OPUS_FRAME_MS: usize = 120;

/// Upper bound for one encoded packet.
const MAX_PACKET_BYTES: usize = 4000;

/// Opus encode/decode with one decoder per session.
pub struct CodecBridge {
    format: AudioFormat,
    decoders: DashMap<String, Arc<Mutex<opus::Decoder>>>,
}

impl CodecBridge {
    pub fn new(format: AudioFormat) -> Self {
        Self {
            format,
            decoders: DashMap::new(),
        }
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    fn channels(&self) -> opus::Channels {
        if self.format.channels >= 2 {
            opus::Channels::Stereo
        } else {
            opus::Channels::Mono
        }
    }

    /// Decode one Opus frame for a session into little-endian PCM bytes.
    ///
    /// ## Error Handling:
    /// An empty or corrupt frame returns an error but leaves the decoder in
    /// place, so the next good frame decodes normally.
    pub fn decode(&self, session_id: &str, frame: &[u8]) -> VoiceResult<Vec<u8>> {
        if frame.is_empty() {
            return Err(VoiceError::InvalidFrame("empty Opus frame".to_string()));
        }

        let decoder = self.decoder_for(session_id)?;
        let mut decoder = decoder.lock().unwrap_or_else(|e| e.into_inner());

        let capacity = self.format.sample_rate as usize * MAX_OPUS_FRAME_MS / 1000
            * self.format.channels as usize;
        let mut pcm = vec![0i16; capacity];
        let per_channel = decoder.decode(frame, &mut pcm, false)?;
        let valid = per_channel * self.format.channels as usize;

        trace!(session_id, samples = valid, "Decoded Opus frame");
        Ok(samples_to_bytes(&pcm[..valid]))
    }

    /// Encode PCM bytes into independent Opus frames of `frame_ms` each.
    ///
    /// The last partial frame is zero-padded. A frame with no real samples in
    /// it is never encoded, so empty input gives an empty result.
    pub fn encode(&self, pcm: &[u8], frame_ms: u32) -> VoiceResult<Vec<Vec<u8>>> {
        if !SUPPORTED_FRAME_DURATIONS_MS.contains(&frame_ms) {
            return Err(VoiceError::UnsupportedFormat(format!(
                "Opus frame duration {}ms (expected one of {:?})",
                frame_ms, SUPPORTED_FRAME_DURATIONS_MS
            )));
        }

        let samples = bytes_to_samples(pcm);
        let frame_len = self.format.samples_per_frame(frame_ms);
        if samples.is_empty() || frame_len == 0 {
            return Ok(Vec::new());
        }

        let mut encoder = opus::Encoder::new(
            self.format.sample_rate,
            self.channels(),
            opus::Application::Audio,
        )?;
        encoder.set_bitrate(opus::Bitrate::Bits(self.format.sample_rate as i32))?;

        let mut frames = Vec::with_capacity(samples.len().div_ceil(frame_len));
        let mut padded = vec![0i16; frame_len];
        let mut packet = vec![0u8; MAX_PACKET_BYTES];

        for chunk in samples.chunks(frame_len) {
            let input: &[i16] = if chunk.len() == frame_len {
                chunk
            } else {
                padded.fill(0);
                padded[..chunk.len()].copy_from_slice(chunk);
                &padded
            };
            let written = encoder.encode(input, &mut packet)?;
            frames.push(packet[..written].to_vec());
        }

        debug!(frames = frames.len(), frame_ms, "Encoded PCM to Opus");
        Ok(frames)
    }

    pub fn has_decoder(&self, session_id: &str) -> bool {
        self.decoders.contains_key(session_id)
    }

    pub fn active_decoders(&self) -> usize {
        self.decoders.len()
    }

    fn decoder_for(&self, session_id: &str) -> VoiceResult<Arc<Mutex<opus::Decoder>>> {
        if let Some(existing) = self.decoders.get(session_id) {
            return Ok(existing.clone());
        }

        let decoder = opus::Decoder::new(self.format.sample_rate, self.channels())?;
        let entry = self
            .decoders
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(decoder)));
        debug!(session_id, "Created Opus decoder");
        Ok(entry.clone())
    }
}

impl SessionResource for CodecBridge {
    fn release(&self, session_id: &str) {
        if self.decoders.remove(session_id).is_some() {
            debug!(session_id, "Released Opus decoder");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine_pcm(duration_ms: usize, format: AudioFormat) -> Vec<u8> {
        let samples: Vec<i16> = (0..format.sample_rate as usize * duration_ms / 1000)
            .map(|i| {
                let t = i as f32 / format.sample_rate as f32;
                ((t * 440.0 * 2.0 * std::f32::consts::PI).sin() * 8000.0) as i16
            })
            .collect();
        samples_to_bytes(&samples)
    }

    #[test]
    fn test_round_trip_keeps_duration() {
        let format = AudioFormat::new(16000, 1);
        let codec = CodecBridge::new(format);
        let pcm = sine_pcm(1000, format);

        let frames = codec.encode(&pcm, 60).unwrap();
        // 1000ms / 60ms = 16.67, so the last frame is padded
        assert_eq!(frames.len(), 17);
        assert!(frames.iter().all(|f| !f.is_empty()));

        let mut decoded = Vec::new();
        for frame in &frames {
            decoded.extend(codec.decode("s1", frame).unwrap());
        }
        let original_ms = pcm.len() / format.bytes_per_ms();
        let decoded_ms = decoded.len() / format.bytes_per_ms();
        assert!(decoded_ms.abs_diff(original_ms) <= 60);
        assert!(codec.has_decoder("s1"));
    }

    #[test]
    fn test_invalid_frames_keep_decoder() {
        let format = AudioFormat::new(16000, 1);
        let codec = CodecBridge::new(format);
        let good = codec.encode(&sine_pcm(60, format), 60).unwrap();

        assert!(codec.decode("s1", &[]).is_err());
        assert!(codec.decode("s1", &good[0]).is_ok());
        assert_eq!(codec.active_decoders(), 1);
    }

    #[test]
    fn test_encode_edge_cases() {
        let codec = CodecBridge::new(AudioFormat::new(16000, 1));
        assert!(codec.encode(&[0u8; 640], 25).is_err());
        assert!(codec.encode(&[], 60).unwrap().is_empty());
        // a single sample still produces one padded frame
        assert_eq!(codec.encode(&[1, 0], 20).unwrap().len(), 1);
    }

    #[test]
    fn test_release_drops_decoder() {
        let format = AudioFormat::new(16000, 1);
        let codec = CodecBridge::new(format);
        let frames = codec.encode(&sine_pcm(20, format), 20).unwrap();
        codec.decode("s1", &frames[0]).unwrap();
        codec.decode("s2", &frames[0]).unwrap();

        codec.release("s1");
        assert!(!codec.has_decoder("s1"));
        assert!(codec.has_decoder("s2"));
    }
}
