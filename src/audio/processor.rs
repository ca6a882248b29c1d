//! # PCM Conversion Helpers
//!
//! Small, stateless functions shared by the codec, the noise gate, the VAD and
//! the synthesis pipeline. Everything here works on 16-bit little-endian PCM,
//! which is what the Opus decoder produces and the encoder consumes.
//!
//! ## Key Functions:
//! - **Byte/sample conversion**: `bytes_to_samples`, `samples_to_bytes`
//! - **Normalization**: `pcm_to_float` scales to [-1.0, 1.0)
//! - **Measurement**: `mean_abs_energy`, `pcm_duration_ms`
//! - **Format conversion**: `downmix_to_mono`, `resample_linear`
//! - **WAV container**: `decode_wav`, `encode_wav` (via the `wav` crate)

use crate::error::{VoiceError, VoiceResult};
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use std::io::Cursor;

/// `audio_format` value for integer PCM in a WAV header.
const WAV_FORMAT_PCM: u16 = 1;

/// Sample rate and channel count of a PCM stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFormat {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    /// Bytes of 16-bit PCM per millisecond.
    pub fn bytes_per_ms(&self) -> usize {
        self.sample_rate as usize * self.channels as usize * 2 / 1000
    }

    /// Interleaved samples in one frame of the given duration.
    pub fn samples_per_frame(&self, frame_ms: u32) -> usize {
        self.sample_rate as usize * frame_ms as usize / 1000 * self.channels as usize
    }
}

/// Decode little-endian 16-bit PCM bytes into samples.
///
/// ## Rust Concepts:
/// - **Cursor**: reads from a byte slice as if it were a file
/// - **while let Ok(...)**: keeps reading until the cursor runs dry;
///   a trailing odd byte is ignored
pub fn bytes_to_samples(data: &[u8]) -> Vec<i16> {
    let mut cursor = Cursor::new(data);
    let mut samples = Vec::with_capacity(data.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample);
    }
    samples
}

/// Encode samples as little-endian 16-bit PCM bytes.
pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = vec![0u8; samples.len() * 2];
    LittleEndian::write_i16_into(samples, &mut bytes);
    bytes
}

/// Scale 16-bit samples to floats in [-1.0, 1.0).
pub fn pcm_to_float(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 32768.0).collect()
}

/// Mean absolute amplitude of normalized samples. Zero for an empty slice.
pub fn mean_abs_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().map(|s| s.abs()).sum::<f32>() / samples.len() as f32
}

/// Playback duration of a PCM byte buffer.
pub fn pcm_duration_ms(len_bytes: usize, format: AudioFormat) -> u64 {
    let per_ms = format.bytes_per_ms();
    if per_ms == 0 {
        return 0;
    }
    (len_bytes / per_ms) as u64
}

/// Average interleaved channels down to a single channel.
pub fn downmix_to_mono(samples: &[i16], channels: u16) -> Vec<i16> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks(channels as usize)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| s as i32).sum();
            (sum / frame.len() as i32) as i16
        })
        .collect()
}

/// Linear-interpolation resampler for mono audio.
///
/// Good enough for speech going to a narrow-band codec; it is not meant for music.
pub fn resample_linear(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || samples.is_empty() || from_rate == 0 {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = ((samples.len() as f64) / ratio).floor() as usize;
    let last = samples.len() - 1;

    (0..out_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = pos.floor() as usize;
            let frac = pos - idx as f64;
            let a = samples[idx.min(last)] as f64;
            let b = samples[(idx + 1).min(last)] as f64;
            (a + (b - a) * frac).round() as i16
        })
        .collect()
}

/// Parse a WAV container into mono 16-bit samples plus the source format.
///
/// 8-bit, 24-bit and float tracks are converted to 16-bit. Multi-channel
/// audio is downmixed, so the returned format always has one channel.
pub fn decode_wav(bytes: &[u8]) -> VoiceResult<(Vec<i16>, AudioFormat)> {
    let mut cursor = Cursor::new(bytes);
    let (header, data) = wav::read(&mut cursor)?;

    let samples: Vec<i16> = match data {
        wav::BitDepth::Sixteen(samples) => samples,
        wav::BitDepth::Eight(samples) => samples
            .into_iter()
            .map(|s| ((s as i16) - 128) << 8)
            .collect(),
        wav::BitDepth::TwentyFour(samples) => {
            samples.into_iter().map(|s| (s >> 8) as i16).collect()
        }
        wav::BitDepth::ThirtyTwoFloat(samples) => samples
            .into_iter()
            .map(|s| (s.clamp(-1.0, 1.0) * 32767.0) as i16)
            .collect(),
        wav::BitDepth::Empty => {
            return Err(VoiceError::UnsupportedFormat("WAV file has no audio data".to_string()))
        }
    };

    let mono = downmix_to_mono(&samples, header.channel_count);
    Ok((mono, AudioFormat::new(header.sampling_rate, 1)))
}

/// Wrap 16-bit samples in a WAV container.
pub fn encode_wav(samples: &[i16], format: AudioFormat) -> VoiceResult<Vec<u8>> {
    let header = wav::Header::new(WAV_FORMAT_PCM, format.channels, format.sample_rate, 16);
    let mut cursor = Cursor::new(Vec::new());
    wav::write(header, &wav::BitDepth::Sixteen(samples.to_vec()), &mut cursor)?;
    Ok(cursor.into_inner())
}
