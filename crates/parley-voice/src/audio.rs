//! Audio primitives: fixed-size PCM frames, finalized utterances and WAV helpers.
//!
//! Frames arrive from the transport as little-endian PCM16 bytes. They are cut into
//! fixed-size `AudioFrame`s here and never mutated afterwards.

use crate::error::{VoiceError, VoiceResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::sync::Arc;

/// Frame geometry shared by the queue, the VAD and the segmenter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioFormat {
    /// Sample rate in Hz (default: 16000)
    pub sample_rate: u32,

    /// Samples per frame (default: 512 = 32ms at 16kHz)
    pub frame_samples: usize,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            frame_samples: 512,
        }
    }
}

impl AudioFormat {
    /// Duration of one frame in milliseconds.
    pub fn frame_duration_ms(&self) -> f64 {
        self.frame_samples as f64 * 1000.0 / self.sample_rate as f64
    }

    /// Size of one frame on the wire (PCM16LE).
    pub fn frame_bytes(&self) -> usize {
        self.frame_samples * 2
    }
}

/// One immutable block of mono PCM16 samples.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    samples: Arc<[i16]>,
}

impl AudioFrame {
    pub fn new(samples: Vec<i16>) -> Self {
        Self {
            samples: samples.into(),
        }
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Cuts an arbitrary stream of PCM16LE byte chunks into whole frames.
///
/// Transport messages rarely line up with frame boundaries; leftover bytes are kept
/// until the next chunk completes the frame.
#[derive(Debug)]
pub struct FrameAssembler {
    format: AudioFormat,
    pending: Vec<u8>,
}

impl FrameAssembler {
    pub fn new(format: AudioFormat) -> Self {
        Self {
            format,
            pending: Vec::with_capacity(format.frame_bytes()),
        }
    }

    /// Append bytes and return every frame that is now complete.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Vec<AudioFrame> {
        self.pending.extend_from_slice(bytes);
        let frame_bytes = self.format.frame_bytes();
        let whole = self.pending.len() / frame_bytes;
        if whole == 0 {
            return Vec::new();
        }

        let frames = self.pending[..whole * frame_bytes]
            .chunks_exact(frame_bytes)
            .map(|chunk| {
                AudioFrame::new(
                    chunk
                        .chunks_exact(2)
                        .map(|b| i16::from_le_bytes([b[0], b[1]]))
                        .collect(),
                )
            })
            .collect();
        self.pending.drain(..whole * frame_bytes);
        frames
    }

    /// Bytes waiting for the rest of their frame.
    pub fn pending_bytes(&self) -> usize {
        self.pending.len()
    }
}

/// A finalized span of speech, handed from the segmenter to a turn.
#[derive(Debug, Clone)]
pub struct Utterance {
    /// PCM16 samples, voiced frames plus the silence between them.
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    /// Total audio duration in milliseconds.
    pub duration_ms: f64,
    /// When the segment was finalized.
    pub captured_at: DateTime<Utc>,
}

impl Utterance {
    pub fn from_frames(frames: Vec<AudioFrame>, format: AudioFormat) -> Self {
        let duration_ms = frames.len() as f64 * format.frame_duration_ms();
        let mut samples = Vec::with_capacity(frames.iter().map(AudioFrame::len).sum());
        for frame in &frames {
            samples.extend_from_slice(frame.samples());
        }
        Self {
            samples,
            sample_rate: format.sample_rate,
            duration_ms,
            captured_at: Utc::now(),
        }
    }

    /// Samples normalized to -1.0..1.0 (for local inference engines).
    pub fn samples_f32(&self) -> Vec<f32> {
        self.samples.iter().map(|&s| s as f32 / 32768.0).collect()
    }
}

/// Encode mono PCM16 samples as a WAV file in memory.
pub fn encode_wav(samples: &[i16], sample_rate: u32) -> VoiceResult<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for &sample in samples {
            writer.write_sample(sample)?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

/// Silent WAV of the given length.
pub fn silent_wav(duration_ms: f64, sample_rate: u32) -> VoiceResult<Vec<u8>> {
    if !duration_ms.is_finite() || duration_ms < 0.0 {
        return Err(VoiceError::AudioFormat(format!(
            "invalid silence duration: {duration_ms}"
        )));
    }
    let count = (duration_ms * sample_rate as f64 / 1000.0).round() as usize;
    encode_wav(&vec![0i16; count], sample_rate)
}

/// Duration of a WAV payload read from its header, if it parses.
pub fn wav_duration_ms(bytes: &[u8]) -> Option<f64> {
    let reader = hound::WavReader::new(Cursor::new(bytes)).ok()?;
    let rate = reader.spec().sample_rate;
    if rate == 0 {
        return None;
    }
    Some(reader.duration() as f64 * 1000.0 / rate as f64)
}
