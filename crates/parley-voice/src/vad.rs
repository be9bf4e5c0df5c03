//! Voice activity scoring.
//!
//! A VAD backend maps one frame to a speech probability in `[0, 1]`. Backends keep no
//! state between calls, so one instance is shared by every session.

use crate::audio::AudioFrame;
use crate::error::{VoiceError, VoiceResult};
use tracing::{debug, info};
use webrtc_vad::{SampleRate, Vad, VadMode};

/// Speech probability for a single frame.
pub trait VoiceActivity: Send + Sync {
    fn score(&self, frame: &AudioFrame) -> VoiceResult<f32>;

    fn name(&self) -> &'static str;
}

/// RMS energy detector. Probability rises linearly with frame RMS and saturates at
/// `reference_rms`.
#[derive(Debug, Clone)]
pub struct EnergyVad {
    reference_rms: f32,
}

impl EnergyVad {
    pub fn new(reference_rms: f32) -> VoiceResult<Self> {
        if !reference_rms.is_finite() || reference_rms <= 0.0 {
            return Err(VoiceError::VadInit(format!(
                "energy reference must be positive, got {}",
                reference_rms
            )));
        }
        Ok(Self { reference_rms })
    }
}

impl Default for EnergyVad {
    fn default() -> Self {
        Self {
            reference_rms: 1500.0,
        }
    }
}

impl VoiceActivity for EnergyVad {
    fn score(&self, frame: &AudioFrame) -> VoiceResult<f32> {
        if frame.is_empty() {
            return Err(VoiceError::VadProcessing("empty frame".to_string()));
        }
        let sum_sq: f64 = frame
            .samples()
            .iter()
            .map(|&s| {
                let v = s as f64;
                v * v
            })
            .sum();
        let rms = (sum_sq / frame.len() as f64).sqrt() as f32;
        Ok((rms / self.reference_rms).clamp(0.0, 1.0))
    }

    fn name(&self) -> &'static str {
        "energy"
    }
}

/// WebRTC VAD. The detector only accepts 10, 20 or 30 ms windows, so the longest
/// window that fits in the frame is scored (30 ms of a 32 ms frame by default).
/// A fresh detector is built per call; `webrtc_vad::Vad` is not `Send`.
#[derive(Debug, Clone)]
pub struct WebRtcVad {
    sample_rate: u32,
    mode: u8,
    window: usize,
}

impl WebRtcVad {
    pub fn new(sample_rate: u32, frame_samples: usize, mode: u8) -> VoiceResult<Self> {
        info!(
            "🎙️ Initializing WebRTC VAD (sample_rate: {}Hz, mode: {})",
            sample_rate, mode
        );

        if !matches!(sample_rate, 8000 | 16000 | 32000 | 48000) {
            return Err(VoiceError::Config(format!(
                "WebRTC VAD only supports 8000, 16000, 32000, or 48000 Hz, got {}",
                sample_rate
            )));
        }

        if mode > 3 {
            return Err(VoiceError::Config(format!(
                "VAD mode must be 0-3, got {}",
                mode
            )));
        }

        let per_ms = sample_rate as usize / 1000;
        let window = [30, 20, 10]
            .iter()
            .map(|ms| ms * per_ms)
            .find(|&w| w <= frame_samples)
            .ok_or_else(|| {
                VoiceError::Config(format!(
                    "frame of {} samples is shorter than the 10ms WebRTC window",
                    frame_samples
                ))
            })?;

        info!("✅ VAD initialized (window: {} samples)", window);

        Ok(Self {
            sample_rate,
            mode,
            window,
        })
    }

    pub fn window(&self) -> usize {
        self.window
    }

    fn detector(&self) -> Vad {
        let vad_mode = match self.mode {
            0 => VadMode::Quality,
            1 => VadMode::LowBitrate,
            2 => VadMode::Aggressive,
            _ => VadMode::VeryAggressive,
        };
        let sample_rate = match self.sample_rate {
            8000 => SampleRate::Rate8kHz,
            32000 => SampleRate::Rate32kHz,
            48000 => SampleRate::Rate48kHz,
            _ => SampleRate::Rate16kHz,
        };
        let mut vad = Vad::new();
        vad.set_mode(vad_mode);
        vad.set_sample_rate(sample_rate);
        vad
    }
}

impl VoiceActivity for WebRtcVad {
    fn score(&self, frame: &AudioFrame) -> VoiceResult<f32> {
        if frame.len() < self.window {
            return Err(VoiceError::VadProcessing(format!(
                "Expected at least {} samples, got {}",
                self.window,
                frame.len()
            )));
        }

        let mut vad = self.detector();
        let is_speech = vad
            .is_voice_segment(&frame.samples()[..self.window])
            .map_err(|e| VoiceError::VadProcessing(format!("VAD processing failed: {:?}", e)))?;

        debug!("VAD result: {}", if is_speech { "SPEECH" } else { "SILENCE" });

        Ok(if is_speech { 1.0 } else { 0.0 })
    }

    fn name(&self) -> &'static str {
        "webrtc"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_energy_scores_silence_and_speech() {
        let vad = EnergyVad::default();
        let silence = AudioFrame::new(vec![0; 512]);
        let loud = AudioFrame::new(vec![8000; 512]);
        assert_eq!(vad.score(&silence).unwrap(), 0.0);
        assert_eq!(vad.score(&loud).unwrap(), 1.0);

        let quiet = AudioFrame::new(vec![750; 512]);
        let score = vad.score(&quiet).unwrap();
        assert!((score - 0.5).abs() < 1e-3);
    }

    #[test]
    fn test_energy_rejects_empty_frames() {
        let vad = EnergyVad::default();
        assert!(vad.score(&AudioFrame::new(Vec::new())).is_err());
        assert!(EnergyVad::new(0.0).is_err());
    }

    #[test]
    fn test_webrtc_window_fits_frame() {
        let vad = WebRtcVad::new(16000, 512, 3).unwrap();
        assert_eq!(vad.window(), 480); // 30ms at 16kHz

        let vad = WebRtcVad::new(16000, 400, 3).unwrap();
        assert_eq!(vad.window(), 320);
    }

    #[test]
    fn test_invalid_sample_rate() {
        assert!(WebRtcVad::new(44100, 512, 3).is_err());
        assert!(WebRtcVad::new(16000, 512, 4).is_err());
        assert!(WebRtcVad::new(16000, 100, 3).is_err());
    }

    #[test]
    fn test_silence_detection() {
        let vad = WebRtcVad::new(16000, 512, 3).unwrap();
        let silence = AudioFrame::new(vec![0; 512]);
        assert_eq!(vad.score(&silence).unwrap(), 0.0);

        let short = AudioFrame::new(vec![0; 100]);
        assert!(vad.score(&short).is_err());
    }
}
