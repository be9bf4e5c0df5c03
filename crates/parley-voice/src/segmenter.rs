//! Speech segmentation: decides when an utterance starts and ends.
//!
//! The segmenter consumes one frame at a time. Durations are measured in frame time
//! (frames × frame duration), never wall-clock, so results do not depend on how fast
//! frames arrive.

use crate::audio::{AudioFormat, AudioFrame, Utterance};
use crate::metrics::{LatencyMetrics, LatencyStage};
use crate::vad::VoiceActivity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Segmentation knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmenterConfig {
    /// Speech probability at or above which a frame counts as voiced (default: 0.5)
    pub threshold: f32,

    /// Minimum voiced duration for a segment to become an utterance (default: 300ms)
    pub min_speech_ms: u64,

    /// Trailing silence that ends a segment (default: 700ms)
    pub min_silence_ms: u64,

    /// Segment length that forces finalization (default: 30s)
    pub max_utterance_ms: u64,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            min_speech_ms: 300,
            min_silence_ms: 700,
            max_utterance_ms: 30_000,
        }
    }
}

/// Output of `SpeechSegmenter::push_frame`.
#[derive(Debug, Clone)]
pub enum SegmentEvent {
    /// First voiced frame of a new segment. Emitted immediately (drives barge-in).
    SpeechStarted { at: DateTime<Utc> },

    /// Segment finalized with enough speech.
    Utterance(Utterance),

    /// Speech that kept going past a forced cut at `max_utterance_ms`. Follows the
    /// previous `Utterance` without a `SpeechStarted` in between.
    Continued(Utterance),

    /// Segment ended but was too short to be speech.
    Discarded { speech_ms: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmenterState {
    Silent,
    Speaking,
}

pub struct SpeechSegmenter {
    config: SegmenterConfig,
    format: AudioFormat,
    frame_ms: f64,
    vad: Arc<dyn VoiceActivity>,
    metrics: Arc<LatencyMetrics>,

    state: SegmenterState,
    frames: Vec<AudioFrame>,
    // One past the last voiced frame in `frames`.
    voiced_end: usize,
    speech_ms: f64,
    silence_ms: f64,
    // Set by a forced cut until `min_silence_ms` of silence passes; the next voiced
    // frame then resumes the same speech instead of starting new speech.
    continuing: bool,
    // The open segment resumed a forced cut.
    resumed: bool,
    anomalies: u64,
}

impl SpeechSegmenter {
    pub fn new(
        config: SegmenterConfig,
        format: AudioFormat,
        vad: Arc<dyn VoiceActivity>,
        metrics: Arc<LatencyMetrics>,
    ) -> Self {
        Self {
            frame_ms: format.frame_duration_ms(),
            config,
            format,
            vad,
            metrics,
            state: SegmenterState::Silent,
            frames: Vec::new(),
            voiced_end: 0,
            speech_ms: 0.0,
            silence_ms: 0.0,
            continuing: false,
            resumed: false,
            anomalies: 0,
        }
    }

    pub fn state(&self) -> SegmenterState {
        self.state
    }

    /// Frames the VAD failed on (treated as silence).
    pub fn anomalies(&self) -> u64 {
        self.anomalies
    }

    /// Classify one frame and advance the state machine.
    pub fn push_frame(&mut self, frame: AudioFrame) -> Option<SegmentEvent> {
        let voiced = self.classify(&frame);

        match (self.state, voiced) {
            (SegmenterState::Silent, false) => {
                if self.continuing {
                    self.silence_ms += self.frame_ms;
                    if self.silence_ms >= self.config.min_silence_ms as f64 {
                        self.continuing = false;
                    }
                }
                None
            }

            (SegmenterState::Silent, true) => {
                let resumed = std::mem::take(&mut self.continuing);
                self.state = SegmenterState::Speaking;
                self.frames.clear();
                self.frames.push(frame);
                self.voiced_end = 1;
                self.speech_ms = self.frame_ms;
                self.silence_ms = 0.0;
                self.resumed = resumed;
                if resumed {
                    debug!("🎤 Speech continues past forced cut");
                    return None;
                }
                debug!("🎤 Speech started");
                Some(SegmentEvent::SpeechStarted { at: Utc::now() })
            }

            (SegmenterState::Speaking, true) => {
                self.frames.push(frame);
                self.voiced_end = self.frames.len();
                self.speech_ms += self.frame_ms;
                self.silence_ms = 0.0;

                if self.segment_ms() >= self.config.max_utterance_ms as f64 {
                    warn!("⏱️ Max utterance duration reached, finalizing");
                    return self.force_cut();
                }
                None
            }

            (SegmenterState::Speaking, false) => {
                self.frames.push(frame);
                self.silence_ms += self.frame_ms;

                if self.silence_ms >= self.config.min_silence_ms as f64 {
                    return self.finish();
                }
                if self.segment_ms() >= self.config.max_utterance_ms as f64 {
                    warn!("⏱️ Max utterance duration reached, finalizing");
                    return self.force_cut();
                }
                None
            }
        }
    }

    /// Drop any open segment and return to `Silent`.
    pub fn reset(&mut self) {
        self.state = SegmenterState::Silent;
        self.frames.clear();
        self.voiced_end = 0;
        self.speech_ms = 0.0;
        self.silence_ms = 0.0;
        self.continuing = false;
        self.resumed = false;
    }

    fn segment_ms(&self) -> f64 {
        self.frames.len() as f64 * self.frame_ms
    }

    fn classify(&mut self, frame: &AudioFrame) -> bool {
        let started = Instant::now();
        let result = self.vad.score(frame);
        self.metrics.record(
            LatencyStage::Vad,
            started.elapsed().as_secs_f64() * 1000.0,
        );

        match result {
            Ok(probability) => probability >= self.config.threshold,
            Err(e) => {
                self.anomalies += 1;
                warn!(
                    "VAD failed on frame ({} so far), treating as silence: {}",
                    self.anomalies, e
                );
                false
            }
        }
    }

    /// Finalize at `max_utterance_ms` and keep listening for the rest of the speech.
    fn force_cut(&mut self) -> Option<SegmentEvent> {
        let trailing_silence = self.silence_ms;
        let event = self.finish();
        self.continuing = true;
        self.silence_ms = trailing_silence;
        event
    }

    fn finish(&mut self) -> Option<SegmentEvent> {
        let speech_ms = self.speech_ms;
        let resumed = self.resumed;
        let mut frames = std::mem::take(&mut self.frames);
        frames.truncate(self.voiced_end);
        self.reset();

        if speech_ms < self.config.min_speech_ms as f64 {
            debug!("⏭️ Speech too short ({:.0}ms), ignoring", speech_ms);
            // A short tail after a forced cut never announced itself.
            return (!resumed).then_some(SegmentEvent::Discarded { speech_ms });
        }

        let utterance = Utterance::from_frames(frames, self.format);
        info!(
            "✅ Utterance finalized ({:.0}ms audio, {:.0}ms voiced)",
            utterance.duration_ms, speech_ms
        );
        Some(if resumed {
            SegmentEvent::Continued(utterance)
        } else {
            SegmentEvent::Utterance(utterance)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{VoiceError, VoiceResult};
    use crate::vad::EnergyVad;

    fn voiced() -> AudioFrame {
        AudioFrame::new(vec![8000; 512])
    }

    fn silent() -> AudioFrame {
        AudioFrame::new(vec![0; 512])
    }

    fn segmenter() -> SpeechSegmenter {
        SpeechSegmenter::new(
            SegmenterConfig::default(),
            AudioFormat::default(),
            Arc::new(EnergyVad::default()),
            Arc::new(LatencyMetrics::default()),
        )
    }

    fn feed(seg: &mut SpeechSegmenter, frames: impl IntoIterator<Item = AudioFrame>) -> Vec<SegmentEvent> {
        frames.into_iter().filter_map(|f| seg.push_frame(f)).collect()
    }

    #[test]
    fn test_silence_never_produces_utterance() {
        let mut seg = segmenter();
        let events = feed(&mut seg, (0..200).map(|_| silent()));
        assert!(events.is_empty());
        assert_eq!(seg.state(), SegmenterState::Silent);
    }

    #[test]
    fn test_speech_then_silence_produces_one_utterance() {
        let mut seg = segmenter();
        let frames = (0..20).map(|_| voiced()).chain((0..25).map(|_| silent()));
        let events = feed(&mut seg, frames);

        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], SegmentEvent::SpeechStarted { .. }));
        match &events[1] {
            SegmentEvent::Utterance(u) => {
                assert!((u.duration_ms - 640.0).abs() < 1e-6);
                assert_eq!(u.samples.len(), 20 * 512);
            }
            other => panic!("expected utterance, got {:?}", other),
        }
        assert_eq!(seg.state(), SegmenterState::Silent);
    }

    #[test]
    fn test_intervening_silence_is_kept() {
        let mut seg = segmenter();
        let frames = (0..6)
            .map(|_| voiced())
            .chain((0..5).map(|_| silent()))
            .chain((0..6).map(|_| voiced()))
            .chain((0..25).map(|_| silent()));
        let events = feed(&mut seg, frames);

        let utterances: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                SegmentEvent::Utterance(u) => Some(u),
                _ => None,
            })
            .collect();
        assert_eq!(utterances.len(), 1);
        assert_eq!(utterances[0].samples.len(), 17 * 512);
    }

    #[test]
    fn test_short_speech_is_discarded() {
        let mut seg = segmenter();
        let frames = (0..5).map(|_| voiced()).chain((0..25).map(|_| silent()));
        let events = feed(&mut seg, frames);

        assert!(matches!(events[0], SegmentEvent::SpeechStarted { .. }));
        assert!(matches!(events[1], SegmentEvent::Discarded { .. }));
        assert!(!events
            .iter()
            .any(|e| matches!(e, SegmentEvent::Utterance(_))));
    }

    #[test]
    fn test_max_utterance_forces_finalization() {
        let mut seg = SpeechSegmenter::new(
            SegmenterConfig {
                max_utterance_ms: 640,
                ..SegmenterConfig::default()
            },
            AudioFormat::default(),
            Arc::new(EnergyVad::default()),
            Arc::new(LatencyMetrics::default()),
        );
        let events = feed(&mut seg, (0..20).map(|_| voiced()));
        assert!(matches!(events.last(), Some(SegmentEvent::Utterance(_))));
    }

    #[test]
    fn test_speech_past_forced_cut_continues_without_new_start() {
        let mut seg = SpeechSegmenter::new(
            SegmenterConfig {
                max_utterance_ms: 640,
                ..SegmenterConfig::default()
            },
            AudioFormat::default(),
            Arc::new(EnergyVad::default()),
            Arc::new(LatencyMetrics::default()),
        );
        let frames = (0..30).map(|_| voiced()).chain((0..25).map(|_| silent()));
        let events = feed(&mut seg, frames);

        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], SegmentEvent::SpeechStarted { .. }));
        match (&events[1], &events[2]) {
            (SegmentEvent::Utterance(first), SegmentEvent::Continued(rest)) => {
                assert!((first.duration_ms - 640.0).abs() < 1e-6);
                assert!((rest.duration_ms - 320.0).abs() < 1e-6);
            }
            other => panic!("expected utterance then continuation, got {:?}", other),
        }
        assert_eq!(seg.state(), SegmenterState::Silent);

        // After a real pause the next speech is new speech again.
        let events = feed(&mut seg, (0..10).map(|_| voiced()));
        assert!(matches!(events[0], SegmentEvent::SpeechStarted { .. }));
    }

    #[test]
    fn test_short_tail_after_forced_cut_is_dropped_quietly() {
        let mut seg = SpeechSegmenter::new(
            SegmenterConfig {
                max_utterance_ms: 640,
                ..SegmenterConfig::default()
            },
            AudioFormat::default(),
            Arc::new(EnergyVad::default()),
            Arc::new(LatencyMetrics::default()),
        );
        let frames = (0..22).map(|_| voiced()).chain((0..25).map(|_| silent()));
        let events = feed(&mut seg, frames);

        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], SegmentEvent::Utterance(_)));
    }

    struct FlakyVad;

    impl VoiceActivity for FlakyVad {
        fn score(&self, frame: &AudioFrame) -> VoiceResult<f32> {
            if frame.samples()[0] < 0 {
                Err(VoiceError::VadProcessing("bad frame".into()))
            } else {
                Ok(1.0)
            }
        }

        fn name(&self) -> &'static str {
            "flaky"
        }
    }

    #[test]
    fn test_vad_failure_counts_as_silence() {
        let metrics = Arc::new(LatencyMetrics::default());
        let mut seg = SpeechSegmenter::new(
            SegmenterConfig::default(),
            AudioFormat::default(),
            Arc::new(FlakyVad),
            Arc::clone(&metrics),
        );
        let bad = AudioFrame::new(vec![-1; 512]);
        let events = feed(&mut seg, (0..3).map(|_| bad.clone()));
        assert!(events.is_empty());
        assert_eq!(seg.anomalies(), 3);
        assert_eq!(metrics.stats(LatencyStage::Vad).count, 3);
    }
}
