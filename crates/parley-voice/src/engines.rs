//! One-time backend resolution at process start.
//!
//! Each configured engine either builds or falls back to its default. The outcome is
//! returned as data (`Resolution`) so the caller can log it and serve it on `/health`.

use crate::config::{LlmEngine, SttEngine, TtsEngine, VadEngine, VoiceConfig};
use crate::error::VoiceResult;
use crate::llm::{LanguageModel, OpenAiChatLlm, ScriptedLlm};
use crate::stt::{OpenAiStt, PlaceholderStt, SpeechToText};
use crate::tts::{OpenAiTts, PlaceholderTts, TextToSpeech};
use crate::vad::{EnergyVad, VoiceActivity, WebRtcVad};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// How one stage's backend was chosen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Resolution {
    Configured {
        engine: String,
    },
    FellBack {
        requested: String,
        engine: String,
        reason: String,
    },
}

impl Resolution {
    pub fn engine(&self) -> &str {
        match self {
            Resolution::Configured { engine } | Resolution::FellBack { engine, .. } => engine,
        }
    }

    pub fn fell_back(&self) -> bool {
        matches!(self, Resolution::FellBack { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendReport {
    pub vad: Resolution,
    pub stt: Resolution,
    pub llm: Resolution,
    pub tts: Resolution,
}

/// The four capabilities every session shares.
#[derive(Clone)]
pub struct Backends {
    pub vad: Arc<dyn VoiceActivity>,
    pub stt: Arc<dyn SpeechToText>,
    pub llm: Arc<dyn LanguageModel>,
    pub tts: Arc<dyn TextToSpeech>,
}

impl Backends {
    pub fn new(
        vad: Arc<dyn VoiceActivity>,
        stt: Arc<dyn SpeechToText>,
        llm: Arc<dyn LanguageModel>,
        tts: Arc<dyn TextToSpeech>,
    ) -> Self {
        Self { vad, stt, llm, tts }
    }

    /// Offline defaults: energy VAD, placeholder STT/TTS, scripted LLM.
    pub fn placeholders(sample_rate: u32) -> Self {
        Self::new(
            Arc::new(EnergyVad::default()),
            Arc::new(PlaceholderStt::new()),
            Arc::new(ScriptedLlm::new()),
            Arc::new(PlaceholderTts::new(sample_rate)),
        )
    }

    /// Build every configured backend, falling back per stage on failure.
    pub fn resolve(cfg: &VoiceConfig) -> (Self, BackendReport) {
        let (vad, vad_res) = resolve_vad(cfg);
        let (stt, stt_res) = resolve_stt(cfg);
        let (llm, llm_res) = resolve_llm(cfg);
        let (tts, tts_res) = resolve_tts(cfg);

        let report = BackendReport {
            vad: vad_res,
            stt: stt_res,
            llm: llm_res,
            tts: tts_res,
        };
        for (stage, res) in [
            ("vad", &report.vad),
            ("stt", &report.stt),
            ("llm", &report.llm),
            ("tts", &report.tts),
        ] {
            match res {
                Resolution::Configured { engine } => info!("🔧 {} backend: {}", stage, engine),
                Resolution::FellBack {
                    requested,
                    engine,
                    reason,
                } => warn!(
                    "⚠️ {} backend {} unavailable ({}), using {}",
                    stage, requested, reason, engine
                ),
            }
        }

        (Self::new(vad, stt, llm, tts), report)
    }
}

fn configured(engine: &str) -> Resolution {
    Resolution::Configured {
        engine: engine.to_string(),
    }
}

fn fell_back(requested: &str, engine: &str, reason: impl ToString) -> Resolution {
    Resolution::FellBack {
        requested: requested.to_string(),
        engine: engine.to_string(),
        reason: reason.to_string(),
    }
}

fn energy_vad(cfg: &VoiceConfig) -> Arc<dyn VoiceActivity> {
    match EnergyVad::new(cfg.vad.energy_reference) {
        Ok(vad) => Arc::new(vad),
        Err(_) => Arc::new(EnergyVad::default()),
    }
}

fn resolve_vad(cfg: &VoiceConfig) -> (Arc<dyn VoiceActivity>, Resolution) {
    match cfg.vad.engine {
        VadEngine::Energy => (energy_vad(cfg), configured("energy")),
        VadEngine::Webrtc => {
            match WebRtcVad::new(
                cfg.audio.sample_rate,
                cfg.audio.frame_samples,
                cfg.vad.webrtc_mode,
            ) {
                Ok(vad) => (Arc::new(vad), configured("webrtc")),
                Err(e) => (energy_vad(cfg), fell_back("webrtc", "energy", e)),
            }
        }
    }
}

fn resolve_stt(cfg: &VoiceConfig) -> (Arc<dyn SpeechToText>, Resolution) {
    match cfg.stt.engine {
        SttEngine::Placeholder => (Arc::new(PlaceholderStt::new()), configured("placeholder")),
        SttEngine::OpenAi => match OpenAiStt::from_config(&cfg.stt) {
            Ok(stt) => (Arc::new(stt), configured("openai")),
            Err(e) => (
                Arc::new(PlaceholderStt::new()),
                fell_back("openai", "placeholder", e),
            ),
        },
        SttEngine::Whisper => match build_whisper(cfg) {
            Ok(stt) => (stt, configured("whisper")),
            Err(e) => (
                Arc::new(PlaceholderStt::new()),
                fell_back("whisper", "placeholder", e),
            ),
        },
    }
}

#[cfg(feature = "whisper")]
fn build_whisper(cfg: &VoiceConfig) -> VoiceResult<Arc<dyn SpeechToText>> {
    use crate::error::VoiceError;
    let path = cfg
        .stt
        .whisper_model_path
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .ok_or_else(|| VoiceError::Config("stt.whisper_model_path not set".to_string()))?;
    Ok(Arc::new(crate::stt::WhisperStt::new(path)?))
}

#[cfg(not(feature = "whisper"))]
fn build_whisper(_cfg: &VoiceConfig) -> VoiceResult<Arc<dyn SpeechToText>> {
    Err(crate::error::VoiceError::Config(
        "built without the `whisper` feature".to_string(),
    ))
}

fn resolve_llm(cfg: &VoiceConfig) -> (Arc<dyn LanguageModel>, Resolution) {
    let scripted = || ScriptedLlm::with_delay(Duration::from_millis(cfg.llm.scripted_delay_ms));
    match cfg.llm.engine {
        LlmEngine::Scripted => (Arc::new(scripted()), configured("scripted")),
        LlmEngine::OpenAi => match OpenAiChatLlm::from_config(&cfg.llm) {
            Ok(llm) => (Arc::new(llm), configured("openai")),
            Err(e) => (Arc::new(scripted()), fell_back("openai", "scripted", e)),
        },
    }
}

fn resolve_tts(cfg: &VoiceConfig) -> (Arc<dyn TextToSpeech>, Resolution) {
    let placeholder = || PlaceholderTts::new(cfg.audio.sample_rate);
    match cfg.tts.engine {
        TtsEngine::Placeholder => (Arc::new(placeholder()), configured("placeholder")),
        TtsEngine::OpenAi => match OpenAiTts::from_config(&cfg.tts, cfg.audio.sample_rate) {
            Ok(tts) => (Arc::new(tts), configured("openai")),
            Err(e) => (Arc::new(placeholder()), fell_back("openai", "placeholder", e)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_resolve_as_configured() {
        let (backends, report) = Backends::resolve(&VoiceConfig::default());
        assert_eq!(report.vad, configured("energy"));
        assert_eq!(report.llm.engine(), "scripted");
        assert!(!report.stt.fell_back());
        assert_eq!(backends.tts.name(), "placeholder");
    }

    #[test]
    fn test_missing_key_falls_back() {
        let mut cfg = VoiceConfig::default();
        cfg.llm.engine = LlmEngine::OpenAi;
        cfg.llm.api_key = None;
        cfg.stt.engine = SttEngine::Whisper;

        let (backends, report) = Backends::resolve(&cfg);
        assert!(report.llm.fell_back());
        assert_eq!(report.llm.engine(), "scripted");
        assert_eq!(backends.llm.name(), "scripted");
        assert!(report.stt.fell_back());

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["llm"]["status"], "fell_back");
        assert_eq!(json["llm"]["requested"], "openai");
    }
}
