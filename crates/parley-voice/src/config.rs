//! Layered configuration.
//!
//! Sources, lowest priority first: built-in defaults, an optional TOML file
//! (`PARLEY_CONFIG`, default `config/parley.toml`), then `PARLEY_*` environment
//! variables with `__` between sections (`PARLEY_LLM__MODEL=gpt-4o-mini`).

use crate::audio::AudioFormat;
use crate::error::{VoiceError, VoiceResult};
use crate::knowledge::KnowledgeConfig;
use crate::segmenter::SegmenterConfig;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const CONFIG_PATH_ENV: &str = "PARLEY_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config/parley.toml";

const DEFAULT_API_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VadEngine {
    #[default]
    Energy,
    Webrtc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SttEngine {
    #[default]
    Placeholder,
    OpenAi,
    Whisper,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmEngine {
    #[default]
    Scripted,
    OpenAi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtsEngine {
    #[default]
    Placeholder,
    OpenAi,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Frame queue capacity per session (default: 50 frames, ~1.6s)
    pub queue_capacity: usize,

    /// How long shutdown waits for the segmentation task before aborting it
    pub shutdown_timeout_ms: u64,

    /// Language passed to STT, e.g. "en" or "zh". None lets the engine detect.
    pub language_hint: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 50,
            shutdown_timeout_ms: 1000,
            language_hint: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnConfig {
    /// Hard wall-clock limit on one LLM generation
    pub llm_timeout_ms: u64,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            llm_timeout_ms: 8000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Samples kept per stage
    pub window: usize,

    /// Samples listed under `recent` on the metrics surface
    pub recent: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            window: crate::metrics::DEFAULT_WINDOW,
            recent: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    pub engine: VadEngine,

    /// RMS at which the energy detector reports probability 1.0
    pub energy_reference: f32,

    /// WebRTC aggressiveness 0-3
    pub webrtc_mode: u8,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            engine: VadEngine::Energy,
            energy_reference: 1500.0,
            webrtc_mode: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SttConfig {
    pub engine: SttEngine,
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub whisper_model_path: Option<String>,
    pub timeout_secs: u64,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            engine: SttEngine::Placeholder,
            base_url: DEFAULT_API_URL.to_string(),
            api_key: None,
            model: "whisper-1".to_string(),
            whisper_model_path: None,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub engine: LlmEngine,
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,

    /// Persona rendered into the system prompt
    pub character_name: String,
    pub personality: String,

    /// Turns kept verbatim in conversation memory
    pub memory_turns: usize,

    /// Artificial latency for the scripted engine
    pub scripted_delay_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            engine: LlmEngine::Scripted,
            base_url: DEFAULT_API_URL.to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            temperature: 0.7,
            max_tokens: 300,
            character_name: "Mika".to_string(),
            personality: "cheerful, curious and a little playful; keeps answers short"
                .to_string(),
            memory_turns: 8,
            scripted_delay_ms: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    pub engine: TtsEngine,
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub voice_en: String,
    pub voice_zh: String,
    pub timeout_secs: u64,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            engine: TtsEngine::Placeholder,
            base_url: DEFAULT_API_URL.to_string(),
            api_key: None,
            model: "tts-1".to_string(),
            voice_en: "nova".to_string(),
            voice_zh: "shimmer".to_string(),
            timeout_secs: 60,
        }
    }
}

/// Everything the voice engine needs, one section per concern.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    pub audio: AudioFormat,
    pub segmenter: SegmenterConfig,
    pub session: SessionConfig,
    pub turn: TurnConfig,
    pub metrics: MetricsConfig,
    pub vad: VadConfig,
    pub stt: SttConfig,
    pub llm: LlmConfig,
    pub tts: TtsConfig,
    pub knowledge: KnowledgeConfig,
}

/// Build the layered source set (file + environment).
pub fn layered() -> Result<config::Config, config::ConfigError> {
    let config_path =
        std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let builder = config::Config::builder();

    let path = Path::new(&config_path);
    let builder = if path.exists() {
        builder.add_source(config::File::from(path))
    } else {
        builder
    };

    builder
        .add_source(
            config::Environment::with_prefix("PARLEY")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()
}

/// Deserialize one top-level section, falling back to its default when absent.
pub fn section<T: DeserializeOwned + Default>(
    source: &config::Config,
    key: &str,
) -> Result<T, config::ConfigError> {
    match source.get::<T>(key) {
        Ok(value) => Ok(value),
        Err(config::ConfigError::NotFound(_)) => Ok(T::default()),
        Err(e) => Err(e),
    }
}

impl VoiceConfig {
    /// Load from file and environment, fill API keys, then validate.
    pub fn load() -> VoiceResult<Self> {
        let source = layered()?;
        Self::from_source(&source)
    }

    pub fn from_source(source: &config::Config) -> VoiceResult<Self> {
        let mut cfg: VoiceConfig = source.clone().try_deserialize()?;
        cfg.fill_api_keys_from_env();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Use the provider-wide keys when a section has none of its own.
    pub fn fill_api_keys_from_env(&mut self) {
        let fallback = std::env::var("OPENAI_API_KEY")
            .or_else(|_| std::env::var("OPENROUTER_API_KEY"))
            .ok()
            .filter(|k| !k.trim().is_empty());
        for key in [
            &mut self.stt.api_key,
            &mut self.llm.api_key,
            &mut self.tts.api_key,
        ] {
            if key.as_deref().map_or(true, |k| k.trim().is_empty()) {
                *key = fallback.clone();
            }
        }
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> VoiceResult<()> {
        if !matches!(self.audio.sample_rate, 8000 | 16000 | 32000 | 48000) {
            return Err(VoiceError::Config(format!(
                "audio.sample_rate must be 8000, 16000, 32000 or 48000, got {}",
                self.audio.sample_rate
            )));
        }
        if self.audio.frame_samples == 0 {
            return Err(VoiceError::Config(
                "audio.frame_samples must be positive".to_string(),
            ));
        }
        validate_segmenter(&self.segmenter)?;
        if self.session.queue_capacity == 0 {
            return Err(VoiceError::Config(
                "session.queue_capacity must be positive".to_string(),
            ));
        }
        if self.turn.llm_timeout_ms == 0 {
            return Err(VoiceError::Config(
                "turn.llm_timeout_ms must be positive".to_string(),
            ));
        }
        if self.metrics.window == 0 {
            return Err(VoiceError::Config(
                "metrics.window must be positive".to_string(),
            ));
        }
        if self.vad.webrtc_mode > 3 {
            return Err(VoiceError::Config(format!(
                "vad.webrtc_mode must be 0-3, got {}",
                self.vad.webrtc_mode
            )));
        }
        if self.vad.energy_reference <= 0.0 {
            return Err(VoiceError::Config(
                "vad.energy_reference must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Segmenter knobs are also updated at runtime, so they validate on their own.
pub fn validate_segmenter(cfg: &SegmenterConfig) -> VoiceResult<()> {
    if !(0.0..=1.0).contains(&cfg.threshold) {
        return Err(VoiceError::Config(format!(
            "segmenter.threshold must be within [0, 1], got {}",
            cfg.threshold
        )));
    }
    if cfg.min_silence_ms == 0 {
        return Err(VoiceError::Config(
            "segmenter.min_silence_ms must be positive".to_string(),
        ));
    }
    if cfg.max_utterance_ms < cfg.min_speech_ms {
        return Err(VoiceError::Config(
            "segmenter.max_utterance_ms must be at least min_speech_ms".to_string(),
        ));
    }
    Ok(())
}
