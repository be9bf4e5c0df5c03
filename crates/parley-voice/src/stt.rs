//! **Speech-to-Text**: turn a finalized `Utterance` into text for the LLM stage.
//!
//! Implement `SpeechToText` for local Whisper (whisper-rs, `whisper` feature) or any
//! OpenAI-compatible `/audio/transcriptions` endpoint.

use crate::audio::{encode_wav, Utterance};
use crate::config::SttConfig;
use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

/// Converts an utterance to text. An empty string means nothing intelligible was heard.
#[async_trait]
pub trait SpeechToText: Send + Sync {
    async fn transcribe(&self, utterance: &Utterance, language: Option<&str>)
        -> VoiceResult<String>;

    fn name(&self) -> &'static str;
}

/// Placeholder STT: returns a fixed string. Use for exercising the pipeline without a model.
#[derive(Debug, Default)]
pub struct PlaceholderStt {
    /// If set, return this instead of the default message.
    pub response: Option<String>,
}

impl PlaceholderStt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(s: impl Into<String>) -> Self {
        Self {
            response: Some(s.into()),
        }
    }
}

#[async_trait]
impl SpeechToText for PlaceholderStt {
    async fn transcribe(
        &self,
        utterance: &Utterance,
        _language: Option<&str>,
    ) -> VoiceResult<String> {
        if let Some(ref r) = self.response {
            return Ok(r.clone());
        }
        Ok(format!(
            "[STT placeholder: {} samples, {:.1}s]",
            utterance.samples.len(),
            utterance.duration_ms / 1000.0
        ))
    }

    fn name(&self) -> &'static str {
        "placeholder"
    }
}

/// OpenAI-compatible transcription API (OpenAI Whisper, OpenRouter, local servers).
#[derive(Debug, Clone)]
pub struct OpenAiStt {
    base_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl OpenAiStt {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> VoiceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| VoiceError::Stt(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            client,
        })
    }

    pub fn from_config(cfg: &SttConfig) -> VoiceResult<Self> {
        let api_key = cfg
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| {
                VoiceError::Config(
                    "STT requires stt.api_key, OPENAI_API_KEY, or OPENROUTER_API_KEY".to_string(),
                )
            })?;
        Self::new(
            cfg.base_url.clone(),
            api_key,
            cfg.model.clone(),
            Duration::from_secs(cfg.timeout_secs),
        )
    }
}

#[async_trait]
impl SpeechToText for OpenAiStt {
    async fn transcribe(
        &self,
        utterance: &Utterance,
        language: Option<&str>,
    ) -> VoiceResult<String> {
        if utterance.samples.is_empty() {
            return Ok(String::new());
        }
        let wav = encode_wav(&utterance.samples, utterance.sample_rate)?;
        let url = format!("{}/audio/transcriptions", self.base_url.trim_end_matches('/'));
        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| VoiceError::Stt(e.to_string()))?;
        let mut form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone());
        if let Some(lang) = language {
            form = form.text("language", lang.to_string());
        }

        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| VoiceError::Stt(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(VoiceError::Stt(format!("STT API error {}: {}", status, body)));
        }
        let json: serde_json::Value = res
            .json()
            .await
            .map_err(|e| VoiceError::Stt(e.to_string()))?;
        let text = json
            .get("text")
            .and_then(|t| t.as_str())
            .unwrap_or("")
            .trim()
            .to_string();
        debug!("STT transcript: {:?}", text);
        Ok(text)
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

// -----------------------------------------------------------------------------
// Local Whisper STT (optional feature). Requires whisper.cpp/ggml.
// -----------------------------------------------------------------------------
#[cfg(feature = "whisper")]
mod whisper_stt {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

    /// Local Whisper STT: loads a ggml model (e.g. ggml-base.en.bin) and runs inference
    /// on a blocking thread. Audio must be 16 kHz mono.
    pub struct WhisperStt {
        #[allow(dead_code)]
        context: WhisperContext,
        state: Arc<Mutex<whisper_rs::WhisperState>>,
    }

    impl WhisperStt {
        pub fn new(model_path: &str) -> VoiceResult<Self> {
            let params = WhisperContextParameters::default();
            let context = WhisperContext::new_with_params(model_path, params)
                .map_err(|e| VoiceError::Stt(format!("Whisper load failed: {}", e)))?;
            let state = context
                .create_state()
                .map_err(|e| VoiceError::Stt(format!("Whisper state init failed: {}", e)))?;
            Ok(Self {
                context,
                state: Arc::new(Mutex::new(state)),
            })
        }
    }

    #[async_trait]
    impl SpeechToText for WhisperStt {
        async fn transcribe(
            &self,
            utterance: &Utterance,
            language: Option<&str>,
        ) -> VoiceResult<String> {
            if utterance.samples.is_empty() {
                return Ok(String::new());
            }
            if utterance.sample_rate != 16000 {
                return Err(VoiceError::Stt(format!(
                    "Whisper expects 16 kHz; got {} Hz",
                    utterance.sample_rate
                )));
            }
            let samples = utterance.samples_f32();
            let language = language.unwrap_or("en").to_string();
            let state = Arc::clone(&self.state);

            tokio::task::spawn_blocking(move || {
                let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
                params.set_print_progress(false);
                params.set_print_realtime(false);
                params.set_no_timestamps(true);
                params.set_language(Some(&language));

                let mut state = state.lock();
                state
                    .full(params, &samples)
                    .map_err(|e| VoiceError::Stt(format!("Whisper inference failed: {}", e)))?;
                let text = state
                    .as_iter()
                    .filter_map(|seg| seg.to_str().ok().map(str::to_string))
                    .collect::<Vec<_>>()
                    .join(" ")
                    .trim()
                    .to_string();
                Ok(text)
            })
            .await
            .map_err(|e| VoiceError::Stt(format!("Whisper task failed: {}", e)))?
        }

        fn name(&self) -> &'static str {
            "whisper"
        }
    }
}

#[cfg(feature = "whisper")]
pub use whisper_stt::WhisperStt;
