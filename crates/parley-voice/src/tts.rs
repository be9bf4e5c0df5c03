//! **Text-to-Speech**: synthesize reply text into WAV audio plus a duration.

use crate::audio::{silent_wav, wav_duration_ms};
use crate::config::TtsConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::llm::{contains_cjk, PhonemeHint};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

/// Fallback speaking rate when nothing better is known.
pub const MS_PER_CHAR: f64 = 50.0;

/// Synthesized audio ready for delivery.
#[derive(Debug, Clone)]
pub struct SpeechAudio {
    pub bytes: Vec<u8>,
    pub duration_ms: f64,
}

#[async_trait]
pub trait TextToSpeech: Send + Sync {
    async fn synthesize(&self, text: &str) -> VoiceResult<SpeechAudio>;

    fn name(&self) -> &'static str;
}

/// Duration of synthesized audio: WAV header if it parses, else raw PCM16 mono byte
/// rate, else `chars × 50ms`.
pub fn estimate_duration_ms(bytes: &[u8], text: &str, sample_rate: u32) -> f64 {
    if let Some(ms) = wav_duration_ms(bytes) {
        return ms;
    }
    if !bytes.is_empty() && sample_rate > 0 {
        let bytes_per_second = sample_rate as f64 * 2.0;
        return bytes.len() as f64 / bytes_per_second * 1000.0;
    }
    (text.chars().count() as f64 * MS_PER_CHAR).max(1.0)
}

/// Rough per-character lip-sync timings spread over `duration_ms`. Vowels get 1.2×
/// the per-char time, other characters 0.8×, and each word ends with a `_` gap of 0.5×.
pub fn estimate_phonemes(text: &str, duration_ms: f64) -> Vec<PhonemeHint> {
    let cleaned: String = text
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect();
    let words: Vec<&str> = cleaned.split_whitespace().collect();
    let total_chars: usize = words.iter().map(|w| w.chars().count()).sum();
    if total_chars == 0 || duration_ms <= 0.0 {
        return Vec::new();
    }

    let per_char = duration_ms / total_chars as f64;
    let mut hints = Vec::with_capacity(total_chars + words.len());
    let mut t = 0.0;
    for word in words {
        for c in word.chars().flat_map(char::to_lowercase) {
            let weight = if matches!(c, 'a' | 'e' | 'i' | 'o' | 'u') {
                1.2
            } else {
                0.8
            };
            let d = per_char * weight;
            hints.push(PhonemeHint(c.to_uppercase().collect(), t, t + d));
            t += d;
        }
        let gap = per_char * 0.5;
        hints.push(PhonemeHint("_".to_string(), t, t + gap));
        t += gap;
    }
    hints
}

/// Placeholder TTS: silent WAV as long as the text would take to say.
#[derive(Debug, Clone)]
pub struct PlaceholderTts {
    sample_rate: u32,
}

impl Default for PlaceholderTts {
    fn default() -> Self {
        Self { sample_rate: 16000 }
    }
}

impl PlaceholderTts {
    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }
}

#[async_trait]
impl TextToSpeech for PlaceholderTts {
    async fn synthesize(&self, text: &str) -> VoiceResult<SpeechAudio> {
        let text = text.trim();
        if text.is_empty() {
            return Err(VoiceError::Tts("nothing to synthesize".to_string()));
        }
        let duration_ms = text.chars().count() as f64 * MS_PER_CHAR;
        let bytes = silent_wav(duration_ms, self.sample_rate)?;
        Ok(SpeechAudio { bytes, duration_ms })
    }

    fn name(&self) -> &'static str {
        "placeholder"
    }
}

/// OpenAI-compatible `/audio/speech` (OpenAI, OpenRouter, local servers). Picks the
/// Chinese voice when the text contains CJK characters.
#[derive(Debug, Clone)]
pub struct OpenAiTts {
    base_url: String,
    api_key: String,
    model: String,
    voice_en: String,
    voice_zh: String,
    sample_rate: u32,
    client: reqwest::Client,
}

impl OpenAiTts {
    pub fn from_config(cfg: &TtsConfig, sample_rate: u32) -> VoiceResult<Self> {
        let api_key = cfg
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| {
                VoiceError::Config(
                    "TTS requires tts.api_key, OPENAI_API_KEY, or OPENROUTER_API_KEY".to_string(),
                )
            })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .map_err(|e| VoiceError::Tts(e.to_string()))?;
        Ok(Self {
            base_url: cfg.base_url.clone(),
            api_key,
            model: cfg.model.clone(),
            voice_en: cfg.voice_en.clone(),
            voice_zh: cfg.voice_zh.clone(),
            sample_rate,
            client,
        })
    }

    pub fn voice_for(&self, text: &str) -> &str {
        if contains_cjk(text) {
            &self.voice_zh
        } else {
            &self.voice_en
        }
    }
}

#[async_trait]
impl TextToSpeech for OpenAiTts {
    async fn synthesize(&self, text: &str) -> VoiceResult<SpeechAudio> {
        let text = text.trim();
        if text.is_empty() {
            return Err(VoiceError::Tts("nothing to synthesize".to_string()));
        }
        let url = format!("{}/audio/speech", self.base_url.trim_end_matches('/'));
        let voice = self.voice_for(text);
        debug!("TTS voice: {}", voice);
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
            "voice": voice,
            "response_format": "wav",
        });
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| VoiceError::Tts(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(VoiceError::Tts(format!("TTS API error {}: {}", status, body)));
        }
        let bytes = res
            .bytes()
            .await
            .map_err(|e| VoiceError::Tts(e.to_string()))?
            .to_vec();
        if bytes.is_empty() {
            return Err(VoiceError::Tts("empty audio from TTS API".to_string()));
        }
        let duration_ms = estimate_duration_ms(&bytes, text, self.sample_rate);
        Ok(SpeechAudio { bytes, duration_ms })
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}
