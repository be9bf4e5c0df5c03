//! Response generation: prompt assembly, LLM backends and reply validation.
//!
//! Every backend returns a validated `AgentReply`. Anything that does not conform to
//! the reply schema is a generation failure; the turn then answers with
//! [`fallback_reply`].

use crate::config::LlmConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::knowledge::KnowledgeBase;
use crate::memory::ConversationMemory;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const MAX_UTTERANCE_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Emotion {
    Joy,
    Sad,
    Anger,
    Surprise,
    Neutral,
    Excited,
    Confused,
    Embarrassed,
    Determined,
    Relaxed,
}

impl Emotion {
    /// Parse a model-supplied label; unknown labels become `Neutral`.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "joy" => Emotion::Joy,
            "sad" => Emotion::Sad,
            "anger" => Emotion::Anger,
            "surprise" => Emotion::Surprise,
            "excited" => Emotion::Excited,
            "confused" => Emotion::Confused,
            "embarrassed" => Emotion::Embarrassed,
            "determined" => Emotion::Determined,
            "relaxed" => Emotion::Relaxed,
            _ => Emotion::Neutral,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Emotion::Joy => "joy",
            Emotion::Sad => "sad",
            Emotion::Anger => "anger",
            Emotion::Surprise => "surprise",
            Emotion::Neutral => "neutral",
            Emotion::Excited => "excited",
            Emotion::Confused => "confused",
            Emotion::Embarrassed => "embarrassed",
            Emotion::Determined => "determined",
            Emotion::Relaxed => "relaxed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Intent {
    SmallTalk,
    Answer,
    Ask,
    Joke,
    ToolUse,
}

impl Intent {
    /// Unknown labels are treated as small talk.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_uppercase().as_str() {
            "ANSWER" => Intent::Answer,
            "ASK" => Intent::Ask,
            "JOKE" => Intent::Joke,
            "TOOL_USE" => Intent::ToolUse,
            _ => Intent::SmallTalk,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gesture {
    None,
    Wave,
    Nod,
    ShakeHead,
    Think,
    Celebrate,
}

impl Gesture {
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "wave" => Gesture::Wave,
            "nod" => Gesture::Nod,
            "shake_head" => Gesture::ShakeHead,
            "think" => Gesture::Think,
            "celebrate" => Gesture::Celebrate,
            _ => Gesture::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Emote {
    #[serde(rename = "type")]
    pub kind: Emotion,
    pub intensity: f32,
}

/// `[phoneme, start_ms, end_ms]` lip-sync timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhonemeHint(pub String, pub f64, pub f64);

/// Validated structured response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentReply {
    pub utterance: String,
    pub emote: Emote,
    pub intent: Intent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gesture: Option<Gesture>,
    #[serde(default)]
    pub phoneme_hints: Vec<PhonemeHint>,
}

impl AgentReply {
    /// Gesture worth signaling, i.e. present and not `none`.
    pub fn visible_gesture(&self) -> Option<Gesture> {
        self.gesture.filter(|g| *g != Gesture::None)
    }
}

/// Reply used whenever generation fails (timeout, transport error, invalid output).
pub fn fallback_reply() -> AgentReply {
    AgentReply {
        utterance: "I'm having trouble thinking right now. Can you try again?".to_string(),
        emote: Emote {
            kind: Emotion::Sad,
            intensity: 0.3,
        },
        intent: Intent::SmallTalk,
        gesture: None,
        phoneme_hints: Vec::new(),
    }
}

// -----------------------------------------------------------------------------
// Reply parsing
// -----------------------------------------------------------------------------

/// Parse raw model output into a reply. Accepts bare JSON, fenced JSON, or prose
/// wrapped around a single JSON object.
pub fn parse_reply(raw: &str) -> VoiceResult<AgentReply> {
    let body = strip_code_fence(raw);
    let value: Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(_) => {
            let start = body.find('{');
            let end = body.rfind('}');
            match (start, end) {
                (Some(s), Some(e)) if s < e => serde_json::from_str(&body[s..=e])
                    .map_err(|e| VoiceError::InvalidReply(format!("not JSON: {}", e)))?,
                _ => {
                    return Err(VoiceError::InvalidReply(
                        "no JSON object in model output".to_string(),
                    ))
                }
            }
        }
    };
    validate_reply(&value)
}

/// Check required fields and normalize the rest.
pub fn validate_reply(value: &Value) -> VoiceResult<AgentReply> {
    let obj = value
        .as_object()
        .ok_or_else(|| VoiceError::InvalidReply("reply is not an object".to_string()))?;

    let utterance = obj
        .get("utterance")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| VoiceError::InvalidReply("missing field: utterance".to_string()))?;

    let emote = obj
        .get("emote")
        .ok_or_else(|| VoiceError::InvalidReply("missing field: emote".to_string()))?;
    let (kind, intensity) = match emote {
        Value::Object(e) => (
            e.get("type").and_then(Value::as_str).unwrap_or("neutral"),
            e.get("intensity").and_then(Value::as_f64).unwrap_or(0.5),
        ),
        Value::String(label) => (label.as_str(), 0.5),
        _ => return Err(VoiceError::InvalidReply("emote has wrong shape".to_string())),
    };

    let intent = obj
        .get("intent")
        .and_then(Value::as_str)
        .ok_or_else(|| VoiceError::InvalidReply("missing field: intent".to_string()))?;

    let gesture = obj
        .get("gesture")
        .and_then(Value::as_str)
        .map(Gesture::from_label);

    let phoneme_hints = obj
        .get("phoneme_hints")
        .and_then(Value::as_array)
        .map(|hints| {
            hints
                .iter()
                .filter_map(|h| serde_json::from_value::<PhonemeHint>(h.clone()).ok())
                .collect()
        })
        .unwrap_or_default();

    Ok(AgentReply {
        utterance: utterance.chars().take(MAX_UTTERANCE_CHARS).collect(),
        emote: Emote {
            kind: Emotion::from_label(kind),
            intensity: (intensity as f32).clamp(0.0, 1.0),
        },
        intent: Intent::from_label(intent),
        gesture,
        phoneme_hints,
    })
}

fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string (```json) up to the first newline.
    let rest = match rest.find('\n') {
        Some(i) => &rest[i + 1..],
        None => rest,
    };
    rest.trim_end().trim_end_matches("```").trim()
}

// -----------------------------------------------------------------------------
// Utterance cleaning
// -----------------------------------------------------------------------------

static EMOJI: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(
        "[\u{1F600}-\u{1F64F}\u{1F300}-\u{1F5FF}\u{1F680}-\u{1F6FF}\u{1F1E0}-\u{1F1FF}\u{1F900}-\u{1F9FF}\u{1FA70}-\u{1FAFF}]+",
    )
    .ok()
});

static KAOMOJI: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"\([*^_~=><]+[^)]*\)").ok());

static SYMBOL_RUN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(^|\s)[\^_~=><]{2,}(\s|$)").ok());

static WHITESPACE: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"\s+").ok());

/// Remove emoji and emoticons so TTS does not read them aloud. Returns the original
/// text if cleaning would leave nothing.
pub fn clean_utterance(text: &str) -> String {
    let mut out = text.to_string();
    for (re, with) in [(&EMOJI, ""), (&KAOMOJI, ""), (&SYMBOL_RUN, "$1$2"), (&WHITESPACE, " ")] {
        if let Some(re) = re.as_ref() {
            out = re.replace_all(&out, with).into_owned();
        }
    }
    let out = out.trim();
    if out.is_empty() && !text.trim().is_empty() {
        warn!("Utterance was emptied by cleaning, keeping original");
        return text.trim().to_string();
    }
    out.to_string()
}

// -----------------------------------------------------------------------------
// Prompt
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    English,
    Chinese,
}

impl Language {
    pub fn name(&self) -> &'static str {
        match self {
            Language::English => "English",
            Language::Chinese => "Chinese",
        }
    }
}

pub fn contains_cjk(text: &str) -> bool {
    text.chars().any(|c| ('\u{4e00}'..='\u{9fff}').contains(&c))
}

pub fn detect_language(text: &str) -> Language {
    if contains_cjk(text) {
        Language::Chinese
    } else {
        Language::English
    }
}

/// Input to one generation.
#[derive(Debug, Clone)]
pub struct Prompt {
    pub system: String,
    pub user: String,
    pub language: Language,
}

const REPLY_SCHEMA: &str = r#"You must respond with valid JSON matching this exact format:
{
  "utterance": "your response text here (max 500 chars)",
  "emote": {
    "type": "joy|sad|anger|surprise|neutral|excited|confused|embarrassed|determined|relaxed",
    "intensity": 0.0-1.0
  },
  "intent": "SMALL_TALK|ANSWER|ASK|JOKE|TOOL_USE",
  "gesture": "none|wave|nod|shake_head|think|celebrate",
  "phoneme_hints": []
}

Gesture guide:
- wave: greetings
- nod: agreement or understanding
- shake_head: disagreement or confusion
- think: pondering
- celebrate: excitement or achievement

Rules:
- Plain text only in utterance. No emojis or emoticons; they are read aloud.
- Express emotion through words and the "emote" field.
- Keep utterance short (1-2 sentences). This is a voice conversation."#;

#[derive(Debug, Clone)]
pub struct PromptBuilder {
    character_name: String,
    personality: String,
    knowledge: Option<Arc<KnowledgeBase>>,
    knowledge_top_k: usize,
}

impl PromptBuilder {
    pub fn new(character_name: impl Into<String>, personality: impl Into<String>) -> Self {
        Self {
            character_name: character_name.into(),
            personality: personality.into(),
            knowledge: None,
            knowledge_top_k: 3,
        }
    }

    pub fn from_config(cfg: &LlmConfig) -> Self {
        Self::new(cfg.character_name.clone(), cfg.personality.clone())
    }

    /// Ground replies in the best `top_k` matching facts for each user message.
    pub fn with_knowledge(mut self, knowledge: Option<Arc<KnowledgeBase>>, top_k: usize) -> Self {
        self.knowledge = knowledge;
        self.knowledge_top_k = top_k;
        self
    }

    pub fn character_name(&self) -> &str {
        &self.character_name
    }

    pub fn build(&self, user_text: &str, memory: &ConversationMemory) -> Prompt {
        let language = detect_language(user_text);
        let context = memory.context_block(&self.character_name);
        let context = if context.is_empty() {
            String::new()
        } else {
            format!("\n{}\n", context)
        };
        let facts = self
            .knowledge
            .as_ref()
            .map(|kb| kb.facts_block(user_text, self.knowledge_top_k))
            .filter(|block| !block.is_empty())
            .map(|block| format!("\n{}\n", block))
            .unwrap_or_default();

        let system = format!(
            "You are {name}, {personality}.\n\n\
             LANGUAGE RULE: The user is speaking {lang}. Respond ONLY in {lang}. Never mix languages.\n\
             {context}{facts}\n\
             {schema}\n\n\
             Respond as {name} in JSON format.",
            name = self.character_name,
            personality = self.personality,
            lang = language.name(),
            context = context,
            facts = facts,
            schema = REPLY_SCHEMA,
        );

        Prompt {
            system,
            user: user_text.to_string(),
            language,
        }
    }
}

// -----------------------------------------------------------------------------
// Backends
// -----------------------------------------------------------------------------

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn generate(&self, prompt: &Prompt) -> VoiceResult<AgentReply>;

    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Category {
    Greeting,
    Question,
    Positive,
    Negative,
    Thanks,
    Default,
}

fn categorize(text: &str) -> Category {
    let lower = text.to_lowercase();
    let has = |words: &[&str]| words.iter().any(|w| lower.contains(w));
    if has(&["你好", "您好", "嗨", "hello", "hey"]) || lower.split_whitespace().any(|w| w.trim_matches(|c: char| !c.is_alphanumeric()) == "hi") {
        Category::Greeting
    } else if has(&["吗", "什么", "怎么", "为什么", "?", "？", "what", "how", "why"]) {
        Category::Question
    } else if has(&["谢谢", "感谢", "thank"]) {
        Category::Thanks
    } else if has(&["难过", "伤心", "糟糕", "生气", "sad", "bad", "angry"]) {
        Category::Negative
    } else if has(&["棒", "开心", "高兴", "喜欢", "good", "great", "happy", "love"]) {
        Category::Positive
    } else {
        Category::Default
    }
}

type Canned = (&'static str, Emotion, f32, Intent, Gesture);

fn canned(category: Category, language: Language) -> &'static [Canned] {
    use Emotion::*;
    use Gesture as G;
    use Intent::*;
    match (category, language) {
        (Category::Greeting, Language::English) => &[
            ("Hello! How can I help you today?", Joy, 0.8, SmallTalk, G::Wave),
            ("Hi there! Great to see you! What's on your mind?", Joy, 0.9, SmallTalk, G::Wave),
        ],
        (Category::Greeting, Language::Chinese) => &[
            ("你好呀！很高兴见到你！有什么我可以帮你的吗？", Joy, 0.9, SmallTalk, G::Wave),
            ("嗨！见到你真开心！今天过得怎么样？", Joy, 0.8, SmallTalk, G::Wave),
        ],
        (Category::Question, Language::English) => &[
            ("That's a really interesting question! Let me think about that.", Surprise, 0.6, Answer, G::Think),
            ("Great question! I love when you ask me things like that!", Joy, 0.7, Answer, G::Nod),
        ],
        (Category::Question, Language::Chinese) => &[
            ("这个问题很有意思！让我想想。", Neutral, 0.6, Answer, G::Think),
            ("嗯，我觉得这要看具体情况！你觉得呢？", Neutral, 0.5, Ask, G::Think),
        ],
        (Category::Positive, Language::English) => &[
            ("That's wonderful! I'm so happy for you!", Joy, 0.9, SmallTalk, G::Celebrate),
            ("Amazing! That sounds really exciting!", Excited, 0.8, SmallTalk, G::Celebrate),
        ],
        (Category::Positive, Language::Chinese) => &[
            ("太好了！我真为你高兴！", Joy, 0.95, SmallTalk, G::Celebrate),
        ],
        (Category::Negative, Language::English) => &[
            ("Oh no, I'm sorry to hear that. Is there anything I can do?", Sad, 0.6, Ask, G::None),
        ],
        (Category::Negative, Language::Chinese) => &[
            ("别太难过了，我一直在这里陪着你。", Sad, 0.6, SmallTalk, G::None),
        ],
        (Category::Thanks, Language::English) => &[
            ("You're very welcome! Always happy to help!", Joy, 0.8, SmallTalk, G::Nod),
        ],
        (Category::Thanks, Language::Chinese) => &[
            ("不客气！我很乐意帮忙的！", Joy, 0.8, SmallTalk, G::Nod),
        ],
        (Category::Default, Language::English) => &[
            ("I see! Tell me more, I'm curious!", Neutral, 0.5, Ask, G::Nod),
            ("That's interesting! I hadn't thought about it that way.", Surprise, 0.5, SmallTalk, G::Think),
        ],
        (Category::Default, Language::Chinese) => &[
            ("原来如此！跟我说说更多吧！", Neutral, 0.6, Ask, G::Nod),
            ("有意思！我之前没这样想过呢。", Surprise, 0.6, SmallTalk, G::Think),
        ],
    }
}

/// Deterministic canned replies chosen by keyword category and language, rotating
/// within a category. Optional delay simulates model latency.
#[derive(Debug, Default)]
pub struct ScriptedLlm {
    delay: Duration,
    counter: AtomicUsize,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            counter: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl LanguageModel for ScriptedLlm {
    async fn generate(&self, prompt: &Prompt) -> VoiceResult<AgentReply> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let choices = canned(categorize(&prompt.user), prompt.language);
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let (text, kind, intensity, intent, gesture) = choices[n % choices.len()];
        Ok(AgentReply {
            utterance: text.to_string(),
            emote: Emote { kind, intensity },
            intent,
            gesture: Some(gesture),
            phoneme_hints: Vec::new(),
        })
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

/// OpenAI-compatible chat completions in JSON mode (OpenAI, OpenRouter, Ollama `/v1`).
#[derive(Debug, Clone)]
pub struct OpenAiChatLlm {
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
    client: reqwest::Client,
}

impl OpenAiChatLlm {
    pub fn from_config(cfg: &LlmConfig) -> VoiceResult<Self> {
        let api_key = cfg
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| {
                VoiceError::Config(
                    "LLM requires llm.api_key, OPENAI_API_KEY, or OPENROUTER_API_KEY".to_string(),
                )
            })?;
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| VoiceError::Llm(e.to_string()))?;
        Ok(Self {
            base_url: cfg.base_url.clone(),
            api_key,
            model: cfg.model.clone(),
            temperature: cfg.temperature,
            max_tokens: cfg.max_tokens,
            client,
        })
    }
}

#[async_trait]
impl LanguageModel for OpenAiChatLlm {
    async fn generate(&self, prompt: &Prompt) -> VoiceResult<AgentReply> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": prompt.system },
                { "role": "user", "content": prompt.user },
            ],
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
            "response_format": { "type": "json_object" },
        });

        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| VoiceError::Llm(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(VoiceError::Llm(format!("LLM API error {}: {}", status, body)));
        }

        let json: Value = res
            .json()
            .await
            .map_err(|e| VoiceError::Llm(e.to_string()))?;
        let content = json
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| VoiceError::InvalidReply("response has no message content".to_string()))?;
        debug!("LLM raw output: {}", content);
        parse_reply(content)
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}
