//! # Parley Voice - real-time turn-taking engine
//!
//! Continuous PCM audio in, spoken replies out, with barge-in.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────── Session ─────────────────────────────┐
//! │                                                                    │
//! │  bytes → FrameAssembler → FrameQueue → SpeechSegmenter (VAD)      │
//! │            (drop-oldest)                   │            │          │
//! │                               speech-started       utterance       │
//! │                                     │                   ↓          │
//! │                              cancel active ──→ TurnOrchestrator    │
//! │                                                STT → LLM → TTS     │
//! │                                                        ↓           │
//! │                               OutboundEvent stream → transport     │
//! └────────────────────────────────────────────────────────────────────┘
//!            LatencyMetrics (process-wide, injected) ← every stage
//! ```

pub mod audio;
pub mod config;
pub mod engines;
pub mod error;
pub mod events;
pub mod frame_queue;
pub mod knowledge;
pub mod llm;
pub mod memory;
pub mod metrics;
pub mod segmenter;
pub mod session;
pub mod stt;
pub mod tts;
pub mod turn;
pub mod vad;

pub use audio::{encode_wav, AudioFormat, AudioFrame, FrameAssembler, Utterance};
pub use config::{
    LlmEngine, SessionConfig, SttEngine, TtsEngine, VadEngine, VoiceConfig,
};
pub use engines::{BackendReport, Backends, Resolution};
pub use error::{VoiceError, VoiceResult};
pub use events::{OutboundEvent, SessionPhase};
pub use frame_queue::{FrameQueue, PushOutcome};
pub use knowledge::{KnowledgeBase, KnowledgeConfig, KnowledgeHit, KnowledgeRecord};
pub use llm::{
    fallback_reply, AgentReply, Emote, Emotion, Gesture, Intent, LanguageModel, OpenAiChatLlm,
    PhonemeHint, Prompt, PromptBuilder, ScriptedLlm,
};
pub use memory::ConversationMemory;
pub use metrics::{LatencyMetrics, LatencyStage, StageSnapshot, StageStats};
pub use segmenter::{SegmentEvent, SegmenterConfig, SpeechSegmenter};
pub use session::{Session, SessionFactory};
pub use stt::{OpenAiStt, PlaceholderStt, SpeechToText};
#[cfg(feature = "whisper")]
pub use stt::WhisperStt;
pub use tts::{OpenAiTts, PlaceholderTts, SpeechAudio, TextToSpeech};
pub use turn::{TurnHandle, TurnInput, TurnOrchestrator, TurnPhase};
pub use vad::{EnergyVad, VoiceActivity, WebRtcVad};
