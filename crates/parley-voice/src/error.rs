//! Error types for the Parley voice engine

use thiserror::Error;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur while segmenting audio or running a turn.
///
/// Stage failures (`Stt`, `Tts`, `Llm`, `GenerationTimeout`) are caught at the turn
/// boundary and never end a session; only `Transport` does.
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("VAD initialization failed: {0}")]
    VadInit(String),

    #[error("VAD processing error: {0}")]
    VadProcessing(String),

    #[error("Audio format error: {0}")]
    AudioFormat(String),

    #[error("Channel send error: {0}")]
    ChannelSend(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("STT error: {0}")]
    Stt(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("LLM generation exceeded {0} ms")]
    GenerationTimeout(u64),

    #[error("Invalid LLM reply: {0}")]
    InvalidReply(String),

    #[error("TTS error: {0}")]
    Tts(String),

    #[error("Turn cancelled")]
    Cancelled,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VoiceError {
    /// Whether this error ends only the current turn (session keeps running).
    pub fn is_stage_failure(&self) -> bool {
        !matches!(self, VoiceError::Transport(_) | VoiceError::Config(_))
    }
}

impl From<config::ConfigError> for VoiceError {
    fn from(err: config::ConfigError) -> Self {
        VoiceError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_faults_are_not_stage_failures() {
        assert!(!VoiceError::Transport("closed".into()).is_stage_failure());
        assert!(VoiceError::Stt("503".into()).is_stage_failure());
        assert!(VoiceError::GenerationTimeout(50).is_stage_failure());
    }
}
