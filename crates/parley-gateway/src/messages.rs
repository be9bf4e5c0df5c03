//! Inbound WebSocket messages. Outbound events live in `parley_voice::events`.

use base64::Engine as _;
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IncomingMessage {
    /// Typed input; starts a turn directly.
    UserInput { text: String },
    /// Base64 PCM16LE audio, for clients that cannot send binary frames.
    AudioChunk { data: String },
}

impl IncomingMessage {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

pub fn decode_audio_chunk(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    base64::engine::general_purpose::STANDARD.decode(data.trim())
}
