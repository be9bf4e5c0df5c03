//! Outbound events, serialized as JSON objects tagged by `type`.

use crate::llm::{AgentReply, Emote, Gesture, PhonemeHint};
use serde::{Deserialize, Serialize};

/// Coarse session phase reported to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    Idle,
    Listening,
    Thinking,
    Speaking,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundEvent {
    State {
        state: SessionPhase,
    },
    Transcript {
        turn_id: u64,
        text: String,
    },
    Emotion {
        turn_id: u64,
        emotion: Emote,
    },
    Gesture {
        turn_id: u64,
        gesture: Gesture,
    },
    Audio {
        turn_id: u64,
        text: String,
        /// Base64-encoded WAV.
        audio: String,
        duration_ms: f64,
        phoneme_hints: Vec<PhonemeHint>,
    },
    TurnComplete {
        turn_id: u64,
        response: AgentReply,
        llm_latency_ms: f64,
        total_latency_ms: f64,
    },
    /// The client should stop playing audio from `turn_id`.
    Interrupted {
        turn_id: u64,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        turn_id: Option<u64>,
        message: String,
    },
}

impl OutboundEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundEvent::State { .. } => "state",
            OutboundEvent::Transcript { .. } => "transcript",
            OutboundEvent::Emotion { .. } => "emotion",
            OutboundEvent::Gesture { .. } => "gesture",
            OutboundEvent::Audio { .. } => "audio",
            OutboundEvent::TurnComplete { .. } => "turn_complete",
            OutboundEvent::Interrupted { .. } => "interrupted",
            OutboundEvent::Error { .. } => "error",
        }
    }

    pub fn error(turn_id: Option<u64>, message: impl Into<String>) -> Self {
        OutboundEvent::Error {
            turn_id,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{fallback_reply, Emotion};

    #[test]
    fn test_emotion_event_shape() {
        let event = OutboundEvent::Emotion {
            turn_id: 3,
            emotion: fallback_reply().emote,
        };
        let json: serde_json::Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "emotion");
        assert_eq!(json["emotion"]["type"], "sad");
        assert_eq!(json["turn_id"], 3);
    }

    #[test]
    fn test_kind_matches_tag() {
        let events = [
            OutboundEvent::State {
                state: SessionPhase::Listening,
            },
            OutboundEvent::Gesture {
                turn_id: 1,
                gesture: Gesture::ShakeHead,
            },
            OutboundEvent::Interrupted { turn_id: 1 },
            OutboundEvent::error(None, "boom"),
        ];
        for event in events {
            let json = serde_json::to_value(&event).unwrap();
            assert_eq!(json["type"], event.kind());
        }
        let json = serde_json::to_value(OutboundEvent::Gesture {
            turn_id: 1,
            gesture: Gesture::ShakeHead,
        })
        .unwrap();
        assert_eq!(json["gesture"], "shake_head");
        assert_eq!(Emotion::from_label("JOY"), Emotion::Joy);
    }
}
