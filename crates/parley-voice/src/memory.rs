//! Per-session conversation context for the LLM prompt.
//!
//! A rolling window of recent turns plus a compact digest rebuilt every few exchanges.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;

const DIGEST_LINE_CHARS: usize = 120;
const DIGEST_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    User,
    Assistant,
}

#[derive(Debug, Clone)]
pub struct MemoryTurn {
    pub speaker: Speaker,
    pub text: String,
    pub emotion: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ConversationMemory {
    max_turns: usize,
    digest_interval: usize,
    turns: VecDeque<MemoryTurn>,
    digest: String,
    exchanges_since_digest: usize,
}

impl Default for ConversationMemory {
    fn default() -> Self {
        Self::new(8, 4)
    }
}

impl ConversationMemory {
    pub fn new(max_turns: usize, digest_interval: usize) -> Self {
        Self {
            max_turns: max_turns.max(1),
            digest_interval: digest_interval.max(1),
            turns: VecDeque::new(),
            digest: String::new(),
            exchanges_since_digest: 0,
        }
    }

    pub fn add_user(&mut self, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        self.push(MemoryTurn {
            speaker: Speaker::User,
            text: text.trim().to_string(),
            emotion: None,
            at: Utc::now(),
        });
    }

    /// Record a reply. Completes one exchange; the digest is rebuilt on the interval.
    pub fn add_assistant(&mut self, text: &str, emotion: Option<&str>) {
        if text.trim().is_empty() {
            return;
        }
        self.push(MemoryTurn {
            speaker: Speaker::Assistant,
            text: text.trim().to_string(),
            emotion: emotion.map(str::to_string),
            at: Utc::now(),
        });
        self.exchanges_since_digest += 1;
        if self.exchanges_since_digest >= self.digest_interval {
            self.exchanges_since_digest = 0;
            self.rebuild_digest();
        }
    }

    pub fn turns(&self) -> impl Iterator<Item = &MemoryTurn> {
        self.turns.iter()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Prompt block: digest (if any) then the recent turns. Empty when nothing happened yet.
    pub fn context_block(&self, assistant_name: &str) -> String {
        let mut lines = Vec::new();
        if !self.digest.is_empty() {
            lines.push(format!("[Summary] {}", self.digest));
        }
        if !self.turns.is_empty() {
            lines.push("[Recent conversation]".to_string());
            for turn in &self.turns {
                match turn.speaker {
                    Speaker::User => lines.push(format!("User: {}", turn.text)),
                    Speaker::Assistant => lines.push(format!("{}: {}", assistant_name, turn.text)),
                }
            }
        }
        lines.join("\n")
    }

    fn push(&mut self, turn: MemoryTurn) {
        self.turns.push_back(turn);
        while self.turns.len() > self.max_turns {
            self.turns.pop_front();
        }
    }

    fn rebuild_digest(&mut self) {
        let pieces: Vec<String> = self
            .turns
            .iter()
            .map(|t| {
                let prefix = match t.speaker {
                    Speaker::User => "U:",
                    Speaker::Assistant => "A:",
                };
                truncate_chars(&format!("{}{}", prefix, t.text), DIGEST_LINE_CHARS)
            })
            .collect();
        self.digest = pieces.join(" | ").chars().take(DIGEST_CHARS).collect();
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(3)).collect();
    out.push_str("...");
    out
}
