//! Local knowledge base: JSON/CSV fact records matched against the user's words and
//! rendered into the prompt as facts the reply must stick to.
//!
//! Scoring: a verbatim hit scores 100, otherwise the number of
//! shared tokens (lowercase ASCII words plus CJK bigrams).

use crate::error::VoiceResult;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Score for a record whose text contains the whole query.
const VERBATIM_SCORE: f64 = 100.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KnowledgeConfig {
    /// Directory scanned recursively for `.json` and `.csv` files. Unset disables lookup.
    pub data_dir: Option<String>,

    /// Facts injected per prompt (default: 3)
    pub top_k: usize,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            top_k: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KnowledgeRecord {
    pub id: String,
    pub title: String,
    pub text: String,
    pub tags: Vec<String>,
    pub meta: serde_json::Value,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KnowledgeHit {
    pub record: KnowledgeRecord,
    pub score: f64,
    pub snippet: String,
}

#[derive(Debug, Clone, Default)]
pub struct KnowledgeBase {
    records: Vec<KnowledgeRecord>,
}

impl KnowledgeBase {
    pub fn new(records: Vec<KnowledgeRecord>) -> Self {
        Self { records }
    }

    /// Load the configured directory. Returns `None` when lookup is disabled or the
    /// directory cannot be read; the conversation then runs without facts.
    pub fn from_config(cfg: &KnowledgeConfig) -> Option<Arc<Self>> {
        let dir = cfg.data_dir.as_deref()?;
        match Self::load_dir(dir) {
            Ok(kb) => Some(Arc::new(kb)),
            Err(e) => {
                warn!("📚 Knowledge base at {} unavailable: {}", dir, e);
                None
            }
        }
    }

    /// Recursively load every `.json` and `.csv` file under `dir`. Unreadable files
    /// are skipped with a warning.
    pub fn load_dir(dir: impl AsRef<Path>) -> VoiceResult<Self> {
        let dir = dir.as_ref();
        let mut records = Vec::new();
        for entry in walkdir::WalkDir::new(dir).sort_by_file_name() {
            let entry = entry.map_err(std::io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let extension = path
                .extension()
                .and_then(|e| e.to_str())
                .map(str::to_ascii_lowercase);
            let loaded = match extension.as_deref() {
                Some("json") => std::fs::read_to_string(path)
                    .map_err(Into::into)
                    .and_then(|raw| parse_json(&raw, path)),
                Some("csv") => std::fs::File::open(path)
                    .map_err(Into::into)
                    .and_then(|file| parse_csv(file, path)),
                _ => continue,
            };
            match loaded {
                Ok(mut found) => records.append(&mut found),
                Err(e) => warn!("📚 Failed to read {}: {}", path.display(), e),
            }
        }
        info!("📚 Loaded {} knowledge records from {}", records.len(), dir.display());
        Ok(Self { records })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Best `top_k` records with a positive score, highest first. Ties keep load order.
    pub fn search(&self, query: &str, top_k: usize) -> Vec<KnowledgeHit> {
        let mut scored: Vec<(f64, &KnowledgeRecord)> = self
            .records
            .iter()
            .map(|record| (score(query, &record.text), record))
            .filter(|(score, _)| *score > 0.0)
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));

        scored
            .into_iter()
            .take(top_k)
            .map(|(score, record)| KnowledgeHit {
                snippet: snippet(&record.text, query),
                score,
                record: record.clone(),
            })
            .collect()
    }

    /// Prompt block listing the matching facts, or an empty string when nothing matches.
    pub fn facts_block(&self, query: &str, top_k: usize) -> String {
        let hits = self.search(query, top_k);
        if hits.is_empty() {
            return String::new();
        }
        let facts: Vec<String> = hits
            .iter()
            .map(|hit| format!("- {}: {}", hit.record.title, hit.snippet))
            .collect();
        format!(
            "[STRICT FACTS]\n{}\n\nRules:\n\
             - Base the answer strictly on the facts above. Never guess or invent details, especially prices and dates.\n\
             - If the facts are not enough, answer briefly and ask one natural clarifying question.\n\
             - Keep it conversational, 1-2 sentences.",
            facts.join("\n")
        )
    }
}

fn is_cjk(c: char) -> bool {
    ('\u{4e00}'..='\u{9fff}').contains(&c)
}

fn tokens(text: &str) -> HashSet<String> {
    let mut out: HashSet<String> = text
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_ascii_lowercase)
        .collect();
    let cjk: Vec<char> = text.chars().filter(|c| is_cjk(*c)).collect();
    out.extend(cjk.windows(2).map(|pair| pair.iter().collect::<String>()));
    out
}

fn score(query: &str, text: &str) -> f64 {
    let query = query.trim();
    if query.is_empty() || text.is_empty() {
        return 0.0;
    }
    if text.contains(query) {
        return VERBATIM_SCORE;
    }
    let query_tokens = tokens(query);
    let text_tokens = tokens(text);
    query_tokens.intersection(&text_tokens).count() as f64
}

/// Text around the verbatim match (30 chars before, 60 after), else the first 90 chars.
fn snippet(text: &str, query: &str) -> String {
    let query = query.trim();
    let found = if query.is_empty() { None } else { text.find(query) };
    match found {
        Some(byte_pos) => {
            let pos = text[..byte_pos].chars().count();
            let start = pos.saturating_sub(30);
            let len = pos - start + query.chars().count() + 60;
            text.chars().skip(start).take(len).collect()
        }
        None => text.chars().take(90).collect(),
    }
}

fn default_title(title: &str, text: &str) -> String {
    if !title.is_empty() || text.is_empty() {
        return title.to_string();
    }
    if text.chars().count() > 43 {
        format!("{}...", text.chars().take(40).collect::<String>())
    } else {
        text.to_string()
    }
}

fn value_str(value: Option<&serde_json::Value>) -> String {
    match value {
        Some(serde_json::Value::String(s)) => s.trim().to_string(),
        Some(serde_json::Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// A JSON file holds one record object or an array of them; non-object entries are skipped.
pub fn parse_json(raw: &str, path: &Path) -> VoiceResult<Vec<KnowledgeRecord>> {
    let rows = match serde_json::from_str::<serde_json::Value>(raw)? {
        serde_json::Value::Array(rows) => rows,
        single => vec![single],
    };
    let name = file_name(path);

    Ok(rows
        .iter()
        .enumerate()
        .filter_map(|(i, row)| {
            let row = row.as_object()?;
            let text = match value_str(row.get("text")) {
                t if t.is_empty() => value_str(row.get("content")),
                t => t,
            };
            let title = default_title(&value_str(row.get("title")), &text);
            let id = match value_str(row.get("id")) {
                id if id.is_empty() => format!("json:{}:{}", name, i),
                id => id,
            };
            let tags = row
                .get("tags")
                .and_then(|t| t.as_array())
                .map(|tags| tags.iter().map(|t| value_str(Some(t))).collect())
                .unwrap_or_default();
            Some(KnowledgeRecord {
                id,
                title,
                text,
                tags,
                meta: row.get("meta").cloned().unwrap_or_else(|| serde_json::json!({})),
                source: path.display().to_string(),
            })
        })
        .collect())
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CsvRow {
    id: Option<String>,
    title: Option<String>,
    text: Option<String>,
    content: Option<String>,
    tags: Option<String>,
    meta: Option<String>,
}

/// CSV with a header row: `id,title,text|content,tags,meta`. Tags are comma separated,
/// `meta` is JSON (kept as `{"raw": ...}` when it does not parse).
pub fn parse_csv(reader: impl std::io::Read, path: &Path) -> VoiceResult<Vec<KnowledgeRecord>> {
    let name = file_name(path);
    let mut records = Vec::new();
    for (i, row) in csv::Reader::from_reader(reader).deserialize::<CsvRow>().enumerate() {
        let row = row?;
        let trimmed = |v: &Option<String>| v.as_deref().unwrap_or("").trim().to_string();
        let text = match trimmed(&row.text) {
            t if t.is_empty() => trimmed(&row.content),
            t => t,
        };
        let meta_raw = trimmed(&row.meta);
        let meta = if meta_raw.is_empty() {
            serde_json::json!({})
        } else {
            serde_json::from_str(&meta_raw).unwrap_or_else(|_| serde_json::json!({ "raw": meta_raw }))
        };
        records.push(KnowledgeRecord {
            id: match trimmed(&row.id) {
                id if id.is_empty() => format!("csv:{}:{}", name, i),
                id => id,
            },
            title: default_title(&trimmed(&row.title), &text),
            tags: trimmed(&row.tags)
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect(),
            text,
            meta,
            source: path.display().to_string(),
        });
    }
    Ok(records)
}
