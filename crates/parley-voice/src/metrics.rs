//! Process-wide per-stage latency telemetry.
//!
//! One `LatencyMetrics` is created at startup and injected into every session. Each
//! stage keeps a fixed-capacity FIFO ring of recent millisecond samples.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/// Default samples retained per stage.
pub const DEFAULT_WINDOW: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LatencyStage {
    Vad,
    Stt,
    Llm,
    Tts,
    Total,
}

impl LatencyStage {
    pub const ALL: [LatencyStage; 5] = [
        LatencyStage::Vad,
        LatencyStage::Stt,
        LatencyStage::Llm,
        LatencyStage::Tts,
        LatencyStage::Total,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LatencyStage::Vad => "vad",
            LatencyStage::Stt => "stt",
            LatencyStage::Llm => "llm",
            LatencyStage::Tts => "tts",
            LatencyStage::Total => "total",
        }
    }

    fn index(&self) -> usize {
        match self {
            LatencyStage::Vad => 0,
            LatencyStage::Stt => 1,
            LatencyStage::Llm => 2,
            LatencyStage::Tts => 3,
            LatencyStage::Total => 4,
        }
    }
}

/// Aggregate over the samples currently retained. All zero when empty.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StageStats {
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub count: usize,
}

/// Stats plus the newest samples, as served on the metrics surface.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageSnapshot {
    #[serde(flatten)]
    pub stats: StageStats,
    pub recent: Vec<f64>,
}

/// FIFO ring of the last `capacity` samples.
#[derive(Debug, Clone)]
pub struct LatencyRing {
    capacity: usize,
    samples: VecDeque<f64>,
}

impl LatencyRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, millis: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(millis);
    }

    pub fn stats(&self) -> StageStats {
        if self.samples.is_empty() {
            return StageStats::default();
        }
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut sum = 0.0;
        for &s in &self.samples {
            min = min.min(s);
            max = max.max(s);
            sum += s;
        }
        StageStats {
            avg: sum / self.samples.len() as f64,
            min,
            max,
            count: self.samples.len(),
        }
    }

    /// Newest `n` samples, oldest first.
    pub fn recent(&self, n: usize) -> Vec<f64> {
        let skip = self.samples.len().saturating_sub(n);
        self.samples.iter().skip(skip).copied().collect()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Shared latency recorder. Writers from many turns and sessions, readers from the
/// health/metrics surfaces; each stage has its own lock.
pub struct LatencyMetrics {
    rings: [RwLock<LatencyRing>; 5],
}

impl Default for LatencyMetrics {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl LatencyMetrics {
    pub fn new(window: usize) -> Self {
        Self {
            rings: std::array::from_fn(|_| RwLock::new(LatencyRing::new(window))),
        }
    }

    pub fn record(&self, stage: LatencyStage, millis: f64) {
        if !millis.is_finite() || millis < 0.0 {
            return;
        }
        self.rings[stage.index()].write().push(millis);
    }

    pub fn stats(&self, stage: LatencyStage) -> StageStats {
        self.rings[stage.index()].read().stats()
    }

    pub fn recent(&self, stage: LatencyStage, n: usize) -> Vec<f64> {
        self.rings[stage.index()].read().recent(n)
    }

    /// Stats for every stage, keyed by stage name.
    pub fn all_stats(&self) -> BTreeMap<&'static str, StageStats> {
        LatencyStage::ALL
            .iter()
            .map(|stage| (stage.as_str(), self.stats(*stage)))
            .collect()
    }

    /// Stats plus the newest `recent` samples for every stage.
    pub fn snapshot(&self, recent: usize) -> BTreeMap<&'static str, StageSnapshot> {
        LatencyStage::ALL
            .iter()
            .map(|stage| {
                let ring = self.rings[stage.index()].read();
                (
                    stage.as_str(),
                    StageSnapshot {
                        stats: ring.stats(),
                        recent: ring.recent(recent),
                    },
                )
            })
            .collect()
    }
}
