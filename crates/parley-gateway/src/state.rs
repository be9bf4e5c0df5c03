//! Process-wide gateway state and the `[server]` config section.

use parley_voice::{BackendReport, Backends, LatencyMetrics, SessionFactory, VoiceConfig};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

pub struct AppState {
    pub sessions: SessionFactory,
    pub backends: BackendReport,
    pub metrics_recent: usize,
    pub started_at: Instant,
    active_connections: AtomicUsize,
}

impl AppState {
    /// Resolve backends and build the session factory around one shared metrics recorder.
    pub fn from_config(cfg: &VoiceConfig) -> Arc<Self> {
        let metrics = Arc::new(LatencyMetrics::new(cfg.metrics.window));
        let (backends, report) = Backends::resolve(cfg);
        Arc::new(Self {
            sessions: SessionFactory::new(cfg, backends, metrics),
            backends: report,
            metrics_recent: cfg.metrics.recent,
            started_at: Instant::now(),
            active_connections: AtomicUsize::new(0),
        })
    }

    pub fn metrics(&self) -> &Arc<LatencyMetrics> {
        self.sessions.metrics()
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn connection_opened(&self) -> usize {
        self.active_connections.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn connection_closed(&self) -> usize {
        self.active_connections
            .fetch_sub(1, Ordering::Relaxed)
            .saturating_sub(1)
    }
}
