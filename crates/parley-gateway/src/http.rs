//! HTTP surfaces: health, latency metrics, runtime audio tuning and standalone synthesis.

use crate::state::AppState;
use axum::{
    extract::State,
    http::{header, HeaderName, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use parley_voice::{SegmenterConfig, VoiceError};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

/// JSON error body `{"error": "..."}` with a status code.
pub struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "error": self.1 }))).into_response()
    }
}

impl From<VoiceError> for ApiError {
    fn from(err: VoiceError) -> Self {
        match err {
            VoiceError::Config(msg) => ApiError(StatusCode::BAD_REQUEST, msg),
            other => ApiError(StatusCode::BAD_GATEWAY, other.to_string()),
        }
    }
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "active_sessions": state.active_connections(),
        "backends": state.backends,
        "latency": state.metrics().all_stats(),
    }))
}

pub async fn metrics(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!(state.metrics().snapshot(state.metrics_recent)))
}

pub async fn get_audio_config(State(state): State<Arc<AppState>>) -> Json<SegmenterConfig> {
    Json(state.sessions.segmenter_config())
}

/// Partial update; omitted fields keep their current value.
#[derive(Debug, Default, Deserialize)]
pub struct AudioConfigUpdate {
    pub threshold: Option<f32>,
    pub min_speech_ms: Option<u64>,
    pub min_silence_ms: Option<u64>,
    pub max_utterance_ms: Option<u64>,
}

pub async fn update_audio_config(
    State(state): State<Arc<AppState>>,
    Json(update): Json<AudioConfigUpdate>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut cfg = state.sessions.segmenter_config();
    if let Some(v) = update.threshold {
        cfg.threshold = v;
    }
    if let Some(v) = update.min_speech_ms {
        cfg.min_speech_ms = v;
    }
    if let Some(v) = update.min_silence_ms {
        cfg.min_silence_ms = v;
    }
    if let Some(v) = update.max_utterance_ms {
        cfg.max_utterance_ms = v;
    }
    state.sessions.update_segmenter(cfg.clone())?;
    info!(target: "parley::gateway", "Audio config updated; applies to new sessions");
    Ok(Json(json!({ "status": "ok", "config": cfg })))
}

#[derive(Debug, Deserialize)]
pub struct SynthesizeRequest {
    pub text: String,
}

pub async fn synthesize(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SynthesizeRequest>,
) -> Result<Response, ApiError> {
    if req.text.trim().is_empty() {
        return Err(ApiError(StatusCode::BAD_REQUEST, "text is required".to_string()));
    }
    let audio = state
        .sessions
        .orchestrator()
        .synthesize(&req.text)
        .await
        .map_err(|e| {
            warn!(target: "parley::gateway", "Synthesis failed: {}", e);
            ApiError::from(e)
        })?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "audio/wav".to_string()),
            (
                HeaderName::from_static("x-audio-duration-ms"),
                format!("{:.0}", audio.duration_ms),
            ),
        ],
        audio.bytes,
    )
        .into_response())
}
