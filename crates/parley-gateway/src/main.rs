//! Parley Gateway: WebSocket voice sessions plus health and latency metrics.
//!
//! Routes: `/ws`, `/health`, `/metrics`, `/config/audio` (GET/POST), `/api/synthesize`.

mod http;
mod messages;
mod state;
mod ws;

use anyhow::Context;
use axum::{
    routing::{get, post},
    Router,
};
use parley_voice::{config as voice_config, VoiceConfig};
use state::{AppState, ServerConfig};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_voice_handler))
        .route("/health", get(http::health))
        .route("/metrics", get(http::metrics))
        .route(
            "/config/audio",
            get(http::get_audio_config).post(http::update_audio_config),
        )
        .route("/api/synthesize", post(http::synthesize))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let source = voice_config::layered().context("reading configuration")?;
    let server: ServerConfig =
        voice_config::section(&source, "server").context("invalid [server] section")?;
    let voice = VoiceConfig::from_source(&source).context("invalid voice configuration")?;

    let state = AppState::from_config(&voice);
    let addr = server.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!(target: "parley::gateway", "🎙️ Parley gateway listening on {}", addr);

    axum::serve(listener, app(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!(target: "parley::gateway", "Shutting down");
        })
        .await
        .context("server error")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn test_state() -> Arc<AppState> {
        AppState::from_config(&VoiceConfig::default())
    }

    async fn body_json(res: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_backends_and_stages() {
        let res = app(test_state())
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let json = body_json(res).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["backends"]["llm"]["engine"], "scripted");
        assert_eq!(json["latency"]["total"]["count"], 0);
    }

    #[tokio::test]
    async fn test_metrics_lists_recent_samples() {
        let state = test_state();
        for ms in 1..=15 {
            state
                .metrics()
                .record(parley_voice::LatencyStage::Stt, ms as f64);
        }
        let res = app(state)
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(res).await;
        assert_eq!(json["stt"]["count"], 15);
        assert_eq!(json["stt"]["recent"].as_array().unwrap().len(), 10);
        assert_eq!(json["stt"]["max"], 15.0);
        assert_eq!(json["vad"]["count"], 0);
    }

    #[tokio::test]
    async fn test_audio_config_update_and_validation() {
        let state = test_state();
        let res = app(state.clone())
            .oneshot(
                Request::post("/config/audio")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"min_silence_ms": 650, "threshold": 0.4}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(state.sessions.segmenter_config().min_silence_ms, 650);

        let res = app(state.clone())
            .oneshot(
                Request::post("/config/audio")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"threshold": 2.0}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let res = app(state)
            .oneshot(Request::get("/config/audio").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(res).await;
        assert_eq!(json["min_silence_ms"], 650);
        assert!((json["threshold"].as_f64().unwrap() - 0.4).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_synthesize_returns_wav() {
        let res = app(test_state())
            .oneshot(
                Request::post("/api/synthesize")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"text": "hello there"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()["content-type"], "audio/wav");
        assert_eq!(res.headers()["x-audio-duration-ms"], "550");
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..4], b"RIFF");

        let res = app(test_state())
            .oneshot(
                Request::post("/api/synthesize")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"text": "  "}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }
}
