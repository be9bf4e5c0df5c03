//! `/ws`: one voice session per WebSocket connection.
//!
//! Binary messages are raw PCM16LE audio; text messages are JSON `IncomingMessage`s.
//! A sender task drains the session's event stream into the socket while the read
//! loop feeds audio and text into the session.

use crate::messages::{decode_audio_chunk, IncomingMessage};
use crate::state::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use parley_voice::{OutboundEvent, Session, VoiceError};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub async fn ws_voice_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    debug!(target: "parley::gateway", "WebSocket upgrade requested");
    ws.on_upgrade(move |socket| handle_voice_socket(socket, state))
}

async fn handle_voice_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let (mut session, mut events) = state.sessions.create();
    let connections = state.connection_opened();
    info!(
        target: "parley::gateway",
        "🔌 Voice session {} connected ({} active)",
        session.id(),
        connections
    );

    // Local errors (bad messages) share the socket with session events.
    let (local_tx, mut local_rx) = mpsc::unbounded_channel::<OutboundEvent>();

    let sender_task = tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                event = local_rx.recv() => event,
            };
            let Some(event) = event else { break };
            let json = match event.to_json() {
                Ok(json) => json,
                Err(e) => {
                    error!(target: "parley::gateway", "Failed to serialize event: {}", e);
                    continue;
                }
            };
            if let Err(e) = sender.send(Message::Text(json)).await {
                debug!(target: "parley::gateway", "Socket send failed: {}", e);
                break;
            }
        }
    });

    while let Some(msg) = receiver.next().await {
        let result = msg
            .map_err(socket_fault)
            .and_then(|msg| process_message(msg, &mut session));
        match result {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) if e.is_stage_failure() => {
                warn!(target: "parley::gateway", "Rejected client message: {}", e);
                let _ = local_tx.send(OutboundEvent::error(None, e.to_string()));
            }
            Err(e) => {
                warn!(target: "parley::gateway", "Closing session {}: {}", session.id(), e);
                break;
            }
        }
    }

    let id = session.id();
    session.shutdown().await;
    sender_task.abort();
    let remaining = state.connection_closed();
    info!(
        target: "parley::gateway",
        "🔌 Voice session {} disconnected ({} active)",
        id,
        remaining
    );
}

fn socket_fault(err: axum::Error) -> VoiceError {
    VoiceError::Transport(err.to_string())
}

/// Handle one inbound message. `Ok(false)` when the client closed the connection.
fn process_message(msg: Message, session: &mut Session) -> Result<bool, VoiceError> {
    match msg {
        Message::Binary(data) => {
            session.push_audio(&data);
        }
        Message::Text(text) => match IncomingMessage::parse(&text)? {
            IncomingMessage::UserInput { text } => {
                if let Some(turn) = session.submit_text(&text) {
                    debug!(target: "parley::gateway", "Text input started turn {}", turn);
                }
            }
            IncomingMessage::AudioChunk { data } => {
                let bytes = decode_audio_chunk(&data)
                    .map_err(|e| VoiceError::AudioFormat(format!("invalid audio_chunk data: {e}")))?;
                session.push_audio(&bytes);
            }
        },
        Message::Ping(_) | Message::Pong(_) => {}
        Message::Close(_) => return Ok(false),
    }
    Ok(true)
}
