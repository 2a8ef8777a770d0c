//! Relay WebSocket handler
//!
//! `GET /realtime/ws?model=..&voice=..` upgrades the client connection and
//! bridges it to one upstream realtime connection for its whole lifetime.

use axum::{
    Extension,
    extract::{
        Query, State,
        ws::{WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures::SinkExt;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::core::relay::{
    CloseInfo, RelayFrame, RelaySession, split_axum, split_tungstenite,
};
use crate::middleware::ConnectionSlot;
use crate::state::AppState;

/// Maximum WebSocket frame size (10 MB)
const MAX_WS_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Maximum WebSocket message size (10 MB)
const MAX_WS_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Close code sent when the server shuts down mid-handshake
const CLOSE_GOING_AWAY: u16 = 1001;

#[derive(Debug, Default, Deserialize)]
pub struct RelayQuery {
    pub model: Option<String>,
    pub voice: Option<String>,
}

/// Relay WebSocket handler
///
/// Model and voice fall back to the configured defaults when absent or blank.
/// The connection slot reserved by the connection-limit middleware is held
/// until the socket task ends.
pub async fn relay_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<RelayQuery>,
    slot: Option<Extension<ConnectionSlot>>,
) -> Response {
    let upstream = &state.config.upstream;
    let model = upstream.resolve_model(query.model.as_deref()).to_string();
    let voice = upstream.resolve_voice(query.voice.as_deref()).to_string();

    info!(
        model = %model,
        voice = %voice,
        ip = ?slot.as_ref().map(|s| s.ip()),
        "Relay WebSocket upgrade requested"
    );

    let slot = slot.map(|Extension(slot)| slot);
    ws.max_frame_size(MAX_WS_FRAME_SIZE)
        .max_message_size(MAX_WS_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_relay_socket(socket, state, model, voice, slot))
}

async fn handle_relay_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    model: String,
    voice: String,
    slot: Option<ConnectionSlot>,
) {
    let _slot = slot;
    let settings = &state.config.upstream;
    let shutdown = state.shutdown_token();

    let session = RelaySession::with_cancellation(
        model,
        voice,
        settings.keepalive_interval,
        shutdown.child_token(),
    );
    let (mut client_tx, mut client_rx) = split_axum(socket);

    let opened = tokio::select! {
        result = session.open(settings, &mut client_rx) => result,
        _ = shutdown.cancelled() => {
            let _ = client_tx
                .send(RelayFrame::Close(Some(CloseInfo::new(CLOSE_GOING_AWAY, "server shutting down"))))
                .await;
            return;
        }
    };

    match opened {
        Ok(Some(upstream)) => {
            state.record_relay_opened();
            let (upstream_tx, upstream_rx) = split_tungstenite(upstream);
            let session_id = session.id().to_string();
            let outcome = session.run(client_tx, client_rx, upstream_tx, upstream_rx).await;
            debug!(session_id = %session_id, outcome = ?outcome, "Relay socket task finished");
        }
        Ok(None) => {
            debug!(session_id = %session.id(), "Client left before the upstream opened");
        }
        Err(e) => {
            warn!(
                session_id = %session.id(),
                model = %session.model(),
                error = %e,
                "Upstream open failed"
            );
            let close = CloseInfo::internal_error(e.close_reason());
            let _ = client_tx.send(RelayFrame::Close(Some(close))).await;
            let _ = client_tx.close().await;
        }
    }
}
