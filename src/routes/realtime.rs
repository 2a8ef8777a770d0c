//! Relay WebSocket route configuration

use axum::{Router, routing::get};
use tower_http::trace::TraceLayer;

use crate::handlers::relay::relay_handler;
use crate::handlers::session::RELAY_PATH;
use crate::state::AppState;
use std::sync::Arc;

/// Create the relay WebSocket router
///
/// # Endpoint
///
/// `GET /realtime/ws?model=<model>&voice=<voice>` - WebSocket upgrade
///
/// # Protocol
///
/// Frames are forwarded verbatim in both directions. The relay adds three
/// notices of its own on the client leg:
///
/// ```json
/// {"type": "upstream.open"}
/// {"type": "upstream.error", "message": "..."}
/// {"type": "upstream.close", "code": 1000, "reason": "..."}
/// ```
///
/// When the upstream cannot be reached the client is closed with code 1011
/// and a short reason (`missing api key`, `upstream unreachable`).
pub fn create_realtime_router() -> Router<Arc<AppState>> {
    Router::new()
        .route(RELAY_PATH, get(relay_handler))
        .layer(TraceLayer::new_for_http())
}
