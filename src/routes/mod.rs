pub mod api;
pub mod realtime;

use std::sync::Arc;

use axum::{Router, middleware};

use crate::middleware::connection_limit_middleware;
use crate::state::AppState;

/// API and relay routes with state attached.
///
/// The relay route sits behind the connection-limit middleware, which needs
/// `ConnectInfo<SocketAddr>`: serve with
/// `into_make_service_with_connect_info::<SocketAddr>()`. Rate limiting and
/// security headers are layered on in main.rs.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    let realtime_routes = realtime::create_realtime_router().layer(
        middleware::from_fn_with_state(app_state.clone(), connection_limit_middleware),
    );

    api::create_api_router()
        .merge(realtime_routes)
        .with_state(app_state)
}
