//! HTTP and WebSocket request handlers
//!
//! - `api` - Health check endpoint
//! - `session` - Session bootstrap (`POST /session`)
//! - `relay` - Client ⇄ upstream relay WebSocket (`GET /realtime/ws`)

pub mod api;
pub mod relay;
pub mod session;

pub use api::health_check;
pub use relay::relay_handler;
pub use session::create_session;
