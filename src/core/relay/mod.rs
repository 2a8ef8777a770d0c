//! Session relay: one upstream connection per client connection, verbatim
//! forwarding in both directions, upstream keepalive and close propagation.

pub mod frame;
pub mod session;
pub mod upstream;

pub use frame::{
    CLOSE_INTERNAL_ERROR, CLOSE_NORMAL, CloseInfo, RelayFrame, split_axum, split_tungstenite,
};
pub use session::{RelayOutcome, RelaySession, RelayState, RelayStats, RelayStatsSnapshot};
pub use upstream::{
    DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_KEEPALIVE, UpstreamSettings, UpstreamSocket,
    connect_upstream,
};
