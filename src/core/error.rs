//! Error taxonomy for a single call.
//!
//! Transport-level failures end the call; payload-level failures are
//! recovered locally by skipping the offending frame.

use thiserror::Error;

/// Errors raised by the relay, capture, playback and call client layers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CallError {
    /// No upstream credential is configured. The call never starts.
    #[error("Upstream credential is not configured")]
    AuthMissing,

    /// Handshake failure, handshake timeout or mid-call upstream failure.
    #[error("Upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    /// Capture device could not be acquired (permission denied, busy, missing).
    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Audio payload could not be decoded. The frame is dropped.
    #[error("Malformed audio frame: {0}")]
    MalformedFrame(String),

    /// Unexpected or error message from the upstream. Surfaced as a warning.
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Rejected configuration (zero frame duration, zero sample rate, ...).
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Client-side transport failure (relay socket closed or errored).
    #[error("Transport error: {0}")]
    Transport(String),
}

impl CallError {
    /// Whether this error must terminate the current call.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CallError::AuthMissing
                | CallError::UpstreamUnreachable(_)
                | CallError::DeviceUnavailable(_)
                | CallError::InvalidConfig(_)
                | CallError::Transport(_)
        )
    }

    /// Short reason suitable for a WebSocket close frame.
    pub fn close_reason(&self) -> &'static str {
        match self {
            CallError::AuthMissing => "missing api key",
            CallError::UpstreamUnreachable(_) => "upstream unreachable",
            CallError::DeviceUnavailable(_) => "device unavailable",
            CallError::MalformedFrame(_) => "malformed frame",
            CallError::ProtocolError(_) => "protocol error",
            CallError::InvalidConfig(_) => "relay misconfigured",
            CallError::Transport(_) => "transport error",
        }
    }
}

/// Result type for call operations.
pub type CallResult<T> = Result<T, CallError>;
