//! Transport-neutral WebSocket frames.
//!
//! The client leg is an axum socket and the upstream leg a tokio-tungstenite
//! socket. Both are adapted to `Sink<RelayFrame>` / `Stream<RelayFrame>` so the
//! forwarding loop is written once and can be driven by in-memory channels in
//! tests.

use axum::extract::ws::{CloseFrame as AxumCloseFrame, Message as AxumMessage, WebSocket};
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt, future};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as WsCloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use crate::core::error::CallError;

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;

/// Internal relay error, used on both legs for fatal failures.
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Close frame payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

impl CloseInfo {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    pub fn internal_error(reason: impl Into<String>) -> Self {
        Self::new(CLOSE_INTERNAL_ERROR, reason)
    }

    /// Codes that may appear in a close frame on the wire. 1005, 1006 and
    /// 1015 are reserved for local reporting only.
    pub fn is_sendable(&self) -> bool {
        matches!(self.code, 1000..=1003 | 1007..=1014 | 3000..=4999)
    }
}

/// One WebSocket message, independent of the socket library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayFrame {
    Text(String),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    Close(Option<CloseInfo>),
}

impl RelayFrame {
    /// Data frames are forwarded; control frames are per-hop.
    pub fn is_data(&self) -> bool {
        matches!(self, RelayFrame::Text(_) | RelayFrame::Binary(_))
    }

    pub fn len(&self) -> usize {
        match self {
            RelayFrame::Text(t) => t.len(),
            RelayFrame::Binary(b) | RelayFrame::Ping(b) | RelayFrame::Pong(b) => b.len(),
            RelayFrame::Close(_) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// axum (client leg)
// =============================================================================

impl From<AxumMessage> for RelayFrame {
    fn from(msg: AxumMessage) -> Self {
        match msg {
            AxumMessage::Text(t) => RelayFrame::Text(t.as_str().to_owned()),
            AxumMessage::Binary(b) => RelayFrame::Binary(b),
            AxumMessage::Ping(b) => RelayFrame::Ping(b),
            AxumMessage::Pong(b) => RelayFrame::Pong(b),
            AxumMessage::Close(frame) => RelayFrame::Close(
                frame.map(|f| CloseInfo::new(f.code, f.reason.as_str().to_owned())),
            ),
        }
    }
}

impl From<RelayFrame> for AxumMessage {
    fn from(frame: RelayFrame) -> Self {
        match frame {
            RelayFrame::Text(t) => AxumMessage::Text(t.into()),
            RelayFrame::Binary(b) => AxumMessage::Binary(b),
            RelayFrame::Ping(b) => AxumMessage::Ping(b),
            RelayFrame::Pong(b) => AxumMessage::Pong(b),
            RelayFrame::Close(info) => AxumMessage::Close(
                info.filter(CloseInfo::is_sendable)
                    .map(|i| AxumCloseFrame {
                        code: i.code,
                        reason: i.reason.into(),
                    }),
            ),
        }
    }
}

/// Split an axum socket into relay-frame halves.
pub fn split_axum(
    socket: WebSocket,
) -> (
    impl Sink<RelayFrame, Error = CallError> + Send + Unpin + 'static,
    impl Stream<Item = Result<RelayFrame, CallError>> + Send + Unpin + 'static,
) {
    let (sink, stream) = socket.split();
    let sink = sink
        .sink_map_err(|e| CallError::Transport(e.to_string()))
        .with(|frame: RelayFrame| future::ready(Ok::<_, CallError>(AxumMessage::from(frame))));
    let stream = stream.map(|r| {
        r.map(RelayFrame::from)
            .map_err(|e| CallError::Transport(e.to_string()))
    });
    (sink, stream)
}

// =============================================================================
// tungstenite (upstream leg, call client)
// =============================================================================

impl TryFrom<WsMessage> for RelayFrame {
    type Error = CallError;

    fn try_from(msg: WsMessage) -> Result<Self, Self::Error> {
        Ok(match msg {
            WsMessage::Text(t) => RelayFrame::Text(t.as_str().to_owned()),
            WsMessage::Binary(b) => RelayFrame::Binary(b),
            WsMessage::Ping(b) => RelayFrame::Ping(b),
            WsMessage::Pong(b) => RelayFrame::Pong(b),
            WsMessage::Close(frame) => RelayFrame::Close(
                frame.map(|f| CloseInfo::new(u16::from(f.code), f.reason.as_str().to_owned())),
            ),
            WsMessage::Frame(_) => {
                return Err(CallError::ProtocolError("unexpected raw frame".to_string()));
            }
        })
    }
}

impl From<RelayFrame> for WsMessage {
    fn from(frame: RelayFrame) -> Self {
        match frame {
            RelayFrame::Text(t) => WsMessage::Text(t.into()),
            RelayFrame::Binary(b) => WsMessage::Binary(b),
            RelayFrame::Ping(b) => WsMessage::Ping(b),
            RelayFrame::Pong(b) => WsMessage::Pong(b),
            RelayFrame::Close(info) => WsMessage::Close(
                info.filter(CloseInfo::is_sendable)
                    .map(|i| WsCloseFrame {
                        code: CloseCode::from(i.code),
                        reason: i.reason.into(),
                    }),
            ),
        }
    }
}

/// Split a tungstenite socket into relay-frame halves.
pub fn split_tungstenite<S>(
    socket: WebSocketStream<S>,
) -> (
    impl Sink<RelayFrame, Error = CallError> + Send + Unpin + 'static,
    impl Stream<Item = Result<RelayFrame, CallError>> + Send + Unpin + 'static,
)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (sink, stream) = socket.split();
    let sink = sink
        .sink_map_err(|e| CallError::Transport(e.to_string()))
        .with(|frame: RelayFrame| future::ready(Ok::<_, CallError>(WsMessage::from(frame))));
    let stream = stream.map(|r| {
        r.map_err(|e| CallError::Transport(e.to_string()))
            .and_then(RelayFrame::try_from)
    });
    (sink, stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_and_binary_survive_both_libraries() {
        let text = RelayFrame::Text(r#"{"type":"session.update"}"#.to_string());
        let via_axum = RelayFrame::from(AxumMessage::from(text.clone()));
        assert_eq!(via_axum, text);
        let via_ws = RelayFrame::try_from(WsMessage::from(text.clone())).unwrap();
        assert_eq!(via_ws, text);

        let binary = RelayFrame::Binary(Bytes::from_static(&[0, 1, 2, 255]));
        assert_eq!(RelayFrame::from(AxumMessage::from(binary.clone())), binary);
        assert_eq!(
            RelayFrame::try_from(WsMessage::from(binary.clone())).unwrap(),
            binary
        );
    }

    #[test]
    fn test_close_code_and_reason_preserved() {
        let close = RelayFrame::Close(Some(CloseInfo::new(4001, "session expired")));
        assert_eq!(RelayFrame::from(AxumMessage::from(close.clone())), close);
        assert_eq!(
            RelayFrame::try_from(WsMessage::from(close.clone())).unwrap(),
            close
        );
    }

    #[test]
    fn test_reserved_close_codes_are_not_sent() {
        let abnormal = RelayFrame::Close(Some(CloseInfo::new(1006, "")));
        assert_eq!(AxumMessage::from(abnormal.clone()), AxumMessage::Close(None));
        assert_eq!(WsMessage::from(abnormal), WsMessage::Close(None));
        assert!(CloseInfo::internal_error("x").is_sendable());
    }

    #[test]
    fn test_data_classification() {
        assert!(RelayFrame::Text(String::new()).is_data());
        assert!(RelayFrame::Binary(Bytes::new()).is_data());
        assert!(!RelayFrame::Ping(Bytes::new()).is_data());
        assert!(!RelayFrame::Close(None).is_data());
    }
}
