//! One client connection bridged to one upstream connection.
//!
//! Two tasks per session:
//! - client reader: owns the upstream sink, forwards client frames and sends
//!   keepalive pings, so the upstream sink has a single writer
//! - upstream reader: owns the client sink, forwards upstream frames and
//!   emits the relay notices
//!
//! A shared `CancellationToken` stops the other task as soon as either side
//! closes or fails. Frames are forwarded one at a time in arrival order.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::frame::{CloseInfo, RelayFrame};
use super::upstream::{UpstreamSettings, UpstreamSocket, connect_upstream};
use crate::core::error::{CallError, CallResult};
use crate::core::protocol::ServerEvent;

/// Grace period for flushing a close frame on shutdown.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Close code reported in `upstream.close` when the peer sent none.
const CLOSE_NO_STATUS: u16 = 1005;

// =============================================================================
// State
// =============================================================================

/// Relay lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl std::fmt::Display for RelayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayState::Connecting => write!(f, "connecting"),
            RelayState::Open => write!(f, "open"),
            RelayState::Closing => write!(f, "closing"),
            RelayState::Closed => write!(f, "closed"),
        }
    }
}

/// Per-direction frame counters.
#[derive(Debug, Default)]
pub struct RelayStats {
    client_to_upstream: AtomicU64,
    upstream_to_client: AtomicU64,
    dropped_to_upstream: AtomicU64,
    dropped_to_client: AtomicU64,
    pings_sent: AtomicU64,
}

/// Point-in-time copy of [`RelayStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStatsSnapshot {
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
    pub dropped_to_upstream: u64,
    pub dropped_to_client: u64,
    pub pings_sent: u64,
}

impl RelayStats {
    pub fn snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            client_to_upstream: self.client_to_upstream.load(Ordering::Relaxed),
            upstream_to_client: self.upstream_to_client.load(Ordering::Relaxed),
            dropped_to_upstream: self.dropped_to_upstream.load(Ordering::Relaxed),
            dropped_to_client: self.dropped_to_client.load(Ordering::Relaxed),
            pings_sent: self.pings_sent.load(Ordering::Relaxed),
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    ClientClosed(Option<CloseInfo>),
    ClientFailed(String),
    UpstreamClosed(Option<CloseInfo>),
    UpstreamFailed(String),
}

/// First writer wins; later outcomes are consequences of the first.
#[derive(Debug, Default)]
struct OutcomeSlot(Mutex<Option<RelayOutcome>>);

impl OutcomeSlot {
    fn record(&self, outcome: RelayOutcome) {
        let mut slot = self.0.lock();
        if slot.is_none() {
            *slot = Some(outcome);
        }
    }

    fn get(&self) -> Option<RelayOutcome> {
        self.0.lock().clone()
    }
}

#[derive(Debug)]
struct Shared {
    state: Mutex<RelayState>,
    stats: RelayStats,
    outcome: OutcomeSlot,
    cancel: CancellationToken,
}

impl Shared {
    fn state(&self) -> RelayState {
        *self.state.lock()
    }

    fn set_state(&self, next: RelayState) {
        let mut state = self.state.lock();
        // never move backwards
        if (next as u8) > (*state as u8) {
            *state = next;
        }
    }

    /// Record the outcome, enter `closing` and stop the other task.
    fn finish(&self, outcome: RelayOutcome) {
        self.outcome.record(outcome);
        self.set_state(RelayState::Closing);
        self.cancel.cancel();
    }
}

// =============================================================================
// Session
// =============================================================================

/// A client ⇄ upstream relay.
#[derive(Debug)]
pub struct RelaySession {
    id: String,
    model: String,
    voice: String,
    keepalive: Duration,
    shared: Arc<Shared>,
}

impl RelaySession {
    pub fn new(model: impl Into<String>, voice: impl Into<String>, keepalive: Duration) -> Self {
        Self::with_cancellation(model, voice, keepalive, CancellationToken::new())
    }

    /// Like [`new`](Self::new), torn down when `cancel` fires. Pass a child
    /// of a server-wide token to close every relay on shutdown.
    pub fn with_cancellation(
        model: impl Into<String>,
        voice: impl Into<String>,
        keepalive: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id: format!("relay_{}", uuid::Uuid::new_v4().simple()),
            model: model.into(),
            voice: voice.into(),
            keepalive,
            shared: Arc::new(Shared {
                state: Mutex::new(RelayState::Connecting),
                stats: RelayStats::default(),
                outcome: OutcomeSlot::default(),
                cancel,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn voice(&self) -> &str {
        &self.voice
    }

    pub fn state(&self) -> RelayState {
        self.shared.state()
    }

    pub fn stats(&self) -> RelayStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Token that tears the session down when cancelled (e.g. on shutdown).
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    /// Connect the upstream leg.
    ///
    /// The client leg is drained meanwhile: data frames are dropped because
    /// there is nowhere to forward them yet, and a client that goes away
    /// aborts the handshake (`Ok(None)`).
    pub async fn open<CR>(
        &self,
        settings: &UpstreamSettings,
        client_rx: &mut CR,
    ) -> CallResult<Option<UpstreamSocket>>
    where
        CR: Stream<Item = Result<RelayFrame, CallError>> + Unpin,
    {
        let connect = connect_upstream(settings, &self.model, Some(self.voice.as_str()));
        tokio::pin!(connect);

        loop {
            tokio::select! {
                result = &mut connect => {
                    return match result {
                        Ok(socket) => Ok(Some(socket)),
                        Err(e) => {
                            self.shared.set_state(RelayState::Closed);
                            Err(e)
                        }
                    };
                }
                msg = client_rx.next() => match msg {
                    Some(Ok(frame)) if frame.is_data() => {
                        self.shared.stats.dropped_to_upstream.fetch_add(1, Ordering::Relaxed);
                        debug!(session_id = %self.id, bytes = frame.len(), "Upstream not open, dropping client frame");
                    }
                    Some(Ok(RelayFrame::Close(_))) | Some(Err(_)) | None => {
                        info!(session_id = %self.id, "Client left during upstream handshake");
                        self.shared.set_state(RelayState::Closed);
                        return Ok(None);
                    }
                    Some(Ok(_)) => {}
                },
            }
        }
    }

    /// Forward frames until either side closes or fails.
    ///
    /// Sends `upstream.open` to the client first. On upstream close the
    /// client receives `upstream.close` and is closed with the same code and
    /// reason; on upstream failure it receives `upstream.error` and is closed
    /// with 1011.
    pub async fn run<CS, CR, US, UR>(
        self,
        mut client_tx: CS,
        client_rx: CR,
        upstream_tx: US,
        upstream_rx: UR,
    ) -> RelayOutcome
    where
        CS: Sink<RelayFrame, Error = CallError> + Send + Unpin + 'static,
        CR: Stream<Item = Result<RelayFrame, CallError>> + Send + Unpin + 'static,
        US: Sink<RelayFrame, Error = CallError> + Send + Unpin + 'static,
        UR: Stream<Item = Result<RelayFrame, CallError>> + Send + Unpin + 'static,
    {
        self.shared.set_state(RelayState::Open);
        info!(
            session_id = %self.id,
            model = %self.model,
            voice = %self.voice,
            "Relay open"
        );

        if let Err(e) = send_notice(&mut client_tx, &ServerEvent::UpstreamOpen).await {
            self.shared.finish(RelayOutcome::ClientFailed(e.to_string()));
        }

        let client_reader = tokio::spawn(client_to_upstream(
            self.id.clone(),
            client_rx,
            upstream_tx,
            self.keepalive,
            self.shared.clone(),
        ));
        let upstream_reader = tokio::spawn(upstream_to_client(
            self.id.clone(),
            upstream_rx,
            client_tx,
            self.shared.clone(),
        ));

        let (a, b) = tokio::join!(client_reader, upstream_reader);
        for result in [a, b] {
            if let Err(e) = result {
                warn!(session_id = %self.id, "Relay task ended abnormally: {}", e);
            }
        }

        self.shared.set_state(RelayState::Closed);
        let outcome = self
            .shared
            .outcome
            .get()
            .unwrap_or(RelayOutcome::ClientClosed(None));
        let stats = self.shared.stats.snapshot();
        info!(
            session_id = %self.id,
            outcome = ?outcome,
            to_upstream = stats.client_to_upstream,
            to_client = stats.upstream_to_client,
            dropped_to_upstream = stats.dropped_to_upstream,
            dropped_to_client = stats.dropped_to_client,
            "Relay closed"
        );
        outcome
    }
}

async fn send_notice<S>(sink: &mut S, notice: &ServerEvent) -> CallResult<()>
where
    S: Sink<RelayFrame, Error = CallError> + Unpin,
{
    let json = notice.to_json()?;
    sink.send(RelayFrame::Text(json)).await
}

async fn close_sink<S>(sink: &mut S, frame: Option<RelayFrame>)
where
    S: Sink<RelayFrame, Error = CallError> + Unpin,
{
    let _ = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, async {
        if let Some(frame) = frame {
            let _ = sink.send(frame).await;
        }
        let _ = sink.close().await;
    })
    .await;
}

async fn client_to_upstream<CR, US>(
    session_id: String,
    mut client_rx: CR,
    mut upstream_tx: US,
    keepalive: Duration,
    shared: Arc<Shared>,
) where
    CR: Stream<Item = Result<RelayFrame, CallError>> + Unpin,
    US: Sink<RelayFrame, Error = CallError> + Unpin,
{
    let mut ticker = tokio::time::interval_at(Instant::now() + keepalive, keepalive);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut close_frame = None;

    loop {
        tokio::select! {
            biased;

            _ = shared.cancel.cancelled() => break,

            _ = ticker.tick() => {
                if let Err(e) = upstream_tx.send(RelayFrame::Ping(Bytes::new())).await {
                    warn!(session_id = %session_id, "Keepalive ping failed: {}", e);
                    shared.finish(RelayOutcome::UpstreamFailed(e.to_string()));
                    break;
                }
                shared.stats.pings_sent.fetch_add(1, Ordering::Relaxed);
            }

            msg = client_rx.next() => match msg {
                Some(Ok(frame)) if frame.is_data() => {
                    if shared.state() != RelayState::Open {
                        shared.stats.dropped_to_upstream.fetch_add(1, Ordering::Relaxed);
                        debug!(session_id = %session_id, "Upstream not open, dropping client frame");
                        continue;
                    }
                    if let Err(e) = upstream_tx.send(frame).await {
                        shared.stats.dropped_to_upstream.fetch_add(1, Ordering::Relaxed);
                        warn!(session_id = %session_id, "Upstream write failed: {}", e);
                        shared.finish(RelayOutcome::UpstreamFailed(e.to_string()));
                        break;
                    }
                    shared.stats.client_to_upstream.fetch_add(1, Ordering::Relaxed);
                }
                Some(Ok(RelayFrame::Close(info))) => {
                    info!(session_id = %session_id, close = ?info, "Client closed");
                    close_frame = Some(RelayFrame::Close(info.clone()));
                    shared.finish(RelayOutcome::ClientClosed(info));
                    break;
                }
                // ping/pong are per-hop
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(session_id = %session_id, "Client transport error: {}", e);
                    shared.finish(RelayOutcome::ClientFailed(e.to_string()));
                    break;
                }
                None => {
                    info!(session_id = %session_id, "Client disconnected");
                    shared.finish(RelayOutcome::ClientClosed(None));
                    break;
                }
            },
        }
    }

    close_sink(&mut upstream_tx, close_frame).await;
    debug!(session_id = %session_id, "Client reader stopped");
}

async fn upstream_to_client<UR, CS>(
    session_id: String,
    mut upstream_rx: UR,
    mut client_tx: CS,
    shared: Arc<Shared>,
) where
    UR: Stream<Item = Result<RelayFrame, CallError>> + Unpin,
    CS: Sink<RelayFrame, Error = CallError> + Unpin,
{
    loop {
        tokio::select! {
            biased;

            _ = shared.cancel.cancelled() => break,

            msg = upstream_rx.next() => match msg {
                Some(Ok(frame)) if frame.is_data() => {
                    if shared.state() != RelayState::Open {
                        shared.stats.dropped_to_client.fetch_add(1, Ordering::Relaxed);
                        debug!(session_id = %session_id, "Client not open, dropping upstream frame");
                        continue;
                    }
                    if let Err(e) = client_tx.send(frame).await {
                        shared.stats.dropped_to_client.fetch_add(1, Ordering::Relaxed);
                        warn!(session_id = %session_id, "Client write failed: {}", e);
                        shared.finish(RelayOutcome::ClientFailed(e.to_string()));
                        break;
                    }
                    shared.stats.upstream_to_client.fetch_add(1, Ordering::Relaxed);
                }
                Some(Ok(RelayFrame::Close(info))) => {
                    info!(session_id = %session_id, close = ?info, "Upstream closed");
                    shared.finish(RelayOutcome::UpstreamClosed(info));
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(session_id = %session_id, "Upstream transport error: {}", e);
                    shared.finish(RelayOutcome::UpstreamFailed(e.to_string()));
                    break;
                }
                None => {
                    info!(session_id = %session_id, "Upstream disconnected");
                    shared.finish(RelayOutcome::UpstreamClosed(None));
                    break;
                }
            },
        }
    }

    // the client leg is closed here, after the notice that explains why
    match shared.outcome.get() {
        Some(RelayOutcome::UpstreamClosed(info)) => {
            let notice = ServerEvent::UpstreamClose {
                code: info.as_ref().map_or(CLOSE_NO_STATUS, |i| i.code),
                reason: info.as_ref().map(|i| i.reason.clone()).unwrap_or_default(),
            };
            let _ = send_notice(&mut client_tx, &notice).await;
            close_sink(&mut client_tx, Some(RelayFrame::Close(info))).await;
        }
        Some(RelayOutcome::UpstreamFailed(message)) => {
            let _ = send_notice(&mut client_tx, &ServerEvent::UpstreamError { message }).await;
            close_sink(
                &mut client_tx,
                Some(RelayFrame::Close(Some(CloseInfo::internal_error("upstream error")))),
            )
            .await;
        }
        _ => close_sink(&mut client_tx, None).await,
    }
    debug!(session_id = %session_id, "Upstream reader stopped");
}
