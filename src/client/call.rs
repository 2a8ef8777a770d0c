//! Headless call loop
//!
//! Bootstraps a session over HTTP, opens the relay WebSocket and then runs a
//! single `select!` loop over the relay socket, the capture events, the
//! hang-up signal and the speaker ticker. Everything that changes call state
//! goes through the [`CallController`].

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::{Sink, SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::controller::{CallAction, CallController, CallOptions, CallStats, Notice};
use super::speaker::{SPEAKER_BLOCK_MS, SpeakerReport, WavSpeaker};
use crate::core::capture::{AudioSource, CaptureEvent, CapturePipeline};
use crate::core::error::{CallError, CallResult};
use crate::core::playback::{PlaybackClock, PlaybackScheduler, SystemClock};
use crate::core::relay::{CLOSE_NORMAL, CloseInfo, RelayFrame, split_tungstenite};
use crate::core::turn::{CallState, NoticeLevel, Transcript};
use crate::handlers::session::SessionResponse;

/// Capacity of the capture event channel.
const CAPTURE_EVENT_CAPACITY: usize = 64;

/// Where and how to place a call.
#[derive(Debug, Clone)]
pub struct CallPlan {
    /// Base HTTP(S) URL of the gateway
    pub server: Url,
    pub model: Option<String>,
    pub client_id: Option<String>,
    pub options: CallOptions,
    /// WAV file receiving the assistant's speech
    pub output: Option<PathBuf>,
    /// Time to wait after the input ends for the assistant to finish
    pub linger: Duration,
    pub connect_timeout: Duration,
}

impl CallPlan {
    pub fn new(server: Url) -> Self {
        Self {
            server,
            model: None,
            client_id: None,
            options: CallOptions::default(),
            output: None,
            linger: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// What happened during a call.
#[derive(Debug, Clone, Serialize)]
pub struct CallReport {
    pub session_id: Option<String>,
    pub final_state: CallState,
    pub notices: Vec<Notice>,
    pub stats: CallStats,
    pub speaker: Option<SpeakerReport>,
    #[serde(skip)]
    pub transcript: Transcript,
}

/// `POST /session`, returning the session and the relay WebSocket URL.
pub async fn bootstrap_session(
    http: &reqwest::Client,
    plan: &CallPlan,
) -> CallResult<(SessionResponse, Url)> {
    let endpoint = plan
        .server
        .join("/session")
        .map_err(|e| CallError::InvalidConfig(format!("invalid server URL: {e}")))?;

    let body = serde_json::json!({
        "client_id": plan.client_id,
        "model": plan.model,
        "voice": plan.options.voice,
    });

    let response = http
        .post(endpoint)
        .json(&body)
        .timeout(plan.connect_timeout)
        .send()
        .await
        .map_err(|e| CallError::UpstreamUnreachable(format!("session bootstrap failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(CallError::UpstreamUnreachable(format!(
            "session bootstrap failed with status {status}"
        )));
    }

    let session: SessionResponse = response
        .json()
        .await
        .map_err(|e| CallError::ProtocolError(format!("invalid session response: {e}")))?;

    let relay_url = relay_url(&plan.server, &session.relay_path)?;
    Ok((session, relay_url))
}

/// Resolve a relay path against the server URL and switch to the WebSocket
/// scheme.
pub fn relay_url(server: &Url, relay_path: &str) -> CallResult<Url> {
    let mut url = server
        .join(relay_path)
        .map_err(|e| CallError::InvalidConfig(format!("invalid relay path: {e}")))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(CallError::InvalidConfig(format!(
                "unsupported server scheme '{other}'"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| CallError::InvalidConfig(format!("cannot use scheme {scheme}")))?;
    Ok(url)
}

/// Place one call and run it until hang-up, input exhaustion or failure.
///
/// Connection and device failures are reported through the returned
/// [`CallReport`] (final state `idle` or `ended` plus an error notice).
/// Only configuration problems detected before dialing are returned as
/// errors.
pub async fn run_call<S>(plan: CallPlan, source: S, hangup: CancellationToken) -> CallResult<CallReport>
where
    S: AudioSource + 'static,
{
    plan.options.validate()?;

    let clock: Arc<dyn PlaybackClock> = Arc::new(SystemClock::new());
    let scheduler = Arc::new(PlaybackScheduler::new(
        clock.clone(),
        plan.options.output_encoding,
    ));
    let speaker = match &plan.output {
        Some(path) => Some(WavSpeaker::create(
            path,
            scheduler.clone(),
            clock.clone(),
            plan.options.output_sample_rate,
        )?),
        None => None,
    };

    let (mut controller, _state) = CallController::new(plan.options.clone(), scheduler);
    let mut runtime = CallRuntime {
        speaker,
        speaker_report: None,
        source: Some(source),
        capture: None,
        capture_config: plan.options.capture.clone(),
        capture_tx: None,
        input_finished_at: None,
        responses_at_input_end: 0,
    };

    if !controller.start().contains(&CallAction::OpenRelay) {
        return Err(CallError::InvalidConfig("call already started".to_string()));
    }

    let http = reqwest::Client::new();
    let (session_id, socket) = match dial(&http, &plan).await {
        Ok(dialed) => dialed,
        Err(e) => {
            warn!(error = %e, "Call setup failed");
            controller.connect_failed(&e);
            return runtime.finish(controller, None);
        }
    };
    info!(session_id = %session_id, "Relay connected, waiting for upstream");

    let (mut ws_tx, mut ws_rx) = split_tungstenite(socket);
    let (capture_tx, mut capture_rx) = mpsc::channel(CAPTURE_EVENT_CAPACITY);
    runtime.capture_tx = Some(capture_tx);

    let mut ticker = tokio::time::interval(Duration::from_millis(u64::from(SPEAKER_BLOCK_MS)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut hung_up = false;

    loop {
        let actions = tokio::select! {
            _ = hangup.cancelled(), if !hung_up => {
                hung_up = true;
                info!("Hanging up");
                controller.hang_up()
            }

            frame = ws_rx.next() => match frame {
                Some(Ok(RelayFrame::Text(text))) => controller.on_server_text(&text),
                Some(Ok(RelayFrame::Binary(data))) => {
                    debug!(len = data.len(), "Ignoring binary relay frame");
                    vec![]
                }
                Some(Ok(RelayFrame::Ping(_) | RelayFrame::Pong(_))) => vec![],
                Some(Ok(RelayFrame::Close(info))) => {
                    let info = info.unwrap_or_else(|| CloseInfo::new(1005, ""));
                    controller.relay_closed(info.code, info.reason)
                }
                Some(Err(e)) => controller.relay_failed(e.to_string()),
                None => controller.relay_closed(1006, "connection lost"),
            },

            Some(event) = capture_rx.recv() => controller.on_capture_event(event),

            _ = ticker.tick() => match runtime.tick(&controller, plan.linger) {
                Ok(true) => {
                    info!("Input done and answered, hanging up");
                    hung_up = true;
                    controller.hang_up()
                }
                Ok(false) => vec![],
                Err(e) => runtime.output_failed(&mut controller, &e),
            }
        };

        runtime
            .execute(actions, &mut controller, &mut ws_tx)
            .await;

        if matches!(controller.state(), CallState::Idle | CallState::Ended) {
            break;
        }
    }

    runtime.stop_capture().await;
    let _ = ws_tx.close().await;
    runtime.finish(controller, Some(session_id))
}

async fn dial(
    http: &reqwest::Client,
    plan: &CallPlan,
) -> CallResult<(String, crate::core::relay::UpstreamSocket)> {
    let (session, url) = bootstrap_session(http, plan).await?;
    debug!(url = %url, "Opening relay socket");

    let (socket, _response) =
        tokio::time::timeout(plan.connect_timeout, tokio_tungstenite::connect_async(url.as_str()))
            .await
            .map_err(|_| CallError::UpstreamUnreachable("relay connect timed out".to_string()))?
            .map_err(|e| CallError::UpstreamUnreachable(e.to_string()))?;

    Ok((session.session_id, socket))
}

struct CallRuntime<S> {
    speaker: Option<WavSpeaker>,
    /// What a failed speaker wrote before it was dropped
    speaker_report: Option<SpeakerReport>,
    source: Option<S>,
    capture: Option<CapturePipeline>,
    capture_config: crate::core::capture::CaptureConfig,
    capture_tx: Option<mpsc::Sender<CaptureEvent>>,
    input_finished_at: Option<Instant>,
    responses_at_input_end: u64,
}

impl<S: AudioSource + 'static> CallRuntime<S> {
    /// Run the actions in order, including any the controller emits while
    /// handling their outcome.
    async fn execute<W>(
        &mut self,
        actions: Vec<CallAction>,
        controller: &mut CallController,
        ws_tx: &mut W,
    ) where
        W: Sink<RelayFrame, Error = CallError> + Unpin,
    {
        let mut queue: VecDeque<CallAction> = actions.into();

        while let Some(action) = queue.pop_front() {
            match action {
                CallAction::Send(event) => {
                    let text = match event.to_json() {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(error = %e, "Dropping unserializable event");
                            continue;
                        }
                    };
                    if let Err(e) = ws_tx.send(RelayFrame::Text(text)).await {
                        queue.extend(controller.relay_failed(e.to_string()));
                    }
                }
                CallAction::StartCapture => match self.start_capture() {
                    Ok(()) => queue.extend(controller.capture_started()),
                    Err(e) => queue.extend(controller.capture_failed(&e)),
                },
                CallAction::StopCapture => self.stop_capture().await,
                CallAction::CloseRelay => {
                    let close = CloseInfo::new(CLOSE_NORMAL, "call ended");
                    let _ = ws_tx.send(RelayFrame::Close(Some(close))).await;
                }
                CallAction::InputFinished => {
                    if self.input_finished_at.is_none() {
                        info!("Input finished, waiting for the assistant");
                        self.input_finished_at = Some(Instant::now());
                        self.responses_at_input_end = controller.stats().responses_completed;
                    }
                }
                // the relay is dialed once, before the loop starts
                CallAction::OpenRelay => {}
            }
        }
    }

    fn start_capture(&mut self) -> CallResult<()> {
        let source = self
            .source
            .take()
            .ok_or_else(|| CallError::DeviceUnavailable("input already consumed".to_string()))?;
        let events = self
            .capture_tx
            .clone()
            .ok_or_else(|| CallError::DeviceUnavailable("capture channel closed".to_string()))?;
        self.capture = Some(CapturePipeline::start(
            source,
            self.capture_config.clone(),
            events,
        )?);
        Ok(())
    }

    async fn stop_capture(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            capture.stop().await;
        }
    }

    /// Speaker pump plus the end-of-input check. Returns true once the call
    /// should be hung up.
    fn tick(&mut self, controller: &CallController, linger: Duration) -> CallResult<bool> {
        if let Some(speaker) = self.speaker.as_mut() {
            speaker.pump()?;
        } else {
            controller.scheduler().release_finished();
        }

        let Some(finished_at) = self.input_finished_at else {
            return Ok(false);
        };
        let answered = controller.stats().responses_completed > self.responses_at_input_end
            && controller.state() == CallState::Listening
            && !controller.scheduler().is_active();
        Ok(answered || finished_at.elapsed() >= linger)
    }

    /// The speaker output broke mid-call: drop it and end the call the way
    /// any other device failure does.
    fn output_failed(&mut self, controller: &mut CallController, err: &CallError) -> Vec<CallAction> {
        warn!(error = %err, "Speaker output failed");
        if let Some(speaker) = self.speaker.take() {
            self.speaker_report = Some(speaker.report());
        }
        controller.capture_failed(err)
    }

    fn finish(self, controller: CallController, session_id: Option<String>) -> CallResult<CallReport> {
        let mut notices = controller.notices().to_vec();
        let speaker = match self.speaker.map(WavSpeaker::finish) {
            Some(Ok(report)) => Some(report),
            Some(Err(e)) => {
                warn!(error = %e, "Could not finalize speaker output");
                notices.push(Notice {
                    level: NoticeLevel::Error,
                    message: e.to_string(),
                });
                None
            }
            None => self.speaker_report,
        };
        Ok(CallReport {
            session_id,
            final_state: controller.state(),
            notices,
            stats: controller.stats(),
            speaker,
            transcript: controller.transcript().clone(),
        })
    }
}
