//! Turn-taking state machine.
//!
//! `(state, event) → (next state, side effects)`. The coordinator owns the
//! [`CallState`] and the stale-audio guard; it never touches sockets or
//! audio itself. Callers execute the returned [`SideEffect`]s in order.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

// =============================================================================
// States
// =============================================================================

/// Call lifecycle as seen by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    #[default]
    Idle,
    Connecting,
    Listening,
    Thinking,
    Speaking,
    Ended,
}

impl CallState {
    /// Connected and exchanging audio.
    pub fn is_in_call(&self) -> bool {
        matches!(self, Self::Listening | Self::Thinking | Self::Speaking)
    }

    /// Anything between starting and ending a call.
    pub fn is_active(&self) -> bool {
        self.is_in_call() || *self == Self::Connecting
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Listening => "listening",
            Self::Thinking => "thinking",
            Self::Speaking => "speaking",
            Self::Ended => "ended",
        }
    }
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which speech detector is allowed to interrupt the assistant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptSource {
    /// Upstream `input_audio_buffer.speech_started`
    #[default]
    Upstream,
    /// Local energy detector in the capture pipeline
    Local,
}

// =============================================================================
// Events and effects
// =============================================================================

/// Inputs to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnEvent {
    /// User asked to start a call
    CallStarted,
    /// Relay and upstream are connected
    UpstreamReady,
    /// Capture device acquired and streaming
    CaptureStarted,
    ConnectFailed(String),
    CaptureFailed(String),
    SpeechStarted {
        source: InterruptSource,
        /// Audio from an earlier response is still audible
        playback_active: bool,
    },
    /// User turn submitted (speech stopped or buffer committed)
    UserTurnEnded,
    ResponseCreated {
        response_id: String,
    },
    AudioDelta {
        response_id: String,
    },
    /// Assistant transcript or text delta
    CaptionDelta {
        response_id: String,
    },
    ResponseDone {
        response_id: String,
        cancelled: bool,
    },
    ResponseCancelled {
        response_id: Option<String>,
    },
    /// `error` event from the upstream
    UpstreamError(String),
    HangUp,
    /// Relay connection closed without a hang-up
    RelayClosed {
        code: u16,
        reason: String,
    },
    RelayFailed(String),
}

/// Severity of a user-facing notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// Actions the caller must perform, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SideEffect {
    /// Bootstrap the session and open the relay connection
    OpenRelay,
    StartCapture,
    StopCapture,
    /// Flush every scheduled playback buffer
    StopPlayback,
    /// Send `response.cancel` upstream
    SendCancel { response_id: Option<String> },
    /// Hand the audio delta to the playback scheduler
    EnqueuePlayback,
    /// Append the caption delta to the transcript
    AppendCaption,
    Notify { level: NoticeLevel, message: String },
    CloseRelay,
}

/// Result of feeding one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: CallState,
    pub to: CallState,
    pub effects: Vec<SideEffect>,
}

impl Transition {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }

    pub fn count(&self, effect: &SideEffect) -> usize {
        self.effects.iter().filter(|e| *e == effect).count()
    }
}

// =============================================================================
// Coordinator
// =============================================================================

/// The only writer of [`CallState`].
#[derive(Debug, Clone, Default)]
pub struct TurnCoordinator {
    state: CallState,
    interrupt_source: InterruptSource,
    upstream_ready: bool,
    capture_started: bool,
    current_response: Option<String>,
    cancelled_response: Option<String>,
    ignore_stale_audio: bool,
}

impl TurnCoordinator {
    pub fn new(interrupt_source: InterruptSource) -> Self {
        Self {
            interrupt_source,
            ..Default::default()
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn interrupt_source(&self) -> InterruptSource {
        self.interrupt_source
    }

    pub fn ignoring_stale_audio(&self) -> bool {
        self.ignore_stale_audio
    }

    pub fn current_response(&self) -> Option<&str> {
        self.current_response.as_deref()
    }

    /// Apply one event.
    pub fn handle(&mut self, event: TurnEvent) -> Transition {
        let from = self.state;
        let effects = self.apply(event);
        let to = self.state;
        if from != to {
            info!(from = %from, to = %to, "Call state changed");
        }
        Transition { from, to, effects }
    }

    fn apply(&mut self, event: TurnEvent) -> Vec<SideEffect> {
        use CallState::*;

        match event {
            TurnEvent::CallStarted => {
                if !matches!(self.state, Idle | Ended) {
                    debug!(state = %self.state, "Ignoring call start while a call is active");
                    return vec![];
                }
                self.reset_call();
                self.state = Connecting;
                vec![SideEffect::OpenRelay]
            }

            TurnEvent::UpstreamReady => {
                if self.state != Connecting || self.upstream_ready {
                    return vec![];
                }
                self.upstream_ready = true;
                self.enter_listening_if_ready();
                vec![SideEffect::StartCapture]
            }

            TurnEvent::CaptureStarted => {
                if self.state != Connecting {
                    return vec![];
                }
                self.capture_started = true;
                self.enter_listening_if_ready();
                vec![]
            }

            TurnEvent::ConnectFailed(message) => {
                if self.state != Connecting {
                    return vec![];
                }
                self.fail_call(message)
            }

            TurnEvent::CaptureFailed(message) => {
                if !self.state.is_active() {
                    return vec![];
                }
                self.fail_call(message)
            }

            TurnEvent::SpeechStarted {
                source,
                playback_active,
            } => {
                if source != self.interrupt_source {
                    return vec![];
                }
                match self.state {
                    Speaking => self.barge_in(),
                    Listening | Thinking if playback_active => {
                        // tail of a finished response is still audible
                        vec![SideEffect::StopPlayback]
                    }
                    _ => vec![],
                }
            }

            TurnEvent::UserTurnEnded => {
                if self.state == Listening {
                    self.state = Thinking;
                }
                vec![]
            }

            TurnEvent::ResponseCreated { response_id } => {
                if !self.state.is_in_call() {
                    return vec![];
                }
                self.ignore_stale_audio = false;
                self.current_response = Some(response_id);
                vec![]
            }

            TurnEvent::AudioDelta { response_id } => {
                if !self.accepts_output(&response_id) {
                    return vec![];
                }
                self.state = Speaking;
                vec![SideEffect::EnqueuePlayback]
            }

            TurnEvent::CaptionDelta { response_id } => {
                if !self.accepts_output(&response_id) {
                    return vec![];
                }
                self.state = Speaking;
                vec![SideEffect::AppendCaption]
            }

            TurnEvent::ResponseDone {
                response_id,
                cancelled,
            } => {
                if cancelled {
                    return self.upstream_cancelled(Some(response_id));
                }
                if matches!(self.state, Speaking | Thinking) && !self.is_stale(&response_id) {
                    self.state = Listening;
                }
                if self.current_response.as_deref() == Some(response_id.as_str()) {
                    self.current_response = None;
                }
                vec![]
            }

            TurnEvent::ResponseCancelled { response_id } => self.upstream_cancelled(response_id),

            TurnEvent::UpstreamError(message) => {
                if !self.state.is_active() {
                    return vec![];
                }
                vec![SideEffect::Notify {
                    level: NoticeLevel::Warning,
                    message,
                }]
            }

            TurnEvent::HangUp => {
                if !self.state.is_active() {
                    return vec![];
                }
                self.state = Ended;
                self.clear_response_tracking();
                vec![
                    SideEffect::StopCapture,
                    SideEffect::StopPlayback,
                    SideEffect::CloseRelay,
                ]
            }

            TurnEvent::RelayClosed { code, reason } => {
                if !self.state.is_active() {
                    return vec![];
                }
                let message = if reason.is_empty() {
                    format!("Connection closed ({code})")
                } else {
                    format!("Connection closed ({code}): {reason}")
                };
                self.fail_call(message)
            }

            TurnEvent::RelayFailed(message) => {
                if !self.state.is_active() {
                    return vec![];
                }
                self.fail_call(message)
            }
        }
    }

    fn enter_listening_if_ready(&mut self) {
        if self.upstream_ready && self.capture_started {
            self.state = CallState::Listening;
        }
    }

    /// Fatal failure: `idle` while still connecting, `ended` afterwards.
    fn fail_call(&mut self, message: String) -> Vec<SideEffect> {
        self.state = if self.state == CallState::Connecting {
            CallState::Idle
        } else {
            CallState::Ended
        };
        self.clear_response_tracking();
        vec![
            SideEffect::StopCapture,
            SideEffect::StopPlayback,
            SideEffect::CloseRelay,
            SideEffect::Notify {
                level: NoticeLevel::Error,
                message,
            },
        ]
    }

    fn barge_in(&mut self) -> Vec<SideEffect> {
        let response_id = self.current_response.take();
        debug!(response_id = ?response_id, "Barge-in");
        self.cancelled_response = response_id.clone();
        self.ignore_stale_audio = true;
        self.state = CallState::Listening;
        vec![
            SideEffect::StopPlayback,
            SideEffect::SendCancel { response_id },
        ]
    }

    fn upstream_cancelled(&mut self, response_id: Option<String>) -> Vec<SideEffect> {
        if self.state != CallState::Speaking {
            return vec![];
        }
        if let Some(id) = response_id.as_deref() {
            if self.is_stale(id) {
                return vec![];
            }
        }
        let cancelled = response_id.or_else(|| self.current_response.take());
        if self.current_response == cancelled {
            self.current_response = None;
        }
        self.cancelled_response = cancelled;
        self.ignore_stale_audio = true;
        self.state = CallState::Listening;
        vec![SideEffect::StopPlayback]
    }

    fn is_stale(&self, response_id: &str) -> bool {
        !response_id.is_empty() && self.cancelled_response.as_deref() == Some(response_id)
    }

    /// Whether output of `response_id` would be played right now.
    pub fn accepts_output(&self, response_id: &str) -> bool {
        self.state.is_in_call() && !self.ignore_stale_audio && !self.is_stale(response_id)
    }

    fn clear_response_tracking(&mut self) {
        self.current_response = None;
        self.cancelled_response = None;
        self.ignore_stale_audio = false;
    }

    fn reset_call(&mut self) {
        self.upstream_ready = false;
        self.capture_started = false;
        self.clear_response_tracking();
    }
}
