//! Call controller
//!
//! Feeds relay notices, upstream events and capture events through the
//! [`TurnCoordinator`] and carries out the side effects that only touch
//! in-process state (playback, transcript, notices). Effects that need a
//! socket or a device are handed back to the caller as [`CallAction`]s, in
//! the order the coordinator emitted them.

use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::core::audio::{AudioFrame, PcmEncoding};
use crate::core::capture::{CaptureConfig, CaptureEvent, CommitMode, append_event};
use crate::core::error::{CallError, CallResult};
use crate::core::playback::PlaybackScheduler;
use crate::core::protocol::{
    ClientEvent, DEFAULT_OUTPUT_SAMPLE_RATE, InputAudioTranscription, ServerEvent, SessionConfig,
    TurnDetection,
};
use crate::core::turn::{
    CallState, InterruptSource, NoticeLevel, Role, SideEffect, Transcript, Transition,
    TurnCoordinator, TurnEvent,
};

/// Per-call settings.
#[derive(Debug, Clone)]
pub struct CallOptions {
    pub voice: Option<String>,
    pub instructions: Option<String>,
    /// Encoding assumed for output deltas that declare nothing
    pub output_encoding: PcmEncoding,
    pub output_sample_rate: u32,
    pub capture: CaptureConfig,
    pub interrupt_source: InterruptSource,
    /// Model used for transcribing the user's audio; `None` disables it
    pub input_transcription: Option<String>,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            voice: None,
            instructions: None,
            output_encoding: PcmEncoding::Pcm16,
            output_sample_rate: DEFAULT_OUTPUT_SAMPLE_RATE,
            capture: CaptureConfig::default(),
            interrupt_source: InterruptSource::Upstream,
            input_transcription: None,
        }
    }
}

impl CallOptions {
    pub fn validate(&self) -> CallResult<()> {
        self.capture.validate()?;
        if self.output_sample_rate == 0 {
            return Err(CallError::InvalidConfig(
                "output sample rate must be greater than zero".to_string(),
            ));
        }
        if self.interrupt_source == InterruptSource::Local
            && self.capture.speech_detection.is_none()
        {
            return Err(CallError::InvalidConfig(
                "local interruption needs local speech detection".to_string(),
            ));
        }
        Ok(())
    }

    /// `session.update` payload announced once the upstream is open.
    pub fn session_config(&self) -> SessionConfig {
        let turn_detection = match self.capture.commit_mode {
            CommitMode::ServerVad => TurnDetection::server_vad(),
            CommitMode::Manual => TurnDetection::None {},
        };
        SessionConfig {
            modalities: Some(vec!["audio".to_string(), "text".to_string()]),
            instructions: self.instructions.clone(),
            voice: self.voice.clone(),
            input_audio_format: Some(PcmEncoding::Pcm16.as_str().to_string()),
            output_audio_format: Some(self.output_encoding.as_str().to_string()),
            input_audio_transcription: self
                .input_transcription
                .clone()
                .map(|model| InputAudioTranscription { model }),
            turn_detection: Some(turn_detection),
            temperature: None,
        }
    }
}

/// Work the controller cannot do by itself.
#[derive(Debug, Clone, PartialEq)]
pub enum CallAction {
    OpenRelay,
    StartCapture,
    StopCapture,
    CloseRelay,
    /// Write one event to the relay
    Send(ClientEvent),
    /// The capture source ran dry
    InputFinished,
}

/// A user-facing message raised during the call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

/// Counters kept over one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CallStats {
    pub frames_sent: u64,
    pub deltas_scheduled: u64,
    pub deltas_discarded: u64,
    pub responses_completed: u64,
    pub barge_ins: u64,
}

pub struct CallController {
    options: CallOptions,
    coordinator: TurnCoordinator,
    scheduler: Arc<PlaybackScheduler>,
    transcript: Transcript,
    notices: Vec<Notice>,
    stats: CallStats,
    state_tx: watch::Sender<CallState>,
}

impl CallController {
    /// Controller plus a receiver that observes every state change.
    pub fn new(
        options: CallOptions,
        scheduler: Arc<PlaybackScheduler>,
    ) -> (Self, watch::Receiver<CallState>) {
        let (state_tx, state_rx) = watch::channel(CallState::Idle);
        scheduler.configure(options.output_sample_rate);
        let controller = Self {
            coordinator: TurnCoordinator::new(options.interrupt_source),
            options,
            scheduler,
            transcript: Transcript::new(),
            notices: Vec::new(),
            stats: CallStats::default(),
            state_tx,
        };
        (controller, state_rx)
    }

    pub fn state(&self) -> CallState {
        self.coordinator.state()
    }

    pub fn options(&self) -> &CallOptions {
        &self.options
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn notices(&self) -> &[Notice] {
        &self.notices
    }

    pub fn stats(&self) -> CallStats {
        self.stats
    }

    pub fn scheduler(&self) -> &Arc<PlaybackScheduler> {
        &self.scheduler
    }

    pub fn subscribe(&self) -> watch::Receiver<CallState> {
        self.state_tx.subscribe()
    }

    pub fn start(&mut self) -> Vec<CallAction> {
        self.drive(TurnEvent::CallStarted).1
    }

    pub fn connect_failed(&mut self, err: &CallError) -> Vec<CallAction> {
        self.drive(TurnEvent::ConnectFailed(err.to_string())).1
    }

    pub fn capture_started(&mut self) -> Vec<CallAction> {
        self.drive(TurnEvent::CaptureStarted).1
    }

    pub fn capture_failed(&mut self, err: &CallError) -> Vec<CallAction> {
        self.drive(TurnEvent::CaptureFailed(err.to_string())).1
    }

    pub fn hang_up(&mut self) -> Vec<CallAction> {
        self.drive(TurnEvent::HangUp).1
    }

    pub fn relay_closed(&mut self, code: u16, reason: impl Into<String>) -> Vec<CallAction> {
        self.drive(TurnEvent::RelayClosed {
            code,
            reason: reason.into(),
        })
        .1
    }

    pub fn relay_failed(&mut self, message: impl Into<String>) -> Vec<CallAction> {
        self.drive(TurnEvent::RelayFailed(message.into())).1
    }

    /// Handle one text message from the relay. Unparseable messages are
    /// skipped.
    pub fn on_server_text(&mut self, text: &str) -> Vec<CallAction> {
        match ServerEvent::parse(text) {
            Ok(event) => self.on_server_event(event),
            Err(e) => {
                warn!(error = %e, "Skipping unparseable relay message");
                vec![]
            }
        }
    }

    pub fn on_server_event(&mut self, event: ServerEvent) -> Vec<CallAction> {
        match event {
            ServerEvent::UpstreamOpen => {
                let mut actions = vec![CallAction::Send(ClientEvent::session_update(
                    self.options.session_config(),
                ))];
                actions.extend(self.drive(TurnEvent::UpstreamReady).1);
                actions
            }

            ServerEvent::SessionCreated { .. } | ServerEvent::SessionUpdated { .. } => {
                debug!("Upstream session acknowledged");
                vec![]
            }

            ServerEvent::SpeechStarted { .. } => {
                let playback_active = self.scheduler.is_active();
                self.speech_started(InterruptSource::Upstream, playback_active)
            }

            ServerEvent::SpeechStopped { .. } | ServerEvent::InputAudioBufferCommitted { .. } => {
                self.drive(TurnEvent::UserTurnEnded).1
            }

            ServerEvent::InputTranscriptionCompleted { transcript, .. } => {
                self.transcript.push_final(Role::User, &transcript);
                vec![]
            }

            ServerEvent::ResponseCreated { response } => {
                self.transcript.close_open(Role::Assistant);
                self.drive(TurnEvent::ResponseCreated {
                    response_id: response.id,
                })
                .1
            }

            ServerEvent::AudioDelta {
                response_id,
                item_id,
                delta,
                sample_rate_hz,
                format,
            } => {
                // state only moves once the audio is actually scheduled
                if !self.coordinator.accepts_output(&response_id) {
                    self.stats.deltas_discarded += 1;
                    return vec![];
                }
                let event_id = if item_id.is_empty() {
                    response_id.clone()
                } else {
                    item_id
                };
                if !self.schedule_delta(&delta, sample_rate_hz, format.as_deref(), event_id) {
                    return vec![];
                }
                self.drive(TurnEvent::AudioDelta { response_id }).1
            }

            ServerEvent::AudioTranscriptDelta { response_id, delta }
            | ServerEvent::TextDelta { response_id, delta } => {
                let (transition, actions) =
                    self.drive(TurnEvent::CaptionDelta { response_id });
                if transition.count(&SideEffect::AppendCaption) > 0 {
                    self.transcript.append_delta(Role::Assistant, &delta);
                }
                actions
            }

            ServerEvent::AudioTranscriptDone { .. } | ServerEvent::TextDone { .. } => {
                self.transcript.mark_last_complete();
                vec![]
            }

            ServerEvent::AudioDone { .. } => vec![],

            ServerEvent::ResponseDone { response } => {
                self.transcript.close_open(Role::Assistant);
                let cancelled = response.is_cancelled();
                if !cancelled {
                    self.stats.responses_completed += 1;
                }
                self.drive(TurnEvent::ResponseDone {
                    response_id: response.id,
                    cancelled,
                })
                .1
            }

            ServerEvent::ResponseCancelled {
                response_id,
                response,
            } => {
                self.transcript.close_open(Role::Assistant);
                let response_id = response_id.or(response.map(|r| r.id));
                self.drive(TurnEvent::ResponseCancelled { response_id }).1
            }

            ServerEvent::Error { error } => {
                let message = if error.message.is_empty() {
                    error.error_type
                } else {
                    error.message
                };
                self.drive(TurnEvent::UpstreamError(message)).1
            }

            ServerEvent::UpstreamError { message } => {
                self.drive(TurnEvent::RelayFailed(message)).1
            }

            ServerEvent::UpstreamClose { code, reason } => self.relay_closed(code, reason),

            ServerEvent::Unknown => vec![],
        }
    }

    pub fn on_capture_event(&mut self, event: CaptureEvent) -> Vec<CallAction> {
        match event {
            CaptureEvent::Frame(frame) => {
                if !self.state().is_in_call() {
                    return vec![];
                }
                self.stats.frames_sent += 1;
                vec![CallAction::Send(append_event(&frame))]
            }
            CaptureEvent::SpeechStarted => {
                let playback_active = self.scheduler.is_active();
                self.speech_started(InterruptSource::Local, playback_active)
            }
            CaptureEvent::SpeechStopped => vec![],
            CaptureEvent::Commit => {
                if !self.state().is_in_call() {
                    return vec![];
                }
                vec![
                    CallAction::Send(ClientEvent::commit()),
                    CallAction::Send(ClientEvent::response_create()),
                ]
            }
            CaptureEvent::Ended => vec![CallAction::InputFinished],
            CaptureEvent::Failed(e) => self.capture_failed(&e),
        }
    }

    fn speech_started(
        &mut self,
        source: InterruptSource,
        playback_active: bool,
    ) -> Vec<CallAction> {
        let (transition, actions) = self.drive(TurnEvent::SpeechStarted {
            source,
            playback_active,
        });
        if transition.from == CallState::Speaking && transition.to == CallState::Listening {
            self.stats.barge_ins += 1;
            self.transcript.close_open(Role::Assistant);
        }
        actions
    }

    /// Decode and enqueue one delta. Returns false when it was dropped.
    fn schedule_delta(
        &mut self,
        delta: &str,
        sample_rate_hz: Option<u32>,
        format: Option<&str>,
        event_id: String,
    ) -> bool {
        if let Some(rate) = sample_rate_hz {
            self.scheduler.configure(rate);
        }
        let payload = match ServerEvent::decode_audio_delta(delta) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "Skipping audio delta");
                self.stats.deltas_discarded += 1;
                return false;
            }
        };
        let frame = AudioFrame::playback(
            Bytes::from(payload),
            self.scheduler.sample_rate(),
            ServerEvent::declared_encoding(format),
            event_id,
        );
        match self.scheduler.enqueue(&frame) {
            Ok(outcome) => {
                self.stats.deltas_scheduled += 1;
                debug!(
                    start = outcome.start,
                    duration = outcome.duration,
                    encoding = %outcome.encoding.as_str(),
                    "Audio delta scheduled"
                );
                true
            }
            Err(e) => {
                warn!(error = %e, "Skipping audio delta");
                self.stats.deltas_discarded += 1;
                false
            }
        }
    }

    fn drive(&mut self, event: TurnEvent) -> (Transition, Vec<CallAction>) {
        let transition = self.coordinator.handle(event);
        let mut actions = Vec::new();

        for effect in &transition.effects {
            match effect {
                SideEffect::OpenRelay => actions.push(CallAction::OpenRelay),
                SideEffect::StartCapture => actions.push(CallAction::StartCapture),
                SideEffect::StopCapture => actions.push(CallAction::StopCapture),
                SideEffect::CloseRelay => actions.push(CallAction::CloseRelay),
                SideEffect::StopPlayback => {
                    self.scheduler.stop_all();
                }
                SideEffect::SendCancel { response_id } => actions.push(CallAction::Send(
                    ClientEvent::response_cancel(response_id.clone()),
                )),
                // carried out by the caller, which holds the payload
                SideEffect::EnqueuePlayback | SideEffect::AppendCaption => {}
                SideEffect::Notify { level, message } => {
                    match level {
                        NoticeLevel::Info => info!(notice = %message, "Call notice"),
                        NoticeLevel::Warning => warn!(notice = %message, "Call notice"),
                        NoticeLevel::Error => error!(notice = %message, "Call notice"),
                    }
                    self.notices.push(Notice {
                        level: *level,
                        message: message.clone(),
                    });
                }
            }
        }

        if transition.changed() {
            self.state_tx.send_replace(transition.to);
        }
        (transition, actions)
    }
}
