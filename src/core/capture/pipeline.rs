//! Microphone → transport framing.
//!
//! Raw blocks are block-average downsampled to the target rate, converted to
//! PCM16 and accumulated until exactly one frame duration is available. Only
//! whole frames leave the pipeline; the tail waits for the next block.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::source::AudioSource;
use super::vad::{SpeechDetector, SpeechDetectorConfig, SpeechTransition};
use crate::core::audio::{AudioFrame, downsample_to_pcm16};
use crate::core::error::{CallError, CallResult};
use crate::core::protocol::{ClientEvent, DEFAULT_INPUT_SAMPLE_RATE, new_event_id};

/// Who decides that the user's turn is over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitMode {
    /// Upstream VAD commits the buffer
    #[default]
    ServerVad,
    /// The client commits periodically and asks for a response
    Manual,
}

/// Capture pipeline settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub target_sample_rate: u32,
    pub frame_duration_ms: u32,
    /// Local speech detection; `None` disables it
    pub speech_detection: Option<SpeechDetectorConfig>,
    pub commit_mode: CommitMode,
    /// Minimum spacing between manual commits
    pub commit_interval_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            target_sample_rate: DEFAULT_INPUT_SAMPLE_RATE,
            frame_duration_ms: 200,
            speech_detection: None,
            commit_mode: CommitMode::ServerVad,
            commit_interval_ms: 800,
        }
    }
}

impl CaptureConfig {
    /// Samples per emitted frame.
    pub fn frame_samples(&self) -> usize {
        (u64::from(self.target_sample_rate) * u64::from(self.frame_duration_ms) / 1000) as usize
    }

    pub fn validate(&self) -> CallResult<()> {
        if self.frame_duration_ms == 0 {
            return Err(CallError::InvalidConfig(
                "frame duration must be greater than zero".to_string(),
            ));
        }
        if self.target_sample_rate == 0 {
            return Err(CallError::InvalidConfig(
                "target sample rate must be greater than zero".to_string(),
            ));
        }
        if self.frame_samples() == 0 {
            return Err(CallError::InvalidConfig(format!(
                "{} ms at {} Hz is less than one sample",
                self.frame_duration_ms, self.target_sample_rate
            )));
        }
        Ok(())
    }
}

/// Output of the capture pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    /// One full frame at the target rate
    Frame(AudioFrame),
    /// Local detector heard the user start speaking
    SpeechStarted,
    /// Local detector heard the user stop speaking
    SpeechStopped,
    /// Manual mode: commit the buffer and request a response
    Commit,
    /// The source ran dry
    Ended,
    /// The source failed; capture has stopped
    Failed(CallError),
}

/// Transport form of a captured frame.
pub fn append_event(frame: &AudioFrame) -> ClientEvent {
    ClientEvent::InputAudioBufferAppend {
        event_id: Some(frame.event_id().to_string()),
        audio: frame.to_base64(),
    }
}

/// Synchronous framing core, driven one raw block at a time.
#[derive(Debug)]
pub struct CaptureFramer {
    config: CaptureConfig,
    device_rate: u32,
    frame_samples: usize,
    pending: Vec<i16>,
    detector: Option<SpeechDetector>,
    last_commit: Option<Instant>,
    frames_emitted: u64,
}

impl CaptureFramer {
    pub fn new(config: CaptureConfig, device_rate: u32) -> CallResult<Self> {
        config.validate()?;
        if device_rate == 0 {
            return Err(CallError::InvalidConfig(
                "device sample rate must be greater than zero".to_string(),
            ));
        }
        let frame_samples = config.frame_samples();
        let detector = config.speech_detection.map(SpeechDetector::new);
        Ok(Self {
            config,
            device_rate,
            frame_samples,
            pending: Vec::with_capacity(frame_samples * 2),
            detector,
            last_commit: None,
            frames_emitted: 0,
        })
    }

    /// Process one raw block observed at `now`.
    pub fn push_block(&mut self, block: &[f32], now: Instant) -> Vec<CaptureEvent> {
        let mut events = Vec::new();

        if let Some(detector) = self.detector.as_mut() {
            match detector.process(block) {
                Some(SpeechTransition::Onset) => events.push(CaptureEvent::SpeechStarted),
                Some(SpeechTransition::Offset) => events.push(CaptureEvent::SpeechStopped),
                None => {}
            }
        }

        let converted =
            downsample_to_pcm16(block, self.device_rate, self.config.target_sample_rate);
        self.pending.extend_from_slice(&converted);

        while self.pending.len() >= self.frame_samples {
            let samples: Vec<i16> = self.pending.drain(..self.frame_samples).collect();
            let frame =
                AudioFrame::capture(&samples, self.config.target_sample_rate, new_event_id());
            self.frames_emitted += 1;
            events.push(CaptureEvent::Frame(frame));

            if self.config.commit_mode == CommitMode::Manual && self.commit_due(now) {
                self.last_commit = Some(now);
                events.push(CaptureEvent::Commit);
            }
        }

        events
    }

    fn commit_due(&self, now: Instant) -> bool {
        match self.last_commit {
            None => true,
            Some(last) => {
                now.saturating_duration_since(last)
                    >= Duration::from_millis(self.config.commit_interval_ms)
            }
        }
    }

    /// Samples waiting for the next frame.
    pub fn buffered_samples(&self) -> usize {
        self.pending.len()
    }

    pub fn frames_emitted(&self) -> u64 {
        self.frames_emitted
    }

    pub fn is_speaking(&self) -> bool {
        self.detector.as_ref().is_some_and(|d| d.is_speaking())
    }

    /// Discard the partial frame and speech state.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.last_commit = None;
        if let Some(detector) = self.detector.as_mut() {
            detector.reset();
        }
    }
}

/// Handle to a running capture task.
#[derive(Debug)]
pub struct CapturePipeline {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl CapturePipeline {
    /// Validate the configuration and spawn the capture task.
    ///
    /// Fails fast with [`CallError::InvalidConfig`] before anything is
    /// spawned.
    pub fn start<S>(
        source: S,
        config: CaptureConfig,
        events: mpsc::Sender<CaptureEvent>,
    ) -> CallResult<Self>
    where
        S: AudioSource + 'static,
    {
        let framer = CaptureFramer::new(config, source.sample_rate())?;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_capture(source, framer, events, cancel.clone()));
        Ok(Self {
            cancel,
            task: Some(task),
        })
    }

    /// Stop capturing and wait for the task to finish. Idempotent.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Capture task ended abnormally: {}", e);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_capture<S: AudioSource>(
    mut source: S,
    mut framer: CaptureFramer,
    events: mpsc::Sender<CaptureEvent>,
    cancel: CancellationToken,
) {
    info!(
        device_rate = source.sample_rate(),
        target_rate = framer.config.target_sample_rate,
        frame_ms = framer.config.frame_duration_ms,
        "Capture started"
    );

    'capture: loop {
        let block = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            block = source.next_block() => block,
        };

        match block {
            Ok(Some(block)) => {
                for event in framer.push_block(&block, Instant::now()) {
                    if events.send(event).await.is_err() {
                        debug!("Capture consumer dropped");
                        break 'capture;
                    }
                }
            }
            Ok(None) => {
                debug!(
                    discarded = framer.buffered_samples(),
                    "Capture source exhausted"
                );
                let _ = events.send(CaptureEvent::Ended).await;
                break;
            }
            Err(e) => {
                warn!("Capture source failed: {}", e);
                let _ = events.send(CaptureEvent::Failed(e)).await;
                break;
            }
        }
    }

    framer.reset();
    info!(frames = framer.frames_emitted(), "Capture stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::capture::ChannelSource;

    fn frames(events: &[CaptureEvent]) -> Vec<&AudioFrame> {
        events
            .iter()
            .filter_map(|e| match e {
                CaptureEvent::Frame(f) => Some(f),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_zero_duration_is_invalid() {
        let config = CaptureConfig {
            frame_duration_ms: 0,
            ..Default::default()
        };
        assert!(matches!(
            CaptureFramer::new(config, 48_000),
            Err(CallError::InvalidConfig(_))
        ));
        assert!(CaptureFramer::new(CaptureConfig::default(), 0).is_err());
    }

    #[test]
    fn test_frames_are_exact_and_tail_is_kept() {
        let mut framer = CaptureFramer::new(CaptureConfig::default(), 48_000).unwrap();
        let now = Instant::now();

        // 4096 @ 48k -> 1365 @ 16k per block; 3200 samples per frame
        let mut all = Vec::new();
        for _ in 0..5 {
            all.extend(framer.push_block(&[0.1; 4096], now));
        }
        let emitted = frames(&all);
        assert_eq!(emitted.len(), 2);
        for frame in &emitted {
            assert_eq!(frame.sample_count(), Some(3200));
            assert_eq!(frame.sample_rate(), 16_000);
            assert!(frame.event_id().starts_with("event_"));
        }
        assert_eq!(framer.buffered_samples(), 5 * 1365 - 6400);

        framer.reset();
        assert_eq!(framer.buffered_samples(), 0);
    }

    #[test]
    fn test_identity_when_rates_match() {
        let config = CaptureConfig {
            frame_duration_ms: 10,
            ..Default::default()
        };
        let mut framer = CaptureFramer::new(config, 16_000).unwrap();
        let events = framer.push_block(&[0.5; 160], Instant::now());
        let emitted = frames(&events);
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].payload().len(), 320);
        assert_eq!(framer.buffered_samples(), 0);
    }

    #[test]
    fn test_speech_detection_runs_alongside_framing() {
        let config = CaptureConfig {
            speech_detection: Some(SpeechDetectorConfig::default()),
            frame_duration_ms: 10,
            ..Default::default()
        };
        let mut framer = CaptureFramer::new(config, 16_000).unwrap();
        let now = Instant::now();

        let mut events = Vec::new();
        for _ in 0..5 {
            events.extend(framer.push_block(&[0.5; 160], now));
        }
        assert_eq!(frames(&events).len(), 5);
        assert_eq!(
            events
                .iter()
                .filter(|e| **e == CaptureEvent::SpeechStarted)
                .count(),
            1
        );
        assert!(framer.is_speaking());
    }

    #[test]
    fn test_manual_commit_spacing() {
        let config = CaptureConfig {
            commit_mode: CommitMode::Manual,
            frame_duration_ms: 10,
            ..Default::default()
        };
        let mut framer = CaptureFramer::new(config, 16_000).unwrap();
        let t0 = Instant::now();

        let commits = |events: Vec<CaptureEvent>| {
            events
                .iter()
                .filter(|e| **e == CaptureEvent::Commit)
                .count()
        };

        assert_eq!(commits(framer.push_block(&[0.0; 160], t0)), 1);
        assert_eq!(
            commits(framer.push_block(&[0.0; 160], t0 + Duration::from_millis(400))),
            0
        );
        assert_eq!(
            commits(framer.push_block(&[0.0; 160], t0 + Duration::from_millis(800))),
            1
        );
    }

    #[test]
    fn test_append_event_uses_frame_id() {
        let frame = AudioFrame::capture(&[0, 1], 16_000, "event_abc");
        match append_event(&frame) {
            ClientEvent::InputAudioBufferAppend { event_id, audio } => {
                assert_eq!(event_id.as_deref(), Some("event_abc"));
                assert_eq!(audio, "AAABAA==");
            }
            _ => panic!("Wrong event type"),
        }
    }

    #[tokio::test]
    async fn test_pipeline_emits_frames_and_stops_idempotently() {
        let (block_tx, source) = ChannelSource::new(48_000, 16);
        let (event_tx, mut event_rx) = mpsc::channel(16);

        let mut pipeline =
            CapturePipeline::start(source, CaptureConfig::default(), event_tx).unwrap();

        for _ in 0..3 {
            block_tx.send(vec![0.1; 4096]).await.unwrap();
        }
        match event_rx.recv().await.unwrap() {
            CaptureEvent::Frame(frame) => assert_eq!(frame.sample_count(), Some(3200)),
            other => panic!("unexpected event {other:?}"),
        }

        pipeline.stop().await;
        assert!(!pipeline.is_running());
        pipeline.stop().await;
    }

    #[tokio::test]
    async fn test_pipeline_reports_exhausted_source() {
        let (block_tx, source) = ChannelSource::new(16_000, 4);
        let (event_tx, mut event_rx) = mpsc::channel(4);
        let _pipeline = CapturePipeline::start(source, CaptureConfig::default(), event_tx).unwrap();
        drop(block_tx);
        assert_eq!(event_rx.recv().await, Some(CaptureEvent::Ended));
    }

    #[tokio::test]
    async fn test_invalid_config_fails_before_spawning() {
        let (_block_tx, source) = ChannelSource::new(48_000, 4);
        let (event_tx, _event_rx) = mpsc::channel(4);
        let config = CaptureConfig {
            frame_duration_ms: 0,
            ..Default::default()
        };
        assert!(matches!(
            CapturePipeline::start(source, config, event_tx),
            Err(CallError::InvalidConfig(_))
        ));
    }
}
