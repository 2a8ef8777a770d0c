pub mod audio;
pub mod capture;
pub mod error;
pub mod playback;
pub mod protocol;
pub mod relay;
pub mod turn;

// Re-export commonly used types for convenience
pub use error::{CallError, CallResult};

pub use audio::{AudioFrame, FrameDirection, PcmEncoding};

pub use capture::{
    AudioSource, CaptureConfig, CaptureEvent, CapturePipeline, CommitMode, SpeechDetector,
    SpeechDetectorConfig,
};

pub use playback::{ManualClock, PlaybackClock, PlaybackScheduler, SystemClock};

pub use protocol::{ClientEvent, ServerEvent, SessionConfig, UpstreamProvider};

pub use relay::{RelayFrame, RelayOutcome, RelaySession, RelayState, UpstreamSettings};

pub use turn::{CallState, SideEffect, Transcript, TurnCoordinator, TurnEvent};
