//! Capture pipeline: live input → rate-converted transport frames, plus
//! optional local speech detection.

pub mod pipeline;
pub mod source;
pub mod vad;

pub use pipeline::{
    CaptureConfig, CaptureEvent, CaptureFramer, CapturePipeline, CommitMode, append_event,
};
pub use source::{
    AudioSource, ChannelSource, DEFAULT_BLOCK_SIZE, DEFAULT_DEVICE_SAMPLE_RATE, WavSource,
};
pub use vad::{SpeechDetector, SpeechDetectorConfig, SpeechTransition};
