//! Realtime protocol: event types and upstream endpoint selection.

pub mod config;
pub mod messages;

pub use config::{
    DASHSCOPE_REALTIME_URL, DEFAULT_INPUT_SAMPLE_RATE, DEFAULT_MODEL, DEFAULT_OUTPUT_SAMPLE_RATE,
    DEFAULT_VOICE, OPENAI_REALTIME_URL, UpstreamProvider, build_upstream_url,
};
pub use messages::{
    ApiError, ClientEvent, InputAudioTranscription, ResponseConfig, ResponseInfo, ServerEvent,
    SessionConfig, TurnDetection, new_event_id,
};
