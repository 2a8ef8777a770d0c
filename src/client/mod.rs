//! Headless call client
//!
//! Wires the capture pipeline, the playback scheduler and the turn
//! coordinator to a relay connection. WAV files stand in for the microphone
//! and the speaker.

pub mod call;
pub mod controller;
pub mod speaker;

pub use call::{CallPlan, CallReport, bootstrap_session, relay_url, run_call};
pub use controller::{CallAction, CallController, CallOptions, CallStats, Notice};
pub use speaker::{SpeakerReport, WavSpeaker};
