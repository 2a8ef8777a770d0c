//! Playback of synthesized speech.

pub mod clock;
pub mod scheduler;

pub use clock::{ManualClock, PlaybackClock, SystemClock};
pub use scheduler::{EnqueueOutcome, PlaybackScheduler, ScheduledBuffer};
