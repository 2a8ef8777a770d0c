//! Turn-taking: call state machine and captions.

pub mod coordinator;
pub mod transcript;

pub use coordinator::{
    CallState, InterruptSource, NoticeLevel, SideEffect, Transition, TurnCoordinator, TurnEvent,
};
pub use transcript::{Role, Transcript, Utterance};
