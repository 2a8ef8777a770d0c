//! Test Fixtures Module
//!
//! - Audio fixtures (programmatically generated PCM and WAV files)
//! - Server fixtures (gateway bound to an ephemeral port)

// Allow dead code in test fixtures - not every test binary uses every helper
#![allow(dead_code)]

pub mod audio_fixtures;
pub mod server_fixtures;

pub use audio_fixtures::*;
pub use server_fixtures::*;
