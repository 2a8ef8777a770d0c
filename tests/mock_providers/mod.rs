//! Mock realtime upstream
//!
//! An in-process WebSocket server speaking just enough of the realtime
//! protocol for the relay and call-client tests. Behaviour per connection is
//! chosen with [`MockBehavior`]; everything the mock receives is recorded in
//! [`MockUpstreamState`] for assertions.

// Allow dead code in test infrastructure - not every test binary uses every helper
#![allow(dead_code)]

pub mod realtime_mock;

pub use realtime_mock::*;
