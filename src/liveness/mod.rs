//! Liveness Module
//!
//! Keep-alive signalling for operations that are busy but produce no I/O
//! for longer than a downstream idle timeout.
//!
//! - [`keeper`]: [`LivenessKeeper`] ticker and [`LivenessCounter`] signals

pub mod keeper;

pub use keeper::{LivenessCounter, LivenessGuard, LivenessKeeper};
