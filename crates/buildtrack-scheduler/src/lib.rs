//! Build tracking for BuildTrack.
//!
//! The [`Tracker`] discovers started builds and makes sure each one is run by
//! exactly one task while it is in flight. The [`TrackerRunner`] drives the
//! tracker on an interval and on demand, and releases the engine on shutdown.

pub mod runner;
pub mod tracker;

#[cfg(test)]
pub(crate) mod testing;

pub use runner::{RunnerHandle, RunnerOptions, TrackerRunner};
pub use tracker::Tracker;
