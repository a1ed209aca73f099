//! Core domain types and traits for BuildTrack.
//!
//! This crate contains:
//! - Build identifiers and build records
//! - The capability traits the tracker consumes (finder, engine, runnable)
//! - The build store used by engines to record outcomes
//! - The container executor contract

pub mod build;
pub mod engine;
pub mod error;
pub mod executor;
pub mod finder;
pub mod id;

pub use build::{Build, BuildPlan, BuildStatus};
pub use engine::{Engine, Runnable};
pub use error::{Error, Result};
pub use finder::{BuildFinder, BuildStore};
pub use id::BuildId;
