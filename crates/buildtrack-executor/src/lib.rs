//! Build execution for BuildTrack.
//!
//! Provides:
//! - [`ExecutorEngine`], the engine the tracker hands started builds to
//! - [`LocalDockerExecutor`], which runs build jobs as local containers

pub mod docker;
pub mod engine;

pub use buildtrack_core::executor::{
    Executor, JobHandle, JobResult, JobSpec, JobStatus, LogLine, LogStream,
};
pub use docker::LocalDockerExecutor;
pub use engine::ExecutorEngine;
