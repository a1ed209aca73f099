//! Build discovery and bookkeeping contracts.

use async_trait::async_trait;

use crate::executor::LogLine;
use crate::{Build, BuildId, BuildStatus, Result};

/// Source of truth for builds that are in the started state.
#[async_trait]
pub trait BuildFinder: Send + Sync {
    /// Snapshot of every build currently marked as started.
    async fn get_all_started_builds(&self) -> Result<Vec<Build>>;
}

/// Where engines record build output and outcomes.
#[async_trait]
pub trait BuildStore: Send + Sync {
    /// Move a started build to a terminal status.
    ///
    /// Returns `false` if the build was no longer started.
    async fn finish_build(&self, id: BuildId, status: BuildStatus) -> Result<bool>;

    /// Append a line of output to the build's event log.
    async fn append_log(&self, id: BuildId, line: &LogLine) -> Result<()>;
}
