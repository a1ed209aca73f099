//! Build records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{BuildId, Error, Result};

/// Lifecycle status of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Pending,
    Started,
    Succeeded,
    Failed,
    Errored,
    Aborted,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Pending => "pending",
            BuildStatus::Started => "started",
            BuildStatus::Succeeded => "succeeded",
            BuildStatus::Failed => "failed",
            BuildStatus::Errored => "errored",
            BuildStatus::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuildStatus::Succeeded
                | BuildStatus::Failed
                | BuildStatus::Errored
                | BuildStatus::Aborted
        )
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BuildStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(BuildStatus::Pending),
            "started" => Ok(BuildStatus::Started),
            "succeeded" => Ok(BuildStatus::Succeeded),
            "failed" => Ok(BuildStatus::Failed),
            "errored" => Ok(BuildStatus::Errored),
            "aborted" => Ok(BuildStatus::Aborted),
            other => Err(Error::InvalidInput(format!("unknown build status: {}", other))),
        }
    }
}

/// What a build runs: a container image and the commands to execute in it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildPlan {
    pub image: String,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl BuildPlan {
    /// Decode a plan from its stored JSON form.
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        let plan: BuildPlan = serde_json::from_value(value.clone())
            .map_err(|e| Error::InvalidInput(format!("invalid build plan: {}", e)))?;
        if plan.image.trim().is_empty() {
            return Err(Error::InvalidInput("build plan has no image".to_string()));
        }
        Ok(plan)
    }
}

/// A build as discovered by a [`crate::BuildFinder`].
///
/// The tracker only looks at [`Build::id`]; the remaining fields are for
/// engines and logging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Build {
    pub id: BuildId,
    pub name: String,
    pub team_name: String,
    pub pipeline_name: Option<String>,
    pub job_name: Option<String>,
    pub status: BuildStatus,
    /// Raw plan document; decoded lazily with [`BuildPlan::from_json`].
    pub plan: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl Build {
    pub fn id(&self) -> BuildId {
        self.id
    }

    /// Create a started build with an empty plan. Handy for tests and one-off builds.
    pub fn started(id: BuildId, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            team_name: "main".to_string(),
            pipeline_name: None,
            job_name: None,
            status: BuildStatus::Started,
            plan: serde_json::Value::Null,
            created_at: now,
            start_time: Some(now),
            end_time: None,
        }
    }

    pub fn plan(&self) -> Result<BuildPlan> {
        BuildPlan::from_json(&self.plan)
    }
}
