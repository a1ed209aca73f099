//! Local Docker executor implementation.

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerState, ContainerStateStatusEnum};
use buildtrack_core::executor::*;
use buildtrack_core::{BuildId, Error, Result};
use chrono::Utc;
use futures::StreamExt;
use futures::stream::BoxStream;
use tracing::{debug, info, warn};

/// Runs build jobs as containers on the local Docker daemon.
pub struct LocalDockerExecutor {
    docker: Docker,
}

impl LocalDockerExecutor {
    /// Create a new LocalDockerExecutor connecting to the local Docker daemon.
    pub fn new() -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().map_err(|e| Error::Internal(e.to_string()))?;
        Ok(Self { docker })
    }

    fn container_name(build_id: &BuildId) -> String {
        format!("buildtrack-build-{}", build_id)
    }

    fn handle(
        &self,
        build_id: BuildId,
        container_id: String,
        logs_since: Option<chrono::DateTime<Utc>>,
    ) -> JobHandle {
        JobHandle {
            build_id,
            executor_id: container_id,
            executor_name: self.name().to_string(),
            logs_since,
        }
    }

    /// Start a created container, removing it if it cannot be started.
    async fn start(&self, container_name: &str) -> Result<()> {
        info!(container = %container_name, "Starting container");
        let started = self
            .docker
            .start_container(container_name, None::<StartContainerOptions<String>>)
            .await;

        if let Err(e) = started {
            if let Err(remove_err) = self.remove(container_name).await {
                warn!(
                    container = %container_name,
                    error = %remove_err,
                    "Failed to remove unstarted container"
                );
            }
            return Err(Error::ExecutionFailed(format!("Failed to start container: {}", e)));
        }
        Ok(())
    }

    async fn remove(&self, container_name: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        self.docker
            .remove_container(container_name, Some(options))
            .await
            .map_err(|e| Error::ExecutionFailed(format!("Failed to remove container: {}", e)))
    }

    async fn pull_image(&self, image: &str) {
        info!(image = %image, "Pulling image");
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };

        let mut pull_stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = pull_stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(status = %status, "Pull progress");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Pull warning");
                }
            }
        }
    }
}

fn parse_time(value: Option<String>) -> Option<chrono::DateTime<Utc>> {
    value
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

#[async_trait]
impl Executor for LocalDockerExecutor {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn spawn(&self, spec: JobSpec) -> Result<JobHandle> {
        let container_name = Self::container_name(&spec.build_id);

        // A previous process may have been released while this build was running.
        if let Ok(existing) = self.docker.inspect_container(&container_name, None).await {
            let container_id = existing.id.unwrap_or_else(|| container_name.clone());
            let state = existing.state.and_then(|s| s.status);

            if state == Some(ContainerStateStatusEnum::CREATED) {
                self.start(&container_name).await?;
                return Ok(self.handle(spec.build_id, container_id, None));
            }

            info!(container = %container_name, ?state, "Reattaching to existing container");
            return Ok(self.handle(spec.build_id, container_id, Some(Utc::now())));
        }

        self.pull_image(&spec.image).await;

        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let cmd = if spec.command.is_empty() {
            None
        } else {
            Some(spec.command.clone())
        };

        let config = Config {
            image: Some(spec.image.clone()),
            cmd,
            env: Some(env),
            working_dir: spec.working_dir.clone(),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: container_name.clone(),
            platform: None,
        };

        info!(container = %container_name, "Creating container");
        let container = self
            .docker
            .create_container(Some(create_options), config)
            .await
            .map_err(|e| Error::ExecutionFailed(format!("Failed to create container: {}", e)))?;

        self.start(&container_name).await?;

        Ok(self.handle(spec.build_id, container.id, None))
    }

    async fn logs(&self, handle: &JobHandle) -> Result<BoxStream<'static, LogLine>> {
        let container_name = Self::container_name(&handle.build_id);

        let stream = self.docker.logs(&container_name, Some(logs_options(handle)));

        let mapped_stream = stream.filter_map(|result| async move {
            match result {
                Ok(output) => {
                    let (stream, message) = match output {
                        LogOutput::StdErr { message } => (LogStream::Stderr, message),
                        LogOutput::StdOut { message }
                        | LogOutput::Console { message }
                        | LogOutput::StdIn { message } => (LogStream::Stdout, message),
                    };
                    Some(LogLine {
                        timestamp: Utc::now(),
                        stream,
                        content: String::from_utf8_lossy(&message).trim_end().to_string(),
                    })
                }
                Err(e) => {
                    warn!(error = %e, "Log stream error");
                    None
                }
            }
        });

        Ok(Box::pin(mapped_stream))
    }

    async fn status(&self, handle: &JobHandle) -> Result<JobStatus> {
        let container_name = Self::container_name(&handle.build_id);

        let inspect = self
            .docker
            .inspect_container(&container_name, None)
            .await
            .map_err(|e| Error::NotFound(format!("Container not found: {}", e)))?;

        let state = inspect
            .state
            .ok_or_else(|| Error::Internal("No state".to_string()))?;

        Ok(job_status(state))
    }

    async fn wait(&self, handle: &JobHandle) -> Result<JobResult> {
        let container_name = Self::container_name(&handle.build_id);

        // First check if container is already stopped
        let current_status = self.status(handle).await?;
        if current_status.is_terminal() {
            let exit_code = match &current_status {
                JobStatus::Succeeded { .. } => Some(0),
                JobStatus::Failed { exit_code, .. } => *exit_code,
                _ => None,
            };
            return Ok(JobResult {
                status: current_status,
                exit_code,
            });
        }

        let options = WaitContainerOptions {
            condition: "not-running",
        };

        let mut stream = self.docker.wait_container(&container_name, Some(options));

        let exit_code = match stream.next().await {
            Some(Ok(response)) => Some(response.status_code as i32),
            Some(Err(e)) => {
                // Non-zero exits surface as errors; the status below has the details.
                debug!(error = %e, "Wait returned an error");
                None
            }
            None => None,
        };

        let status = self.status(handle).await?;
        let exit_code = match &status {
            JobStatus::Succeeded { .. } => Some(0),
            JobStatus::Failed {
                exit_code: Some(code),
                ..
            } => Some(*code),
            _ => exit_code,
        };

        Ok(JobResult { status, exit_code })
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<()> {
        self.remove(&Self::container_name(&handle.build_id)).await
    }
}

fn logs_options(handle: &JobHandle) -> LogsOptions<String> {
    LogsOptions {
        follow: true,
        stdout: true,
        stderr: true,
        since: handle.logs_since.map(|t| t.timestamp()).unwrap_or(0),
        ..Default::default()
    }
}

/// Map Docker container state onto a job status.
fn job_status(state: ContainerState) -> JobStatus {
    match state.status {
        // Never started, so an exit code of 0 means nothing.
        Some(ContainerStateStatusEnum::CREATED) => return JobStatus::Pending,
        Some(ContainerStateStatusEnum::RUNNING | ContainerStateStatusEnum::RESTARTING) => {
            let started_at = parse_time(state.started_at).unwrap_or_else(Utc::now);
            return JobStatus::Running { started_at };
        }
        _ => {}
    }

    if state.running.unwrap_or(false) {
        let started_at = parse_time(state.started_at).unwrap_or_else(Utc::now);
        return JobStatus::Running { started_at };
    }
    if state.paused.unwrap_or(false) {
        return JobStatus::Pending;
    }

    let exit_code = state.exit_code.map(|c| c as i32);
    let started_at = parse_time(state.started_at);
    let finished_at = parse_time(state.finished_at).unwrap_or_else(Utc::now);

    if exit_code == Some(0) {
        JobStatus::Succeeded {
            started_at: started_at.unwrap_or(finished_at),
            finished_at,
        }
    } else {
        JobStatus::Failed {
            started_at,
            finished_at,
            exit_code,
            message: state.error.unwrap_or_default(),
        }
    }
}
