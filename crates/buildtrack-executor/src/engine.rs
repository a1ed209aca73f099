//! Executor-backed engine - runs each build as a single container job.

use async_trait::async_trait;
use buildtrack_core::executor::{Executor, JobHandle, JobResult, JobSpec, JobStatus, LogLine};
use buildtrack_core::{Build, BuildStatus, BuildStore, Engine, Result, Runnable};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{Instrument, Span, debug, error, info, warn};

/// How long to keep reading logs after the job has exited.
const LOG_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Engine that turns build plans into executor jobs.
pub struct ExecutorEngine {
    executor: Arc<dyn Executor>,
    store: Arc<dyn BuildStore>,
    work_dir: String,
    released: watch::Sender<bool>,
}

impl ExecutorEngine {
    pub fn new(
        executor: Arc<dyn Executor>,
        store: Arc<dyn BuildStore>,
        work_dir: impl Into<String>,
    ) -> Self {
        let (released, _) = watch::channel(false);
        Self {
            executor,
            store,
            work_dir: work_dir.into(),
            released,
        }
    }
}

#[async_trait]
impl Engine for ExecutorEngine {
    fn new_build(&self, build: Build) -> Box<dyn Runnable> {
        Box::new(ExecutorBuild {
            build,
            executor: Arc::clone(&self.executor),
            store: Arc::clone(&self.store),
            work_dir: self.work_dir.clone(),
            released: self.released.subscribe(),
        })
    }

    /// Stop following in-flight builds. Their jobs keep running and the
    /// builds stay started, so the next process picks them up again.
    async fn release_all(&self) {
        if self.released.send_replace(true) {
            debug!("Engine already released");
        } else {
            info!("Engine released");
        }
    }
}

/// A build bound to an executor job.
struct ExecutorBuild {
    build: Build,
    executor: Arc<dyn Executor>,
    store: Arc<dyn BuildStore>,
    work_dir: String,
    released: watch::Receiver<bool>,
}

#[async_trait]
impl Runnable for ExecutorBuild {
    async fn run(&self, span: Span) {
        self.execute().instrument(span).await
    }
}

impl ExecutorBuild {
    async fn execute(&self) {
        let mut released = self.released.clone();
        if *released.borrow_and_update() {
            info!("Engine released, not starting build");
            return;
        }

        let spec = match self.job_spec() {
            Ok(spec) => spec,
            Err(e) => {
                error!(error = %e, "Invalid build plan");
                self.record(&LogLine::system(e.to_string())).await;
                self.finish(BuildStatus::Errored).await;
                return;
            }
        };

        let handle = match self.executor.spawn(spec).await {
            Ok(handle) => handle,
            Err(e) => {
                error!(error = %e, "Failed to start build job");
                self.record(&LogLine::system(e.to_string())).await;
                self.finish(BuildStatus::Errored).await;
                return;
            }
        };
        info!(executor = %handle.executor_name, job = %handle.executor_id, "Build job started");

        let outcome = tokio::select! {
            outcome = self.follow(&handle) => outcome,
            _ = wait_for_release(&mut released) => {
                info!("Engine released, leaving build job running");
                return;
            }
        };

        let status = match outcome {
            Ok(JobResult {
                status: JobStatus::Succeeded { .. },
                ..
            }) => BuildStatus::Succeeded,
            Ok(JobResult {
                status: JobStatus::Failed { message, .. },
                exit_code,
            }) => {
                info!(?exit_code, %message, "Build job failed");
                BuildStatus::Failed
            }
            Ok(JobResult { status, .. }) => {
                warn!(?status, "Build job ended in unexpected state");
                BuildStatus::Errored
            }
            Err(e) => {
                error!(error = %e, "Lost track of build job");
                BuildStatus::Errored
            }
        };

        self.record(&LogLine::system(format!("build {}", status))).await;

        // Keep the exited job until the result is stored, so a retry reads
        // its exit status instead of running it again.
        if !self.finish(status).await {
            return;
        }

        if let Err(e) = self.executor.cancel(&handle).await {
            warn!(error = %e, "Failed to clean up build job");
        }
    }

    fn job_spec(&self) -> Result<JobSpec> {
        let plan = self.build.plan()?;

        let command = if plan.commands.is_empty() {
            vec![]
        } else {
            vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                plan.commands.join(" && "),
            ]
        };

        Ok(JobSpec {
            build_id: self.build.id(),
            image: plan.image,
            command,
            working_dir: Some(self.work_dir.clone()),
            env: plan.env,
        })
    }

    /// Forward job output until the job exits.
    async fn follow(&self, handle: &JobHandle) -> Result<JobResult> {
        let mut logs = self.executor.logs(handle).await?;
        let wait = self.executor.wait(handle);
        tokio::pin!(wait);

        let result = loop {
            tokio::select! {
                result = &mut wait => break result,
                line = logs.next() => match line {
                    Some(line) => self.record(&line).await,
                    None => break (&mut wait).await,
                },
            }
        };

        while let Ok(Some(line)) = tokio::time::timeout(LOG_DRAIN_TIMEOUT, logs.next()).await {
            self.record(&line).await;
        }

        result
    }

    async fn record(&self, line: &LogLine) {
        info!(stream = line.stream.as_str(), "{}", line.content);
        if let Err(e) = self.store.append_log(self.build.id(), line).await {
            warn!(error = %e, "Failed to save build output");
        }
    }

    /// Store the build result. `false` if the store could not be reached.
    async fn finish(&self, status: BuildStatus) -> bool {
        match self.store.finish_build(self.build.id(), status).await {
            Ok(true) => info!(%status, "Build finished"),
            Ok(false) => warn!(%status, "Build was no longer started"),
            Err(e) => {
                error!(error = %e, %status, "Failed to record build result");
                return false;
            }
        }
        true
    }
}

/// Resolves once the engine is released. Never resolves if the engine is gone.
async fn wait_for_release(released: &mut watch::Receiver<bool>) {
    if released.wait_for(|released| *released).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildtrack_core::executor::LogStream;
    use buildtrack_core::{BuildId, Error};
    use chrono::Utc;
    use futures::stream::{self, BoxStream};
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Clone, Copy)]
    enum Outcome {
        Exit(i32),
        SpawnError,
        Hang,
    }

    struct FakeExecutor {
        outcome: Outcome,
        spawned: Mutex<Vec<JobSpec>>,
        cancelled: AtomicUsize,
    }

    impl FakeExecutor {
        fn new(outcome: Outcome) -> Arc<Self> {
            Arc::new(Self {
                outcome,
                spawned: Mutex::new(Vec::new()),
                cancelled: AtomicUsize::new(0),
            })
        }

        fn spawned(&self) -> Vec<JobSpec> {
            self.spawned.lock().unwrap().clone()
        }

        fn cancelled(&self) -> usize {
            self.cancelled.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Executor for FakeExecutor {
        fn name(&self) -> &'static str {
            "fake"
        }

        async fn spawn(&self, spec: JobSpec) -> Result<JobHandle> {
            if matches!(self.outcome, Outcome::SpawnError) {
                return Err(Error::ExecutionFailed("no such image".to_string()));
            }
            let handle = JobHandle {
                build_id: spec.build_id,
                executor_id: format!("job-{}", spec.build_id),
                executor_name: self.name().to_string(),
                logs_since: None,
            };
            self.spawned.lock().unwrap().push(spec);
            Ok(handle)
        }

        async fn logs(&self, _handle: &JobHandle) -> Result<BoxStream<'static, LogLine>> {
            if matches!(self.outcome, Outcome::Hang) {
                return Ok(stream::pending().boxed());
            }
            let line = LogLine {
                timestamp: Utc::now(),
                stream: LogStream::Stdout,
                content: "hello".to_string(),
            };
            Ok(stream::iter(vec![line]).boxed())
        }

        async fn status(&self, _handle: &JobHandle) -> Result<JobStatus> {
            Ok(JobStatus::Pending)
        }

        async fn wait(&self, _handle: &JobHandle) -> Result<JobResult> {
            let now = Utc::now();
            match self.outcome {
                Outcome::Exit(0) => Ok(JobResult {
                    status: JobStatus::Succeeded {
                        started_at: now,
                        finished_at: now,
                    },
                    exit_code: Some(0),
                }),
                Outcome::Exit(code) => Ok(JobResult {
                    status: JobStatus::Failed {
                        started_at: Some(now),
                        finished_at: now,
                        exit_code: Some(code),
                        message: String::new(),
                    },
                    exit_code: Some(code),
                }),
                Outcome::SpawnError | Outcome::Hang => std::future::pending().await,
            }
        }

        async fn cancel(&self, _handle: &JobHandle) -> Result<()> {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeStore {
        finished: Mutex<Vec<(BuildId, BuildStatus)>>,
        logs: Mutex<Vec<String>>,
        unavailable: AtomicBool,
    }

    impl FakeStore {
        fn unavailable() -> Arc<Self> {
            let store = Self::default();
            store.unavailable.store(true, Ordering::SeqCst);
            Arc::new(store)
        }

        fn finished(&self) -> Vec<(BuildId, BuildStatus)> {
            self.finished.lock().unwrap().clone()
        }

        fn logs(&self) -> Vec<String> {
            self.logs.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BuildStore for FakeStore {
        async fn finish_build(&self, id: BuildId, status: BuildStatus) -> Result<bool> {
            if self.unavailable.load(Ordering::SeqCst) {
                return Err(Error::Storage("connection reset".to_string()));
            }
            self.finished.lock().unwrap().push((id, status));
            Ok(true)
        }

        async fn append_log(&self, _id: BuildId, line: &LogLine) -> Result<()> {
            self.logs.lock().unwrap().push(line.content.clone());
            Ok(())
        }
    }

    fn build_with_plan(plan: serde_json::Value) -> Build {
        let mut build = Build::started(BuildId::new(7), "1");
        build.plan = plan;
        build
    }

    fn plan() -> serde_json::Value {
        json!({
            "image": "alpine",
            "commands": ["make", "make test"],
            "env": {"CI": "true"}
        })
    }

    fn new_engine(executor: &Arc<FakeExecutor>, store: &Arc<FakeStore>) -> ExecutorEngine {
        ExecutorEngine::new(executor.clone(), store.clone(), "/workspace")
    }

    #[tokio::test]
    async fn test_successful_build_is_recorded() {
        let executor = FakeExecutor::new(Outcome::Exit(0));
        let store = Arc::new(FakeStore::default());
        let engine = new_engine(&executor, &store);

        engine
            .new_build(build_with_plan(plan()))
            .run(Span::none())
            .await;

        let spawned = executor.spawned();
        assert_eq!(spawned.len(), 1);
        assert_eq!(spawned[0].image, "alpine");
        assert_eq!(spawned[0].command[2], "make && make test");
        assert_eq!(spawned[0].working_dir.as_deref(), Some("/workspace"));
        assert_eq!(spawned[0].env.get("CI").map(String::as_str), Some("true"));

        assert_eq!(store.finished(), vec![(BuildId::new(7), BuildStatus::Succeeded)]);
        assert_eq!(store.logs(), vec!["hello", "build succeeded"]);
        assert_eq!(executor.cancelled(), 1);
    }

    #[tokio::test]
    async fn test_failed_job_fails_the_build() {
        let executor = FakeExecutor::new(Outcome::Exit(2));
        let store = Arc::new(FakeStore::default());
        let engine = new_engine(&executor, &store);

        engine
            .new_build(build_with_plan(plan()))
            .run(Span::none())
            .await;

        assert_eq!(store.finished(), vec![(BuildId::new(7), BuildStatus::Failed)]);
        assert_eq!(executor.cancelled(), 1);
    }

    #[tokio::test]
    async fn test_job_is_kept_when_result_cannot_be_stored() {
        let executor = FakeExecutor::new(Outcome::Exit(0));
        let store = FakeStore::unavailable();
        let engine = new_engine(&executor, &store);

        engine
            .new_build(build_with_plan(plan()))
            .run(Span::none())
            .await;

        assert_eq!(executor.spawned().len(), 1);
        assert!(store.finished().is_empty());
        assert_eq!(executor.cancelled(), 0);
    }

    #[tokio::test]
    async fn test_invalid_plan_errors_the_build() {
        let executor = FakeExecutor::new(Outcome::Exit(0));
        let store = Arc::new(FakeStore::default());
        let engine = new_engine(&executor, &store);

        engine
            .new_build(build_with_plan(json!({"commands": ["true"]})))
            .run(Span::none())
            .await;

        assert!(executor.spawned().is_empty());
        assert_eq!(store.finished(), vec![(BuildId::new(7), BuildStatus::Errored)]);
    }

    #[tokio::test]
    async fn test_spawn_failure_errors_the_build() {
        let executor = FakeExecutor::new(Outcome::SpawnError);
        let store = Arc::new(FakeStore::default());
        let engine = new_engine(&executor, &store);

        engine
            .new_build(build_with_plan(plan()))
            .run(Span::none())
            .await;

        assert_eq!(store.finished(), vec![(BuildId::new(7), BuildStatus::Errored)]);
        assert_eq!(executor.cancelled(), 0);
    }

    #[tokio::test]
    async fn test_released_engine_does_not_start_builds() {
        let executor = FakeExecutor::new(Outcome::Exit(0));
        let store = Arc::new(FakeStore::default());
        let engine = new_engine(&executor, &store);

        engine.release_all().await;
        engine
            .new_build(build_with_plan(plan()))
            .run(Span::none())
            .await;

        assert!(executor.spawned().is_empty());
        assert!(store.finished().is_empty());
    }

    #[tokio::test]
    async fn test_release_leaves_running_builds_started() {
        let executor = FakeExecutor::new(Outcome::Hang);
        let store = Arc::new(FakeStore::default());
        let engine = Arc::new(new_engine(&executor, &store));

        let runnable = engine.new_build(build_with_plan(plan()));
        let running = tokio::spawn(async move { runnable.run(Span::none()).await });

        while executor.spawned().is_empty() {
            tokio::task::yield_now().await;
        }

        engine.release_all().await;
        engine.release_all().await;

        tokio::time::timeout(Duration::from_secs(1), running)
            .await
            .unwrap()
            .unwrap();

        assert!(store.finished().is_empty());
        assert_eq!(executor.cancelled(), 0);
    }
}
