//! Build tracker - runs every started build exactly once while it is in flight.

use buildtrack_core::{Build, BuildFinder, BuildId, Engine, Result};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{Instrument, debug, info, info_span};

/// Ids of builds whose runnable is currently executing.
type TrackedSet = Arc<Mutex<HashSet<BuildId>>>;

fn lock(tracked: &Mutex<HashSet<BuildId>>) -> MutexGuard<'_, HashSet<BuildId>> {
    // Every mutation is a single insert or remove, so a poisoned set is still consistent.
    tracked.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Discovers started builds and dispatches each one to the engine.
///
/// The tracker is cheap to share behind an [`Arc`]; [`Tracker::track`] may be
/// called concurrently from any number of tasks.
pub struct Tracker {
    finder: Arc<dyn BuildFinder>,
    engine: Arc<dyn Engine>,
    tracked: TrackedSet,
}

impl Tracker {
    pub fn new(finder: Arc<dyn BuildFinder>, engine: Arc<dyn Engine>) -> Self {
        Self {
            finder,
            engine,
            tracked: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Run one discovery cycle.
    ///
    /// Every started build that is not already running is handed to the
    /// engine and run on its own task. The returned future does not wait for
    /// any build to finish. The only error is a failed discovery query, in
    /// which case nothing is dispatched.
    pub async fn track(&self) -> Result<()> {
        let builds = self.finder.get_all_started_builds().await?;

        for build in builds {
            let Some(guard) = TrackedBuild::acquire(&self.tracked, build.id()) else {
                debug!(build_id = %build.id(), "Build already running");
                continue;
            };
            self.dispatch(build, guard);
        }

        Ok(())
    }

    fn dispatch(&self, build: Build, guard: TrackedBuild) {
        let span = info_span!(
            "build",
            build_id = %build.id,
            team = %build.team_name,
            pipeline = ?build.pipeline_name,
            job = ?build.job_name,
            name = %build.name
        );
        info!(parent: &span, "Tracking build");

        let runnable = self.engine.new_build(build);

        tokio::spawn(
            async move {
                // Dropped on every exit path, including a panic inside `run`.
                let _guard = guard;
                runnable.run(tracing::Span::current()).await;
                debug!("Build finished");
            }
            .instrument(span),
        );
    }

    /// Whether any build is currently running.
    pub fn running(&self) -> bool {
        !lock(&self.tracked).is_empty()
    }

    /// Number of builds currently running.
    pub fn running_count(&self) -> usize {
        lock(&self.tracked).len()
    }

    /// Release the engine's global resources.
    ///
    /// Does not wait for running builds and does not forget them.
    pub async fn release(&self) {
        info!(running = self.running_count(), "Releasing engine");
        self.engine.release_all().await;
    }
}

/// Membership of one build in the tracked set, removed when dropped.
struct TrackedBuild {
    id: BuildId,
    tracked: TrackedSet,
}

impl TrackedBuild {
    /// Check-and-insert under a single lock. `None` if the build is already tracked.
    fn acquire(tracked: &TrackedSet, id: BuildId) -> Option<Self> {
        if !lock(tracked).insert(id) {
            return None;
        }

        Some(Self {
            id,
            tracked: Arc::clone(tracked),
        })
    }
}

impl Drop for TrackedBuild {
    fn drop(&mut self) {
        lock(&self.tracked).remove(&self.id);
    }
}
