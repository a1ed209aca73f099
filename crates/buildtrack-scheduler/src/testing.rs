//! Fake collaborators shared by the tracker and runner tests.

use async_trait::async_trait;
use buildtrack_core::{Build, BuildFinder, BuildId, Engine, Error, Result, Runnable};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::Span;

pub(crate) fn started(id: i64) -> Build {
    Build::started(BuildId::new(id), id.to_string())
}

/// Poll `condition` until it holds, failing the test after one second.
pub(crate) async fn eventually(mut condition: impl FnMut() -> bool) {
    let polled = tokio::time::timeout(Duration::from_secs(1), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "condition not met within 1s");
}

pub(crate) struct FakeFinder {
    builds: Mutex<Vec<Build>>,
    error: Mutex<Option<String>>,
    calls: AtomicUsize,
}

impl FakeFinder {
    pub(crate) fn returning(builds: Vec<Build>) -> Arc<Self> {
        Arc::new(Self {
            builds: Mutex::new(builds),
            error: Mutex::new(None),
            calls: AtomicUsize::new(0),
        })
    }

    pub(crate) fn failing(message: &str) -> Arc<Self> {
        let finder = Self::returning(vec![]);
        *finder.error.lock().unwrap() = Some(message.to_string());
        finder
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BuildFinder for FakeFinder {
    async fn get_all_started_builds(&self) -> Result<Vec<Build>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.error.lock().unwrap().clone() {
            return Err(Error::Storage(message));
        }
        Ok(self.builds.lock().unwrap().clone())
    }
}

/// Engine whose runnables report the build they ran on a channel, then
/// optionally wait for a gate to open or panic.
pub(crate) struct FakeEngine {
    ran: mpsc::UnboundedSender<Build>,
    gate: Mutex<Option<watch::Receiver<bool>>>,
    panic_on_run: AtomicBool,
    new_build_calls: AtomicUsize,
    release_calls: AtomicUsize,
}

impl FakeEngine {
    pub(crate) fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Build>) {
        let (ran, rx) = mpsc::unbounded_channel();
        let engine = Arc::new(Self {
            ran,
            gate: Mutex::new(None),
            panic_on_run: AtomicBool::new(false),
            new_build_calls: AtomicUsize::new(0),
            release_calls: AtomicUsize::new(0),
        });
        (engine, rx)
    }

    /// Make runnables block until `true` is sent on the returned gate.
    pub(crate) fn close_gate(&self) -> watch::Sender<bool> {
        let (tx, rx) = watch::channel(false);
        *self.gate.lock().unwrap() = Some(rx);
        tx
    }

    pub(crate) fn panic_on_run(&self) {
        self.panic_on_run.store(true, Ordering::SeqCst);
    }

    pub(crate) fn new_build_calls(&self) -> usize {
        self.new_build_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn release_calls(&self) -> usize {
        self.release_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Engine for FakeEngine {
    fn new_build(&self, build: Build) -> Box<dyn Runnable> {
        self.new_build_calls.fetch_add(1, Ordering::SeqCst);
        Box::new(FakeRunnable {
            build,
            ran: self.ran.clone(),
            gate: self.gate.lock().unwrap().clone(),
            panic: self.panic_on_run.load(Ordering::SeqCst),
        })
    }

    async fn release_all(&self) {
        self.release_calls.fetch_add(1, Ordering::SeqCst);
    }
}

struct FakeRunnable {
    build: Build,
    ran: mpsc::UnboundedSender<Build>,
    gate: Option<watch::Receiver<bool>>,
    panic: bool,
}

#[async_trait]
impl Runnable for FakeRunnable {
    async fn run(&self, _span: Span) {
        let _ = self.ran.send(self.build.clone());

        if let Some(gate) = &self.gate {
            let mut gate = gate.clone();
            let _ = gate.wait_for(|open| *open).await;
        }

        if self.panic {
            panic!("build {} blew up", self.build.id());
        }
    }
}
