//! Engine and runnable contracts.
//!
//! An [`Engine`] turns a discovered [`Build`] into a [`Runnable`] that
//! performs the build's work. The tracker only starts runnables and
//! forgets them once they return; everything a build does happens inside
//! [`Runnable::run`].

use async_trait::async_trait;
use tracing::Span;

use crate::Build;

/// A unit of work bound to a single build.
#[async_trait]
pub trait Runnable: Send + Sync {
    /// Run the build to completion.
    ///
    /// Events for this build should be recorded within `span`. Failures are
    /// handled inside the runnable; returning means the work is over.
    async fn run(&self, span: Span);
}

/// Factory and lifecycle owner for runnables.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Create a runnable for the given build. Must be safe to call
    /// concurrently for distinct builds.
    fn new_build(&self, build: Build) -> Box<dyn Runnable>;

    /// Release all resources held by the engine. Called once at shutdown.
    async fn release_all(&self);
}
