//! Execution backends.
//!
//! A [`Builder`] turns a build into a [`BuildHandle`]; executing the handle
//! starts the build and yields an [`Operation`] that can be checkpointed into
//! the build's status and awaited until the build finishes.

pub mod cluster;

pub use cluster::{ClusterBuilder, ClusterOperation, Completion, CompletionRegistry, PodKey};

use crate::crds::{Build, BuildProvider, BuildStatus};
use crate::tasks::types::Result;
use async_trait::async_trait;

pub trait Builder: Send + Sync {
    /// Backend recorded in `status.builder`
    fn provider(&self) -> BuildProvider;

    /// Validate `build` and prepare it for execution
    fn build_from_spec(&self, build: &Build) -> Result<Box<dyn BuildHandle>>;

    /// Re-attach to a build started earlier, from the locator in its status
    fn operation_from_status(&self, status: &BuildStatus) -> Result<Box<dyn Operation>>;
}

#[async_trait]
pub trait BuildHandle: Send + Sync {
    /// Start the build
    async fn execute(&self) -> Result<Box<dyn Operation>>;
}

#[async_trait]
pub trait Operation: Send + Sync {
    /// Human readable identifier of the running build
    fn name(&self) -> String;

    /// Record the locator and start time in `status`
    fn checkpoint(&self, build: &Build, status: &mut BuildStatus);

    /// Block until the build finishes and return its final status
    async fn wait(&self) -> Result<BuildStatus>;
}
