//! Owner tags and instance configuration.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::async_instance::TrickleAsyncInstance;
use crate::definition::TrickleDefinition;
use crate::error::TrickleError;
use crate::executor::{Executor, ThreadPoolExecutor};
use crate::raw::TrickleRawInstance;
use crate::sync::TrickleSyncInstance;
use crate::tracer::{NoopTracer, Tracer};

static NEXT_OWNER_ID: AtomicU64 = AtomicU64::new(1);

fn next_owner_id() -> u64 {
    NEXT_OWNER_ID.fetch_add(1, Ordering::Relaxed)
}

/// Identifies the builder that created a node handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BuilderId(u64);

impl BuilderId {
    pub(crate) fn next() -> Self {
        Self(next_owner_id())
    }
}

/// Identifies the instance that created a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceId(u64);

impl InstanceId {
    pub(crate) fn next() -> Self {
        Self(next_owner_id())
    }
}

/// Builder for instances of a [`TrickleDefinition`].
///
/// # Example
///
/// ```ignore
/// let instance = definition
///     .instance_builder()
///     .tracer(LogTracer)
///     .threads(4)
///     .build_async()?;
/// ```
pub struct TrickleInstanceBuilder {
    definition: TrickleDefinition,
    tracer: Arc<dyn Tracer>,
    executor: Option<Arc<dyn Executor>>,
    threads: usize,
}

impl TrickleInstanceBuilder {
    pub(crate) fn new(definition: TrickleDefinition) -> Self {
        Self {
            definition,
            tracer: Arc::new(NoopTracer),
            executor: None,
            threads: default_threads(),
        }
    }

    /// Set the tracer that observes the instance.
    pub fn tracer<T: Tracer>(mut self, tracer: T) -> Self {
        self.tracer = Arc::new(tracer);
        self
    }

    /// Use a caller-provided executor for async instances.
    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Number of worker threads of the bundled pool, used when no executor is set.
    ///
    /// Defaults to the available parallelism.
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    /// Build a manually stepped instance.
    pub fn build_raw(self) -> TrickleRawInstance {
        TrickleRawInstance::with_tracer(self.definition, self.tracer)
    }

    /// Build a lazily computing instance.
    pub fn build_sync(self) -> TrickleSyncInstance {
        TrickleSyncInstance::from_raw(self.build_raw())
    }

    /// Build an instance that computes in the background.
    ///
    /// Starts a [`ThreadPoolExecutor`] unless an executor was provided.
    pub fn build_async(self) -> Result<TrickleAsyncInstance, TrickleError> {
        let executor = match self.executor {
            Some(executor) => executor,
            None => Arc::new(ThreadPoolExecutor::new(self.threads)?),
        };
        let raw = TrickleRawInstance::with_tracer(self.definition, self.tracer);
        Ok(TrickleAsyncInstance::new(raw, executor))
    }
}

fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
