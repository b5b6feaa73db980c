//! Execution environments that run one task across N independent contexts.
//!
//! The distributed-oracle runtime is consumed, not implemented: anything
//! that can run a task once per context and hand back every context's
//! outcome implements [`ExecutionEnvironment`]. [`LocalEnvironment`] is the
//! in-process implementation used by the service, where each context is a
//! separate tokio task with its own timeout.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;

/// Index of one execution context, `0..redundancy`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ContextId(pub usize);

/// A unit of work handed to every context. It receives the context id and
/// must not share mutable state with its siblings.
pub type NodeTask<T> =
    Arc<dyn Fn(ContextId) -> BoxFuture<'static, Result<T, ContextError>> + Send + Sync>;

/// Why a single context produced no value.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum ContextError {
    #[error("context failed: {0}")]
    Failed(String),
    #[error("context timed out after {0:?}")]
    TimedOut(Duration),
    #[error("context aborted: {0}")]
    Aborted(String),
}

/// Runs a task redundantly and returns one outcome per context.
#[async_trait]
pub trait ExecutionEnvironment: Send + Sync {
    /// Number of independent contexts every task runs in.
    fn redundancy(&self) -> usize;

    /// Run `task` once per context. The returned vector has exactly
    /// `redundancy()` entries in context order.
    async fn run<T>(&self, task: NodeTask<T>) -> Vec<Result<T, ContextError>>
    where
        T: Send + 'static;
}

/// In-process environment: one tokio task per context.
#[derive(Clone, Debug)]
pub struct LocalEnvironment {
    redundancy: usize,
    context_timeout: Duration,
}

impl LocalEnvironment {
    /// `redundancy` is clamped to at least one context.
    pub fn new(redundancy: usize, context_timeout: Duration) -> Self {
        LocalEnvironment {
            redundancy: redundancy.max(1),
            context_timeout,
        }
    }
}

#[async_trait]
impl ExecutionEnvironment for LocalEnvironment {
    fn redundancy(&self) -> usize {
        self.redundancy
    }

    async fn run<T>(&self, task: NodeTask<T>) -> Vec<Result<T, ContextError>>
    where
        T: Send + 'static,
    {
        let timeout = self.context_timeout;
        let handles = (0..self.redundancy).map(|i| {
            let fut = task(ContextId(i));
            tokio::spawn(async move {
                match tokio::time::timeout(timeout, fut).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(ContextError::TimedOut(timeout)),
                }
            })
        });

        futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|joined| match joined {
                Ok(outcome) => outcome,
                Err(e) => Err(ContextError::Aborted(e.to_string())),
            })
            .collect()
    }
}
