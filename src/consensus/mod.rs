//! # Redundant computation with median consensus
//!
//! Every trusted number in the system (a speed statistic, a distance, a
//! resolved coordinate) is computed once per execution context and the
//! outcomes are reduced to a single value by taking their median.
//!
//! ## Why median
//!
//! The contexts are redundant but not adversarial. A minority of them may
//! return an outlier (transient fault, divergent environment state) or fail
//! outright. The median ignores such a minority without requiring any proof
//! of correct execution.
//!
//! ```text
//!   task ──► context 0 ──► 15.0  ┐
//!        ──► context 1 ──► 15.0  ├─ sort ─► middle ─► ConsensusResult { 15.0, 3 }
//!        ──► context 2 ──► 99.9  ┘
//!        ──► context 3 ──► (timed out, dropped)
//! ```
//!
//! ## Rules
//!
//! - Odd sample count: the middle value. Even: the mean of the two middle
//!   values.
//! - Failed contexts and non-finite outputs are dropped before reduction.
//! - Zero surviving samples is [`ConsensusError::NoData`]; any positive count
//!   is accepted and reported in `sample_count` for the caller to judge.
//! - No rounding happens here.

pub mod environment;

use std::sync::Arc;

use futures::FutureExt;

use crate::measurement::Coordinate;
use environment::{ContextError, ContextId, ExecutionEnvironment, NodeTask};

/// A value agreed on by `sample_count` independent contexts.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ConsensusResult<T> {
    pub value: T,
    pub sample_count: usize,
}

/// Consensus failures.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum ConsensusError {
    #[error("no context produced a value for {label} ({failed} failed)")]
    NoData { label: String, failed: usize },
}

/// Values that can be reduced by median.
pub trait MedianAggregate: Sized {
    /// Reduce samples to their median. `None` for an empty or unusable set.
    fn aggregate_median(samples: Vec<Self>) -> Option<Self>;
}

impl MedianAggregate for f64 {
    fn aggregate_median(samples: Vec<f64>) -> Option<f64> {
        median(&samples)
    }
}

impl MedianAggregate for Coordinate {
    /// Component-wise median of latitude and longitude.
    fn aggregate_median(samples: Vec<Coordinate>) -> Option<Coordinate> {
        let lats: Vec<f64> = samples.iter().map(|c| c.lat).collect();
        let lons: Vec<f64> = samples.iter().map(|c| c.lon).collect();
        Some(Coordinate::new(median(&lats)?, median(&lons)?))
    }
}

/// Median of the finite values in `values`.
///
/// Non-finite entries are ignored. Returns `None` if nothing finite remains.
pub fn median(values: &[f64]) -> Option<f64> {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Reduce per-context outcomes to a consensus value.
pub fn reduce<T: MedianAggregate>(
    label: &str,
    outcomes: Vec<Result<T, ContextError>>,
) -> Result<ConsensusResult<T>, ConsensusError> {
    let total = outcomes.len();
    let mut samples = Vec::with_capacity(total);
    for (i, outcome) in outcomes.into_iter().enumerate() {
        match outcome {
            Ok(v) => samples.push(v),
            Err(e) => tracing::warn!(label, context = i, error = %e, "context dropped from consensus"),
        }
    }
    let sample_count = samples.len();
    match T::aggregate_median(samples) {
        Some(value) => Ok(ConsensusResult {
            value,
            sample_count,
        }),
        None => Err(ConsensusError::NoData {
            label: label.to_string(),
            failed: total,
        }),
    }
}

/// Runs numeric computations through an [`ExecutionEnvironment`] and
/// reduces the results.
pub struct ConsensusEngine<E> {
    env: Arc<E>,
}

impl<E> Clone for ConsensusEngine<E> {
    fn clone(&self) -> Self {
        ConsensusEngine {
            env: self.env.clone(),
        }
    }
}

impl<E: ExecutionEnvironment> ConsensusEngine<E> {
    pub fn new(env: Arc<E>) -> Self {
        ConsensusEngine { env }
    }

    pub fn redundancy(&self) -> usize {
        self.env.redundancy()
    }

    /// Evaluate a pure function in every context and take the median.
    ///
    /// Non-finite results count as failed contexts.
    pub async fn compute<F>(&self, label: &str, f: F) -> Result<ConsensusResult<f64>, ConsensusError>
    where
        F: Fn() -> f64 + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let task: NodeTask<f64> = Arc::new(move |_ctx: ContextId| {
            let f = f.clone();
            async move {
                let v = f();
                if v.is_finite() {
                    Ok(v)
                } else {
                    Err(ContextError::Failed(format!("non-finite result {v}")))
                }
            }
            .boxed()
        });
        self.observe(label, task).await
    }

    /// Run an arbitrary per-context task (e.g. an external lookup) and
    /// take the median of its outputs.
    pub async fn observe<T>(
        &self,
        label: &str,
        task: NodeTask<T>,
    ) -> Result<ConsensusResult<T>, ConsensusError>
    where
        T: MedianAggregate + Send + 'static,
    {
        let outcomes = self.env.run(task).await;
        let result = reduce(label, outcomes)?;
        tracing::debug!(
            label,
            samples = result.sample_count,
            redundancy = self.env.redundancy(),
            "consensus reached"
        );
        Ok(result)
    }
}
