//! Tiered aggregation: trigger, then simulate, then local.
//!
//! Each tier implements [`AggregationTier`]. The orchestrator walks the
//! tiers in order and returns the first non-empty result. A tier that errors
//! or yields nothing is logged and skipped; only when every tier has been
//! tried does the orchestrator give up.

use std::sync::Arc;

use async_trait::async_trait;

use crate::consensus::environment::ExecutionEnvironment;
use crate::measurement::{Measurement, NetworkStatistics};
use crate::statistics::StatisticsAggregator;
use crate::workflow::{parse_workflow_output, WorkflowError, WorkflowRunner};

/// Why a single tier produced nothing usable.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum TierError {
    #[error(transparent)]
    Workflow(#[from] WorkflowError),
    #[error("no usable statistics in output")]
    NoStatistics,
}

/// All tiers failed.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum OrchestratorError {
    #[error("aggregation unavailable: all {tiers} tiers failed")]
    Exhausted { tiers: usize },
}

/// One strategy for turning measurements into statistics.
#[async_trait]
pub trait AggregationTier: Send + Sync {
    fn name(&self) -> &'static str;

    async fn attempt(&self, measurements: &[Measurement]) -> Result<Vec<NetworkStatistics>, TierError>;
}

/// Runs the deployed remote job.
pub struct TriggerTier {
    runner: Arc<dyn WorkflowRunner>,
}

impl TriggerTier {
    pub fn new(runner: Arc<dyn WorkflowRunner>) -> Self {
        TriggerTier { runner }
    }
}

#[async_trait]
impl AggregationTier for TriggerTier {
    fn name(&self) -> &'static str {
        "trigger"
    }

    async fn attempt(&self, measurements: &[Measurement]) -> Result<Vec<NetworkStatistics>, TierError> {
        let stdout = self.runner.trigger(measurements).await?;
        parse_workflow_output(&stdout).ok_or(TierError::NoStatistics)
    }
}

/// Simulates the remote job.
pub struct SimulateTier {
    runner: Arc<dyn WorkflowRunner>,
}

impl SimulateTier {
    pub fn new(runner: Arc<dyn WorkflowRunner>) -> Self {
        SimulateTier { runner }
    }
}

#[async_trait]
impl AggregationTier for SimulateTier {
    fn name(&self) -> &'static str {
        "simulate"
    }

    async fn attempt(&self, measurements: &[Measurement]) -> Result<Vec<NetworkStatistics>, TierError> {
        let stdout = self.runner.simulate(measurements).await?;
        parse_workflow_output(&stdout).ok_or(TierError::NoStatistics)
    }
}

/// In-process statistics through the local consensus engine.
pub struct LocalTier<E> {
    aggregator: StatisticsAggregator<E>,
}

impl<E: ExecutionEnvironment> LocalTier<E> {
    pub fn new(aggregator: StatisticsAggregator<E>) -> Self {
        LocalTier { aggregator }
    }
}

#[async_trait]
impl<E: ExecutionEnvironment + 'static> AggregationTier for LocalTier<E> {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn attempt(&self, measurements: &[Measurement]) -> Result<Vec<NetworkStatistics>, TierError> {
        let stats = self.aggregator.aggregate(measurements).await;
        if stats.is_empty() {
            return Err(TierError::NoStatistics);
        }
        Ok(stats)
    }
}

/// Statistics together with the tier that produced them.
#[derive(Clone, Debug, PartialEq)]
pub struct TierOutcome {
    /// `None` when the input was empty and no tier ran.
    pub tier: Option<&'static str>,
    pub statistics: Vec<NetworkStatistics>,
}

/// Ordered list of aggregation tiers.
pub struct Orchestrator {
    tiers: Vec<Box<dyn AggregationTier>>,
}

impl Orchestrator {
    pub fn new(tiers: Vec<Box<dyn AggregationTier>>) -> Self {
        Orchestrator { tiers }
    }

    /// The standard cascade. Without a runner only the local tier is used.
    pub fn standard<E: ExecutionEnvironment + 'static>(
        runner: Option<Arc<dyn WorkflowRunner>>,
        aggregator: StatisticsAggregator<E>,
    ) -> Self {
        let mut tiers: Vec<Box<dyn AggregationTier>> = Vec::with_capacity(3);
        if let Some(runner) = runner {
            tiers.push(Box::new(TriggerTier::new(runner.clone())));
            tiers.push(Box::new(SimulateTier::new(runner)));
        }
        tiers.push(Box::new(LocalTier::new(aggregator)));
        Orchestrator::new(tiers)
    }

    pub fn tier_names(&self) -> Vec<&'static str> {
        self.tiers.iter().map(|t| t.name()).collect()
    }

    /// Try each tier in order and return the first non-empty result.
    ///
    /// Empty input is not an error: it yields empty statistics without
    /// consulting any tier.
    pub async fn run(&self, measurements: &[Measurement]) -> Result<TierOutcome, OrchestratorError> {
        if measurements.is_empty() {
            tracing::info!("no measurements to aggregate");
            return Ok(TierOutcome {
                tier: None,
                statistics: Vec::new(),
            });
        }

        for tier in &self.tiers {
            match tier.attempt(measurements).await {
                Ok(statistics) if !statistics.is_empty() => {
                    tracing::info!(tier = tier.name(), networks = statistics.len(), "aggregation tier succeeded");
                    return Ok(TierOutcome {
                        tier: Some(tier.name()),
                        statistics,
                    });
                }
                Ok(_) => tracing::warn!(tier = tier.name(), "aggregation tier returned no statistics"),
                Err(e) => tracing::warn!(tier = tier.name(), error = %e, "aggregation tier failed"),
            }
        }

        tracing::error!(tiers = self.tiers.len(), "all aggregation tiers failed");
        Err(OrchestratorError::Exhausted {
            tiers: self.tiers.len(),
        })
    }
}
