//! Per-network statistics over measurement batches.
//!
//! Measurements are grouped by network name and each group gets its own
//! [`NetworkStatistics`]. Average, median, minimum and maximum are four
//! independent consensus computations over the group's speeds; the range is
//! derived from the agreed min and max. Groups are computed concurrently and
//! a failing group is logged and skipped, never failing the batch.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};

use crate::consensus::environment::ExecutionEnvironment;
use crate::consensus::{median, ConsensusEngine, ConsensusError};
use crate::measurement::{round2, Coordinate, Measurement, NetworkStatistics};

/// Errors computing one network's statistics.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum StatisticsError {
    #[error("no measurements for network {0}")]
    EmptyGroup(String),
    #[error("no parseable timestamp for network {0}")]
    NoTimestamp(String),
    #[error(transparent)]
    Consensus(#[from] ConsensusError),
}

/// Computes [`NetworkStatistics`] through the consensus engine.
pub struct StatisticsAggregator<E> {
    engine: ConsensusEngine<E>,
}

impl<E> Clone for StatisticsAggregator<E> {
    fn clone(&self) -> Self {
        StatisticsAggregator {
            engine: self.engine.clone(),
        }
    }
}

impl<E: ExecutionEnvironment> StatisticsAggregator<E> {
    pub fn new(engine: ConsensusEngine<E>) -> Self {
        StatisticsAggregator { engine }
    }

    /// Statistics for every network in `measurements`, ordered by network name.
    ///
    /// Empty input gives an empty result. Networks whose computation fails
    /// are left out.
    pub async fn aggregate(&self, measurements: &[Measurement]) -> Vec<NetworkStatistics> {
        let groups = group_by_network(measurements);
        tracing::info!(
            measurements = measurements.len(),
            networks = groups.len(),
            "aggregating statistics"
        );

        let jobs = groups
            .iter()
            .map(|(name, points)| self.network_statistics(name, points));
        let results = futures::future::join_all(jobs).await;

        groups
            .keys()
            .zip(results)
            .filter_map(|(name, result)| match result {
                Ok(stats) => Some(stats),
                Err(e) => {
                    tracing::warn!(network = %name, error = %e, "skipping network");
                    None
                }
            })
            .collect()
    }

    /// Statistics for one network's group of measurements.
    pub async fn network_statistics(
        &self,
        name: &str,
        points: &[&Measurement],
    ) -> Result<NetworkStatistics, StatisticsError> {
        if points.is_empty() {
            return Err(StatisticsError::EmptyGroup(name.to_string()));
        }
        tracing::debug!(network = name, count = points.len(), "computing network statistics");

        let speeds: Arc<Vec<f64>> = Arc::new(points.iter().map(|m| m.speed_mbps).collect());

        let (average, median_speed, min, max) = futures::try_join!(
            self.engine.compute("average", {
                let speeds = speeds.clone();
                move || average_of(&speeds)
            }),
            self.engine.compute("median", {
                let speeds = speeds.clone();
                move || median(&speeds).unwrap_or(f64::NAN)
            }),
            self.engine.compute("min", {
                let speeds = speeds.clone();
                move || min_of(&speeds)
            }),
            self.engine.compute("max", {
                let speeds = speeds.clone();
                move || max_of(&speeds)
            }),
        )?;

        let latest_timestamp =
            latest_timestamp(points).ok_or_else(|| StatisticsError::NoTimestamp(name.to_string()))?;

        let stats = NetworkStatistics {
            network_name: name.to_string(),
            total_measurements: points.len(),
            average_speed: round2(average.value),
            median_speed: round2(median_speed.value),
            min_speed: round2(min.value),
            max_speed: round2(max.value),
            speed_range: round2(max.value - min.value),
            unique_locations: unique_locations(points),
            latest_timestamp,
        };
        tracing::info!(
            network = name,
            avg = stats.average_speed,
            median = stats.median_speed,
            "network statistics complete"
        );
        Ok(stats)
    }
}

/// Group measurements by network name. Iteration order is by name.
pub fn group_by_network(measurements: &[Measurement]) -> BTreeMap<&str, Vec<&Measurement>> {
    let mut groups: BTreeMap<&str, Vec<&Measurement>> = BTreeMap::new();
    for m in measurements {
        groups.entry(m.network_name.as_str()).or_default().push(m);
    }
    groups
}

/// Distinct `(lat, lon)` pairs in first-seen order.
pub fn unique_locations(points: &[&Measurement]) -> Vec<Coordinate> {
    let mut seen: Vec<Coordinate> = Vec::new();
    for m in points {
        let loc = m.location();
        if !seen.contains(&loc) {
            seen.push(loc);
        }
    }
    seen
}

/// Latest parseable timestamp in the group as RFC 3339 UTC with
/// millisecond precision.
pub fn latest_timestamp(points: &[&Measurement]) -> Option<String> {
    points
        .iter()
        .filter_map(|m| {
            let parsed = parse_timestamp(&m.timestamp);
            if parsed.is_none() {
                tracing::debug!(timestamp = %m.timestamp, "ignoring unparseable timestamp");
            }
            parsed
        })
        .max()
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// ISO-8601 timestamp as an instant. Values without an offset, and bare
/// dates, are read as UTC.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Some(t.with_timezone(&Utc));
    }
    if let Ok(t) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(t.and_utc());
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|t| t.and_utc())
}

fn average_of(speeds: &[f64]) -> f64 {
    if speeds.is_empty() {
        return f64::NAN;
    }
    speeds.iter().sum::<f64>() / speeds.len() as f64
}

fn min_of(speeds: &[f64]) -> f64 {
    speeds.iter().copied().fold(f64::INFINITY, f64::min)
}

fn max_of(speeds: &[f64]) -> f64 {
    speeds.iter().copied().fold(f64::NEG_INFINITY, f64::max)
}
