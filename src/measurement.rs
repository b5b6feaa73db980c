//! Core data model: measurements, coordinates, source descriptors and the
//! derived statistics/verdict projections.
//!
//! Everything here is immutable once built. Statistics and verdicts are
//! recomputed on every request and never stored.

use serde::{Deserialize, Serialize};

/// A latitude/longitude pair in decimal degrees.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    #[serde(alias = "lng")]
    pub lon: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lon: f64) -> Self {
        Coordinate { lat, lon }
    }

    /// Both components are finite and inside the WGS84 ranges.
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }
}

/// One reported network-quality observation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Measurement {
    #[serde(alias = "wifiName")]
    pub network_name: String,
    #[serde(alias = "speed")]
    pub speed_mbps: f64,
    pub lat: f64,
    pub lon: f64,
    /// ISO-8601 timestamp as reported; parsed only when aggregating.
    pub timestamp: String,
    #[serde(alias = "walletAddress")]
    pub reporter_id: String,
    /// Network address of the reporter, when known.
    #[serde(alias = "ip", default, skip_serializing_if = "Option::is_none")]
    pub reporter_address: Option<String>,
}

impl Measurement {
    pub fn location(&self) -> Coordinate {
        Coordinate::new(self.lat, self.lon)
    }
}

/// Static description of one content-addressed archive.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveSource {
    pub content_id: String,
    pub retrieval_url: String,
    pub label: String,
}

impl ArchiveSource {
    pub fn new(
        content_id: impl Into<String>,
        retrieval_url: impl Into<String>,
        label: impl Into<String>,
    ) -> Self {
        ArchiveSource {
            content_id: content_id.into(),
            retrieval_url: retrieval_url.into(),
            label: label.into(),
        }
    }
}

/// Per-network statistics derived from a non-empty group of measurements.
///
/// All speed fields are rounded to two decimals at construction time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatistics {
    #[serde(alias = "wifiName")]
    pub network_name: String,
    pub total_measurements: usize,
    pub average_speed: f64,
    pub median_speed: f64,
    pub min_speed: f64,
    pub max_speed: f64,
    pub speed_range: f64,
    #[serde(alias = "locations", default)]
    pub unique_locations: Vec<Coordinate>,
    pub latest_timestamp: String,
}

/// Outcome of checking a claimed location against a resolved one.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationVerdict {
    pub claimed_location: Coordinate,
    pub resolved_location: Coordinate,
    pub distance_km: f64,
    pub within_threshold: bool,
}

/// Round to two decimal places for presentation.
///
/// Applied only to final values; intermediate aggregation works on raw
/// numbers so the median is not biased.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
