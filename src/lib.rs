//! # Verifi
//!
//! Verification and aggregation of crowdsourced network-quality
//! measurements:
//! - **Archive ingestion**: measurements are pulled from content-addressed
//!   archives and the embedded JSON is carved out of the binary envelope
//! - **Median consensus**: every trusted number is computed redundantly
//!   across independent execution contexts and reduced by median
//! - **Location verification**: a claimed coordinate is checked against the
//!   reporter's geolocated network address
//! - **Tiered aggregation**: per-network statistics come from the remote
//!   workflow when it is reachable and from the local engine otherwise

pub mod archive;
pub mod config;
pub mod consensus;
pub mod fetcher;
pub mod geo;
pub mod measurement;
pub mod orchestrator;
pub mod rpc;
pub mod statistics;
pub mod verifier;
pub mod workflow;

/// Service constants
pub mod constants {
    /// Service name reported by the health endpoint
    pub const SERVICE_NAME: &str = "verifi";
    /// Default RPC listen port
    pub const DEFAULT_RPC_PORT: u16 = 4000;
    /// Maximum accepted request body (2 MiB)
    pub const MAX_REQUEST_BYTES: usize = 2 * 1024 * 1024;

    /// Default number of independent execution contexts per computation
    pub const DEFAULT_REDUNDANCY: usize = 5;
    /// Per-context timeout for consensus computations (seconds)
    pub const CONTEXT_TIMEOUT_SECS: u64 = 15;

    /// Claimed and resolved locations further apart than this fail
    /// verification. The bound is inclusive.
    pub const DISTANCE_THRESHOLD_KM: f64 = 10.0;
    /// Mean Earth radius used by the haversine distance
    pub const EARTH_RADIUS_KM: f64 = 6371.0;
    /// Default geolocation service
    pub const DEFAULT_GEO_BASE_URL: &str = "https://ipinfo.io";
    /// Geolocation request timeout (seconds)
    pub const GEO_TIMEOUT_SECS: u64 = 10;

    /// Archive retrieval timeout per URL (seconds)
    pub const SOURCE_TIMEOUT_SECS: u64 = 30;
    /// Workflow CLI invocation timeout (seconds)
    pub const WORKFLOW_TIMEOUT_SECS: u64 = 60;
}
