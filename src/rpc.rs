//! JSON HTTP API for the verifi service.
//!
//! A thin layer over the core: it fetches archives, runs the aggregation
//! cascade and verifies locations, and maps the core's failure kinds onto
//! status codes. Statistics responses name the producing tier in the
//! `x-verifi-tier` header.
//!
//! The server has no authentication and binds to localhost by default.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::consensus::environment::LocalEnvironment;
use crate::fetcher::SourceFetcher;
use crate::measurement::{Coordinate, Measurement, NetworkStatistics, VerificationVerdict};
use crate::orchestrator::{Orchestrator, OrchestratorError, TierOutcome};
use crate::verifier::{LocationVerifier, VerifyError};

/// Response header carrying the aggregation tier.
pub const TIER_HEADER: &str = "x-verifi-tier";

/// Shared RPC state.
#[derive(Clone)]
pub struct RpcState {
    pub fetcher: Arc<SourceFetcher>,
    pub orchestrator: Arc<Orchestrator>,
    pub verifier: Arc<LocationVerifier<LocalEnvironment>>,
}

/// Build the RPC router.
pub fn router(rpc_state: RpcState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/measurements", get(get_measurements))
        .route("/statistics", get(get_statistics).post(post_statistics))
        .route("/verify", post(post_verify))
        .layer(DefaultBodyLimit::max(crate::constants::MAX_REQUEST_BYTES))
        .with_state(rpc_state)
}

/// Start the RPC server.
pub async fn serve(
    addr: SocketAddr,
    rpc_state: RpcState,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app = router(rpc_state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("RPC server listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

type TierResponse = ([(&'static str, &'static str); 1], Json<Vec<NetworkStatistics>>);

fn tier_response(outcome: TierOutcome) -> TierResponse {
    (
        [(TIER_HEADER, outcome.tier.unwrap_or("none"))],
        Json(outcome.statistics),
    )
}

fn orchestrator_error(e: OrchestratorError) -> (StatusCode, String) {
    (StatusCode::SERVICE_UNAVAILABLE, e.to_string())
}

// ── GET /health ──

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    timestamp: String,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: crate::constants::SERVICE_NAME,
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    })
}

// ── GET /measurements ──

async fn get_measurements(State(state): State<RpcState>) -> Json<Vec<Measurement>> {
    Json(state.fetcher.fetch_all().await.measurements)
}

// ── GET /statistics ──

async fn get_statistics(
    State(state): State<RpcState>,
) -> Result<TierResponse, (StatusCode, String)> {
    let report = state.fetcher.fetch_all().await;
    let outcome = state
        .orchestrator
        .run(&report.measurements)
        .await
        .map_err(orchestrator_error)?;
    Ok(tier_response(outcome))
}

// ── POST /statistics ──

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatisticsRequest {
    data_points: Vec<Measurement>,
}

async fn post_statistics(
    State(state): State<RpcState>,
    Json(req): Json<StatisticsRequest>,
) -> Result<TierResponse, (StatusCode, String)> {
    let outcome = state
        .orchestrator
        .run(&req.data_points)
        .await
        .map_err(orchestrator_error)?;
    Ok(tier_response(outcome))
}

// ── POST /verify ──

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifyRequest {
    #[serde(default, alias = "ip")]
    reporter_address: Option<String>,
    #[serde(default)]
    lat: Option<f64>,
    #[serde(default, alias = "lng")]
    lon: Option<f64>,
}

async fn post_verify(
    State(state): State<RpcState>,
    Json(req): Json<VerifyRequest>,
) -> Result<Json<VerificationVerdict>, (StatusCode, String)> {
    let claimed = req.lat.zip(req.lon).map(|(lat, lon)| Coordinate::new(lat, lon));
    let verdict = state
        .verifier
        .verify(req.reporter_address.as_deref(), claimed)
        .await
        .map_err(|e| {
            let status = match e {
                VerifyError::InvalidInput(_) => StatusCode::BAD_REQUEST,
                VerifyError::LocationUnavailable(_) => StatusCode::UNPROCESSABLE_ENTITY,
                VerifyError::Consensus(_) => StatusCode::SERVICE_UNAVAILABLE,
            };
            (status, e.to_string())
        })?;
    Ok(Json(verdict))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::http::{Request, StatusCode as HttpStatus};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::consensus::ConsensusEngine;
    use crate::fetcher::{ArchiveRetriever, FetchError};
    use crate::geo::{GeoError, GeoLocator};
    use crate::measurement::ArchiveSource;
    use crate::orchestrator::{AggregationTier, TierError};
    use crate::statistics::StatisticsAggregator;

    struct MapRetriever(HashMap<String, Vec<u8>>);

    #[async_trait]
    impl ArchiveRetriever for MapRetriever {
        async fn retrieve(&self, url: &str) -> Result<Vec<u8>, FetchError> {
            self.0.get(url).cloned().ok_or_else(|| FetchError::Status {
                url: url.to_string(),
                status: 404,
            })
        }
    }

    /// Resolves every address except `0.0.0.0` to Prague.
    struct PragueLocator;

    #[async_trait]
    impl GeoLocator for PragueLocator {
        async fn locate(&self, address: &str) -> Result<Option<Coordinate>, GeoError> {
            if address == "0.0.0.0" {
                return Ok(None);
            }
            Ok(Some(Coordinate::new(50.0755, 14.4378)))
        }
    }

    struct BrokenTier;

    #[async_trait]
    impl AggregationTier for BrokenTier {
        fn name(&self) -> &'static str {
            "broken"
        }

        async fn attempt(&self, _: &[Measurement]) -> Result<Vec<NetworkStatistics>, TierError> {
            Err(TierError::NoStatistics)
        }
    }

    fn archive(name: &str, speed: f64, time: &str) -> Vec<u8> {
        format!(
            "\u{1}\u{2}roots{{\"location\":{{\"lat\":1,\"lng\":2}},\"speed\":{speed},\"time\":\"{time}\",\"wifiName\":\"{name}\",\"walletAddress\":\"0xabc\"}}\u{0}"
        )
        .into_bytes()
    }

    fn test_rpc_state(archives: Vec<(&str, Vec<u8>)>, broken: bool) -> RpcState {
        let sources = archives
            .iter()
            .map(|(cid, _)| ArchiveSource::new(*cid, format!("https://src/{cid}"), format!("{cid}.car")))
            .collect();
        let bodies = archives
            .into_iter()
            .map(|(cid, body)| (format!("https://src/{cid}"), body))
            .collect();
        let fetcher = SourceFetcher::new(Arc::new(MapRetriever(bodies)), sources, vec![]);

        let env = Arc::new(LocalEnvironment::new(3, Duration::from_secs(1)));
        let engine = ConsensusEngine::new(env);
        let orchestrator = if broken {
            Orchestrator::new(vec![Box::new(BrokenTier)])
        } else {
            Orchestrator::standard(None, StatisticsAggregator::new(engine.clone()))
        };
        let verifier = LocationVerifier::new(engine, Arc::new(PragueLocator), 10.0);

        RpcState {
            fetcher: Arc::new(fetcher),
            orchestrator: Arc::new(orchestrator),
            verifier: Arc::new(verifier),
        }
    }

    async fn send(app: &Router, request: Request<axum::body::Body>) -> (HttpStatus, Option<String>, Vec<u8>) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let tier = response
            .headers()
            .get(TIER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, tier, body.to_vec())
    }

    async fn get_json(app: &Router, path: &str) -> (HttpStatus, serde_json::Value) {
        let request = Request::builder()
            .uri(path)
            .body(axum::body::Body::empty())
            .unwrap();
        let (status, _, body) = send(app, request).await;
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap_or_else(|e| {
            panic!(
                "JSON parse error: {} (status={}, body={:?})",
                e,
                status,
                String::from_utf8_lossy(&body)
            )
        });
        (status, json)
    }

    fn post(path: &str, body: &str) -> Request<axum::body::Body> {
        Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json")
            .body(axum::body::Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let app = router(test_rpc_state(vec![], false));
        let (status, json) = get_json(&app, "/health").await;
        assert_eq!(status, HttpStatus::OK);
        assert_eq!(json["status"], "ok");
        assert_eq!(json["service"], crate::constants::SERVICE_NAME);
        assert!(json["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[tokio::test]
    async fn measurements_skip_failed_sources() {
        let app = router(test_rpc_state(
            vec![
                ("a", archive("cafe", 10.0, "2025-11-22T12:00:00Z")),
                ("b", b"garbage".to_vec()),
            ],
            false,
        ));
        let (status, json) = get_json(&app, "/measurements").await;
        assert_eq!(status, HttpStatus::OK);
        let arr = json.as_array().unwrap();
        assert_eq!(arr.len(), 1);
        assert_eq!(arr[0]["networkName"], "cafe");
    }

    #[tokio::test]
    async fn statistics_from_fetched_archives() {
        let app = router(test_rpc_state(
            vec![
                ("a", archive("cafe", 10.0, "2025-11-22T12:00:00Z")),
                ("b", archive("cafe", 20.0, "2025-11-22T13:00:00Z")),
            ],
            false,
        ));
        let request = Request::builder()
            .uri("/statistics")
            .body(axum::body::Body::empty())
            .unwrap();
        let (status, tier, body) = send(&app, request).await;
        assert_eq!(status, HttpStatus::OK);
        assert_eq!(tier.as_deref(), Some("local"));
        let stats: Vec<NetworkStatistics> = serde_json::from_slice(&body).unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].average_speed, 15.0);
        assert_eq!(stats[0].latest_timestamp, "2025-11-22T13:00:00.000Z");
    }

    #[tokio::test]
    async fn no_measurements_is_empty_list_not_error() {
        let app = router(test_rpc_state(vec![("a", b"nothing".to_vec())], true));
        let (status, json) = get_json(&app, "/statistics").await;
        assert_eq!(status, HttpStatus::OK);
        assert!(json.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn tier_exhaustion_is_service_unavailable() {
        let app = router(test_rpc_state(vec![], true));
        let body = r#"{"dataPoints":[{"networkName":"x","speedMbps":1,"lat":0,"lon":0,"timestamp":"2025-11-22T12:00:00Z","reporterId":"0x1"}]}"#;
        let (status, _, _) = send(&app, post("/statistics", body)).await;
        assert_eq!(status, HttpStatus::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn post_statistics_accepts_legacy_fields() {
        let app = router(test_rpc_state(vec![], false));
        let body = r#"{"dataPoints":[
            {"wifiName":"lib","speed":10,"lat":1,"lon":2,"timestamp":"2025-11-22T12:00:00Z","walletAddress":"0x1"},
            {"wifiName":"lib","speed":30,"lat":1,"lon":2,"timestamp":"2025-11-22T12:05:00Z","walletAddress":"0x2"}
        ]}"#;
        let (status, tier, body) = send(&app, post("/statistics", body)).await;
        assert_eq!(status, HttpStatus::OK);
        assert_eq!(tier.as_deref(), Some("local"));
        let stats: Vec<NetworkStatistics> = serde_json::from_slice(&body).unwrap();
        assert_eq!(stats[0].network_name, "lib");
        assert_eq!(stats[0].median_speed, 20.0);
    }

    #[tokio::test]
    async fn post_statistics_accepts_offsetless_timestamps() {
        let app = router(test_rpc_state(vec![], false));
        let body = r#"{"dataPoints":[
            {"wifiName":"cafe","speed":12,"lat":1,"lon":2,"timestamp":"2025-11-22T12:25:00","walletAddress":"0x1"},
            {"wifiName":"cafe","speed":18,"lat":1,"lon":2,"timestamp":"2025-11-22","walletAddress":"0x2"}
        ]}"#;
        let (status, tier, body) = send(&app, post("/statistics", body)).await;
        assert_eq!(status, HttpStatus::OK);
        assert_eq!(tier.as_deref(), Some("local"));
        let stats: Vec<NetworkStatistics> = serde_json::from_slice(&body).unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].latest_timestamp, "2025-11-22T12:25:00.000Z");
    }

    #[tokio::test]
    async fn post_statistics_rejects_malformed_body() {
        let app = router(test_rpc_state(vec![], false));
        let (status, _, _) = send(&app, post("/statistics", r#"{"points":[]}"#)).await;
        assert!(status.is_client_error());
    }

    #[tokio::test]
    async fn verify_maps_outcomes_to_status() {
        let app = router(test_rpc_state(vec![], false));

        let (status, _, body) = send(
            &app,
            post("/verify", r#"{"reporterAddress":"8.8.8.8","lat":50.08,"lon":14.44}"#),
        )
        .await;
        assert_eq!(status, HttpStatus::OK);
        let verdict: VerificationVerdict = serde_json::from_slice(&body).unwrap();
        assert!(verdict.within_threshold);

        let (status, _, _) = send(&app, post("/verify", r#"{"lat":50.08,"lon":14.44}"#)).await;
        assert_eq!(status, HttpStatus::BAD_REQUEST);

        let (status, _, _) = send(
            &app,
            post("/verify", r#"{"reporterAddress":"0.0.0.0","lat":50.08,"lon":14.44}"#),
        )
        .await;
        assert_eq!(status, HttpStatus::UNPROCESSABLE_ENTITY);
    }
}
