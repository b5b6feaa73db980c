//! Concurrent retrieval of measurement archives.
//!
//! Every configured [`ArchiveSource`] is retrieved in parallel. A source is
//! tried at its own retrieval URL first and then through each fallback
//! gateway in order; it fails only when every URL failed. Failures are
//! counted and logged, never propagated to sibling sources.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::archive::{extract_payload, ArchivePayload};
use crate::measurement::{ArchiveSource, Measurement};

/// Retrieval failures for a single URL or source.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum FetchError {
    #[error("request to {url} failed: {reason}")]
    Request { url: String, reason: String },
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("no measurement found in archive from {0}")]
    NoPayload(String),
    #[error("archive from {url} is not a usable measurement: {reason}")]
    Invalid { url: String, reason: String },
    #[error("archive payload has no time")]
    MissingTime,
    #[error("source {label} unavailable after {attempts} attempts: {last}")]
    Exhausted {
        label: String,
        attempts: usize,
        last: Box<FetchError>,
    },
}

/// Fetches the raw bytes behind a URL.
#[async_trait]
pub trait ArchiveRetriever: Send + Sync {
    async fn retrieve(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

/// Plain HTTP GET with a per-request timeout.
pub struct HttpRetriever {
    client: reqwest::Client,
}

impl HttpRetriever {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Request {
                url: String::new(),
                reason: format!("failed to build client: {}", e),
            })?;
        Ok(HttpRetriever { client })
    }
}

#[async_trait]
impl ArchiveRetriever for HttpRetriever {
    async fn retrieve(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let request_error = |e: reqwest::Error| FetchError::Request {
            url: url.to_string(),
            reason: e.to_string(),
        };
        let resp = self.client.get(url).send().await.map_err(request_error)?;
        if !resp.status().is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: resp.status().as_u16(),
            });
        }
        let bytes = resp.bytes().await.map_err(request_error)?;
        Ok(bytes.to_vec())
    }
}

/// Measurements recovered from one fetch round.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FetchReport {
    pub measurements: Vec<Measurement>,
    pub failures: usize,
}

/// Retrieves every configured source and converts the archives to
/// [`Measurement`]s.
pub struct SourceFetcher {
    retriever: Arc<dyn ArchiveRetriever>,
    sources: Vec<ArchiveSource>,
    gateways: Vec<String>,
}

impl SourceFetcher {
    pub fn new(
        retriever: Arc<dyn ArchiveRetriever>,
        sources: Vec<ArchiveSource>,
        gateways: Vec<String>,
    ) -> Self {
        SourceFetcher {
            retriever,
            sources,
            gateways,
        }
    }

    pub fn sources(&self) -> &[ArchiveSource] {
        &self.sources
    }

    /// Retrieve all sources concurrently and wait for every one to settle.
    pub async fn fetch_all(&self) -> FetchReport {
        let results =
            futures::future::join_all(self.sources.iter().map(|s| self.fetch_source(s))).await;

        let mut report = FetchReport::default();
        for (source, result) in self.sources.iter().zip(results) {
            match result {
                Ok(m) => report.measurements.push(m),
                Err(e) => {
                    tracing::warn!(source = %source.label, error = %e, "archive source failed");
                    report.failures += 1;
                }
            }
        }
        tracing::info!(
            fetched = report.measurements.len(),
            failed = report.failures,
            "archive fetch complete"
        );
        report
    }

    /// Retrieve one source, falling back through the gateways.
    pub async fn fetch_source(&self, source: &ArchiveSource) -> Result<Measurement, FetchError> {
        let urls = self.candidate_urls(source);
        let mut last = None;
        for url in &urls {
            match self.fetch_url(url).await {
                Ok(m) => {
                    tracing::debug!(source = %source.label, url = %url, "archive retrieved");
                    return Ok(m);
                }
                Err(e) => {
                    tracing::debug!(source = %source.label, error = %e, "retrieval attempt failed");
                    last = Some(e);
                }
            }
        }
        let last = last.unwrap_or_else(|| FetchError::NoPayload(source.retrieval_url.clone()));
        Err(FetchError::Exhausted {
            label: source.label.clone(),
            attempts: urls.len(),
            last: Box::new(last),
        })
    }

    fn candidate_urls(&self, source: &ArchiveSource) -> Vec<String> {
        std::iter::once(source.retrieval_url.clone())
            .chain(
                self.gateways
                    .iter()
                    .map(|g| format!("{}{}", g, source.content_id)),
            )
            .collect()
    }

    async fn fetch_url(&self, url: &str) -> Result<Measurement, FetchError> {
        let bytes = self.retriever.retrieve(url).await?;
        let payload = extract_payload(&bytes).ok_or_else(|| FetchError::NoPayload(url.to_string()))?;
        to_measurement(payload).map_err(|e| FetchError::Invalid {
            url: url.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Map an archive payload onto the canonical measurement shape.
///
/// The payload's `time` is required here even though extraction tolerates
/// its absence.
pub fn to_measurement(payload: ArchivePayload) -> Result<Measurement, FetchError> {
    let timestamp = payload
        .time
        .filter(|t| !t.is_empty())
        .ok_or(FetchError::MissingTime)?;
    Ok(Measurement {
        network_name: payload.wifi_name,
        speed_mbps: payload.speed,
        lat: payload.location.lat,
        lon: payload.location.lon,
        timestamp,
        reporter_id: payload.wallet_address,
        reporter_address: payload.ip,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Serves fixed bodies by URL and records every request.
    #[derive(Default)]
    struct StubRetriever {
        bodies: HashMap<String, Vec<u8>>,
        requested: Mutex<Vec<String>>,
    }

    impl StubRetriever {
        fn with(mut self, url: &str, body: &[u8]) -> Self {
            self.bodies.insert(url.to_string(), body.to_vec());
            self
        }

        fn requested(&self) -> Vec<String> {
            self.requested.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ArchiveRetriever for StubRetriever {
        async fn retrieve(&self, url: &str) -> Result<Vec<u8>, FetchError> {
            self.requested.lock().unwrap().push(url.to_string());
            self.bodies.get(url).cloned().ok_or_else(|| FetchError::Status {
                url: url.to_string(),
                status: 404,
            })
        }
    }

    fn archive(name: &str, speed: f64) -> Vec<u8> {
        let body = format!(
            r#"{{"location":{{"lat":50.1,"lng":14.4}},"speed":{speed},"time":"2025-11-22T12:25:00Z","wifiName":"{name}","walletAddress":"0xabc"}}"#
        );
        let mut bytes = b"\x3a\xa2\x65roots\x81\xd8\x2a".to_vec();
        bytes.extend_from_slice(body.as_bytes());
        bytes.extend_from_slice(b"\x00\x01");
        bytes
    }

    fn source(cid: &str) -> ArchiveSource {
        ArchiveSource::new(cid, format!("https://primary/{cid}"), format!("{cid}.car"))
    }

    #[tokio::test]
    async fn failures_are_isolated_per_source() {
        let stub = StubRetriever::default()
            .with("https://primary/a", &archive("cafe", 12.0))
            .with("https://primary/c", b"no json here")
            .with("https://primary/d", &archive("library", 30.0));
        let fetcher = SourceFetcher::new(
            Arc::new(stub),
            vec![source("a"), source("b"), source("c"), source("d")],
            vec![],
        );

        let report = fetcher.fetch_all().await;
        assert_eq!(report.failures, 2);
        let mut names: Vec<_> = report.measurements.iter().map(|m| m.network_name.as_str()).collect();
        names.sort();
        assert_eq!(names, vec!["cafe", "library"]);
    }

    #[tokio::test]
    async fn gateways_are_tried_in_order_after_primary() {
        let stub = Arc::new(
            StubRetriever::default().with("https://gw2/ipfs/a", &archive("airport", 8.0)),
        );
        let fetcher = SourceFetcher::new(
            stub.clone(),
            vec![source("a")],
            vec!["https://gw1/ipfs/".into(), "https://gw2/ipfs/".into(), "https://gw3/ipfs/".into()],
        );

        let m = fetcher.fetch_source(&source("a")).await.unwrap();
        assert_eq!(m.network_name, "airport");
        assert_eq!(
            stub.requested(),
            vec!["https://primary/a", "https://gw1/ipfs/a", "https://gw2/ipfs/a"]
        );
    }

    #[tokio::test]
    async fn exhausted_source_reports_attempts() {
        let fetcher = SourceFetcher::new(
            Arc::new(StubRetriever::default()),
            vec![source("z")],
            vec!["https://gw/".into()],
        );
        let err = fetcher.fetch_source(&source("z")).await.unwrap_err();
        assert_eq!(
            err,
            FetchError::Exhausted {
                label: "z.car".into(),
                attempts: 2,
                last: Box::new(FetchError::Status {
                    url: "https://gw/z".into(),
                    status: 404
                }),
            }
        );
        assert!(err.to_string().ends_with("https://gw/z returned HTTP 404"), "{err}");
    }

    #[test]
    fn payload_maps_onto_measurement() {
        let payload = extract_payload(&archive("cafe", 42.5)).unwrap();
        let m = to_measurement(payload).unwrap();
        assert_eq!(m.network_name, "cafe");
        assert_eq!(m.speed_mbps, 42.5);
        assert_eq!((m.lat, m.lon), (50.1, 14.4));
        assert_eq!(m.timestamp, "2025-11-22T12:25:00Z");
        assert_eq!(m.reporter_id, "0xabc");
        assert_eq!(m.reporter_address, None);
    }

    #[test]
    fn payload_without_time_is_not_a_measurement() {
        let bytes = br#"{"wifiName":"X","walletAddress":"0xabc","location":{"lat":1,"lng":2},"speed":50}"#;
        let payload = extract_payload(bytes).unwrap();
        assert_eq!(to_measurement(payload), Err(FetchError::MissingTime));
    }
}
