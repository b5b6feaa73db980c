//! Network-address geolocation.
//!
//! The lookup service is external. [`IpInfoLocator`] speaks the ipinfo.io
//! JSON format, where the coordinate comes back as a `"lat,lon"` string in
//! the `loc` field.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::measurement::Coordinate;

/// Geolocation failures.
#[derive(Clone, Debug, thiserror::Error)]
pub enum GeoError {
    #[error("geolocation request failed: {0}")]
    Request(String),
    #[error("geolocation service returned HTTP {0}")]
    Status(u16),
    #[error("invalid geolocation response: {0}")]
    InvalidResponse(String),
}

/// Resolves a network address to an approximate coordinate.
#[async_trait]
pub trait GeoLocator: Send + Sync {
    /// `Ok(None)` means the service answered but has no location for the
    /// address.
    async fn locate(&self, address: &str) -> Result<Option<Coordinate>, GeoError>;
}

/// HTTP client for an ipinfo-compatible lookup service.
pub struct IpInfoLocator {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct IpInfoResponse {
    #[serde(default)]
    loc: Option<String>,
}

impl IpInfoLocator {
    pub fn new(
        base_url: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, GeoError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GeoError::Request(format!("failed to build client: {}", e)))?;
        Ok(IpInfoLocator {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            client,
        })
    }

    fn lookup_url(&self, address: &str) -> String {
        match &self.token {
            Some(token) => format!("{}/{}/json?token={}", self.base_url, address, token),
            None => format!("{}/{}/json", self.base_url, address),
        }
    }
}

#[async_trait]
impl GeoLocator for IpInfoLocator {
    async fn locate(&self, address: &str) -> Result<Option<Coordinate>, GeoError> {
        let resp = self
            .client
            .get(self.lookup_url(address))
            .send()
            .await
            .map_err(|e| GeoError::Request(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(GeoError::Status(resp.status().as_u16()));
        }
        let body: IpInfoResponse = resp
            .json()
            .await
            .map_err(|e| GeoError::InvalidResponse(e.to_string()))?;
        match body.loc {
            Some(loc) => parse_loc(&loc).map(Some),
            None => Ok(None),
        }
    }
}

/// Parse a `"lat,lon"` pair.
pub fn parse_loc(loc: &str) -> Result<Coordinate, GeoError> {
    let (lat, lon) = loc
        .split_once(',')
        .ok_or_else(|| GeoError::InvalidResponse(format!("malformed loc {:?}", loc)))?;
    let parse = |s: &str| {
        s.trim()
            .parse::<f64>()
            .map_err(|e| GeoError::InvalidResponse(format!("malformed loc {:?}: {}", loc, e)))
    };
    let coord = Coordinate::new(parse(lat)?, parse(lon)?);
    if !coord.is_valid() {
        return Err(GeoError::InvalidResponse(format!("out of range loc {:?}", loc)));
    }
    Ok(coord)
}
