//! Location verification.
//!
//! A reporter's claimed coordinate is plausible when it lies within a fixed
//! distance of the coordinate their network address resolves to. Both the
//! address lookup and the distance computation go through the consensus
//! engine, so a single context's lookup or arithmetic cannot decide the
//! verdict on its own.

use std::sync::Arc;

use futures::FutureExt;

use crate::consensus::environment::{ContextError, ContextId, ExecutionEnvironment, NodeTask};
use crate::consensus::{ConsensusEngine, ConsensusError, ConsensusResult};
use crate::constants::EARTH_RADIUS_KM;
use crate::geo::GeoLocator;
use crate::measurement::{round2, Coordinate, VerificationVerdict};

/// Verification failures. None of these are retried here.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum VerifyError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("location unavailable for {0}")]
    LocationUnavailable(String),
    #[error(transparent)]
    Consensus(#[from] ConsensusError),
}

/// Checks claimed coordinates against resolved network locations.
pub struct LocationVerifier<E> {
    engine: ConsensusEngine<E>,
    locator: Arc<dyn GeoLocator>,
    threshold_km: f64,
}

impl<E: ExecutionEnvironment> LocationVerifier<E> {
    pub fn new(engine: ConsensusEngine<E>, locator: Arc<dyn GeoLocator>, threshold_km: f64) -> Self {
        LocationVerifier {
            engine,
            locator,
            threshold_km,
        }
    }

    pub fn threshold_km(&self) -> f64 {
        self.threshold_km
    }

    /// Produce a verdict for a claimed coordinate and reporter address.
    ///
    /// Missing inputs fail fast with [`VerifyError::InvalidInput`].
    pub async fn verify(
        &self,
        reporter_address: Option<&str>,
        claimed: Option<Coordinate>,
    ) -> Result<VerificationVerdict, VerifyError> {
        let address = reporter_address
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .ok_or_else(|| VerifyError::InvalidInput("missing reporter address".into()))?;
        let claimed =
            claimed.ok_or_else(|| VerifyError::InvalidInput("missing claimed coordinates".into()))?;
        if !claimed.is_valid() {
            return Err(VerifyError::InvalidInput(format!(
                "claimed coordinates out of range: ({}, {})",
                claimed.lat, claimed.lon
            )));
        }

        let resolved = self.resolve(address).await?;
        let distance = self.distance_km(resolved.value, claimed).await?;
        let within = within_threshold(distance.value, self.threshold_km);

        tracing::info!(
            address,
            distance_km = distance.value,
            within,
            lookup_samples = resolved.sample_count,
            "location verified"
        );

        Ok(VerificationVerdict {
            claimed_location: claimed,
            resolved_location: resolved.value,
            distance_km: round2(distance.value),
            within_threshold: within,
        })
    }

    /// Resolve an address once per context and take the component-wise
    /// median of the answers.
    pub async fn resolve(&self, address: &str) -> Result<ConsensusResult<Coordinate>, VerifyError> {
        let locator = self.locator.clone();
        let owned = address.to_string();
        let task: NodeTask<Coordinate> = Arc::new(move |ctx: ContextId| {
            let locator = locator.clone();
            let address = owned.clone();
            async move {
                match locator.locate(&address).await {
                    Ok(Some(coord)) => Ok(coord),
                    Ok(None) => Err(ContextError::Failed(format!("no location for {}", address))),
                    Err(e) => {
                        tracing::debug!(context = ctx.0, error = %e, "geolocation lookup failed");
                        Err(ContextError::Failed(e.to_string()))
                    }
                }
            }
            .boxed()
        });

        match self.engine.observe("geolocation", task).await {
            Ok(result) => Ok(result),
            Err(ConsensusError::NoData { .. }) => {
                Err(VerifyError::LocationUnavailable(address.to_string()))
            }
        }
    }

    /// Great-circle distance between two coordinates under consensus.
    pub async fn distance_km(
        &self,
        a: Coordinate,
        b: Coordinate,
    ) -> Result<ConsensusResult<f64>, VerifyError> {
        Ok(self.engine.compute("distance", move || haversine_km(a, b)).await?)
    }
}

/// Haversine distance in kilometres.
pub fn haversine_km(a: Coordinate, b: Coordinate) -> f64 {
    let dlat = (b.lat - a.lat).to_radians();
    let dlon = (b.lon - a.lon).to_radians();
    let h = (dlat / 2.0).sin().powi(2)
        + a.lat.to_radians().cos() * b.lat.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    // Rounding can push h past 1 near the antipode.
    let h = h.clamp(0.0, 1.0);
    2.0 * EARTH_RADIUS_KM * h.sqrt().atan2((1.0 - h).sqrt())
}

/// The threshold is inclusive.
pub fn within_threshold(distance_km: f64, threshold_km: f64) -> bool {
    distance_km <= threshold_km
}
