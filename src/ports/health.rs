//! HealthChecker port - named dependency probes for the health composite.

use async_trait::async_trait;

/// Outcome of one dependency probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

/// A named probe aggregated by the `/health` endpoint.
///
/// Checks run with a per-check timeout; a check that does not answer in
/// time reports unhealthy.
#[async_trait]
pub trait HealthChecker: Send + Sync {
    fn name(&self) -> &'static str;

    async fn check(&self) -> HealthState;
}
