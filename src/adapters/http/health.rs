//! Health composite aggregating named dependency checkers.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::warn;

use crate::ports::{HealthChecker, HealthState};

/// Per-check timeout; a checker that does not answer reports unhealthy.
const CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Aggregated report served on `/health`.
#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: HealthState,
    pub checks: BTreeMap<&'static str, HealthState>,
}

impl HealthReport {
    pub fn http_status(&self) -> u16 {
        match self.status {
            HealthState::Healthy | HealthState::Degraded => 200,
            HealthState::Unhealthy => 503,
        }
    }
}

/// Registry of named health checkers.
#[derive(Default)]
pub struct HealthComposite {
    checkers: Vec<Arc<dyn HealthChecker>>,
}

impl HealthComposite {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, checker: Arc<dyn HealthChecker>) {
        self.checkers.push(checker);
    }

    /// Runs every check with the per-check timeout and aggregates:
    /// any unhealthy wins, then any degraded, else healthy.
    pub async fn report(&self) -> HealthReport {
        let mut checks = BTreeMap::new();
        let mut status = HealthState::Healthy;

        for checker in &self.checkers {
            let state = match tokio::time::timeout(CHECK_TIMEOUT, checker.check()).await {
                Ok(state) => state,
                Err(_elapsed) => {
                    warn!(check = checker.name(), "health check timed out");
                    HealthState::Unhealthy
                }
            };
            status = worse(status, state);
            checks.insert(checker.name(), state);
        }

        HealthReport { status, checks }
    }
}

fn worse(a: HealthState, b: HealthState) -> HealthState {
    use HealthState::*;
    match (a, b) {
        (Unhealthy, _) | (_, Unhealthy) => Unhealthy,
        (Degraded, _) | (_, Degraded) => Degraded,
        _ => Healthy,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct StaticCheck {
        name: &'static str,
        state: HealthState,
    }

    #[async_trait]
    impl HealthChecker for StaticCheck {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn check(&self) -> HealthState {
            self.state
        }
    }

    struct HangingCheck;

    #[async_trait]
    impl HealthChecker for HangingCheck {
        fn name(&self) -> &'static str {
            "hanging"
        }

        async fn check(&self) -> HealthState {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            HealthState::Healthy
        }
    }

    #[tokio::test]
    async fn empty_composite_is_healthy() {
        let composite = HealthComposite::new();
        let report = composite.report().await;
        assert_eq!(report.status, HealthState::Healthy);
        assert_eq!(report.http_status(), 200);
    }

    #[tokio::test]
    async fn degraded_check_degrades_the_whole() {
        let mut composite = HealthComposite::new();
        composite.register(Arc::new(StaticCheck {
            name: "ok",
            state: HealthState::Healthy,
        }));
        composite.register(Arc::new(StaticCheck {
            name: "meh",
            state: HealthState::Degraded,
        }));

        let report = composite.report().await;
        assert_eq!(report.status, HealthState::Degraded);
        assert_eq!(report.http_status(), 200);
        assert_eq!(report.checks["meh"], HealthState::Degraded);
    }

    #[tokio::test]
    async fn unhealthy_check_wins_and_maps_to_503() {
        let mut composite = HealthComposite::new();
        composite.register(Arc::new(StaticCheck {
            name: "meh",
            state: HealthState::Degraded,
        }));
        composite.register(Arc::new(StaticCheck {
            name: "down",
            state: HealthState::Unhealthy,
        }));

        let report = composite.report().await;
        assert_eq!(report.status, HealthState::Unhealthy);
        assert_eq!(report.http_status(), 503);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_check_times_out_unhealthy() {
        let mut composite = HealthComposite::new();
        composite.register(Arc::new(HangingCheck));

        let report = composite.report().await;
        assert_eq!(report.status, HealthState::Unhealthy);
        assert_eq!(report.checks["hanging"], HealthState::Unhealthy);
    }
}
