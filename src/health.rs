//! Health monitor: an independent periodic loop classifying each running
//! backend's liveness. Failures never unilaterally stop a backend — they
//! only surface through the status interface.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

use crate::backend::{Backend, BackendRegistry, BackendState};
use crate::catalog::TransportDescriptor;

pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);
const HTTP_HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    #[must_use]
    pub fn classify(response_time: Duration) -> Self {
        if response_time < Duration::from_secs(1) {
            Self::Healthy
        } else if response_time <= Duration::from_secs(2) {
            Self::Degraded
        } else {
            Self::Unhealthy
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }

    /// `unhealthy` dominates `degraded` dominates `healthy`.
    #[must_use]
    pub fn worse_of(self, other: Self) -> Self {
        match (self, other) {
            (Self::Unhealthy, _) | (_, Self::Unhealthy) => Self::Unhealthy,
            (Self::Degraded, _) | (_, Self::Degraded) => Self::Degraded,
            _ => Self::Healthy,
        }
    }
}

pub struct HealthMonitor {
    http_client: reqwest::Client,
    statuses: DashMap<String, HealthStatus>,
}

impl HealthMonitor {
    #[must_use]
    pub fn new() -> Self {
        Self {
            http_client: reqwest::Client::new(),
            statuses: DashMap::new(),
        }
    }

    #[must_use]
    pub fn status(&self, backend_id: &str) -> Option<HealthStatus> {
        self.statuses.get(backend_id).map(|s| *s)
    }

    /// Overall status mirrors the worst observed per-backend status;
    /// `healthy` if there are no running backends to check.
    #[must_use]
    pub fn overall(&self) -> HealthStatus {
        self.statuses
            .iter()
            .fold(HealthStatus::Healthy, |acc, entry| acc.worse_of(*entry.value()))
    }

    #[must_use]
    pub fn snapshot(&self) -> HashMap<String, HealthStatus> {
        self.statuses.iter().map(|e| (e.key().clone(), *e.value())).collect()
    }

    async fn check_one(&self, backend: &Backend) {
        if backend.state() != BackendState::Running {
            return;
        }

        let status = match &backend.spec.transport {
            TransportDescriptor::Child { .. } => HealthStatus::Healthy,
            TransportDescriptor::Http { url, .. } => self.check_http(url).await,
            TransportDescriptor::Sse { .. } => {
                // Healthy iff the upstream stream is open; a backend that
                // transitioned out of Running already failed the guard above.
                HealthStatus::Healthy
            }
        };

        debug!(backend = %backend.id, status = status.as_str(), "health check result");
        self.statuses.insert(backend.id.clone(), status);
    }

    async fn check_http(&self, base_url: &str) -> HealthStatus {
        let url = format!("{}/health", base_url.trim_end_matches('/'));
        let start = Instant::now();
        let result = tokio::time::timeout(HTTP_HEALTH_TIMEOUT, self.http_client.get(&url).send()).await;
        let elapsed = start.elapsed();
        match result {
            Ok(Ok(response)) if response.status().is_success() => HealthStatus::classify(elapsed),
            _ => HealthStatus::Unhealthy,
        }
    }

    pub async fn check_all(&self, registry: &BackendRegistry) {
        for backend in registry.iter() {
            self.check_one(&backend).await;
        }
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

pub fn spawn_health_loop(
    monitor: Arc<HealthMonitor>,
    registry: Arc<BackendRegistry>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEALTH_CHECK_INTERVAL);
        loop {
            ticker.tick().await;
            monitor.check_all(&registry).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_boundaries_match_spec() {
        assert_eq!(HealthStatus::classify(Duration::from_millis(50)), HealthStatus::Healthy);
        assert_eq!(HealthStatus::classify(Duration::from_millis(1500)), HealthStatus::Degraded);
        assert_eq!(HealthStatus::classify(Duration::from_millis(3000)), HealthStatus::Unhealthy);
    }

    #[test]
    fn overall_mirrors_worst_observed() {
        let monitor = HealthMonitor::new();
        monitor.statuses.insert("a".to_string(), HealthStatus::Healthy);
        monitor.statuses.insert("b".to_string(), HealthStatus::Degraded);
        assert_eq!(monitor.overall(), HealthStatus::Degraded);
        monitor.statuses.insert("c".to_string(), HealthStatus::Unhealthy);
        assert_eq!(monitor.overall(), HealthStatus::Unhealthy);
    }

    #[test]
    fn overall_healthy_when_no_backends_checked() {
        let monitor = HealthMonitor::new();
        assert_eq!(monitor.overall(), HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn http_health_check_classifies_by_latency() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::path("/health"))
            .respond_with(wiremock::ResponseTemplate::new(200))
            .mount(&server)
            .await;
        let monitor = HealthMonitor::new();
        let status = monitor.check_http(&server.uri()).await;
        assert_eq!(status, HealthStatus::Healthy);
    }
}
