//! Active health checking.
//!
//! # Responsibilities
//! - Re-probe unhealthy backends with a TCP connect
//! - Feed the results into the backend hysteresis counters

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time;

use crate::config::HealthCheckConfig;
use crate::load_balancer::BackendManager;
use crate::observability::metrics;

pub struct HealthMonitor {
    backends: Arc<BackendManager>,
    config: HealthCheckConfig,
}

impl HealthMonitor {
    pub fn new(backends: Arc<BackendManager>, config: HealthCheckConfig) -> Self {
        Self { backends, config }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.config.interval_secs)
    }

    /// Probe every backend currently marked unhealthy.
    ///
    /// Healthy and unknown backends are left to the passive checks done by the
    /// connection path.
    pub async fn check_unhealthy(&self) {
        let timeout = Duration::from_millis(self.config.timeout_ms);

        for backend in self.backends.all_backends().iter().filter(|b| !b.is_healthy()) {
            let addr = backend.addr;
            let reachable = match time::timeout(timeout, TcpStream::connect(addr)).await {
                Ok(Ok(_)) => true,
                Ok(Err(e)) => {
                    tracing::debug!(backend = %addr, error = %e, "Health probe failed: connection error");
                    false
                }
                Err(_) => {
                    tracing::debug!(backend = %addr, "Health probe failed: timeout");
                    false
                }
            };

            if reachable {
                if backend.mark_success(self.config.healthy_threshold as usize) {
                    tracing::info!(backend = %addr, "Backend recovered");
                }
            } else {
                backend.mark_failure(self.config.unhealthy_threshold as usize);
            }

            metrics::record_backend_health(&addr.to_string(), backend.is_healthy());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use crate::load_balancer::{HealthState, Policy};

    fn manager(addresses: &[String]) -> Arc<BackendManager> {
        let configs: Vec<BackendConfig> = addresses
            .iter()
            .map(|address| BackendConfig {
                name: String::new(),
                address: address.clone(),
                weight: 1,
                max_connections: 10,
            })
            .collect();
        Arc::new(BackendManager::new(&configs, Policy::RoundRobin))
    }

    #[tokio::test]
    async fn reachable_backend_recovers() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let manager = manager(&[listener.local_addr().unwrap().to_string()]);
        let backend = Arc::clone(&manager.all_backends()[0]);
        backend.mark_failure(1);
        assert!(!backend.is_healthy());

        let config = HealthCheckConfig {
            healthy_threshold: 2,
            timeout_ms: 500,
            ..HealthCheckConfig::default()
        };
        let monitor = HealthMonitor::new(Arc::clone(&manager), config);

        monitor.check_unhealthy().await;
        assert_eq!(backend.health(), HealthState::Unhealthy, "one success is not enough");
        monitor.check_unhealthy().await;
        assert_eq!(backend.health(), HealthState::Healthy);
    }

    #[tokio::test]
    async fn unreachable_backend_stays_down() {
        // bind then drop to get a port nobody listens on
        let port = std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let manager = manager(&[format!("127.0.0.1:{port}")]);
        let backend = Arc::clone(&manager.all_backends()[0]);
        backend.mark_failure(1);

        let monitor = HealthMonitor::new(Arc::clone(&manager), HealthCheckConfig::default());
        monitor.check_unhealthy().await;
        assert!(!backend.is_healthy());
    }
}
