//! Backend set management.
//!
//! # Responsibilities
//! - Own the static list of upstream targets
//! - Apply the configured policy to select a backend
//! - Expose targets to health probing and the connection pool

use std::sync::Arc;

use crate::config::BackendConfig;
use crate::load_balancer::{backend::Backend, LoadBalancer, Policy, SelectError, SelectionContext};

/// Owns the upstream targets and the selection policy.
#[derive(Debug)]
pub struct BackendManager {
    backends: Vec<Arc<Backend>>,
    policy: Policy,
    balancer: Box<dyn LoadBalancer>,
}

impl BackendManager {
    /// Create a new backend manager from configuration.
    pub fn new(configs: &[BackendConfig], policy: Policy) -> Self {
        let mut backends = Vec::with_capacity(configs.len());
        for config in configs {
            match Backend::from_config(backends.len(), config) {
                Some(backend) => backends.push(Arc::new(backend)),
                None => tracing::warn!(address = %config.address, "Invalid backend address, skipping"),
            }
        }
        Self::from_backends(backends, policy)
    }

    pub fn from_backends(backends: Vec<Arc<Backend>>, policy: Policy) -> Self {
        Self {
            backends,
            policy,
            balancer: policy.build(),
        }
    }

    /// Select a backend for a request.
    pub fn select(&self, ctx: &SelectionContext<'_>) -> Result<Arc<Backend>, SelectError> {
        match self.balancer.next_server(&self.backends, ctx) {
            Some(backend) => Ok(backend),
            None => {
                tracing::debug!(
                    client = %ctx.client_ip,
                    policy = %self.policy,
                    backend_count = self.backends.len(),
                    excluded = ctx.excluded.len(),
                    "No eligible backend"
                );
                Err(SelectError::NoUpstream)
            }
        }
    }

    /// All configured backends, in configuration order.
    pub fn all_backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    pub fn policy(&self) -> Policy {
        self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn config(address: &str) -> BackendConfig {
        BackendConfig {
            name: String::new(),
            address: address.into(),
            weight: 1,
            max_connections: 4,
        }
    }

    #[test]
    fn skips_invalid_addresses() {
        let manager = BackendManager::new(
            &[config("127.0.0.1:1"), config("bogus"), config("127.0.0.1:2")],
            Policy::RoundRobin,
        );
        let indexes: Vec<usize> = manager.all_backends().iter().map(|b| b.index).collect();
        assert_eq!(indexes, vec![0, 1]);
        assert_eq!(manager.all_backends()[1].addr.port(), 2);
    }

    #[test]
    fn no_upstream_when_all_unhealthy() {
        let manager = BackendManager::new(&[config("127.0.0.1:1"), config("127.0.0.1:2")], Policy::LeastConnections);
        let ctx = SelectionContext::new(IpAddr::from([10, 0, 0, 1]));
        assert!(manager.select(&ctx).is_ok());

        for backend in manager.all_backends() {
            backend.mark_failure(1);
        }
        assert_eq!(manager.select(&ctx).unwrap_err(), SelectError::NoUpstream);
    }
}
