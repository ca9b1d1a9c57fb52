//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! Request head parsed → client IP known
//!     → manager.rs (BackendManager::select)
//!     → Apply load balancing policy:
//!         - round_robin.rs (rotate through backends)
//!         - least_conn.rs (pick backend with fewest leased connections)
//!         - ip_hash.rs (stable client → backend affinity)
//!         - random.rs (weighted random choice)
//!     → Return the chosen Backend, or NoUpstream
//! ```
//!
//! # Design Decisions
//! - Policies only read shared state (atomic counters and health)
//! - Unhealthy or already-failed backends are skipped per selection
//! - The pool owns connection counting; policies never mutate counters

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod backend;
pub mod ip_hash;
pub mod least_conn;
pub mod manager;
pub mod random;
pub mod round_robin;

pub use backend::{Backend, BackendConnectionGuard, HealthState};
pub use manager::BackendManager;

/// A backend selection strategy.
pub trait LoadBalancer: Send + Sync + fmt::Debug {
    /// Pick the next backend among `backends` that `ctx` considers eligible.
    fn next_server(&self, backends: &[Arc<Backend>], ctx: &SelectionContext<'_>) -> Option<Arc<Backend>>;
}

/// Per-selection inputs: who is asking and what must be avoided.
#[derive(Debug, Clone, Copy)]
pub struct SelectionContext<'a> {
    pub client_ip: IpAddr,
    /// Backends that already failed for the current request.
    pub excluded: &'a [SocketAddr],
}

impl<'a> SelectionContext<'a> {
    pub fn new(client_ip: IpAddr) -> Self {
        Self {
            client_ip,
            excluded: &[],
        }
    }

    pub fn excluding(mut self, excluded: &'a [SocketAddr]) -> Self {
        self.excluded = excluded;
        self
    }

    /// Healthy (or not yet known) and not excluded.
    pub fn is_eligible(&self, backend: &Backend) -> bool {
        backend.is_healthy() && !self.excluded.contains(&backend.addr)
    }
}

/// Available selection policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Policy {
    RoundRobin,
    #[default]
    LeastConnections,
    IpHash,
    Random,
}

impl Policy {
    pub fn build(self) -> Box<dyn LoadBalancer> {
        match self {
            Policy::RoundRobin => Box::new(round_robin::RoundRobin::new()),
            Policy::LeastConnections => Box::new(least_conn::LeastConnections::new()),
            Policy::IpHash => Box::new(ip_hash::IpHash::new()),
            Policy::Random => Box::new(random::WeightedRandom::new()),
        }
    }
}

impl FromStr for Policy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "round_robin" => Ok(Policy::RoundRobin),
            "least_connections" => Ok(Policy::LeastConnections),
            "ip_hash" => Ok(Policy::IpHash),
            "random" => Ok(Policy::Random),
            other => Err(format!(
                "unknown policy '{other}' (expected round_robin, least_connections, ip_hash or random)"
            )),
        }
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Policy::RoundRobin => "round_robin",
            Policy::LeastConnections => "least_connections",
            Policy::IpHash => "ip_hash",
            Policy::Random => "random",
        };
        f.write_str(name)
    }
}

/// Selection failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectError {
    #[error("no upstream available")]
    NoUpstream,
}

#[cfg(test)]
pub(crate) fn test_backends(n: usize) -> Vec<Arc<Backend>> {
    (0..n)
        .map(|i| {
            let addr = SocketAddr::from(([127, 0, 0, 1], 9000 + i as u16));
            Arc::new(Backend::new(i, addr, 100))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_names_round_trip() {
        for policy in [
            Policy::RoundRobin,
            Policy::LeastConnections,
            Policy::IpHash,
            Policy::Random,
        ] {
            assert_eq!(policy.to_string().parse::<Policy>().unwrap(), policy);
        }
        assert_eq!("LEAST-CONNECTIONS".parse::<Policy>().unwrap(), Policy::LeastConnections);
        assert!("fastest".parse::<Policy>().is_err());
    }
}
