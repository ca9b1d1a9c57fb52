//! IP hash load balancing strategy.
//!
//! Client affinity: the same client IP maps to the same backend for as long
//! as the backend list is unchanged. When the mapped backend is ineligible the
//! selection probes forward through the list, so other clients keep their
//! mapping.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::net::IpAddr;
use std::sync::Arc;

use crate::load_balancer::{backend::Backend, LoadBalancer, SelectionContext};

#[derive(Debug, Default)]
pub struct IpHash;

impl IpHash {
    pub fn new() -> Self {
        Self
    }

    /// Stable slot for a client over `len` backends.
    pub fn slot(client_ip: IpAddr, len: usize) -> usize {
        // DefaultHasher::new() uses fixed keys, so the value is stable across calls
        let mut hasher = DefaultHasher::new();
        canonical(client_ip).hash(&mut hasher);
        (hasher.finish() % len as u64) as usize
    }
}

/// IPv4 clients accepted on a dual-stack socket show up as v4-mapped v6.
fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        v4 => v4,
    }
}

impl LoadBalancer for IpHash {
    fn next_server(&self, backends: &[Arc<Backend>], ctx: &SelectionContext<'_>) -> Option<Arc<Backend>> {
        if backends.is_empty() {
            return None;
        }

        let len = backends.len();
        let start = Self::slot(ctx.client_ip, len);
        (0..len)
            .map(|i| &backends[(start + i) % len])
            .find(|backend| ctx.is_eligible(backend))
            .cloned()
    }
}
