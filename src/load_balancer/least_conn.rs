//! Least Connections load balancing strategy.

use std::sync::Arc;

use crate::load_balancer::{backend::Backend, LoadBalancer, SelectionContext};

/// Least connections selector.
/// Selects the eligible backend with the minimum number of leased connections.
#[derive(Debug, Default)]
pub struct LeastConnections;

impl LeastConnections {
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancer for LeastConnections {
    fn next_server(&self, backends: &[Arc<Backend>], ctx: &SelectionContext<'_>) -> Option<Arc<Backend>> {
        // min_by_key keeps the first of equal minimums: lowest index wins ties
        backends
            .iter()
            .filter(|b| ctx.is_eligible(b))
            .min_by_key(|b| b.active_count())
            .cloned()
    }
}
