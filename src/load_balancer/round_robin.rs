//! Round-robin load balancing strategy.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::load_balancer::{backend::Backend, LoadBalancer, SelectionContext};

/// Round-robin selector.
/// Stores an internal counter to rotate through backends.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobin {
    fn next_server(&self, backends: &[Arc<Backend>], ctx: &SelectionContext<'_>) -> Option<Arc<Backend>> {
        if backends.is_empty() {
            return None;
        }

        // every caller gets its own cursor value; ineligible slots are skipped
        // without consuming further cursor values
        let start = self.counter.fetch_add(1, Ordering::Relaxed);
        let len = backends.len();

        (0..len)
            .map(|i| &backends[(start + i) % len])
            .find(|backend| ctx.is_eligible(backend))
            .cloned()
    }
}
