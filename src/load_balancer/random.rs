//! Weighted random load balancing strategy.

use std::sync::Arc;

use rand::Rng;

use crate::load_balancer::{backend::Backend, LoadBalancer, SelectionContext};

/// Picks an eligible backend at random, proportionally to its weight.
#[derive(Debug, Default)]
pub struct WeightedRandom;

impl WeightedRandom {
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancer for WeightedRandom {
    fn next_server(&self, backends: &[Arc<Backend>], ctx: &SelectionContext<'_>) -> Option<Arc<Backend>> {
        let eligible: Vec<&Arc<Backend>> = backends.iter().filter(|b| ctx.is_eligible(b)).collect();
        let total: u64 = eligible.iter().map(|b| u64::from(b.weight.max(1))).sum();
        if total == 0 {
            return None;
        }

        let mut point = rand::thread_rng().gen_range(0..total);
        for backend in eligible {
            let weight = u64::from(backend.weight.max(1));
            if point < weight {
                return Some(backend.clone());
            }
            point -= weight;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, SocketAddr};

    #[test]
    fn respects_weights_and_health() {
        let mut heavy = Backend::new(0, SocketAddr::from(([127, 0, 0, 1], 9000)), 10);
        heavy.weight = 9;
        let light = Backend::new(1, SocketAddr::from(([127, 0, 0, 1], 9001)), 10);
        let down = Backend::new(2, SocketAddr::from(([127, 0, 0, 1], 9002)), 10);
        down.mark_failure(1);
        let backends = vec![Arc::new(heavy), Arc::new(light), Arc::new(down)];

        let lb = WeightedRandom::new();
        let ctx = SelectionContext::new(IpAddr::from([10, 0, 0, 1]));
        let mut counts = [0usize; 3];
        for _ in 0..5000 {
            counts[lb.next_server(&backends, &ctx).unwrap().index] += 1;
        }

        assert_eq!(counts[2], 0);
        assert!(counts[0] > counts[1] * 4, "{counts:?}");
    }

    #[test]
    fn none_when_nothing_eligible() {
        let b = Backend::new(0, SocketAddr::from(([127, 0, 0, 1], 9000)), 10);
        let excluded = [b.addr];
        let backends = vec![Arc::new(b)];
        let ctx = SelectionContext::new(IpAddr::from([10, 0, 0, 1])).excluding(&excluded);
        assert!(WeightedRandom::new().next_server(&backends, &ctx).is_none());
    }
}
