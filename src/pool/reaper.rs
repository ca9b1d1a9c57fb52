//! Background maintenance of the upstream pool.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio::time::{self, MissedTickBehavior};

use crate::health::HealthMonitor;
use crate::pool::ConnectionPool;

const MIN_TICK: Duration = Duration::from_millis(10);

/// Sweeps expired idle connections on a timer, independent of traffic, and
/// optionally drives the health monitor on its own timer.
pub struct PoolReaper {
    pool: Arc<ConnectionPool>,
    interval: Duration,
    health: Option<HealthMonitor>,
}

impl PoolReaper {
    pub fn new(pool: Arc<ConnectionPool>, interval: Duration) -> Self {
        Self {
            pool,
            interval: interval.max(MIN_TICK),
            health: None,
        }
    }

    pub fn with_health_monitor(mut self, monitor: HealthMonitor) -> Self {
        self.health = Some(monitor);
        self
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(
            interval_ms = self.interval.as_millis() as u64,
            health_checks = self.health.is_some(),
            "Pool reaper starting"
        );

        let mut sweep = time::interval(self.interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let probe_every = self.health.as_ref().map_or(Duration::from_secs(3600), HealthMonitor::interval);
        let mut probe = time::interval(probe_every.max(MIN_TICK));
        probe.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = sweep.tick() => {
                    self.pool.sweep(Instant::now());
                }
                _ = probe.tick(), if self.health.is_some() => {
                    if let Some(monitor) = &self.health {
                        monitor.check_unhealthy().await;
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("Pool reaper received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }
}
