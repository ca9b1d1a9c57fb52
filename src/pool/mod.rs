//! Upstream connection pool.
//!
//! # Data Flow
//! ```text
//! acquire(backend)
//!     → reserve a slot under the backend's connection ceiling
//!     → pop the most recently used idle entry, probe it outside the lock
//!     → or start a non-blocking connect (fresh lease)
//! release(lease, healthy)
//!     → idle list (reusable, healthy, under the idle cap, within lifetime)
//!     → or close; unhealthy releases count against the backend
//! reaper.rs
//!     → periodic sweep of expired idle entries
//! ```
//!
//! # Design Decisions
//! - Leases own their entry, so two contexts can never share a socket
//! - One mutex guards the idle lists and the leased index; probes and
//!   connects happen outside it
//! - The backend's atomic counter is both the ceiling and the
//!   least-connections signal

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use thiserror::Error;

use crate::config::PoolConfig;
use crate::load_balancer::Backend;
use crate::observability::metrics;

pub mod entry;
pub mod reaper;

pub use entry::{ConnectProgress, EntryHealth, Lease, PoolEntry};
pub use reaper::PoolReaper;

/// Error type for pool operations.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("backend {0} is at its connection limit")]
    Saturated(SocketAddr),
    #[error("connect to {addr} failed: {source}")]
    Connect { addr: SocketAddr, source: io::Error },
}

#[derive(Debug, Default)]
struct PoolState {
    /// Idle entries per target, most recently used last.
    idle: HashMap<SocketAddr, Vec<PoolEntry>>,
    /// Ids of entries currently held by a lease.
    leased: HashSet<u64>,
}

/// Per-target pools of idle upstream sockets.
#[derive(Debug)]
pub struct ConnectionPool {
    max_idle_per_backend: usize,
    idle_timeout: Duration,
    max_lifetime: Duration,
    unhealthy_threshold: usize,
    next_id: AtomicU64,
    state: Mutex<PoolState>,
}

impl ConnectionPool {
    pub fn new(config: &PoolConfig, unhealthy_threshold: u32) -> Self {
        Self {
            max_idle_per_backend: config.max_idle_per_backend,
            idle_timeout: config.idle_timeout(),
            max_lifetime: config.max_lifetime(),
            unhealthy_threshold: unhealthy_threshold.max(1) as usize,
            next_id: AtomicU64::new(1),
            state: Mutex::new(PoolState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lease a connection to `backend`.
    ///
    /// Reuses the most recently released live idle socket, otherwise starts a
    /// non-blocking connect. Fails immediately when the backend is at its
    /// connection ceiling.
    pub fn acquire(&self, backend: &Arc<Backend>) -> Result<Lease, PoolError> {
        let addr = backend.addr;
        let guard = backend.try_create_guard().ok_or(PoolError::Saturated(addr))?;

        loop {
            let candidate = {
                let mut state = self.lock();
                let entry = state.idle.get_mut(&addr).and_then(Vec::pop);
                if let Some(entry) = &entry {
                    state.leased.insert(entry.id);
                }
                entry
            };
            let Some(entry) = candidate else { break };

            let live = entry.health == EntryHealth::Healthy
                && entry.probe()
                && !entry.is_expired(Instant::now(), Duration::MAX, self.max_lifetime);
            if live {
                tracing::trace!(backend = %addr, entry = entry.id, "Reusing idle upstream connection");
                metrics::record_pool_acquire(true);
                return Ok(Lease {
                    entry,
                    guard,
                    fresh: false,
                    reusable: false,
                });
            }

            tracing::debug!(backend = %addr, entry = entry.id, "Discarding dead idle connection");
            self.lock().leased.remove(&entry.id);
        }

        let stream = TcpStream::connect(addr).map_err(|source| PoolError::Connect { addr, source })?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(backend = %addr, error = %e, "Failed to set TCP_NODELAY upstream");
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().leased.insert(id);
        metrics::record_pool_acquire(false);
        tracing::trace!(backend = %addr, entry = id, "Opening upstream connection");

        Ok(Lease {
            entry: PoolEntry::new(id, stream, addr),
            guard,
            fresh: true,
            reusable: false,
        })
    }

    /// Return a lease.
    ///
    /// A healthy, reusable lease goes back to its target's idle list unless
    /// the list is full or the socket outlived its lifetime. An unhealthy
    /// release closes the socket and records a failure against the target.
    pub fn release(&self, lease: Lease, healthy: bool) {
        let Lease {
            mut entry,
            guard,
            reusable,
            ..
        } = lease;
        let now = Instant::now();

        let mut state = self.lock();
        state.leased.remove(&entry.id);

        if !healthy {
            drop(state);
            entry.health = EntryHealth::Unhealthy;
            tracing::debug!(
                backend = %entry.target,
                entry = entry.id,
                health = ?entry.health,
                "Closing upstream connection after failure"
            );
            if guard.backend.mark_failure(self.unhealthy_threshold) {
                tracing::warn!(backend = %entry.target, "Backend marked unhealthy");
            }
            metrics::record_backend_health(&entry.target.to_string(), guard.backend.is_healthy());
            return;
        }

        if !reusable || entry.is_expired(now, Duration::MAX, self.max_lifetime) {
            return;
        }

        let list = state.idle.entry(entry.target).or_default();
        if list.len() >= self.max_idle_per_backend {
            tracing::trace!(backend = %entry.target, entry = entry.id, "Idle list full, closing connection");
            return;
        }
        entry.last_used = now;
        entry.health = EntryHealth::Healthy;
        list.push(entry);
    }

    /// Close idle entries past their idle timeout or lifetime as of `now`.
    ///
    /// Entries are dropped, and so closed, while the lock is held. Leased
    /// entries are not in the idle lists and cannot be touched.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut reaped = 0;
        let mut state = self.lock();
        for list in state.idle.values_mut() {
            list.retain(|entry| {
                let expired = entry.is_expired(now, self.idle_timeout, self.max_lifetime);
                reaped += usize::from(expired);
                !expired
            });
        }
        state.idle.retain(|_, list| !list.is_empty());
        drop(state);

        if reaped > 0 {
            tracing::debug!(reaped, "Reaped idle upstream connections");
            metrics::record_pool_reaped(reaped);
        }
        reaped
    }

    pub fn idle_count(&self, addr: &SocketAddr) -> usize {
        self.lock().idle.get(addr).map_or(0, Vec::len)
    }

    pub fn total_idle(&self) -> usize {
        self.lock().idle.values().map(Vec::len).sum()
    }

    pub fn leased_count(&self) -> usize {
        self.lock().leased.len()
    }

    pub fn is_leased(&self, id: u64) -> bool {
        self.lock().leased.contains(&id)
    }
}
