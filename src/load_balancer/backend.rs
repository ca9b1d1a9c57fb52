//! Upstream target abstraction.
//!
//! # Responsibilities
//! - Represent a single backend server
//! - Track active (leased) connections for Least Connections and the pool ceiling
//! - Track health state (Unknown/Healthy/Unhealthy) with hysteresis

use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::BackendConfig;

/// Health State enum.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Unknown = 0,
    Healthy = 1,
    Unhealthy = 2,
}

impl From<u8> for HealthState {
    fn from(val: u8) -> Self {
        match val {
            1 => HealthState::Healthy,
            2 => HealthState::Unhealthy,
            _ => HealthState::Unknown,
        }
    }
}

/// A single backend server.
#[derive(Debug)]
pub struct Backend {
    /// Position in the configured target list.
    pub index: usize,
    /// Name used in logs and metrics (defaults to the address).
    pub name: String,
    /// The address of the backend.
    pub addr: SocketAddr,
    /// Relative weight for weighted selection.
    pub weight: u32,
    /// Maximum concurrent leased connections allowed.
    pub max_connections: usize,
    /// Number of currently leased connections.
    pub active_connections: AtomicUsize,

    /// Current health state (0=Unknown, 1=Healthy, 2=Unhealthy).
    pub state: AtomicU8,
    /// Consecutive failure count.
    pub consecutive_failures: AtomicUsize,
    /// Consecutive success count.
    pub consecutive_successes: AtomicUsize,
}

impl Backend {
    /// Create a new backend.
    pub fn new(index: usize, addr: SocketAddr, max_connections: usize) -> Self {
        Self {
            index,
            name: addr.to_string(),
            addr,
            weight: 1,
            max_connections,
            active_connections: AtomicUsize::new(0),
            state: AtomicU8::new(HealthState::Unknown as u8),
            consecutive_failures: AtomicUsize::new(0),
            consecutive_successes: AtomicUsize::new(0),
        }
    }

    /// Build a backend from its configuration entry.
    pub fn from_config(index: usize, config: &BackendConfig) -> Option<Self> {
        let addr: SocketAddr = config.address.parse().ok()?;
        let mut backend = Self::new(index, addr, config.max_connections);
        backend.weight = config.weight.max(1);
        if !config.name.is_empty() {
            backend.name = config.name.clone();
        }
        Some(backend)
    }

    /// Get the current number of active connections.
    pub fn active_count(&self) -> usize {
        self.active_connections.load(Ordering::Acquire)
    }

    /// Increment active connection count.
    pub fn inc_connections(&self) {
        self.active_connections.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrement active connection count.
    pub fn dec_connections(&self) {
        self.active_connections.fetch_sub(1, Ordering::AcqRel);
    }

    /// Try to create a connection guard that increments count.
    ///
    /// Returns `None` when the backend is at its connection ceiling.
    pub fn try_create_guard(self: &Arc<Self>) -> Option<BackendConnectionGuard> {
        let mut prev = self.active_connections.load(Ordering::Acquire);
        loop {
            if prev >= self.max_connections {
                return None;
            }
            match self.active_connections.compare_exchange_weak(
                prev,
                prev + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(x) => prev = x,
            }
        }
        Some(BackendConnectionGuard {
            backend: self.clone(),
        })
    }

    // --- Health Logic ---

    pub fn health(&self) -> HealthState {
        HealthState::from(self.state.load(Ordering::Acquire))
    }

    /// Return true if backend is considered healthy (Healthy or Unknown).
    pub fn is_healthy(&self) -> bool {
        self.health() != HealthState::Unhealthy
    }

    /// Report a successful exchange or probe.
    ///
    /// Returns true when this call moved the backend to Healthy.
    pub fn mark_success(&self, healthy_threshold: usize) -> bool {
        self.consecutive_failures.store(0, Ordering::Release);

        if self.health() == HealthState::Healthy {
            return false;
        }

        let successes = self.consecutive_successes.fetch_add(1, Ordering::AcqRel) + 1;
        if successes >= healthy_threshold {
            self.state.store(HealthState::Healthy as u8, Ordering::Release);
            self.consecutive_successes.store(0, Ordering::Release);
            return true;
        }
        false
    }

    /// Report a failed exchange or probe.
    ///
    /// Returns true when this call moved the backend to Unhealthy.
    pub fn mark_failure(&self, unhealthy_threshold: usize) -> bool {
        self.consecutive_successes.store(0, Ordering::Release);

        if self.health() == HealthState::Unhealthy {
            return false;
        }

        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= unhealthy_threshold {
            self.state.store(HealthState::Unhealthy as u8, Ordering::Release);
            self.consecutive_failures.store(0, Ordering::Release);
            return true;
        }
        false
    }
}

/// A RAII guard that manages the active connection count.
#[derive(Debug)]
pub struct BackendConnectionGuard {
    pub backend: Arc<Backend>,
}

impl Deref for BackendConnectionGuard {
    type Target = Backend;
    fn deref(&self) -> &Self::Target {
        &self.backend
    }
}

impl Drop for BackendConnectionGuard {
    fn drop(&mut self) {
        self.backend.dec_connections();
    }
}
