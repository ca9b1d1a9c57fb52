//! Pooled upstream connections and the leases that hand them out.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::TcpStream;

use crate::load_balancer::{Backend, BackendConnectionGuard};
use crate::net::socket::{read_stream, write_stream, SocketResult};

/// What the pool last learned about an entry's socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryHealth {
    /// Carried at least one complete exchange.
    Healthy,
    /// Connect still in flight, or no exchange finished on it yet.
    Unknown,
    /// Released after a failure; closed, never pooled.
    Unhealthy,
}

/// An upstream socket owned by the pool.
#[derive(Debug)]
pub struct PoolEntry {
    pub(crate) id: u64,
    pub(crate) stream: TcpStream,
    pub(crate) target: SocketAddr,
    pub(crate) created: Instant,
    pub(crate) last_used: Instant,
    pub(crate) health: EntryHealth,
}

impl PoolEntry {
    pub(crate) fn new(id: u64, stream: TcpStream, target: SocketAddr) -> Self {
        let now = Instant::now();
        Self {
            id,
            stream,
            target,
            created: now,
            last_used: now,
            health: EntryHealth::Unknown,
        }
    }

    /// Just-in-time liveness check on an idle socket.
    ///
    /// An idle HTTP/1.1 upstream has nothing to say: pending bytes or EOF both
    /// mean the connection cannot carry another request.
    pub fn probe(&self) -> bool {
        let mut byte = [0u8; 1];
        loop {
            match self.stream.peek(&mut byte) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return true,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Ok(_) | Err(_) => return false,
            }
        }
    }

    pub(crate) fn is_expired(&self, now: Instant, idle_timeout: Duration, max_lifetime: Duration) -> bool {
        now.saturating_duration_since(self.last_used) >= idle_timeout
            || now.saturating_duration_since(self.created) >= max_lifetime
    }
}

/// Progress of a non-blocking connect.
#[derive(Debug)]
pub enum ConnectProgress {
    Connected,
    Pending,
    Failed(io::Error),
}

/// Exclusive use of one upstream connection.
///
/// The entry is moved out of the pool for the lifetime of the lease, and the
/// lease holds a slot of the target's connection ceiling until it is released.
#[derive(Debug)]
pub struct Lease {
    pub(crate) entry: PoolEntry,
    pub(crate) guard: BackendConnectionGuard,
    pub(crate) fresh: bool,
    pub(crate) reusable: bool,
}

impl Lease {
    pub fn id(&self) -> u64 {
        self.entry.id
    }

    pub fn target(&self) -> SocketAddr {
        self.entry.target
    }

    pub fn backend(&self) -> &Arc<Backend> {
        &self.guard.backend
    }

    /// True while the connect started for this lease has not been confirmed.
    pub fn is_fresh(&self) -> bool {
        self.fresh
    }

    pub fn health(&self) -> EntryHealth {
        self.entry.health
    }

    /// Record a completed exchange on this connection.
    pub fn mark_healthy(&mut self) {
        self.entry.health = EntryHealth::Healthy;
    }

    /// A connection that already served an exchange and may since have been
    /// closed by the target's keep-alive timer.
    pub fn is_reused(&self) -> bool {
        self.entry.health == EntryHealth::Healthy
    }

    pub fn stream(&mut self) -> &mut TcpStream {
        &mut self.entry.stream
    }

    pub fn probe(&self) -> bool {
        self.entry.probe()
    }

    /// Allow the entry back into the idle list on release.
    pub fn set_reusable(&mut self, reusable: bool) {
        self.reusable = reusable;
    }

    pub fn is_reusable(&self) -> bool {
        self.reusable
    }

    /// Check a pending connect once the socket reports writable.
    pub fn connect_progress(&mut self) -> ConnectProgress {
        if !self.fresh {
            return ConnectProgress::Connected;
        }
        match self.entry.stream.take_error() {
            Ok(Some(err)) | Err(err) => return ConnectProgress::Failed(err),
            Ok(None) => {}
        }
        match self.entry.stream.peer_addr() {
            Ok(_) => {
                self.fresh = false;
                ConnectProgress::Connected
            }
            Err(e) if e.kind() == io::ErrorKind::NotConnected => ConnectProgress::Pending,
            Err(e) => ConnectProgress::Failed(e),
        }
    }

    pub fn try_read(&mut self, buf: &mut [u8]) -> SocketResult {
        read_stream(&mut self.entry.stream, buf)
    }

    pub fn try_write(&mut self, buf: &[u8]) -> SocketResult {
        write_stream(&mut self.entry.stream, buf)
    }
}
