//! Engine assembly: listeners, balancer, pool and the event loop.

use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use mio::net::TcpStream;
use rustls::ServerConfig;
use thiserror::Error;

use crate::config::ProxyConfig;
use crate::load_balancer::BackendManager;
use crate::net::{bind_all, load_tls_config, Listener, ListenerError, SocketHandler, TcpSocket, TlsError, TlsSocket};
use crate::observability::metrics;
use crate::pool::ConnectionPool;
use crate::proxy::context::{ContextSettings, Env};
use crate::proxy::event_loop::{EventLoop, EventLoopHandle};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Listener(#[from] ListenerError),
    #[error(transparent)]
    Tls(#[from] TlsError),
    #[error("no usable backend address configured")]
    NoBackends,
    #[error("event loop failure: {0}")]
    Io(#[from] io::Error),
}

/// Decides whether an accepted stream becomes a connection, and wraps it.
#[derive(Debug)]
pub(crate) struct Admission {
    tls: Option<Arc<ServerConfig>>,
    max_connections: usize,
}

impl Admission {
    pub(crate) fn new(tls: Option<Arc<ServerConfig>>, max_connections: usize) -> Self {
        Self { tls, max_connections }
    }

    /// `None` drops the stream: over the connection limit or TLS setup failed.
    pub(crate) fn admit(&self, stream: TcpStream, peer: SocketAddr, active: usize) -> Option<Box<dyn SocketHandler>> {
        if active >= self.max_connections {
            tracing::warn!(client = %peer, limit = self.max_connections, "Connection limit reached, rejecting");
            metrics::record_connection_rejected();
            return None;
        }
        if let Err(e) = stream.set_nodelay(true) {
            tracing::trace!(client = %peer, error = %e, "Failed to set TCP_NODELAY");
        }

        match &self.tls {
            None => Some(Box::new(TcpSocket::new(stream))),
            Some(config) => match TlsSocket::new(stream, Arc::clone(config)) {
                Ok(socket) => Some(Box::new(socket)),
                Err(e) => {
                    tracing::warn!(client = %peer, error = %e, "Failed to start TLS session");
                    None
                }
            },
        }
    }
}

/// A bound, ready-to-run proxy.
pub struct ProxyEngine {
    event_loop: EventLoop,
    local_addrs: Vec<SocketAddr>,
    balancer: Arc<BackendManager>,
    pool: Arc<ConnectionPool>,
}

impl ProxyEngine {
    /// Bind the configured listeners, loading TLS material from disk if configured.
    pub fn bind(config: &ProxyConfig) -> Result<Self, EngineError> {
        let tls = match &config.listener.tls {
            Some(tls) => Some(load_tls_config(Path::new(&tls.cert_path), Path::new(&tls.key_path))?),
            None => None,
        };
        Self::bind_with_tls(config, tls)
    }

    /// Bind with an already built TLS configuration.
    pub fn bind_with_tls(config: &ProxyConfig, tls: Option<Arc<ServerConfig>>) -> Result<Self, EngineError> {
        let balancer = Arc::new(BackendManager::new(&config.backends, config.load_balancing.policy));
        if balancer.all_backends().is_empty() {
            return Err(EngineError::NoBackends);
        }
        let pool = Arc::new(ConnectionPool::new(&config.pool, config.health_check.unhealthy_threshold));

        let listeners = bind_all(&config.listener)?;
        let local_addrs: Vec<SocketAddr> = listeners.iter().map(Listener::local_addr).collect();

        let env = Env {
            balancer: Arc::clone(&balancer),
            pool: Arc::clone(&pool),
            settings: ContextSettings::from_config(config),
        };
        let tls_enabled = tls.is_some();
        let admission = Admission::new(tls, config.listener.max_connections);
        let event_loop = EventLoop::new(listeners, env, admission, config.timeouts.sweep_interval())?;

        tracing::info!(
            addresses = ?local_addrs,
            backends = balancer.all_backends().len(),
            policy = %balancer.policy(),
            tls = tls_enabled,
            "Proxy engine ready"
        );

        Ok(Self {
            event_loop,
            local_addrs,
            balancer,
            pool,
        })
    }

    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    pub fn handle(&self) -> EventLoopHandle {
        self.event_loop.handle()
    }

    pub fn pool(&self) -> Arc<ConnectionPool> {
        Arc::clone(&self.pool)
    }

    pub fn balancer(&self) -> Arc<BackendManager> {
        Arc::clone(&self.balancer)
    }

    /// Run the event loop on the current thread until the handle stops it.
    pub fn run(mut self) -> Result<(), EngineError> {
        self.event_loop.run()?;
        Ok(())
    }
}
