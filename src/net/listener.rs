//! Listening sockets.
//!
//! # Responsibilities
//! - Bind the configured addresses, IPv4 and IPv6
//! - Prefer one dual-stack IPv6 socket where the platform allows it
//! - Hand non-blocking listeners to the event loop
//! - Accept until the kernel queue is drained

use std::io;
use std::net::{Ipv4Addr, SocketAddr};

use mio::net::{TcpListener, TcpStream};
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;

use crate::config::ListenerConfig;

const LISTEN_BACKLOG: i32 = 1024;

/// Error type for listener operations.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("invalid bind address '{0}'")]
    Address(String),
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },
}

/// A non-blocking listening socket.
#[derive(Debug)]
pub struct Listener {
    inner: TcpListener,
    local_addr: SocketAddr,
}

impl Listener {
    /// Bind one address. IPv6 binds accept IPv4 clients too when `dual_stack` is set.
    pub fn bind(addr: SocketAddr, dual_stack: bool) -> Result<Self, ListenerError> {
        let bind_err = |source| ListenerError::Bind { addr, source };

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP)).map_err(bind_err)?;
        if addr.is_ipv6() {
            socket.set_only_v6(!dual_stack).map_err(bind_err)?;
        }
        socket.set_reuse_address(true).map_err(bind_err)?;
        socket.set_nonblocking(true).map_err(bind_err)?;
        socket.bind(&addr.into()).map_err(bind_err)?;
        socket.listen(LISTEN_BACKLOG).map_err(bind_err)?;

        let std_listener: std::net::TcpListener = socket.into();
        let local_addr = std_listener.local_addr().map_err(bind_err)?;
        tracing::info!(address = %local_addr, dual_stack = dual_stack && addr.is_ipv6(), "Listener bound");

        Ok(Self {
            inner: TcpListener::from_std(std_listener),
            local_addr,
        })
    }

    /// Accept one pending connection.
    pub fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        self.inner.accept()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(crate) fn source(&mut self) -> &mut TcpListener {
        &mut self.inner
    }
}

/// Bind every configured address.
///
/// A dual-stack IPv6 bind that the host cannot provide falls back to the IPv4
/// wildcard on the same port.
pub fn bind_all(config: &ListenerConfig) -> Result<Vec<Listener>, ListenerError> {
    let mut listeners = Vec::with_capacity(config.bind_addresses.len());
    for raw in &config.bind_addresses {
        let addr: SocketAddr = raw.parse().map_err(|_| ListenerError::Address(raw.clone()))?;
        match Listener::bind(addr, config.dual_stack) {
            Ok(listener) => listeners.push(listener),
            Err(ListenerError::Bind { source, .. })
                if addr.is_ipv6() && config.dual_stack && ipv6_unavailable(&source) =>
            {
                let fallback = SocketAddr::from((Ipv4Addr::UNSPECIFIED, addr.port()));
                tracing::warn!(requested = %addr, fallback = %fallback, error = %source, "IPv6 unavailable, binding IPv4 only");
                listeners.push(Listener::bind(fallback, false)?);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(listeners)
}

fn ipv6_unavailable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::AddrNotAvailable | io::ErrorKind::Unsupported
    ) || err.raw_os_error() == Some(97) // EAFNOSUPPORT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binds_ephemeral_port() {
        let listener = Listener::bind("127.0.0.1:0".parse().unwrap(), false).unwrap();
        assert_ne!(listener.local_addr().port(), 0);
        // nothing queued yet
        assert_eq!(listener.accept().unwrap_err().kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn rejects_bad_address() {
        let config = ListenerConfig {
            bind_addresses: vec!["localhost:80".into()],
            ..ListenerConfig::default()
        };
        assert!(matches!(bind_all(&config), Err(ListenerError::Address(_))));
    }

    #[test]
    fn dual_stack_accepts_ipv4_clients() {
        let listener = match Listener::bind("[::]:0".parse().unwrap(), true) {
            Ok(listener) => listener,
            // host without IPv6
            Err(_) => return,
        };
        let port = listener.local_addr().port();
        let _client = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        loop {
            match listener.accept() {
                Ok((_, peer)) => {
                    assert_eq!(peer.ip().to_canonical(), std::net::IpAddr::from([127, 0, 0, 1]));
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock && std::time::Instant::now() < deadline => {
                    std::thread::sleep(std::time::Duration::from_millis(5));
                }
                Err(e) => panic!("accept failed: {e}"),
            }
        }
    }
}
