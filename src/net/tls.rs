//! TLS termination over non-blocking sockets.
//!
//! `TlsSocket` wraps a `rustls::ServerConnection` so it honours the same
//! `SocketHandler` contract as plain TCP. While the handshake is running, both
//! directions report `WouldBlock`; the event loop needs no TLS knowledge.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::path::Path;
use std::sync::Arc;

use mio::net::TcpStream;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ServerConfig, ServerConnection};
use thiserror::Error;

use crate::net::socket::{CloseReason, SocketHandler, SocketResult};

/// Errors building a TLS server configuration.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read {path}: {source}")]
    Io { path: String, source: io::Error },
    #[error("no certificates found in {0}")]
    NoCertificates(String),
    #[error("no private key found in {0}")]
    NoPrivateKey(String),
    #[error(transparent)]
    Rustls(#[from] rustls::Error),
}

/// Load a certificate chain and private key (PEM) into a server configuration.
pub fn load_tls_config(cert_path: &Path, key_path: &Path) -> Result<Arc<ServerConfig>, TlsError> {
    let io_err = |path: &Path| {
        let path = path.display().to_string();
        move |source| TlsError::Io { path, source }
    };

    let mut cert_reader = BufReader::new(File::open(cert_path).map_err(io_err(cert_path))?);
    let certs = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(io_err(cert_path))?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(cert_path.display().to_string()));
    }

    let mut key_reader = BufReader::new(File::open(key_path).map_err(io_err(key_path))?);
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(io_err(key_path))?
        .ok_or_else(|| TlsError::NoPrivateKey(key_path.display().to_string()))?;

    build_server_config(certs, key)
}

/// Build a server configuration from already-decoded certificate material.
pub fn build_server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<Arc<ServerConfig>, TlsError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

/// Handshake progress of a TLS socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Handshaking,
    Ready,
    Failed,
}

/// Server-side TLS transport.
pub struct TlsSocket {
    stream: TcpStream,
    conn: ServerConnection,
    state: HandshakeState,
    failure: Option<CloseReason>,
    peer: Option<SocketAddr>,
    closed: bool,
}

impl std::fmt::Debug for TlsSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsSocket")
            .field("peer", &self.peer)
            .field("state", &self.state)
            .field("closed", &self.closed)
            .finish()
    }
}

impl TlsSocket {
    pub fn new(stream: TcpStream, config: Arc<ServerConfig>) -> Result<Self, rustls::Error> {
        let peer = stream.peer_addr().ok();
        Ok(Self {
            stream,
            conn: ServerConnection::new(config)?,
            state: HandshakeState::Handshaking,
            failure: None,
            peer,
            closed: false,
        })
    }

    pub fn handshake_state(&self) -> HandshakeState {
        self.state
    }

    fn fail(&mut self, reason: CloseReason) -> SocketResult {
        if matches!(reason, CloseReason::Tls(_)) {
            tracing::debug!(peer = ?self.peer, reason = %reason, "TLS failure");
            self.state = HandshakeState::Failed;
        }
        self.failure = Some(reason.clone());
        SocketResult::Closed(reason)
    }

    /// Push queued TLS records to the socket until done or blocked.
    fn flush_tls(&mut self) -> Result<(), CloseReason> {
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut self.stream) {
                Ok(0) => return Err(CloseReason::BrokenPipe),
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(CloseReason::from(&e)),
            }
        }
        Ok(())
    }

    /// Pull TLS records from the socket. `Ok(false)` means the socket is drained.
    fn fill(&mut self) -> Result<bool, CloseReason> {
        match self.conn.read_tls(&mut self.stream) {
            Ok(0) => Err(CloseReason::Eof),
            Ok(_) => match self.conn.process_new_packets() {
                Ok(_) => Ok(true),
                Err(e) => {
                    // best effort: let the peer see the alert
                    let _ = self.flush_tls();
                    Err(CloseReason::Tls(e.to_string()))
                }
            },
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::InvalidData => Err(CloseReason::Tls(e.to_string())),
            Err(e) => Err(CloseReason::from(&e)),
        }
    }

    /// Advance the handshake. `Ok(true)` once it has completed.
    fn handshake(&mut self) -> Result<bool, CloseReason> {
        if self.state == HandshakeState::Ready {
            return Ok(true);
        }
        loop {
            self.flush_tls()?;
            if !self.conn.is_handshaking() {
                self.state = HandshakeState::Ready;
                tracing::trace!(peer = ?self.peer, "TLS handshake complete");
                return Ok(true);
            }
            if !self.conn.wants_read() || !self.fill()? {
                return Ok(false);
            }
        }
    }

    /// Common guard for both directions: closed, failed, or still handshaking.
    fn ready(&mut self) -> Option<SocketResult> {
        if self.closed {
            return Some(SocketResult::Closed(CloseReason::Local));
        }
        if let Some(reason) = &self.failure {
            return Some(SocketResult::Closed(reason.clone()));
        }
        match self.handshake() {
            Ok(true) => None,
            Ok(false) => Some(SocketResult::WouldBlock),
            Err(reason) => Some(self.fail(reason)),
        }
    }
}

impl SocketHandler for TlsSocket {
    fn try_read(&mut self, buf: &mut [u8]) -> SocketResult {
        if let Some(result) = self.ready() {
            return result;
        }
        loop {
            match self.conn.reader().read(buf) {
                Ok(0) if !buf.is_empty() => return self.fail(CloseReason::Eof),
                Ok(n) => return SocketResult::Data(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => match self.fill() {
                    Ok(true) => {
                        if let Err(reason) = self.flush_tls() {
                            return self.fail(reason);
                        }
                    }
                    Ok(false) => return SocketResult::WouldBlock,
                    Err(reason) => return self.fail(reason),
                },
                Err(e) => return self.fail(CloseReason::from(&e)),
            }
        }
    }

    fn try_write(&mut self, buf: &[u8]) -> SocketResult {
        if let Some(result) = self.ready() {
            return result;
        }
        if let Err(reason) = self.flush_tls() {
            return self.fail(reason);
        }
        if self.conn.wants_write() {
            // earlier records are still queued
            return SocketResult::WouldBlock;
        }
        if buf.is_empty() {
            return SocketResult::Data(0);
        }

        let n = match self.conn.writer().write(buf) {
            Ok(0) => return SocketResult::WouldBlock,
            Ok(n) => n,
            Err(e) => return self.fail(CloseReason::from(&e)),
        };
        if let Err(reason) = self.flush_tls() {
            return self.fail(reason);
        }
        SocketResult::Data(n)
    }

    fn has_pending_output(&self) -> bool {
        !self.closed && self.failure.is_none() && self.conn.wants_write()
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        if self.state == HandshakeState::Ready {
            self.conn.send_close_notify();
            let _ = self.flush_tls();
        }
        self.closed = true;
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    fn stream(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}
