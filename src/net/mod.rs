//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (dual-stack bind, non-blocking accept)
//!     → tls.rs (optional TLS termination, handshake as a socket sub-state)
//!     → socket.rs (uniform try_read / try_write / close)
//!     → Hand off to the connection state machine
//! ```
//!
//! # Design Decisions
//! - Sockets never block and never surface io::Error to callers
//! - TLS is hidden behind the same trait as plain TCP
//! - Each connection carries an ID for tracing

pub mod connection;
pub mod listener;
pub mod socket;
pub mod tls;

pub use connection::ConnectionId;
pub use listener::{bind_all, Listener, ListenerError};
pub use socket::{CloseReason, SocketHandler, SocketResult, TcpSocket};
pub use tls::{load_tls_config, HandshakeState, TlsError, TlsSocket};
