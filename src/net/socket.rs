//! Uniform non-blocking socket contract.
//!
//! Every transport reports one of three outcomes: bytes moved, would block,
//! or closed with a reason. Errors never escape as `io::Error`, so callers
//! match on a single enum instead of unwinding.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};

use mio::net::TcpStream;

/// Why a socket stopped being usable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Orderly end of stream from the peer.
    Eof,
    /// Connection reset by the peer.
    Reset,
    /// Write to a connection the peer already closed.
    BrokenPipe,
    /// TLS handshake or record layer failure.
    Tls(String),
    /// Closed locally.
    Local,
    /// Any other I/O failure.
    Io(io::ErrorKind),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Eof => f.write_str("end of stream"),
            CloseReason::Reset => f.write_str("connection reset"),
            CloseReason::BrokenPipe => f.write_str("broken pipe"),
            CloseReason::Tls(msg) => write!(f, "tls error: {msg}"),
            CloseReason::Local => f.write_str("closed locally"),
            CloseReason::Io(kind) => write!(f, "i/o error: {kind}"),
        }
    }
}

impl From<&io::Error> for CloseReason {
    fn from(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => CloseReason::Reset,
            io::ErrorKind::BrokenPipe => CloseReason::BrokenPipe,
            io::ErrorKind::UnexpectedEof => CloseReason::Eof,
            kind => CloseReason::Io(kind),
        }
    }
}

/// Outcome of a single non-blocking I/O attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketResult {
    /// `n` bytes were read or written (`n > 0`, except for empty writes).
    Data(usize),
    /// Nothing can be done until the next readiness event.
    WouldBlock,
    /// The socket is finished.
    Closed(CloseReason),
}

/// A non-blocking socket the connection state machine can drive.
pub trait SocketHandler: fmt::Debug + Send {
    /// Read once into `buf`.
    fn try_read(&mut self, buf: &mut [u8]) -> SocketResult;

    /// Write once from `buf`. An empty `buf` only flushes pending transport data.
    fn try_write(&mut self, buf: &[u8]) -> SocketResult;

    /// True when transport-level bytes are still waiting to go out.
    fn has_pending_output(&self) -> bool {
        false
    }

    /// Shut the socket down. Further attempts report `Closed(Local)`.
    fn close(&mut self);

    /// The underlying stream, for readiness registration.
    fn stream(&mut self) -> &mut TcpStream;

    fn peer_addr(&self) -> Option<SocketAddr>;
}

/// One non-blocking read from a raw stream.
pub(crate) fn read_stream(stream: &mut TcpStream, buf: &mut [u8]) -> SocketResult {
    loop {
        match stream.read(buf) {
            Ok(0) if !buf.is_empty() => return SocketResult::Closed(CloseReason::Eof),
            Ok(n) => return SocketResult::Data(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return SocketResult::WouldBlock,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return SocketResult::Closed(CloseReason::from(&e)),
        }
    }
}

/// One non-blocking write to a raw stream. Empty writes succeed trivially.
pub(crate) fn write_stream(stream: &mut TcpStream, buf: &[u8]) -> SocketResult {
    if buf.is_empty() {
        return SocketResult::Data(0);
    }
    loop {
        match stream.write(buf) {
            Ok(0) => return SocketResult::Closed(CloseReason::BrokenPipe),
            Ok(n) => return SocketResult::Data(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return SocketResult::WouldBlock,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return SocketResult::Closed(CloseReason::from(&e)),
        }
    }
}

/// Plain TCP transport.
#[derive(Debug)]
pub struct TcpSocket {
    stream: TcpStream,
    peer: Option<SocketAddr>,
    closed: bool,
}

impl TcpSocket {
    pub fn new(stream: TcpStream) -> Self {
        let peer = stream.peer_addr().ok();
        Self {
            stream,
            peer,
            closed: false,
        }
    }
}

impl SocketHandler for TcpSocket {
    fn try_read(&mut self, buf: &mut [u8]) -> SocketResult {
        if self.closed {
            return SocketResult::Closed(CloseReason::Local);
        }
        read_stream(&mut self.stream, buf)
    }

    fn try_write(&mut self, buf: &[u8]) -> SocketResult {
        if self.closed {
            return SocketResult::Closed(CloseReason::Local);
        }
        write_stream(&mut self.stream, buf)
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.stream.shutdown(Shutdown::Both);
        }
    }

    fn stream(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::net::TcpListener;

    use mio::net::TcpStream;

    /// A connected (mio, std) pair over loopback.
    pub fn socket_pair() -> (TcpStream, std::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (TcpStream::from_std(server), client)
    }
}
