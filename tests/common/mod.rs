//! Shared utilities for integration tests: mock backends, a proxy runner and
//! a small HTTP client.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use event_proxy::config::{BackendConfig, ListenerConfig, ProxyConfig};
use event_proxy::http::{parse_request, parse_response, BodyTransfer, OutputFraming, Parsed, RequestHead};
use event_proxy::load_balancer::BackendManager;
use event_proxy::pool::ConnectionPool;
use event_proxy::{EngineError, EventLoopHandle, ProxyEngine};

pub const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// How a mock backend answers every request.
#[derive(Debug, Clone)]
pub enum Reply {
    /// `200` with a Content-Length body, connection kept open.
    Fixed(&'static str),
    /// `200` with the given chunks, chunked encoding.
    Chunked(Vec<&'static str>),
    /// `200` echoing the request body.
    Echo,
    /// Like `Fixed`, but a kept-alive connection is closed unanswered on its
    /// second request.
    Once(&'static str),
    /// Reads the request and never answers.
    Stall,
}

impl Reply {
    fn render(&self, request_body: &[u8]) -> Vec<u8> {
        match self {
            Reply::Fixed(body) | Reply::Once(body) => {
                format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}", body.len(), body).into_bytes()
            }
            Reply::Chunked(parts) => {
                let mut out = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
                for part in parts {
                    out.extend_from_slice(format!("{:x}\r\n{}\r\n", part.len(), part).as_bytes());
                }
                out.extend_from_slice(b"0\r\n\r\n");
                out
            }
            Reply::Echo => {
                let mut out = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n", request_body.len()).into_bytes();
                out.extend_from_slice(request_body);
                out
            }
            Reply::Stall => Vec::new(),
        }
    }
}

/// A request as the backend saw it.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub head: RequestHead,
    pub body: Vec<u8>,
}

impl Recorded {
    pub fn header(&self, name: &str) -> Option<String> {
        self.head
            .headers
            .iter()
            .find(|h| h.is(name))
            .and_then(|h| h.value_str().map(str::to_string))
    }
}

#[derive(Debug, Default)]
struct Stats {
    connections: AtomicUsize,
    requests: Mutex<Vec<Recorded>>,
}

/// A keep-alive HTTP/1.1 backend counting accepted connections.
#[derive(Debug, Clone)]
pub struct MockBackend {
    pub addr: SocketAddr,
    stats: Arc<Stats>,
}

impl MockBackend {
    pub fn connections(&self) -> usize {
        self.stats.connections.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.stats.requests.lock().unwrap().clone()
    }
}

pub async fn spawn_backend(reply: Reply) -> MockBackend {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let stats = Arc::new(Stats::default());

    let task_stats = Arc::clone(&stats);
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            task_stats.connections.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(serve(socket, reply.clone(), Arc::clone(&task_stats)));
        }
    });

    MockBackend { addr, stats }
}

async fn serve(mut socket: TcpStream, reply: Reply, stats: Arc<Stats>) {
    let mut buf = Vec::new();
    let mut served = 0;
    loop {
        let head = loop {
            if let Ok(Parsed::Complete(head)) = parse_request(&buf, 64 * 1024) {
                break head;
            }
            if !fill(&mut socket, &mut buf).await {
                return;
            }
        };
        buf.drain(..head.head_len);

        if matches!(reply, Reply::Once(_)) && served > 0 {
            return;
        }
        let expects_continue = head
            .headers
            .iter()
            .any(|h| h.is("expect") && h.value_str().is_some_and(|v| v.eq_ignore_ascii_case("100-continue")));
        if expects_continue && socket.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").await.is_err() {
            return;
        }

        let Ok(framing) = head.framing() else { return };
        let mut transfer = BodyTransfer::new(framing, OutputFraming::Identity);
        let mut body = Vec::new();
        while !transfer.is_done() {
            let Ok(consumed) = transfer.pump(&buf, &mut body) else { return };
            buf.drain(..consumed);
            if !transfer.is_done() && !fill(&mut socket, &mut buf).await {
                return;
            }
        }
        served += 1;

        let response = reply.render(&body);
        stats.requests.lock().unwrap().push(Recorded { head, body });
        if matches!(reply, Reply::Stall) {
            std::future::pending::<()>().await;
        }
        if socket.write_all(&response).await.is_err() {
            return;
        }
    }
}

async fn fill(socket: &mut TcpStream, buf: &mut Vec<u8>) -> bool {
    let mut chunk = [0u8; 4096];
    match socket.read(&mut chunk).await {
        Ok(0) | Err(_) => false,
        Ok(n) => {
            buf.extend_from_slice(&chunk[..n]);
            true
        }
    }
}

/// An address nothing listens on.
pub fn dead_address() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

/// Loopback listener, health probes off, the given targets.
pub fn proxy_config(backends: &[SocketAddr]) -> ProxyConfig {
    let mut config = ProxyConfig {
        listener: ListenerConfig {
            bind_addresses: vec!["127.0.0.1:0".into()],
            dual_stack: false,
            ..ListenerConfig::default()
        },
        backends: backends
            .iter()
            .enumerate()
            .map(|(i, addr)| BackendConfig {
                name: format!("backend-{i}"),
                address: addr.to_string(),
                weight: 1,
                max_connections: 16,
            })
            .collect(),
        ..ProxyConfig::default()
    };
    config.health_check.enabled = false;
    config
}

/// A proxy running on its own thread, stopped on drop.
pub struct RunningProxy {
    pub addr: SocketAddr,
    pub pool: Arc<ConnectionPool>,
    pub balancer: Arc<BackendManager>,
    handle: EventLoopHandle,
    thread: Option<JoinHandle<Result<(), EngineError>>>,
}

impl RunningProxy {
    pub fn start(config: &ProxyConfig) -> Self {
        Self::from_engine(ProxyEngine::bind(config).unwrap())
    }

    pub fn from_engine(engine: ProxyEngine) -> Self {
        let addr = engine.local_addrs()[0];
        let pool = engine.pool();
        let balancer = engine.balancer();
        let handle = engine.handle();
        let thread = std::thread::spawn(move || engine.run());
        Self {
            addr,
            pool,
            balancer,
            handle,
            thread: Some(thread),
        }
    }
}

impl Drop for RunningProxy {
    fn drop(&mut self) {
        self.handle.stop();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// A response as the client saw it, body decoded.
#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn body_str(&self) -> &str {
        std::str::from_utf8(&self.body).unwrap()
    }
}

pub async fn connect(addr: SocketAddr) -> TcpStream {
    TcpStream::connect(addr).await.unwrap()
}

pub async fn send(stream: &mut TcpStream, request: &str) {
    send_bytes(stream, request.as_bytes()).await;
}

pub async fn send_bytes(stream: &mut TcpStream, bytes: &[u8]) {
    stream.write_all(bytes).await.unwrap();
}

/// Poll `condition` until it holds or `limit` passes.
pub async fn eventually(limit: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    true
}

/// Read one response. Bytes after it stay in `leftover`.
pub async fn read_response(stream: &mut TcpStream, leftover: &mut Vec<u8>) -> Response {
    tokio::time::timeout(IO_TIMEOUT, read_response_inner(stream, leftover))
        .await
        .expect("timed out waiting for response")
}

async fn read_response_inner(stream: &mut TcpStream, buf: &mut Vec<u8>) -> Response {
    let head = loop {
        if let Parsed::Complete(head) = parse_response(buf, 64 * 1024).unwrap() {
            break head;
        }
        assert!(fill(stream, buf).await, "connection closed before response head");
    };
    buf.drain(..head.head_len);

    let mut transfer = BodyTransfer::new(head.framing(false).unwrap(), OutputFraming::Identity);
    let mut body = Vec::new();
    while !transfer.is_done() {
        let consumed = transfer.pump(buf, &mut body).unwrap();
        buf.drain(..consumed);
        if transfer.is_done() {
            break;
        }
        if !fill(stream, buf).await {
            transfer.on_eof().unwrap();
        }
    }

    Response {
        status: head.status,
        headers: head
            .headers
            .iter()
            .map(|h| (h.name.clone(), h.value_str().unwrap_or_default().to_string()))
            .collect(),
        body,
    }
}

/// True once the peer has closed the connection.
pub async fn closed_within(stream: &mut TcpStream, limit: Duration) -> bool {
    let mut byte = [0u8; 1];
    matches!(tokio::time::timeout(limit, stream.read(&mut byte)).await, Ok(Ok(0)) | Ok(Err(_)))
}
