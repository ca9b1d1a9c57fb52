//! Per-connection state machine.
//!
//! One `ConnectionContext` exists per accepted downstream connection. It owns
//! the downstream socket, at most one upstream lease, the buffers in both
//! directions and the state of the exchange in flight.
//!
//! ```text
//! AcceptingRequest → SelectingUpstream → ForwardingRequest → AwaitingResponse
//!        ↑                                                          ↓
//!        └──────────── Complete ←──────────── ReturningResponse ←───┘
//!                         ↓
//!                      Closing
//! ```
//!
//! Every readiness notification runs the step loop: each step makes at most
//! one non-blocking I/O attempt, on a socket whose interest and recorded
//! events intersect. `WouldBlock` clears the event bit; the loop ends when no
//! step can make progress.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::{Interest, Registry, Token};

use crate::config::ProxyConfig;
use crate::http::{
    parse_request, parse_response, BodyFraming, BodyTransfer, DefaultAnswer, OutputFraming, ParseError, Parsed,
    RequestHead, ResponseHead,
};
use crate::load_balancer::{BackendManager, SelectError, SelectionContext};
use crate::net::{CloseReason, ConnectionId, SocketHandler, SocketResult};
use crate::observability::metrics;
use crate::pool::{ConnectProgress, ConnectionPool, Lease, PoolError};
use crate::proxy::readiness::{Ready, Readiness};

/// Steps run per notification before the context yields to other connections.
pub const MAX_LOOP_ITERATIONS: usize = 64;

/// Lifecycle phase of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    AcceptingRequest,
    SelectingUpstream,
    ForwardingRequest,
    AwaitingResponse,
    ReturningResponse,
    Complete,
    /// Terminal. Sockets are closed and the lease is back in the pool.
    Closing,
}

/// Which socket of a context a token refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Downstream,
    Upstream,
}

/// Token of the downstream socket of the context stored at `key`.
pub fn downstream_token(key: usize) -> Token {
    Token(2 * key + 1)
}

pub fn upstream_token(key: usize) -> Token {
    Token(2 * key + 2)
}

/// Inverse of the token scheme. Token 0 belongs to no context.
pub fn token_owner(token: Token) -> Option<(usize, Side)> {
    match token.0 {
        0 => None,
        t if t % 2 == 1 => Some(((t - 1) / 2, Side::Downstream)),
        t => Some(((t - 2) / 2, Side::Upstream)),
    }
}

/// Limits and timeouts applied to every context.
#[derive(Debug, Clone)]
pub struct ContextSettings {
    pub read_buffer_size: usize,
    pub max_header_size: usize,
    pub max_buffered_bytes: usize,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub keep_alive_timeout: Duration,
    /// Extra selections after an upstream connect failure.
    pub max_retries: u32,
    pub healthy_threshold: usize,
    pub unhealthy_threshold: usize,
}

impl ContextSettings {
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            read_buffer_size: config.http.read_buffer_size.max(1),
            max_header_size: config.http.max_header_size,
            max_buffered_bytes: config.http.max_buffered_bytes,
            connect_timeout: config.timeouts.connect(),
            idle_timeout: config.timeouts.idle(),
            keep_alive_timeout: config.timeouts.keep_alive(),
            max_retries: config.retries.max_attempts,
            healthy_threshold: config.health_check.healthy_threshold.max(1) as usize,
            unhealthy_threshold: config.health_check.unhealthy_threshold.max(1) as usize,
        }
    }
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self::from_config(&ProxyConfig::default())
    }
}

/// Shared collaborators every context works with.
#[derive(Debug, Clone)]
pub struct Env {
    pub balancer: Arc<BackendManager>,
    pub pool: Arc<ConnectionPool>,
    pub settings: ContextSettings,
}

/// What the event loop should do with a context after driving it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextStatus {
    /// Waiting for the next readiness notification.
    Waiting,
    /// Iteration budget exhausted with work left; drive again soon.
    Busy,
    /// Closed; remove it from the dispatch table.
    Closed,
}

enum Step {
    Continue,
    Yield,
    Close,
}

/// How an upstream lease goes back to the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Reuse,
    Discard,
    Unhealthy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Deadline {
    Idle,
    KeepAlive,
    Connect,
}

/// Outgoing bytes with a write cursor.
#[derive(Debug, Default)]
struct OutBuf {
    data: Vec<u8>,
    pos: usize,
}

impl OutBuf {
    fn pending(&self) -> &[u8] {
        &self.data[self.pos..]
    }

    fn len(&self) -> usize {
        self.data.len() - self.pos
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn advance(&mut self, n: usize) {
        self.pos = (self.pos + n).min(self.data.len());
        if self.pos == self.data.len() {
            self.clear();
        }
    }

    fn clear(&mut self) {
        self.data.clear();
        self.pos = 0;
    }

    /// Appendable buffer, with already written bytes dropped.
    fn buf(&mut self) -> &mut Vec<u8> {
        if self.pos > 0 {
            self.data.drain(..self.pos);
            self.pos = 0;
        }
        &mut self.data
    }
}

/// State of the request/response pair in flight. Reset between requests.
#[derive(Debug, Default)]
struct Exchange {
    request: Option<RequestHead>,
    request_framing: Option<BodyFraming>,
    request_body: Option<BodyTransfer>,
    client_keep_alive: bool,
    client_minor: u8,
    is_head: bool,
    status: Option<u16>,
    response_body: Option<BodyTransfer>,
    /// Bytes of a response, real or generated, were queued downstream.
    response_started: bool,
    /// Some of the request reached the current lease.
    request_sent: bool,
    /// The current lease returned at least one byte.
    upstream_replied: bool,
    /// Downstream persistence decided for this exchange.
    keep_alive: bool,
    upstream_reusable: bool,
    answer: Option<DefaultAnswer>,
    attempts: u32,
    excluded: Vec<SocketAddr>,
    started: Option<Instant>,
}

impl Exchange {
    fn request_body_done(&self) -> bool {
        self.request_body.as_ref().map_or(true, BodyTransfer::is_done)
    }

    fn response_body_done(&self) -> bool {
        self.response_body.as_ref().map_or(true, BodyTransfer::is_done)
    }
}

/// One downstream connection and everything it holds.
pub struct ConnectionContext {
    id: ConnectionId,
    key: usize,
    client: SocketAddr,
    downstream: Box<dyn SocketHandler>,
    down: Readiness,
    upstream: Option<Lease>,
    up: Readiness,
    phase: Phase,
    down_in: Vec<u8>,
    up_in: Vec<u8>,
    to_upstream: OutBuf,
    to_downstream: OutBuf,
    exchange: Exchange,
    requests: usize,
    last_activity: Instant,
}

impl std::fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("id", &self.id)
            .field("client", &self.client)
            .field("phase", &self.phase)
            .field("down", &self.down)
            .field("up", &self.up)
            .field("upstream", &self.upstream.as_ref().map(Lease::id))
            .field("requests", &self.requests)
            .finish()
    }
}

impl ConnectionContext {
    pub fn new(key: usize, downstream: Box<dyn SocketHandler>, client: SocketAddr, now: Instant) -> Self {
        Self {
            id: ConnectionId::new(),
            key,
            client,
            downstream,
            down: Readiness::new(),
            upstream: None,
            up: Readiness::new(),
            phase: Phase::AcceptingRequest,
            down_in: Vec::new(),
            up_in: Vec::new(),
            to_upstream: OutBuf::default(),
            to_downstream: OutBuf::default(),
            exchange: Exchange::default(),
            requests: 0,
            last_activity: now,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn client(&self) -> SocketAddr {
        self.client
    }

    /// Completed exchanges on this connection.
    pub fn requests_served(&self) -> usize {
        self.requests
    }

    /// Pool entry currently leased by this connection.
    pub fn upstream_entry(&self) -> Option<u64> {
        self.upstream.as_ref().map(Lease::id)
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Register the downstream socket under this context's token.
    pub fn register(&mut self, registry: &Registry) -> io::Result<()> {
        registry.register(
            self.downstream.stream(),
            downstream_token(self.key),
            Interest::READABLE | Interest::WRITABLE,
        )
    }

    /// Record a readiness notification for one of the context's sockets.
    pub fn on_event(&mut self, side: Side, ready: Ready) {
        match side {
            Side::Downstream => self.down.record(ready),
            Side::Upstream if self.upstream.is_some() => self.up.record(ready),
            // stale event for a lease already released
            Side::Upstream => {}
        }
    }

    /// Run the step loop until nothing can progress.
    pub fn drive(&mut self, registry: &Registry, env: &Env, now: Instant) -> ContextStatus {
        if self.phase == Phase::Closing {
            return ContextStatus::Closed;
        }
        for _ in 0..MAX_LOOP_ITERATIONS {
            self.update_interest(env);
            let step = match self.phase {
                Phase::AcceptingRequest => self.accepting_request(registry, env, now),
                Phase::SelectingUpstream => self.selecting_upstream(registry, env, now),
                Phase::ForwardingRequest => self.forwarding_request(registry, env, now),
                Phase::AwaitingResponse => self.awaiting_response(registry, env, now),
                Phase::ReturningResponse => self.returning_response(registry, env, now),
                Phase::Complete => self.complete(registry, env, now),
                Phase::Closing => Step::Close,
            };
            match step {
                Step::Continue => {}
                Step::Yield => return ContextStatus::Waiting,
                Step::Close => {
                    self.close(registry, env);
                    return ContextStatus::Closed;
                }
            }
        }
        tracing::trace!(conn = %self.id, phase = ?self.phase, "Iteration budget exhausted, yielding");
        ContextStatus::Busy
    }

    /// Enforce the deadline of the current phase.
    pub fn on_timeout(&mut self, registry: &Registry, env: &Env, now: Instant) -> ContextStatus {
        if self.phase == Phase::Closing {
            return ContextStatus::Closed;
        }
        let settings = &env.settings;
        let deadline = match self.phase {
            Phase::AcceptingRequest if self.requests > 0 && self.down_in.is_empty() => Deadline::KeepAlive,
            Phase::ForwardingRequest if self.upstream.as_ref().is_some_and(Lease::is_fresh) => Deadline::Connect,
            _ => Deadline::Idle,
        };
        let limit = match deadline {
            Deadline::Idle => settings.idle_timeout,
            Deadline::KeepAlive => settings.keep_alive_timeout,
            Deadline::Connect => settings.connect_timeout,
        };
        if now.saturating_duration_since(self.last_activity) < limit {
            return ContextStatus::Waiting;
        }

        tracing::debug!(conn = %self.id, phase = ?self.phase, deadline = ?deadline, "Connection timed out");
        match (self.phase, deadline) {
            (Phase::ForwardingRequest, Deadline::Connect) => {
                let target = self.upstream.as_ref().map(Lease::target);
                self.release_upstream(registry, env, Disposition::Unhealthy);
                if let Some(target) = target {
                    if self.retry(target, env) {
                        self.touch(now);
                        return self.drive(registry, env, now);
                    }
                }
                self.exchange.client_keep_alive = false;
                self.answer(registry, env, DefaultAnswer::GatewayTimeout);
                self.flush_best_effort();
            }
            (Phase::AwaitingResponse, _) => {
                self.release_upstream(registry, env, Disposition::Unhealthy);
                self.exchange.client_keep_alive = false;
                self.answer(registry, env, DefaultAnswer::GatewayTimeout);
                self.flush_best_effort();
            }
            _ => {}
        }
        self.close(registry, env);
        ContextStatus::Closed
    }

    /// Release the lease, deregister and close the downstream socket.
    pub fn close(&mut self, registry: &Registry, env: &Env) {
        if self.phase == Phase::Closing {
            return;
        }
        let disposition = match &self.upstream {
            Some(lease) if lease.is_reusable() => Disposition::Reuse,
            _ => Disposition::Discard,
        };
        self.release_upstream(registry, env, disposition);
        if let Err(e) = registry.deregister(self.downstream.stream()) {
            tracing::trace!(conn = %self.id, error = %e, "Deregister failed");
        }
        self.downstream.close();
        self.phase = Phase::Closing;
        tracing::debug!(conn = %self.id, client = %self.client, requests = self.requests, "Connection closed");
    }

    fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    fn update_interest(&mut self, env: &Env) {
        let room = |buf: &OutBuf| buf.len() < env.settings.max_buffered_bytes;
        let flush = if self.downstream.has_pending_output() {
            Ready::WRITABLE
        } else {
            Ready::EMPTY
        };
        let (down, up) = match self.phase {
            Phase::AcceptingRequest => (
                Ready::READABLE | flush,
                if self.upstream.is_some() { Ready::READABLE } else { Ready::EMPTY },
            ),
            Phase::ForwardingRequest => {
                let body = if !self.exchange.request_body_done() && room(&self.to_upstream) {
                    Ready::READABLE
                } else {
                    Ready::EMPTY
                };
                let interim = if self.to_downstream.is_empty() { flush } else { Ready::WRITABLE };
                // a connected target may answer before the body is sent
                let up = match &self.upstream {
                    Some(lease) if !lease.is_fresh() => Ready::READABLE | Ready::WRITABLE,
                    _ => Ready::WRITABLE,
                };
                (body | interim, up)
            }
            Phase::AwaitingResponse => (
                if self.to_downstream.is_empty() { flush } else { Ready::WRITABLE },
                Ready::READABLE,
            ),
            Phase::ReturningResponse => (
                if self.to_downstream.is_empty() { flush } else { Ready::WRITABLE },
                if !self.exchange.response_body_done() && room(&self.to_downstream) {
                    Ready::READABLE
                } else {
                    Ready::EMPTY
                },
            ),
            Phase::SelectingUpstream | Phase::Complete | Phase::Closing => (flush, Ready::EMPTY),
        };
        self.down.interest = down;
        self.up.interest = up;
    }

    // --- phases ---

    fn accepting_request(&mut self, registry: &Registry, env: &Env, now: Instant) -> Step {
        if self.upstream.is_some() && self.up.can(Ready::READABLE) {
            return self.check_idle_upstream(registry, env);
        }

        if !self.down_in.is_empty() {
            match parse_request(&self.down_in, env.settings.max_header_size) {
                Ok(Parsed::Complete(head)) => return self.begin_exchange(registry, env, head, now),
                Ok(Parsed::Partial) => {}
                Err(err) => return self.reject(registry, env, err),
            }
        }

        if self.down.can(Ready::WRITABLE) {
            return self.write_downstream(now);
        }
        if !self.down.can(Ready::READABLE) {
            return Step::Yield;
        }
        match self.read_downstream(env, now) {
            SocketResult::Data(_) | SocketResult::WouldBlock => Step::Continue,
            SocketResult::Closed(reason) => {
                if self.down_in.is_empty() {
                    tracing::trace!(conn = %self.id, reason = %reason, "Client closed idle connection");
                } else {
                    tracing::debug!(conn = %self.id, reason = %reason, "Client closed mid-request");
                }
                Step::Close
            }
        }
    }

    /// A retained upstream connection has nothing to say between exchanges.
    fn check_idle_upstream(&mut self, registry: &Registry, env: &Env) -> Step {
        let Some(lease) = self.upstream.as_mut() else {
            return Step::Continue;
        };
        let mut byte = [0u8; 1];
        match lease.try_read(&mut byte) {
            SocketResult::WouldBlock => self.up.blocked(Ready::READABLE),
            SocketResult::Data(_) | SocketResult::Closed(_) => {
                tracing::debug!(conn = %self.id, entry = lease.id(), "Retained upstream connection went away while idle");
                self.release_upstream(registry, env, Disposition::Discard);
            }
        }
        Step::Continue
    }

    fn begin_exchange(&mut self, registry: &Registry, env: &Env, head: RequestHead, now: Instant) -> Step {
        self.down_in.drain(..head.head_len);
        self.exchange = Exchange {
            client_keep_alive: head.keep_alive(),
            client_minor: head.minor_version,
            is_head: head.is_head(),
            started: Some(now),
            ..Exchange::default()
        };

        let framing = match head.framing() {
            Ok(framing) => framing,
            Err(err) => return self.reject(registry, env, err),
        };
        let output = match framing {
            BodyFraming::Chunked => OutputFraming::Chunked,
            _ => OutputFraming::Identity,
        };

        tracing::debug!(
            conn = %self.id,
            method = %head.method,
            target = %head.target,
            version = head.minor_version,
            "Request received"
        );
        self.exchange.request_framing = Some(framing);
        self.exchange.request_body = Some(BodyTransfer::new(framing, output));
        self.exchange.request = Some(head);
        self.touch(now);
        self.phase = Phase::SelectingUpstream;
        Step::Continue
    }

    fn selecting_upstream(&mut self, registry: &Registry, env: &Env, now: Instant) -> Step {
        if let Some(lease) = self.upstream.as_mut() {
            if lease.probe() {
                tracing::trace!(conn = %self.id, entry = lease.id(), "Reusing retained upstream connection");
                lease.set_reusable(false);
                return self.start_forwarding(now);
            }
            self.release_upstream(registry, env, Disposition::Discard);
        }

        let selected = {
            let ctx = SelectionContext::new(self.client.ip()).excluding(&self.exchange.excluded);
            env.balancer.select(&ctx)
        };
        let backend = match selected {
            Ok(backend) => backend,
            Err(SelectError::NoUpstream) => {
                tracing::warn!(conn = %self.id, attempts = self.exchange.attempts, "No eligible upstream");
                return self.answer(registry, env, DefaultAnswer::BadGateway);
            }
        };

        match env.pool.acquire(&backend) {
            Ok(mut lease) => {
                if let Err(e) = registry.register(
                    lease.stream(),
                    upstream_token(self.key),
                    Interest::READABLE | Interest::WRITABLE,
                ) {
                    tracing::warn!(conn = %self.id, backend = %backend.addr, error = %e, "Failed to register upstream socket");
                    env.pool.release(lease, false);
                    return self.retry_or_answer(registry, env, backend.addr, DefaultAnswer::BadGateway);
                }
                self.up.reset();
                self.upstream = Some(lease);
                self.touch(now);
                self.start_forwarding(now)
            }
            Err(PoolError::Saturated(addr)) => {
                tracing::debug!(conn = %self.id, backend = %addr, "Backend at connection limit");
                self.answer(registry, env, DefaultAnswer::ServiceUnavailable)
            }
            Err(PoolError::Connect { addr, source }) => {
                tracing::warn!(conn = %self.id, backend = %addr, error = %source, "Upstream connect failed");
                if backend.mark_failure(env.settings.unhealthy_threshold) {
                    tracing::warn!(backend = %addr, "Backend marked unhealthy");
                }
                metrics::record_backend_health(&addr.to_string(), backend.is_healthy());
                self.retry_or_answer(registry, env, addr, DefaultAnswer::BadGateway)
            }
        }
    }

    /// Queue the rewritten request head for the leased target.
    fn start_forwarding(&mut self, now: Instant) -> Step {
        let (Some(lease), Some(head), Some(framing)) = (
            self.upstream.as_ref(),
            self.exchange.request.as_ref(),
            self.exchange.request_framing,
        ) else {
            return Step::Close;
        };
        self.to_upstream.clear();
        self.exchange.request_sent = false;
        self.exchange.upstream_replied = false;
        head.encode_upstream(framing, self.client.ip(), lease.target(), self.to_upstream.buf());
        tracing::trace!(conn = %self.id, backend = %lease.target(), entry = lease.id(), "Forwarding request");
        self.touch(now);
        self.phase = Phase::ForwardingRequest;
        Step::Continue
    }

    fn forwarding_request(&mut self, registry: &Registry, env: &Env, now: Instant) -> Step {
        let Some(lease) = self.upstream.as_mut() else {
            return self.answer(registry, env, DefaultAnswer::BadGateway);
        };

        if lease.is_fresh() {
            if !self.up.can(Ready::WRITABLE) {
                return Step::Yield;
            }
            return match lease.connect_progress() {
                ConnectProgress::Connected => {
                    tracing::trace!(conn = %self.id, backend = %lease.target(), "Upstream connected");
                    self.touch(now);
                    Step::Continue
                }
                ConnectProgress::Pending => {
                    self.up.blocked(Ready::WRITABLE);
                    Step::Continue
                }
                ConnectProgress::Failed(e) => {
                    let target = lease.target();
                    tracing::warn!(conn = %self.id, backend = %target, error = %e, "Upstream connect failed");
                    self.release_upstream(registry, env, Disposition::Unhealthy);
                    self.retry_or_answer(registry, env, target, DefaultAnswer::BadGateway)
                }
            };
        }

        if !self.up_in.is_empty() {
            match parse_response(&self.up_in, env.settings.max_header_size) {
                Ok(Parsed::Complete(head)) => return self.begin_response(registry, env, head),
                Ok(Parsed::Partial) => {}
                Err(err) => return self.invalid_response_head(registry, env, err),
            }
        }

        if !self.to_upstream.is_empty() && self.up.can(Ready::WRITABLE) {
            let Some(lease) = self.upstream.as_mut() else {
                return Step::Close;
            };
            return match lease.try_write(self.to_upstream.pending()) {
                SocketResult::Data(n) => {
                    self.to_upstream.advance(n);
                    if n > 0 {
                        self.exchange.request_sent = true;
                        self.touch(now);
                    }
                    Step::Continue
                }
                SocketResult::WouldBlock => {
                    self.up.blocked(Ready::WRITABLE);
                    Step::Continue
                }
                SocketResult::Closed(reason) => self.upstream_failed(registry, env, reason),
            };
        }

        if !self.exchange.request_body_done() && self.to_upstream.len() < env.settings.max_buffered_bytes {
            if !self.down_in.is_empty() {
                if let Some(body) = self.exchange.request_body.as_mut() {
                    match body.pump(&self.down_in, self.to_upstream.buf()) {
                        Ok(0) => {}
                        Ok(consumed) => {
                            self.down_in.drain(..consumed);
                            return Step::Continue;
                        }
                        Err(err) => return self.reject(registry, env, err),
                    }
                }
            }
            if self.down.can(Ready::READABLE) {
                return match self.read_downstream(env, now) {
                    SocketResult::Data(_) | SocketResult::WouldBlock => Step::Continue,
                    SocketResult::Closed(reason) => {
                        tracing::debug!(conn = %self.id, reason = %reason, "Client closed during request body");
                        Step::Close
                    }
                };
            }
        }

        if self.down.can(Ready::WRITABLE) {
            return self.write_downstream(now);
        }
        if self.exchange.request_body_done() && self.to_upstream.is_empty() {
            self.phase = Phase::AwaitingResponse;
            return Step::Continue;
        }
        if self.up.can(Ready::READABLE) {
            return match self.read_upstream(env, now) {
                SocketResult::Data(_) | SocketResult::WouldBlock => Step::Continue,
                SocketResult::Closed(reason) => self.upstream_failed(registry, env, reason),
            };
        }
        Step::Yield
    }

    fn awaiting_response(&mut self, registry: &Registry, env: &Env, now: Instant) -> Step {
        if !self.up_in.is_empty() {
            match parse_response(&self.up_in, env.settings.max_header_size) {
                Ok(Parsed::Complete(head)) => return self.begin_response(registry, env, head),
                Ok(Parsed::Partial) => {}
                Err(err) => return self.invalid_response_head(registry, env, err),
            }
        }

        if self.down.can(Ready::WRITABLE) {
            return self.write_downstream(now);
        }
        if !self.up.can(Ready::READABLE) {
            return Step::Yield;
        }
        match self.read_upstream(env, now) {
            SocketResult::Data(_) | SocketResult::WouldBlock => Step::Continue,
            SocketResult::Closed(reason) => self.upstream_failed(registry, env, reason),
        }
    }

    fn begin_response(&mut self, registry: &Registry, env: &Env, head: ResponseHead) -> Step {
        self.up_in.drain(..head.head_len);

        if head.is_interim() {
            if self.exchange.client_minor >= 1 {
                tracing::trace!(conn = %self.id, status = head.status, "Relaying interim response");
                head.encode_interim(self.to_downstream.buf());
            } else {
                tracing::trace!(conn = %self.id, status = head.status, "Dropping interim response for HTTP/1.0 client");
            }
            return Step::Continue;
        }
        if head.is_upgrade() {
            tracing::debug!(conn = %self.id, "Upstream switched protocols, refusing");
            self.release_upstream(registry, env, Disposition::Discard);
            return self.answer(registry, env, DefaultAnswer::BadGateway);
        }
        let framing = match head.framing(self.exchange.is_head) {
            Ok(framing) => framing,
            Err(err) => {
                tracing::warn!(conn = %self.id, error = %err, "Invalid response framing from upstream");
                self.release_upstream(registry, env, Disposition::Unhealthy);
                return self.answer(registry, env, DefaultAnswer::BadGateway);
            }
        };

        // HTTP/1.0 clients never see chunked encoding
        let dechunk = framing == BodyFraming::Chunked && self.exchange.client_minor == 0;
        let output = if framing == BodyFraming::Chunked && !dechunk {
            OutputFraming::Chunked
        } else {
            OutputFraming::Identity
        };
        // a final answer may arrive before the request body was read or sent
        let request_done = self.exchange.request_body_done();
        let keep_alive = self.exchange.client_keep_alive && !framing.is_close_delimited() && !dechunk && request_done;

        self.exchange.upstream_reusable =
            head.keep_alive() && !framing.is_close_delimited() && request_done && self.to_upstream.is_empty();
        self.exchange.keep_alive = keep_alive;
        self.exchange.status = Some(head.status);
        self.exchange.response_body = Some(BodyTransfer::new(framing, output));
        self.exchange.response_started = true;
        head.encode_downstream(framing, output, keep_alive, self.to_downstream.buf());

        tracing::trace!(conn = %self.id, status = head.status, framing = ?framing, keep_alive, "Response head received");
        self.phase = Phase::ReturningResponse;
        Step::Continue
    }

    fn returning_response(&mut self, registry: &Registry, env: &Env, now: Instant) -> Step {
        if self.down.can(Ready::WRITABLE) {
            return self.write_downstream(now);
        }

        if !self.exchange.response_body_done() && self.to_downstream.len() < env.settings.max_buffered_bytes {
            if !self.up_in.is_empty() {
                if let Some(body) = self.exchange.response_body.as_mut() {
                    match body.pump(&self.up_in, self.to_downstream.buf()) {
                        Ok(0) => {}
                        Ok(consumed) => {
                            self.up_in.drain(..consumed);
                            return Step::Continue;
                        }
                        Err(err) => {
                            tracing::warn!(conn = %self.id, error = %err, "Invalid response body from upstream");
                            self.release_upstream(registry, env, Disposition::Unhealthy);
                            return Step::Close;
                        }
                    }
                }
            }
            if self.up.can(Ready::READABLE) {
                return match self.read_upstream(env, now) {
                    SocketResult::Data(_) | SocketResult::WouldBlock => Step::Continue,
                    SocketResult::Closed(reason) => {
                        let ended = self.exchange.response_body.as_mut().map(BodyTransfer::on_eof);
                        match ended {
                            Some(Ok(())) => {
                                // close-delimited body complete
                                self.release_upstream(registry, env, Disposition::Discard);
                                Step::Continue
                            }
                            _ => self.upstream_failed(registry, env, reason),
                        }
                    }
                };
            }
        }

        if self.exchange.response_body_done() && self.to_downstream.is_empty() && !self.downstream.has_pending_output() {
            self.phase = Phase::Complete;
            return Step::Continue;
        }
        Step::Yield
    }

    fn complete(&mut self, registry: &Registry, env: &Env, now: Instant) -> Step {
        let status = self.exchange.status.unwrap_or_default();
        metrics::record_response(status);
        self.requests += 1;

        if self.exchange.answer.is_none() {
            if let Some(lease) = self.upstream.as_mut() {
                lease.mark_healthy();
                let backend = lease.backend();
                if backend.mark_success(env.settings.healthy_threshold) {
                    tracing::info!(backend = %backend.addr, "Backend marked healthy");
                    metrics::record_backend_health(&backend.addr.to_string(), true);
                }
            }
        }
        tracing::debug!(
            conn = %self.id,
            status,
            keep_alive = self.exchange.keep_alive,
            elapsed_ms = self.exchange.started.map_or(0, |t| now.saturating_duration_since(t).as_millis() as u64),
            "Exchange complete"
        );

        let reusable = self.exchange.upstream_reusable && self.up_in.is_empty();
        if reusable && self.exchange.keep_alive {
            // kept for the next request on this connection
            if let Some(lease) = self.upstream.as_mut() {
                lease.set_reusable(true);
            }
        } else if reusable {
            self.release_upstream(registry, env, Disposition::Reuse);
        } else {
            self.release_upstream(registry, env, Disposition::Discard);
        }

        if !self.exchange.keep_alive {
            return Step::Close;
        }
        self.exchange = Exchange::default();
        self.to_upstream.clear();
        self.touch(now);
        self.phase = Phase::AcceptingRequest;
        Step::Continue
    }

    // --- failures and generated responses ---

    fn reject(&mut self, registry: &Registry, env: &Env, err: ParseError) -> Step {
        tracing::debug!(conn = %self.id, client = %self.client, error = %err, "Rejecting request");
        self.exchange.client_keep_alive = false;
        self.answer(registry, env, err.answer())
    }

    /// Queue a generated response, or close when a real one already started.
    fn answer(&mut self, registry: &Registry, env: &Env, answer: DefaultAnswer) -> Step {
        self.release_upstream(registry, env, Disposition::Discard);
        if self.exchange.response_started {
            return Step::Close;
        }
        let keep_alive =
            answer.allows_keep_alive() && self.exchange.client_keep_alive && self.exchange.request_body_done();

        // only complete interim heads can be queued here
        self.to_downstream.buf().extend_from_slice(&answer.render(keep_alive));
        self.exchange.answer = Some(answer);
        self.exchange.status = Some(answer.status());
        self.exchange.keep_alive = keep_alive;
        self.exchange.response_body = None;
        self.exchange.response_started = true;
        self.phase = Phase::ReturningResponse;
        Step::Continue
    }

    fn invalid_response_head(&mut self, registry: &Registry, env: &Env, err: ParseError) -> Step {
        tracing::warn!(conn = %self.id, error = %err, "Invalid response head from upstream");
        self.release_upstream(registry, env, Disposition::Unhealthy);
        self.answer(registry, env, DefaultAnswer::BadGateway)
    }

    /// Upstream closed or reset during an exchange.
    fn upstream_failed(&mut self, registry: &Registry, env: &Env, reason: CloseReason) -> Step {
        let stale = !self.exchange.upstream_replied && self.upstream.as_ref().is_some_and(Lease::is_reused);
        if stale {
            return self.stale_upstream(registry, env, reason);
        }
        tracing::warn!(
            conn = %self.id,
            backend = ?self.upstream.as_ref().map(Lease::target),
            phase = ?self.phase,
            reason = %reason,
            "Upstream connection failed"
        );
        self.release_upstream(registry, env, Disposition::Unhealthy);
        if self.exchange.response_started {
            Step::Close
        } else {
            self.answer(registry, env, DefaultAnswer::BadGateway)
        }
    }

    /// A reused connection was closed by its target before it answered.
    ///
    /// Keep-alive races are not a target failure. The request is replayed on
    /// another connection when none of its body was consumed and the target
    /// either saw nothing or the method is idempotent.
    fn stale_upstream(&mut self, registry: &Registry, env: &Env, reason: CloseReason) -> Step {
        tracing::debug!(
            conn = %self.id,
            backend = ?self.upstream.as_ref().map(Lease::target),
            reason = %reason,
            sent = self.exchange.request_sent,
            "Reused upstream connection closed before answering"
        );
        self.release_upstream(registry, env, Disposition::Discard);

        let bodiless = matches!(
            self.exchange.request_framing,
            Some(BodyFraming::None | BodyFraming::Length(0))
        );
        let idempotent = self.exchange.request.as_ref().is_some_and(RequestHead::is_idempotent);
        if bodiless && (!self.exchange.request_sent || idempotent) {
            self.to_upstream.clear();
            self.phase = Phase::SelectingUpstream;
            return Step::Continue;
        }
        self.answer(registry, env, DefaultAnswer::BadGateway)
    }

    /// Exclude `target` and go back to selection if attempts remain.
    fn retry(&mut self, target: SocketAddr, env: &Env) -> bool {
        self.exchange.excluded.push(target);
        self.exchange.attempts += 1;
        if self.exchange.attempts > env.settings.max_retries {
            return false;
        }
        tracing::debug!(conn = %self.id, failed = %target, attempt = self.exchange.attempts, "Retrying on another backend");
        self.to_upstream.clear();
        self.phase = Phase::SelectingUpstream;
        true
    }

    fn retry_or_answer(&mut self, registry: &Registry, env: &Env, target: SocketAddr, answer: DefaultAnswer) -> Step {
        if self.retry(target, env) {
            Step::Continue
        } else {
            self.answer(registry, env, answer)
        }
    }

    fn release_upstream(&mut self, registry: &Registry, env: &Env, disposition: Disposition) {
        let Some(mut lease) = self.upstream.take() else {
            return;
        };
        if let Err(e) = registry.deregister(lease.stream()) {
            tracing::trace!(conn = %self.id, error = %e, "Upstream deregister failed");
        }
        self.up.reset();
        self.up_in.clear();
        match disposition {
            Disposition::Reuse => {
                lease.set_reusable(true);
                env.pool.release(lease, true);
            }
            Disposition::Discard => {
                lease.set_reusable(false);
                env.pool.release(lease, true);
            }
            Disposition::Unhealthy => env.pool.release(lease, false),
        }
    }

    /// One unconditional write attempt before an abortive close.
    fn flush_best_effort(&mut self) {
        if let SocketResult::Data(n) = self.downstream.try_write(self.to_downstream.pending()) {
            self.to_downstream.advance(n);
        }
    }

    // --- I/O ---

    fn read_downstream(&mut self, env: &Env, now: Instant) -> SocketResult {
        let start = self.down_in.len();
        self.down_in.resize(start + env.settings.read_buffer_size, 0);
        let result = self.downstream.try_read(&mut self.down_in[start..]);
        let read = match result {
            SocketResult::Data(n) => n,
            _ => 0,
        };
        self.down_in.truncate(start + read);
        match result {
            SocketResult::Data(_) => self.touch(now),
            SocketResult::WouldBlock => self.down.blocked(Ready::READABLE),
            SocketResult::Closed(_) => {}
        }
        result
    }

    fn read_upstream(&mut self, env: &Env, now: Instant) -> SocketResult {
        let Some(lease) = self.upstream.as_mut() else {
            return SocketResult::Closed(CloseReason::Local);
        };
        let start = self.up_in.len();
        self.up_in.resize(start + env.settings.read_buffer_size, 0);
        let result = lease.try_read(&mut self.up_in[start..]);
        let read = match result {
            SocketResult::Data(n) => n,
            _ => 0,
        };
        self.up_in.truncate(start + read);
        match result {
            SocketResult::Data(_) => {
                self.exchange.upstream_replied = true;
                self.touch(now);
            }
            SocketResult::WouldBlock => self.up.blocked(Ready::READABLE),
            SocketResult::Closed(_) => {}
        }
        result
    }

    /// Write queued response bytes, or flush transport output when none are queued.
    fn write_downstream(&mut self, now: Instant) -> Step {
        match self.downstream.try_write(self.to_downstream.pending()) {
            SocketResult::Data(n) => {
                self.to_downstream.advance(n);
                if n > 0 {
                    self.touch(now);
                }
                if n == 0 && !self.downstream.has_pending_output() {
                    // nothing left to flush; drop write interest until more is queued
                    self.down.interest.remove(Ready::WRITABLE);
                }
                Step::Continue
            }
            SocketResult::WouldBlock => {
                self.down.blocked(Ready::WRITABLE);
                Step::Continue
            }
            SocketResult::Closed(reason) => {
                tracing::debug!(conn = %self.id, reason = %reason, phase = ?self.phase, "Client went away");
                Step::Close
            }
        }
    }
}
