//! Single-threaded readiness loop.
//!
//! Owns the poller, the listeners and every connection context. Tokens map
//! back to contexts through the slab key (see `context::token_owner`);
//! listeners sit at the top of the token space and the waker at zero.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;

use crate::net::Listener;
use crate::observability::metrics;
use crate::proxy::context::{token_owner, ConnectionContext, ContextStatus, Env};
use crate::proxy::engine::Admission;
use crate::proxy::readiness::Ready;

pub const WAKER_TOKEN: Token = Token(0);

const EVENTS_CAPACITY: usize = 1024;
const MIN_SWEEP: Duration = Duration::from_millis(10);

fn listener_token(index: usize) -> Token {
    Token(usize::MAX - index)
}

/// Stops a running event loop from another thread.
#[derive(Debug, Clone)]
pub struct EventLoopHandle {
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl EventLoopHandle {
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Err(e) = self.waker.wake() {
            tracing::warn!(error = %e, "Failed to wake event loop");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

pub struct EventLoop {
    poll: Poll,
    events: Events,
    listeners: Vec<Listener>,
    contexts: Slab<ConnectionContext>,
    env: Env,
    admission: Admission,
    handle: EventLoopHandle,
    sweep_interval: Duration,
    last_sweep: Instant,
    /// Contexts that ran out of iterations and must be driven without an event.
    busy: Vec<usize>,
    ready: Vec<(Token, Ready)>,
}

impl EventLoop {
    pub(crate) fn new(
        mut listeners: Vec<Listener>,
        env: Env,
        admission: Admission,
        sweep_interval: Duration,
    ) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        for (index, listener) in listeners.iter_mut().enumerate() {
            poll.registry()
                .register(listener.source(), listener_token(index), Interest::READABLE)?;
        }

        Ok(Self {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            listeners,
            contexts: Slab::new(),
            env,
            admission,
            handle: EventLoopHandle {
                stop: Arc::new(AtomicBool::new(false)),
                waker,
            },
            sweep_interval: sweep_interval.max(MIN_SWEEP),
            last_sweep: Instant::now(),
            busy: Vec::new(),
            ready: Vec::with_capacity(EVENTS_CAPACITY),
        })
    }

    pub fn handle(&self) -> EventLoopHandle {
        self.handle.clone()
    }

    pub fn active_connections(&self) -> usize {
        self.contexts.len()
    }

    /// Poll and dispatch until stopped. Open connections are closed on exit.
    pub fn run(&mut self) -> io::Result<()> {
        tracing::info!(
            listeners = self.listeners.len(),
            sweep_ms = self.sweep_interval.as_millis() as u64,
            "Event loop started"
        );

        while !self.handle.is_stopped() {
            let timeout = if self.busy.is_empty() {
                self.sweep_interval
            } else {
                Duration::ZERO
            };
            if let Err(e) = self.poll.poll(&mut self.events, Some(timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                self.shutdown();
                return Err(e);
            }

            let now = Instant::now();
            let mut touched = std::mem::take(&mut self.busy);
            let mut ready = std::mem::take(&mut self.ready);
            ready.extend(self.events.iter().map(|event| (event.token(), Ready::from(event))));

            for &(token, readiness) in &ready {
                if token == WAKER_TOKEN {
                    continue;
                }
                if let Some(index) = self.listener_index(token) {
                    self.accept(index, now, &mut touched);
                    continue;
                }
                if let Some((key, side)) = token_owner(token) {
                    if let Some(context) = self.contexts.get_mut(key) {
                        context.on_event(side, readiness);
                        touched.push(key);
                    }
                }
            }
            ready.clear();
            self.ready = ready;

            touched.sort_unstable();
            touched.dedup();
            for key in touched {
                self.drive(key, now);
            }

            if now.saturating_duration_since(self.last_sweep) >= self.sweep_interval {
                self.sweep(now);
                self.last_sweep = now;
            }
        }

        self.shutdown();
        Ok(())
    }

    fn listener_index(&self, token: Token) -> Option<usize> {
        let index = usize::MAX - token.0;
        (index < self.listeners.len()).then_some(index)
    }

    /// Accept until the listener's queue is drained.
    fn accept(&mut self, index: usize, now: Instant, touched: &mut Vec<usize>) {
        loop {
            let (stream, peer) = match self.listeners[index].accept() {
                Ok(pair) => pair,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!(error = %e, listener = %self.listeners[index].local_addr(), "Accept failed");
                    return;
                }
            };

            let Some(socket) = self.admission.admit(stream, peer, self.contexts.len()) else {
                continue;
            };

            let entry = self.contexts.vacant_entry();
            let key = entry.key();
            let mut context = ConnectionContext::new(key, socket, peer, now);
            if let Err(e) = context.register(self.poll.registry()) {
                tracing::warn!(client = %peer, error = %e, "Failed to register connection");
                continue;
            }
            tracing::debug!(conn = %context.id(), client = %peer, "Connection accepted");
            entry.insert(context);
            touched.push(key);

            metrics::record_connection_accepted();
            metrics::set_active_connections(self.contexts.len());
        }
    }

    fn drive(&mut self, key: usize, now: Instant) {
        let Some(context) = self.contexts.get_mut(key) else {
            return;
        };
        match context.drive(self.poll.registry(), &self.env, now) {
            ContextStatus::Waiting => {}
            ContextStatus::Busy => self.busy.push(key),
            ContextStatus::Closed => self.remove(key),
        }
    }

    /// Apply phase deadlines to every context.
    fn sweep(&mut self, now: Instant) {
        let mut closed = Vec::new();
        for (key, context) in self.contexts.iter_mut() {
            match context.on_timeout(self.poll.registry(), &self.env, now) {
                ContextStatus::Waiting => {}
                ContextStatus::Busy => self.busy.push(key),
                ContextStatus::Closed => closed.push(key),
            }
        }
        if !closed.is_empty() {
            tracing::debug!(count = closed.len(), "Closed timed-out connections");
        }
        for key in closed {
            self.remove(key);
        }
    }

    fn remove(&mut self, key: usize) {
        if self.contexts.try_remove(key).is_some() {
            self.busy.retain(|&k| k != key);
            metrics::set_active_connections(self.contexts.len());
        }
    }

    fn shutdown(&mut self) {
        for listener in &mut self.listeners {
            if let Err(e) = self.poll.registry().deregister(listener.source()) {
                tracing::trace!(error = %e, "Listener deregister failed");
            }
        }
        let open = self.contexts.len();
        for (_, context) in self.contexts.iter_mut() {
            context.close(self.poll.registry(), &self.env);
        }
        self.contexts.clear();
        self.busy.clear();
        metrics::set_active_connections(0);
        tracing::info!(closed = open, "Event loop stopped");
    }
}
