//! Proxy core.
//!
//! # Data Flow
//! ```text
//! mio readiness event
//!     → event_loop.rs (token → context, accept, timeout sweep)
//!     → context.rs (phase step loop, one I/O attempt per step)
//!     → pool / load_balancer (upstream lease) and http (framing)
//! ```
//!
//! # Design Decisions
//! - One thread owns every socket; shared state is limited to the pool and balancer
//! - Readiness is tracked in userland so edge-triggered events are never lost
//! - Generated responses use the same write path as upstream ones

pub mod context;
pub mod engine;
pub mod event_loop;
pub mod readiness;

pub use context::{ConnectionContext, ContextSettings, ContextStatus, Env, Phase, MAX_LOOP_ITERATIONS};
pub use engine::{EngineError, ProxyEngine};
pub use event_loop::{EventLoop, EventLoopHandle};
pub use readiness::{Ready, Readiness};
