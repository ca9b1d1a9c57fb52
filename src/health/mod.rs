//! Health checking subsystem.
//!
//! # Data Flow
//! ```text
//! Passive (connection path):
//!     connect failure / reset / timeout → Backend::mark_failure
//!     completed exchange               → Backend::mark_success
//!
//! Active (active.rs, driven by the pool reaper):
//!     Periodic timer
//!     → TCP probe of each unhealthy backend
//!     → Backend::mark_success / mark_failure
//! ```
//!
//! # Design Decisions
//! - State transitions require consecutive successes/failures
//! - Unknown backends are eligible until proven otherwise
//! - Health state lives on the backend, not in the pool

pub mod active;

pub use active::HealthMonitor;
