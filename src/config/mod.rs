//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ProxyConfig (validated, immutable)
//!     → handed to the engine and background tasks at startup
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; the target list is static for the process lifetime
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use schema::{
    BackendConfig, HealthCheckConfig, HttpConfig, ListenerConfig, LoadBalancingConfig, LogFormat,
    ObservabilityConfig, PoolConfig, ProxyConfig, RetryConfig, TimeoutConfig, TlsConfig,
};
