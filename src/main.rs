//! Event-driven HTTP/1.1 reverse proxy.
//!
//! # Architecture Overview
//!
//! ```text
//!                 ┌──────────────────────── event loop thread ────────────────────────┐
//!                 │                                                                    │
//!   Client ──────▶│  net::listener ─▶ net::tls ─▶ proxy::context ─▶ load_balancer     │
//!                 │                                   │     ▲            │              │
//!                 │                                   ▼     │            ▼              │
//!   Client ◀──────│                               http codec      pool (lease) ────────┼───▶ Backend
//!                 └────────────────────────────────────────────────────────────────────┘
//!
//!                 ┌──────────────────────── tokio runtime ────────────────────────────┐
//!                 │  signals → shutdown    pool reaper + health probes    metrics     │
//!                 └────────────────────────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

use event_proxy::config::{load_config, ProxyConfig};
use event_proxy::health::HealthMonitor;
use event_proxy::lifecycle::{wait_for_signal, Shutdown};
use event_proxy::load_balancer::Policy;
use event_proxy::observability::{init_logging, init_metrics};
use event_proxy::pool::PoolReaper;
use event_proxy::ProxyEngine;

#[derive(Parser, Debug)]
#[command(name = "event-proxy")]
#[command(about = "Event-driven HTTP/1.1 reverse proxy", version, long_about = None)]
struct Cli {
    /// TOML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the port of every bind address.
    #[arg(short, long)]
    port: Option<u16>,

    /// Override the load balancing policy.
    #[arg(long)]
    policy: Option<Policy>,

    /// Override the log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn apply(&self, config: &mut ProxyConfig) -> Result<(), String> {
        if let Some(port) = self.port {
            for raw in &mut config.listener.bind_addresses {
                let mut addr: SocketAddr = raw.parse().map_err(|_| format!("invalid bind address '{raw}'"))?;
                addr.set_port(port);
                *raw = addr.to_string();
            }
        }
        if let Some(policy) = self.policy {
            config.load_balancing.policy = policy;
        }
        if let Some(level) = &self.log_level {
            config.observability.log_level = level.clone();
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ProxyConfig::default(),
    };
    cli.apply(&mut config)?;

    init_logging(&config.observability)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), config = ?cli.config, "event-proxy starting");

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse::<SocketAddr>() {
            Ok(addr) => init_metrics(addr)?,
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let engine = ProxyEngine::bind(&config)?;
    let handle = engine.handle();
    let shutdown = Shutdown::new();

    let mut reaper = PoolReaper::new(engine.pool(), config.pool.sweep_interval());
    if config.health_check.enabled {
        reaper = reaper.with_health_monitor(HealthMonitor::new(engine.balancer(), config.health_check.clone()));
    }
    let reaper_task = tokio::spawn(reaper.run(shutdown.subscribe()));

    let mut engine_task = tokio::task::spawn_blocking(move || engine.run());

    tokio::select! {
        signal = wait_for_signal() => {
            let signal = signal?;
            tracing::info!(signal, "Shutdown requested");
        }
        result = &mut engine_task => {
            // the loop only returns on its own after a poll failure
            shutdown.trigger();
            result??;
            return Ok(());
        }
    }

    handle.stop();
    shutdown.trigger();
    engine_task.await??;
    if let Err(e) = reaper_task.await {
        tracing::warn!(error = %e, "Pool reaper task failed");
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_apply_to_config() {
        let cli = Cli::parse_from(["event-proxy", "--port", "9000", "--policy", "ip-hash", "--log-level", "debug"]);
        let mut config = ProxyConfig::default();
        config.listener.bind_addresses = vec!["0.0.0.0:8080".into(), "[::]:8080".into()];
        cli.apply(&mut config).unwrap();

        assert_eq!(config.listener.bind_addresses, vec!["0.0.0.0:9000", "[::]:9000"]);
        assert_eq!(config.load_balancing.policy, Policy::IpHash);
        assert_eq!(config.observability.log_level, "debug");
    }
}
