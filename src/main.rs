// ------------------------------------------------------------
// Module declarations
// ------------------------------------------------------------
//
// Each module represents a well-defined responsibility:
//
// - config:     Configuration structs loaded from JSON
// - schema:     Strongly typed market message definitions
// - util:       Shared helper utilities (time, symbol handling, etc.)
// - errors:     Per-component error taxonomy
// - metrics:    Per-component runtime counters
// - exchanges:  Exchange adapters and adapter registry (C3)
// - upstream:   Upstream connection and stream multiplexer (C1/C2)
// - dataflow:   Data-flow manager, routing, circuit breaker (C4)
// - publisher:  Durable Redis-backed publisher channel (C5)
// - broadcast:  Broadcast WebSocket server (C6)
// - cache:      Subscriber cache (C7)
// - supervisor: Integration supervisor tying every component together (C8)
//
mod config;
mod schema;
mod util;
mod errors;
mod metrics;
mod exchanges;
mod upstream;
mod dataflow;
mod publisher;
mod broadcast;
mod cache;
mod supervisor;

// ------------------------------------------------------------
// External dependencies
// ------------------------------------------------------------

use rustls::crypto::{ring, CryptoProvider};

use config::Config;
use supervisor::Supervisor;

use std::fs;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

// ------------------------------------------------------------
// Application entry point
// ------------------------------------------------------------
//
// Responsibilities:
// - Initialize cryptography backend (rustls) and logging
// - Load and validate configuration
// - Build and run the integration supervisor
// - Shut down gracefully on SIGINT/SIGTERM, immediately on a second signal
//
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    // --------------------------------------------------------
    // IMPORTANT:
    // rustls >= 0.23 requires an explicit CryptoProvider
    // installation. This must be executed exactly once and
    // as early as possible in the process lifecycle.
    //
    // Using the `ring` provider for performance and stability.
    // --------------------------------------------------------
    CryptoProvider::install_default(ring::default_provider()).expect("failed to install rustls CryptoProvider");

    // --------------------------------------------------------
    // Load configuration from disk.
    //
    // NOTE: this crate never merges config files or environment
    // layers itself (that's external, per the Non-goals) — it only
    // deserializes the one recognized surface and validates it.
    // --------------------------------------------------------
    let config: Config = load_config("config.json")?;

    let supervisor = Supervisor::initialize(config).await?;
    supervisor.start().await?;
    log::info!("market data collector started");

    wait_for_shutdown_signal().await;
    log::info!("shutdown signal received, draining");

    supervisor.stop().await?;
    Ok(())
}

/// Waits for the first interrupt/terminate signal and returns to start a
/// graceful drain; a second signal received while draining exits the
/// process immediately rather than waiting on `stop()` to finish.
async fn wait_for_shutdown_signal() {
    first_signal().await;
    tokio::spawn(async {
        first_signal().await;
        log::warn!("second shutdown signal received, exiting immediately");
        std::process::exit(130);
    });
}

#[cfg(unix)]
async fn first_signal() {
    let mut terminate = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn first_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

// ------------------------------------------------------------
// Configuration loader
// ------------------------------------------------------------
//
// Reads a JSON configuration file from disk and deserializes
// it into the strongly typed `Config` structure. Validation
// happens once, inside `Supervisor::initialize`, before any I/O.
//
fn load_config(path: &str) -> anyhow::Result<Config> {
    let data = fs::read_to_string(path)?;
    let cfg = serde_json::from_str(&data)?;
    Ok(cfg)
}
