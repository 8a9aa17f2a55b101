// =============================================================================
// Meridian — Main Entry Point
// =============================================================================
//
// Single-node real-time metrics engine: producers feed samples into the
// chart registry, charts interpolate them into round-robin rings, and the
// HTTP API serves windowed aggregation queries over the rings.
//
// Exit codes: 0 clean shutdown, 1 startup misconfiguration, 2 listener
// fatal.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod ingest;
mod query;
mod rrd;
mod runtime_config;
mod stats;
mod storage_number;
mod types;

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::{router, ApiState};
use crate::rrd::ChartRegistry;
use crate::runtime_config::RuntimeConfig;
use crate::stats::EngineStats;

const CONFIG_ENV: &str = "MERIDIAN_CONFIG";
const BIND_ADDR_ENV: &str = "MERIDIAN_BIND_ADDR";
const HOSTNAME_ENV: &str = "MERIDIAN_HOSTNAME";
const PLUGINS_DIR_ENV: &str = "MERIDIAN_PLUGINS_DIR";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Meridian metrics engine starting up");

    let config_path =
        std::env::var(CONFIG_ENV).unwrap_or_else(|_| "meridian_config.json".to_string());

    let mut config = if std::path::Path::new(&config_path).exists() {
        match RuntimeConfig::load(&config_path) {
            Ok(c) => c,
            Err(e) => {
                // A present-but-broken config is a misconfiguration, not
                // something to silently paper over with defaults.
                error!(path = %config_path, error = %e, "cannot load configuration");
                std::process::exit(1);
            }
        }
    } else {
        warn!(path = %config_path, "no config file, using defaults");
        RuntimeConfig::default()
    };

    // Environment overrides.
    if let Ok(addr) = std::env::var(BIND_ADDR_ENV) {
        config.bind_address = addr;
    }
    if let Ok(hostname) = std::env::var(HOSTNAME_ENV) {
        config.hostname = hostname;
    }
    if let Ok(dir) = std::env::var(PLUGINS_DIR_ENV) {
        config.plugins_directory = dir.into();
    }
    config.clamp();

    let bind_addr: SocketAddr = match config.bind_address.parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!(addr = %config.bind_address, error = %e, "invalid bind address");
            std::process::exit(1);
        }
    };

    info!(
        hostname = %config.hostname,
        update_every = config.update_every,
        history = config.history,
        memory_mode = %config.memory_mode,
        database = %config.database_directory.display(),
        "engine configured"
    );

    // ── 2. Build shared state ────────────────────────────────────────────
    let config = Arc::new(config);
    let registry = Arc::new(ChartRegistry::new(config.clone()));
    let stats = Arc::new(EngineStats::new());

    // ── 3. Bind the listener before dropping privileges ──────────────────
    let listener = match tokio::net::TcpListener::bind(bind_addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(addr = %bind_addr, error = %e, "cannot bind listener");
            std::process::exit(2);
        }
    };
    info!(addr = %bind_addr, "API server listening");

    if let Err(e) = drop_privileges(&config) {
        error!(error = %e, "cannot drop privileges");
        std::process::exit(1);
    }

    // ── 4. Producers ─────────────────────────────────────────────────────
    if config.proc_collector {
        let reg = registry.clone();
        tokio::spawn(async move {
            ingest::proc_collector::run_collector(reg).await;
        });
    }

    {
        let reg = registry.clone();
        let st = stats.clone();
        tokio::spawn(async move {
            ingest::plugins::run_supervisor(reg, st).await;
        });
    }

    // ── 5. Periodic save ─────────────────────────────────────────────────
    if config.save_every > 0 && config.memory_mode.is_persistent() {
        let reg = registry.clone();
        let every = config.save_every;
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(every));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await; // first tick fires immediately
            loop {
                interval.tick().await;
                reg.save_all();
            }
        });
    }

    // ── 6. Serve the API ─────────────────────────────────────────────────
    let app = router(Arc::new(ApiState {
        registry: registry.clone(),
        config: config.clone(),
        stats,
    }));
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server failed");
            std::process::exit(2);
        }
    });

    info!("all subsystems running");

    // ── 7. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, saving and stopping");

    registry.free_all();

    info!("Meridian shut down complete");
    Ok(())
}

/// Switch to the configured unprivileged user when started as root.
fn drop_privileges(config: &RuntimeConfig) -> anyhow::Result<()> {
    let Some(username) = &config.run_as_user else {
        return Ok(());
    };
    if !nix::unistd::Uid::effective().is_root() {
        warn!(user = %username, "not running as root, cannot switch user");
        return Ok(());
    }

    let user = nix::unistd::User::from_name(username)?
        .ok_or_else(|| anyhow::anyhow!("user '{username}' not found"))?;
    nix::unistd::setgid(user.gid)?;
    nix::unistd::setuid(user.uid)?;
    info!(user = %username, "dropped privileges");
    Ok(())
}
