//! TillSync device agent
//!
//! Runs next to the point-of-sale UI on each device and keeps the device's
//! local database in sync with the tenant's cloud store:
//! 1. Runs the startup handshake (migrations, restore from cloud)
//! 2. Pushes local changes after a quiet period
//! 3. Applies remote changes as they arrive over realtime channels
//! 4. Reconciles work deferred while the remote side was unreachable
//!
//! Usage:
//!   tillsync-agent --config tillsync.json
//!
//! The UI talks to the agent over a loopback HTTP API.

use anyhow::{Context, Result};
use clap::Parser;
use std::{path::PathBuf, sync::Arc};
use tillsync_agent::{AgentConfig, build_router};
use tillsync_model::TableRegistry;
use tillsync_storage::LocalStore;
use tillsync_sync::SyncEngine;
use tillsync_sync::realtime::WebSocketRealtime;
use tillsync_sync::remote::RestRemoteStore;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "tillsync-agent")]
#[command(about = "TillSync device sync agent")]
struct Args {
    /// Path to the JSON configuration file
    #[arg(short, long, default_value = "tillsync.json")]
    config: PathBuf,

    /// Local database file, overriding the configuration file
    #[arg(short, long)]
    database: Option<PathBuf>,

    /// HTTP API port, overriding the configuration file
    #[arg(long)]
    http_port: Option<u16>,

    /// Enable verbose debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let default_level = if args.verbose { "debug" } else { "info" };
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .compact()
        .init();

    info!("TillSync agent starting...");
    let mut config = if args.config.exists() {
        AgentConfig::load(&args.config)?
    } else {
        warn!("Config file {:?} not found, using defaults", args.config);
        AgentConfig::default()
    };
    if let Some(database) = args.database {
        config.database = database;
    }
    if let Some(port) = args.http_port {
        config.http_port = port;
    }

    let registry = Arc::new(TableRegistry::standard());
    let store = LocalStore::open(&config.database, registry)
        .with_context(|| format!("Failed to open database {:?}", config.database))?;
    let remote = RestRemoteStore::new(config.remote.clone())
        .context("Failed to create remote store client")?;

    let mut engine = SyncEngine::new(store, Arc::new(remote), config.sync.clone());
    match &config.realtime {
        Some(realtime) => {
            engine = engine.with_realtime(Arc::new(WebSocketRealtime::new(realtime.clone())));
        }
        None => info!("No realtime endpoint configured, live updates disabled"),
    }
    let engine = Arc::new(engine);

    let scheduler = engine.start_scheduler().await?;
    if let Some(report) = engine.start_session().await {
        info!(
            degraded = report.degraded,
            migrations = report.migrations_applied,
            "Session started"
        );
    }
    if let Some(user) = &config.user_id {
        match engine.verify_tenant_binding(user).await {
            Ok(check) => info!(tenant = %check.tenant(), "Tenant binding checked: {:?}", check),
            Err(e) => warn!("Tenant binding check failed: {}", e),
        }
    }
    engine.subscribe_all().await?;
    let watch = engine.start_connectivity_watch();

    let app = build_router(Arc::clone(&engine));
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", config.http_port))
        .await
        .with_context(|| format!("Failed to bind HTTP port {}", config.http_port))?;

    println!("\n========================================");
    println!("  TillSync Agent Running");
    println!("========================================");
    println!("  Database:  {}", config.database.display());
    println!("  Remote:    {}", config.remote.base_url);
    println!("  HTTP API:  http://127.0.0.1:{}/api/v1/status", config.http_port);
    println!("========================================\n");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    info!("Shutting down");
    engine.shutdown().await;
    if let Err(e) = scheduler.await {
        warn!("Scheduler task ended abnormally: {}", e);
    }
    if let Err(e) = watch.await {
        warn!("Connectivity watch ended abnormally: {}", e);
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
    }
}
