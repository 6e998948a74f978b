//! sonicfix-server - AI audio transformation job service
//!
//! Accepts audio uploads, runs enhancement and text-to-music jobs through
//! a bounded worker pool, and exposes job status and artifacts over HTTP.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use sonicfix_common::events::EventBus;
use sonicfix_server::config::ServerConfig;
use sonicfix_server::dispatch::{self, JobDispatcher};
use sonicfix_server::inference::LocalEngine;
use sonicfix_server::storage::ArtifactStore;
use sonicfix_server::{build_router, AppState};

#[derive(Debug, Parser)]
#[command(name = "sonicfix-server", about = "AI audio transformation job service")]
struct Cli {
    /// Root folder for database and artifact storage
    #[arg(long, env = "SONICFIX_ROOT")]
    root_folder: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("Starting sonicfix-server v{}", env!("CARGO_PKG_VERSION"));

    let cli = Cli::parse();

    // Step 1: Resolve and initialize the root folder
    let root_folder = sonicfix_common::config::resolve_root_folder(cli.root_folder.as_deref());
    sonicfix_common::config::ensure_root_folder(&root_folder)
        .map_err(|e| anyhow::anyhow!("Failed to initialize root folder: {}", e))?;
    info!("Root folder: {}", root_folder.display());

    // Step 2: Load configuration
    let mut config = ServerConfig::load();
    if let Some(port) = cli.port {
        config.port = port;
    }

    // Step 3: Open or create the database
    let db_path = sonicfix_common::config::database_path(&root_folder);
    info!("Database: {}", db_path.display());
    let db_pool = sonicfix_server::db::init_database_pool(&db_path).await?;
    info!("Database connection established");

    // Event bus for SSE broadcasting
    let event_bus = EventBus::new(256);

    // Step 4: Fail jobs orphaned by a previous run before accepting work
    let recovered =
        dispatch::recover_orphaned_jobs(&db_pool, &event_bus, config.orphan_staleness()).await?;
    if recovered > 0 {
        info!("Recovered {} orphaned job(s) from previous run", recovered);
    }

    // Step 5: Artifact store, engine, and dispatcher
    let store = ArtifactStore::new(root_folder.clone(), db_pool.clone());
    let engine = Arc::new(LocalEngine::new());

    let (dispatcher, queue_rx) = JobDispatcher::new(
        db_pool.clone(),
        store.clone(),
        engine,
        event_bus.clone(),
        config.dispatcher_config(),
    );
    dispatcher.spawn(queue_rx);

    // Step 6: Re-enqueue jobs accepted but not dispatched before shutdown
    let pending = sonicfix_server::db::jobs::list_pending_ids(&db_pool).await?;
    if !pending.is_empty() {
        info!("Re-enqueueing {} pending job(s)", pending.len());
        for job_id in pending {
            if let Err(e) = dispatcher.submit(job_id) {
                tracing::warn!(job_id = %job_id, error = %e, "Failed to re-enqueue pending job");
            }
        }
    }

    // Step 7: Build router and serve
    let state = AppState::new(
        db_pool,
        store,
        dispatcher,
        event_bus,
        Arc::new(config.clone()),
    );
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    info!("Listening on http://{}:{}", config.host, config.port);
    info!("Health check: http://{}:{}/health", config.host, config.port);

    axum::serve(listener, app).await?;

    Ok(())
}
