//! rnsync server entry point.
//!
//! Loads configuration, opens the store, seeds users and serves the HTTP
//! surface until interrupted.

use std::net::SocketAddr;
use std::sync::Arc;

use rnsync::http::{router, AppState};
use rnsync::telemetry::init_tracing;
use rnsync::{
    ChangeBus, FileBackend, KvBackend, MemoryBackend, RecordService, RecordStore, Result,
    ServerConfig, SyncError,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServerConfig::load(std::env::args().skip(1))?;
    init_tracing(config.log_format)?;

    let backend: Arc<dyn KvBackend> = match config.store_config() {
        Some(store_config) => {
            tracing::info!(path = %store_config.path.display(), "opening file store");
            Arc::new(FileBackend::open_or_create(store_config)?)
        }
        None => {
            tracing::warn!("no data_dir configured, records will not survive a restart");
            Arc::new(MemoryBackend::new())
        }
    };

    let bus = Arc::new(ChangeBus::with_buffer_size(config.bus_buffer));
    let service = Arc::new(RecordService::new(RecordStore::new(backend), bus));
    for (username, user) in &config.users {
        service.seed_user(username, &user.display_name, user.permission())?;
    }
    tracing::info!(users = config.users.len(), "users seeded");

    let state = AppState::new(
        Arc::clone(&service),
        config.subscription_idle(),
        config.max_poll(),
    )
    .with_max_polls(config.max_polls);
    let reaper = Arc::clone(&state.subscriptions).spawn_reaper();
    let app = router(state, config.workers);

    let addr: SocketAddr = config
        .bind
        .parse()
        .map_err(|e| SyncError::Config(format!("invalid bind address {}: {}", config.bind, e)))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, workers = config.workers, "starting rnsync server");

    let server = axum::serve(listener, app);
    tokio::select! {
        result = server => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    reaper.abort();
    Ok(())
}
