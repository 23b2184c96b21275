/// taskdir backend: config loading, store and broadcaster setup, HTTP server.
pub mod api;
pub mod client;
pub mod config;
pub mod server;
pub mod state;

use crate::state::AppState;
use std::path::Path;
use std::sync::Arc;
use taskdir_core::broadcast::ChangeBroadcaster;
use taskdir_core::storage::local::TaskStore;

/// Composition root: one store and one broadcaster for the configured
/// directory, shared by every request. Runs until Ctrl-C.
pub async fn run(config_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let config = config::load_config(config_path);

    let store = Arc::new(TaskStore::open(&config.tasks_dir, config.columns.clone())?);
    log::info!(
        "[taskdir.startup] Serving tasks from {} ({} columns)",
        store.dir().display(),
        store.columns().len()
    );

    let broadcaster = Arc::new(ChangeBroadcaster::with_settings(
        store.dir(),
        config.watch_debounce(),
        config.heartbeat_interval(),
    ));

    let state = AppState {
        store,
        broadcaster,
        port: config.port,
        bind_address: config.bind_address.clone(),
    };
    server::spawn_server(state).await?;

    tokio::signal::ctrl_c().await?;
    log::info!("[taskdir.shutdown] Received Ctrl-C, exiting");
    Ok(())
}
