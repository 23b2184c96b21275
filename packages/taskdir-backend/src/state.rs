/// Shared application state passed to axum handlers.

use std::path::PathBuf;
use std::sync::Arc;
use taskdir_core::broadcast::ChangeBroadcaster;
use taskdir_core::storage::local::TaskStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<TaskStore>,
    pub broadcaster: Arc<ChangeBroadcaster>,
    pub port: u16,
    pub bind_address: String,
}

impl AppState {
    pub fn tasks_dir(&self) -> PathBuf {
        self.store.dir().to_path_buf()
    }
}
