pub mod local;

use crate::types::{Board, CreateTaskInput, DeleteResult, Status, Task, UpdateTaskInput};

/// Task repository operations over a storage backend.
/// Implementations: TaskStore (one file per task in a directory).
pub trait TaskStorage: Send + Sync {
    /// Load every task, grouped into the configured columns.
    fn list(&self) -> Result<Board, StorageError>;

    fn get_by_id(&self, id: &str) -> Result<Task, StorageError>;

    fn create(&self, input: CreateTaskInput) -> Result<Task, StorageError>;

    /// Merge `input` over the stored task and rewrite its file.
    fn update(&self, input: UpdateTaskInput) -> Result<Task, StorageError>;

    fn delete(&self, id: &str) -> Result<DeleteResult, StorageError>;

    /// Change only `status` and `order`. Siblings are not renumbered.
    fn move_task(&self, id: &str, new_status: Status, new_order: i64) -> Result<Task, StorageError> {
        let mut input = UpdateTaskInput::new(id);
        input.status = Some(new_status);
        input.order = Some(new_order);
        self.update(input)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Task not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
