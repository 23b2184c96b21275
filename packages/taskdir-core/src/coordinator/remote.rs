use std::sync::Arc;

use async_trait::async_trait;

use crate::storage::{StorageError, TaskStorage};
use crate::types::{Board, CreateTaskInput, DeleteResult, MoveTaskInput, Task, UpdateTaskInput};

/// The store operations a coordinator needs, wherever the store lives.
#[async_trait]
pub trait TaskRemote: Send + Sync + 'static {
    async fn get_board(&self) -> Result<Board, RemoteError>;
    async fn create_task(&self, input: CreateTaskInput) -> Result<Task, RemoteError>;
    async fn update_task(&self, input: UpdateTaskInput) -> Result<Task, RemoteError>;
    async fn delete_task(&self, id: &str) -> Result<DeleteResult, RemoteError>;
    async fn move_task(&self, input: MoveTaskInput) -> Result<Task, RemoteError>;
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RemoteError {
    #[error("Task not found: {0}")]
    NotFound(String),

    #[error("Request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Transport error: {0}")]
    Transport(String),
}

impl From<StorageError> for RemoteError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound(id) => RemoteError::NotFound(id),
            StorageError::InvalidInput(message) => RemoteError::Rejected { status: 400, message },
            StorageError::Io(e) => RemoteError::Transport(e.to_string()),
        }
    }
}

/// In-process remote over any `TaskStorage`, for embedding the store and
/// the coordinator in the same process.
pub struct LocalRemote<S> {
    storage: Arc<S>,
}

impl<S> LocalRemote<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl<S: TaskStorage + 'static> TaskRemote for LocalRemote<S> {
    async fn get_board(&self) -> Result<Board, RemoteError> {
        Ok(self.storage.list()?)
    }

    async fn create_task(&self, input: CreateTaskInput) -> Result<Task, RemoteError> {
        Ok(self.storage.create(input)?)
    }

    async fn update_task(&self, input: UpdateTaskInput) -> Result<Task, RemoteError> {
        Ok(self.storage.update(input)?)
    }

    async fn delete_task(&self, id: &str) -> Result<DeleteResult, RemoteError> {
        Ok(self.storage.delete(id)?)
    }

    async fn move_task(&self, input: MoveTaskInput) -> Result<Task, RemoteError> {
        Ok(self.storage.move_task(&input.id, input.new_status, input.new_order)?)
    }
}
