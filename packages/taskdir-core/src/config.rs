/// Shared configuration types used by the store and the backend.
use serde::{Deserialize, Serialize};

use crate::types::Status;

/// One board column: which status it holds and how it is labelled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnConfig {
    pub id: Status,
    pub title: String,
    #[serde(default)]
    pub color: Option<String>,
}

impl ColumnConfig {
    pub fn new(id: Status, title: &str) -> Self {
        Self {
            id,
            title: title.to_string(),
            color: None,
        }
    }
}

pub fn default_columns() -> Vec<ColumnConfig> {
    vec![
        ColumnConfig::new(Status::Todo, "To Do"),
        ColumnConfig::new(Status::InProgress, "In Progress"),
        ColumnConfig::new(Status::Done, "Done"),
    ]
}
