use axum::{
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Serialize;
use taskdir_core::storage::StorageError;

mod events;
mod tasks;

use crate::state::AppState;

/// Axum REST API routes.
///
///   GET    /board                       -> all columns with their tasks
///   POST   /tasks                       -> create a task
///   GET    /tasks/:id                   -> one task
///   PATCH  /tasks/:id                   -> partial update
///   DELETE /tasks/:id                   -> delete a task
///   POST   /tasks/:id/move              -> change status and order
///   POST   /columns/:status/compact     -> re-space a column's orders
///   GET    /events                      -> SSE stream of file changes
///   GET    /status                      -> health check
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/board", get(tasks::get_board))
        .route("/tasks", post(tasks::create_task))
        .route(
            "/tasks/{task_id}",
            get(tasks::get_task)
                .patch(tasks::update_task)
                .delete(tasks::delete_task),
        )
        .route("/tasks/{task_id}/move", post(tasks::move_task))
        .route("/columns/{status}/compact", post(tasks::compact_column))
        .route("/events", get(events::sse_events))
        .route("/status", get(events::status))
}

// ── Shared types and helpers used across sub-modules ────────────────────

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Check if a user-supplied path segment contains path traversal sequences.
/// Percent-decodes the input first, then checks the decoded string for:
/// "..", "/", "\", "./" prefix, and "/./" in path.
fn has_path_traversal(input: &str) -> bool {
    use percent_encoding::percent_decode_str;
    let decoded = percent_decode_str(input).decode_utf8_lossy();
    decoded.contains("..")
        || decoded.contains('/')
        || decoded.contains('\\')
        || decoded.starts_with("./")
        || decoded.contains("/./")
}

fn log_api_issue(status: StatusCode, target: &'static str, message: impl AsRef<str>) {
    let message = message.as_ref();
    if status.is_server_error() {
        log::error!(target: target, "{}", message);
    } else {
        log::warn!(target: target, "{}", message);
    }
}

fn api_error(status: StatusCode, target: &'static str, error: impl Into<String>) -> ApiError {
    let error = error.into();
    log_api_issue(status, target, &error);
    (status, Json(ErrorResponse { error }))
}

fn storage_error(target: &'static str, e: StorageError) -> ApiError {
    let status = match &e {
        StorageError::NotFound(_) => StatusCode::NOT_FOUND,
        StorageError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        StorageError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    api_error(status, target, e.to_string())
}

/// Reject ids that could escape the task directory before touching the store.
fn check_task_id(target: &'static str, id: &str) -> Result<(), ApiError> {
    if id.trim().is_empty() || has_path_traversal(id) {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            target,
            format!("Invalid task id: {}", id),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::spawn_server;
    use reqwest::{Method, StatusCode};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use taskdir_core::broadcast::ChangeBroadcaster;
    use taskdir_core::config::default_columns;
    use taskdir_core::storage::local::TaskStore;
    use tempfile::TempDir;

    async fn start(dir: &TempDir) -> String {
        let state = AppState {
            store: Arc::new(TaskStore::new(dir.path(), default_columns())),
            broadcaster: Arc::new(ChangeBroadcaster::new(dir.path())),
            port: 0,
            bind_address: "127.0.0.1".to_string(),
        };
        let port = spawn_server(state).await.unwrap();
        format!("http://127.0.0.1:{}", port)
    }

    async fn send(base: &str, method: Method, path: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut request = reqwest::Client::new().request(method, format!("{}{}", base, path));
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await.unwrap();
        let status = response.status();
        let text = response.text().await.unwrap();
        let value = if text.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap()
        };
        (status, value)
    }

    #[test]
    fn test_path_traversal_detection() {
        assert!(has_path_traversal("../etc"));
        assert!(has_path_traversal("%2e%2e"));
        assert!(has_path_traversal("a%2Fb"));
        assert!(!has_path_traversal("task-18c2f-a1b2c3"));
    }

    #[tokio::test]
    async fn test_task_lifecycle() {
        let dir = TempDir::new().unwrap();
        let base = start(&dir).await;

        let (status, created) = send(
            &base,
            Method::POST,
            "/tasks",
            Some(json!({"title": "Ship it", "labels": ["release"]})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = created["id"].as_str().unwrap().to_string();
        assert_eq!(created["status"], "todo");
        assert_eq!(created["priority"], "medium");

        let (status, fetched) = send(&base, Method::GET, &format!("/tasks/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["title"], "Ship it");

        let (status, updated) = send(
            &base,
            Method::PATCH,
            &format!("/tasks/{}", id),
            Some(json!({"title": "Ship it now", "assignee": "sam"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["id"], id.as_str());
        assert_eq!(updated["assignee"], "sam");

        let (status, moved) = send(
            &base,
            Method::POST,
            &format!("/tasks/{}/move", id),
            Some(json!({"newStatus": "done", "newOrder": 5})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(moved["status"], "done");
        assert_eq!(moved["order"], 5);

        let (status, board) = send(&base, Method::GET, "/board", None).await;
        assert_eq!(status, StatusCode::OK);
        let done = board["columns"]
            .as_array()
            .unwrap()
            .iter()
            .find(|c| c["id"] == "done")
            .unwrap();
        assert_eq!(done["tasks"][0]["id"], id.as_str());

        let (status, deleted) = send(&base, Method::DELETE, &format!("/tasks/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(deleted, json!({"success": true, "id": id}));

        let (status, missing) = send(&base, Method::GET, &format!("/tasks/{}", id), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(missing["error"].as_str().unwrap().contains(&id));
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let dir = TempDir::new().unwrap();
        let base = start(&dir).await;

        let (status, body) = send(&base, Method::POST, "/tasks", Some(json!({"title": "   "}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("title"));

        let (status, _) = send(
            &base,
            Method::POST,
            "/tasks/nope/move",
            Some(json!({"newStatus": "done", "newOrder": 1})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&base, Method::DELETE, "/tasks/a%2F..%2Fb", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&base, Method::POST, "/columns/someday/compact", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_compact_column() {
        let dir = TempDir::new().unwrap();
        let base = start(&dir).await;
        for title in ["a", "b"] {
            let (status, _) = send(&base, Method::POST, "/tasks", Some(json!({"title": title}))).await;
            assert_eq!(status, StatusCode::CREATED);
        }

        let (status, tasks) = send(&base, Method::POST, "/columns/todo/compact", None).await;
        assert_eq!(status, StatusCode::OK);
        let orders: Vec<i64> = tasks
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["order"].as_i64().unwrap())
            .collect();
        assert_eq!(orders, vec![0, 1000]);
    }

    #[tokio::test]
    async fn test_status_and_event_stream() {
        let dir = TempDir::new().unwrap();
        let base = start(&dir).await;

        let (status, body) = send(&base, Method::GET, "/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "running");
        assert_eq!(body["subscribers"], 0);

        let mut events = reqwest::Client::new()
            .get(format!("{}/events", base))
            .send()
            .await
            .unwrap();
        assert_eq!(events.status(), StatusCode::OK);
        let first = events.chunk().await.unwrap().unwrap();
        assert!(String::from_utf8_lossy(&first).contains(r#"data: {"type":"connected"}"#));

        let (_, body) = send(&base, Method::GET, "/status", None).await;
        assert_eq!(body["subscribers"], 1);
    }
}
