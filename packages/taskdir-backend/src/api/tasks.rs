use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use serde::Deserialize;
use taskdir_core::storage::TaskStorage;
use taskdir_core::types::{Board, CreateTaskInput, DeleteResult, Status, Task, UpdateTaskInput};

use super::{api_error, check_task_id, storage_error, ApiError};
use crate::state::AppState;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveTaskBody {
    new_status: Status,
    new_order: i64,
}

pub async fn get_board(State(state): State<AppState>) -> Result<Json<Board>, ApiError> {
    let board = state
        .store
        .list()
        .map_err(|e| storage_error("taskdir.api.get_board", e))?;
    Ok(Json(board))
}

pub async fn create_task(
    State(state): State<AppState>,
    Json(input): Json<CreateTaskInput>,
) -> Result<(StatusCode, Json<Task>), ApiError> {
    let task = state
        .store
        .create(input)
        .map_err(|e| storage_error("taskdir.api.create_task", e))?;
    Ok((StatusCode::CREATED, Json(task)))
}

pub async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<Task>, ApiError> {
    check_task_id("taskdir.api.get_task", &task_id)?;
    let task = state
        .store
        .get_by_id(&task_id)
        .map_err(|e| storage_error("taskdir.api.get_task", e))?;
    Ok(Json(task))
}

/// PATCH /tasks/{task_id} -- merge the provided fields; the id comes from the path.
pub async fn update_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    Json(mut input): Json<UpdateTaskInput>,
) -> Result<Json<Task>, ApiError> {
    check_task_id("taskdir.api.update_task", &task_id)?;
    input.id = task_id;
    let task = state
        .store
        .update(input)
        .map_err(|e| storage_error("taskdir.api.update_task", e))?;
    Ok(Json(task))
}

pub async fn delete_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<DeleteResult>, ApiError> {
    check_task_id("taskdir.api.delete_task", &task_id)?;
    let result = state
        .store
        .delete(&task_id)
        .map_err(|e| storage_error("taskdir.api.delete_task", e))?;
    Ok(Json(result))
}

pub async fn move_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    Json(body): Json<MoveTaskBody>,
) -> Result<Json<Task>, ApiError> {
    check_task_id("taskdir.api.move_task", &task_id)?;
    let task = state
        .store
        .move_task(&task_id, body.new_status, body.new_order)
        .map_err(|e| storage_error("taskdir.api.move_task", e))?;
    Ok(Json(task))
}

/// POST /columns/{status}/compact -- re-space orders, returns the column in order.
pub async fn compact_column(
    State(state): State<AppState>,
    Path(status): Path<String>,
) -> Result<Json<Vec<Task>>, ApiError> {
    let status: Status = status.parse().map_err(|e: String| {
        api_error(StatusCode::BAD_REQUEST, "taskdir.api.compact_column", e)
    })?;
    let tasks = state
        .store
        .compact_column(status)
        .map_err(|e| storage_error("taskdir.api.compact_column", e))?;
    Ok(Json(tasks))
}
