use axum::{
    extract::State,
    http::StatusCode,
    response::{sse::Event, Json, Sse},
};
use futures_util::stream::{self, Stream};
use std::convert::Infallible;
use taskdir_core::broadcast::Subscription;
use taskdir_core::watcher::types::StreamMessage;

use super::{api_error, ApiError};
use crate::state::AppState;

/// SSE endpoint: one `data:` frame per change message, heartbeats as comments.
/// The subscription is dropped, and so unregistered, when the client goes away.
pub async fn sse_events(
    State(state): State<AppState>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let subscription = state.broadcaster.subscribe().map_err(|e| {
        api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "taskdir.api.events",
            format!("Failed to start watcher: {}", e),
        )
    })?;

    let stream = stream::unfold(subscription, |mut subscription: Subscription| async move {
        let message = subscription.recv().await?;
        Some((Ok(to_sse_event(&message)), subscription))
    });

    Ok(Sse::new(stream))
}

fn to_sse_event(message: &StreamMessage) -> Event {
    match message.to_json() {
        Some(json) => Event::default().data(json),
        None => Event::default().comment("keep-alive"),
    }
}

pub async fn status(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "running",
        "port": state.port,
        "bindAddress": state.bind_address,
        "tasksDir": state.tasks_dir(),
        "subscribers": state.broadcaster.subscriber_count(),
    }))
}
