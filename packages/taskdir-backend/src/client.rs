/// HTTP client for a running taskdir server.
///
/// `HttpRemote` lets a `MutationCoordinator` drive a remote store, and
/// `follow_events` feeds the server's change stream into that coordinator.
use async_trait::async_trait;
use futures_util::StreamExt;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use taskdir_core::coordinator::{MutationCoordinator, RemoteError, TaskRemote};
use taskdir_core::types::{Board, CreateTaskInput, DeleteResult, MoveTaskInput, Task, UpdateTaskInput};
use taskdir_core::watcher::types::StreamMessage;

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

fn transport(e: reqwest::Error) -> RemoteError {
    RemoteError::Transport(e.to_string())
}

pub struct HttpRemote {
    base_url: String,
    client: reqwest::Client,
}

impl HttpRemote {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn task_url(&self, id: &str, suffix: &str) -> String {
        format!(
            "{}/tasks/{}{}",
            self.base_url,
            utf8_percent_encode(id, NON_ALPHANUMERIC),
            suffix
        )
    }

    /// Send and decode a JSON response. `subject` names what a 404 refers to.
    async fn send<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        subject: &str,
    ) -> Result<T, RemoteError> {
        let response = request.send().await.map_err(transport)?;
        let status = response.status();
        if status.is_success() {
            return response.json::<T>().await.map_err(transport);
        }

        if status == StatusCode::NOT_FOUND {
            return Err(RemoteError::NotFound(subject.to_string()));
        }
        let message = match response.json::<ErrorBody>().await {
            Ok(body) => body.error,
            Err(_) => status.to_string(),
        };
        log::warn!("[taskdir.client] {} failed with {}: {}", subject, status, message);
        Err(RemoteError::Rejected {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl TaskRemote for HttpRemote {
    async fn get_board(&self) -> Result<Board, RemoteError> {
        let request = self.client.get(format!("{}/board", self.base_url));
        self.send(request, "board").await
    }

    async fn create_task(&self, input: CreateTaskInput) -> Result<Task, RemoteError> {
        let request = self.client.post(format!("{}/tasks", self.base_url)).json(&input);
        self.send(request, "tasks").await
    }

    async fn update_task(&self, input: UpdateTaskInput) -> Result<Task, RemoteError> {
        let request = self.client.patch(self.task_url(&input.id, "")).json(&input);
        self.send(request, &input.id).await
    }

    async fn delete_task(&self, id: &str) -> Result<DeleteResult, RemoteError> {
        let request = self.client.delete(self.task_url(id, ""));
        self.send(request, id).await
    }

    async fn move_task(&self, input: MoveTaskInput) -> Result<Task, RemoteError> {
        let request = self.client.post(self.task_url(&input.id, "/move")).json(&input);
        self.send(request, &input.id).await
    }
}

/// Incremental parser for `text/event-stream` bodies. Yields the joined
/// `data:` lines of each complete event; comments and other fields are dropped.
#[derive(Default)]
struct SseParser {
    buffer: Vec<u8>,
    data: Vec<String>,
}

impl SseParser {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if !self.data.is_empty() {
                    events.push(self.data.join("\n"));
                    self.data.clear();
                }
            } else if let Some(value) = line.strip_prefix("data:") {
                self.data.push(value.strip_prefix(' ').unwrap_or(value).to_string());
            }
        }
        events
    }
}

/// Read the server's change stream at `url` until it ends, forwarding every
/// payload to `coordinator`. Each (re)connect triggers a full reconcile since
/// the stream carries no backlog.
pub async fn follow_events<R: TaskRemote>(
    url: &str,
    coordinator: &MutationCoordinator<R>,
) -> Result<(), RemoteError> {
    let response = reqwest::Client::new()
        .get(url)
        .header(reqwest::header::ACCEPT, "text/event-stream")
        .send()
        .await
        .map_err(transport)?;
    let status = response.status();
    if !status.is_success() {
        return Err(RemoteError::Rejected {
            status: status.as_u16(),
            message: format!("event stream refused: {}", status),
        });
    }
    log::info!("[taskdir.client.events] Following {}", url);

    let mut parser = SseParser::default();
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(transport)?;
        for payload in parser.push(&chunk) {
            if StreamMessage::parse(&payload) == Some(StreamMessage::Connected) {
                if let Err(e) = coordinator.reconcile().await {
                    log::warn!("[taskdir.client.events] Reconcile after connect failed: {}", e);
                }
            } else {
                coordinator.on_change_payload(&payload);
            }
        }
    }

    log::info!("[taskdir.client.events] Stream from {} ended", url);
    Ok(())
}
