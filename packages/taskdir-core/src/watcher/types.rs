/// Event types emitted by the file watcher and carried on the change stream.
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Add,
    Change,
    Unlink,
}

/// One settled change to a task file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    #[serde(serialize_with = "serialize_path", deserialize_with = "deserialize_path")]
    pub path: PathBuf,
    /// Milliseconds since the Unix epoch at emission.
    pub timestamp: u64,
}

impl ChangeEvent {
    pub fn now(kind: ChangeKind, path: PathBuf) -> Self {
        Self {
            kind,
            path,
            timestamp: chrono::Utc::now().timestamp_millis().max(0) as u64,
        }
    }
}

/// Messages delivered to change-stream subscribers.
///
/// On the wire: `{"type":"connected"}` once per connection, one
/// `{"type":"add"|"change"|"unlink","path":..,"timestamp":..}` per change,
/// and heartbeats as transport-level no-ops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamMessage {
    Connected,
    Change(ChangeEvent),
    Heartbeat,
}

impl StreamMessage {
    /// JSON payload for this message; heartbeats have none.
    pub fn to_json(&self) -> Option<String> {
        match self {
            StreamMessage::Connected => Some(serde_json::json!({ "type": "connected" }).to_string()),
            StreamMessage::Change(event) => serde_json::to_string(event).ok(),
            StreamMessage::Heartbeat => None,
        }
    }

    /// Parse a JSON payload. Anything that is not a known message is `None`.
    pub fn parse(payload: &str) -> Option<Self> {
        let value: serde_json::Value = serde_json::from_str(payload).ok()?;
        match value.get("type")?.as_str()? {
            "connected" => Some(StreamMessage::Connected),
            "add" | "change" | "unlink" => serde_json::from_value(value).ok().map(StreamMessage::Change),
            _ => None,
        }
    }
}

fn serialize_path<S: serde::Serializer>(path: &PathBuf, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&path.to_string_lossy())
}

fn deserialize_path<'de, D: serde::Deserializer<'de>>(d: D) -> Result<PathBuf, D::Error> {
    let s = String::deserialize(d)?;
    Ok(PathBuf::from(s))
}
