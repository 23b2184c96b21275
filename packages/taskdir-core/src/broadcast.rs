/// Fan-out of one directory watcher to many subscribers.
///
/// Construct one `ChangeBroadcaster` per watched directory at the process
/// composition root and share it (e.g. in an `Arc`). The watcher starts on
/// the first subscription and keeps running until the broadcaster is dropped.
///
/// Each subscriber owns an unbounded channel, so delivery to one subscriber
/// never waits on another. A subscriber receives `Connected` first, then
/// every change from that point on; there is no replay of earlier events.
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::watcher::debounce::DEFAULT_WINDOW;
use crate::watcher::file_watcher::{FileWatcher, ListenerHandle};
use crate::watcher::types::{ChangeEvent, StreamMessage};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Default)]
struct Registry {
    next_id: u64,
    senders: HashMap<u64, mpsc::UnboundedSender<StreamMessage>>,
}

struct Started {
    listener: ListenerHandle,
    heartbeat: Option<JoinHandle<()>>,
}

pub struct ChangeBroadcaster {
    watcher: FileWatcher,
    registry: Arc<Mutex<Registry>>,
    started: Mutex<Option<Started>>,
    heartbeat_interval: Duration,
}

/// A live subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<StreamMessage>,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next message, or `None` once the broadcaster is gone.
    pub async fn recv(&mut self) -> Option<StreamMessage> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<StreamMessage> {
        self.rx.try_recv().ok()
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            let removed = registry
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .senders
                .remove(&self.id)
                .is_some();
            if removed {
                log::info!("[taskdir.broadcast.unsubscribe] Subscriber {} left", self.id);
            }
        }
    }
}

impl ChangeBroadcaster {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_settings(dir, DEFAULT_WINDOW, HEARTBEAT_INTERVAL)
    }

    pub fn with_settings(dir: impl Into<PathBuf>, debounce: Duration, heartbeat_interval: Duration) -> Self {
        Self {
            watcher: FileWatcher::new(dir, debounce),
            registry: Arc::new(Mutex::new(Registry::default())),
            started: Mutex::new(None),
            heartbeat_interval,
        }
    }

    pub fn directory(&self) -> &Path {
        self.watcher.root()
    }

    /// Register a subscriber, starting the watcher if this is the first one.
    pub fn subscribe(&self) -> Result<Subscription, notify::Error> {
        self.ensure_started()?;

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(StreamMessage::Connected);

        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        let id = registry.next_id;
        registry.next_id += 1;
        registry.senders.insert(id, tx);
        log::info!(
            "[taskdir.broadcast.subscribe] Subscriber {} joined ({} total)",
            id,
            registry.senders.len()
        );

        Ok(Subscription {
            id,
            rx,
            registry: Arc::downgrade(&self.registry),
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .senders
            .len()
    }

    /// Deliver an event to every current subscriber, as if the watcher had
    /// reported it.
    pub fn publish(&self, event: ChangeEvent) {
        fan_out(&self.registry, StreamMessage::Change(event));
    }

    fn ensure_started(&self) -> Result<(), notify::Error> {
        let mut started = self.started.lock().unwrap_or_else(PoisonError::into_inner);
        if started.is_some() {
            return Ok(());
        }

        self.watcher.start()?;
        let registry = Arc::downgrade(&self.registry);
        let listener = self
            .watcher
            .on_change(move |event| {
                if let Some(registry) = registry.upgrade() {
                    fan_out(&registry, StreamMessage::Change(event.clone()));
                }
            })
            .map_err(notify::Error::io)?;

        let heartbeat = match tokio::runtime::Handle::try_current() {
            Ok(handle) => Some(handle.spawn(heartbeat_loop(
                Arc::downgrade(&self.registry),
                self.heartbeat_interval,
            ))),
            Err(_) => {
                log::warn!("[taskdir.broadcast.heartbeat] No async runtime, heartbeats disabled");
                None
            }
        };

        *started = Some(Started { listener, heartbeat });
        Ok(())
    }
}

impl Drop for ChangeBroadcaster {
    fn drop(&mut self) {
        let started = self
            .started
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(started) = started {
            if let Some(heartbeat) = started.heartbeat {
                heartbeat.abort();
            }
            started.listener.unsubscribe();
        }
        self.watcher.stop();
    }
}

/// Send to every subscriber, pruning those whose receiver is gone.
fn fan_out(registry: &Mutex<Registry>, message: StreamMessage) {
    let mut registry = registry.lock().unwrap_or_else(PoisonError::into_inner);
    registry.senders.retain(|id, tx| {
        let alive = tx.send(message.clone()).is_ok();
        if !alive {
            log::debug!("[taskdir.broadcast.prune] Dropping closed subscriber {}", id);
        }
        alive
    });
}

async fn heartbeat_loop(registry: Weak<Mutex<Registry>>, period: Duration) {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        interval.tick().await;
        match registry.upgrade() {
            Some(registry) => fan_out(&registry, StreamMessage::Heartbeat),
            None => break,
        }
    }
}
