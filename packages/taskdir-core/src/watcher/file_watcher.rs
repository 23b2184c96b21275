/// File watcher for a task directory.
///
/// Raw notify events are forwarded to a dispatch thread which feeds them
/// through a `PathDebouncer` (100ms stability window per path) and queues each
/// settled `ChangeEvent` for every registered listener. Each listener runs on
/// its own thread, so a slow or panicking listener only delays itself.
use std::collections::BTreeMap;
use std::fs;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Component, Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use notify::event::{ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use super::debounce::{PathDebouncer, RawChange};
use super::types::ChangeEvent;
use crate::codec;

/// Upper bound on how long the dispatch thread sleeps when nothing is pending.
const IDLE_WAIT: Duration = Duration::from_secs(1);

#[derive(Default)]
struct Listeners {
    next_id: u64,
    entries: BTreeMap<u64, Sender<ChangeEvent>>,
}

enum WatchMessage {
    Event(Event),
    Error(notify::Error),
    Stop,
}

struct Running {
    _watcher: RecommendedWatcher,
    control: Sender<WatchMessage>,
    thread: JoinHandle<()>,
}

/// Watches one directory tree for task file changes.
pub struct FileWatcher {
    root: PathBuf,
    window: Duration,
    listeners: Arc<RwLock<Listeners>>,
    running: Mutex<Option<Running>>,
}

/// Returned by `FileWatcher::on_change`; removes exactly that listener.
pub struct ListenerHandle {
    id: u64,
    listeners: Weak<RwLock<Listeners>>,
}

impl ListenerHandle {
    /// Returns false if the listener was already gone.
    pub fn unsubscribe(self) -> bool {
        match self.listeners.upgrade() {
            Some(listeners) => listeners
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .entries
                .remove(&self.id)
                .is_some(),
            None => false,
        }
    }
}

impl FileWatcher {
    pub fn new(root: impl Into<PathBuf>, window: Duration) -> Self {
        Self {
            root: root.into(),
            window,
            listeners: Arc::new(RwLock::new(Listeners::default())),
            running: Mutex::new(None),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Start watching. Calling it again while running is a no-op.
    pub fn start(&self) -> Result<(), notify::Error> {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.is_some() {
            return Ok(());
        }

        let root = fs::canonicalize(&self.root).unwrap_or_else(|_| self.root.clone());
        let (tx, rx) = mpsc::channel::<WatchMessage>();

        let notify_tx = tx.clone();
        let mut watcher = RecommendedWatcher::new(
            move |result: Result<Event, notify::Error>| {
                let message = match result {
                    Ok(event) => WatchMessage::Event(event),
                    Err(e) => WatchMessage::Error(e),
                };
                let _ = notify_tx.send(message);
            },
            Config::default(),
        )?;
        watcher.watch(&root, RecursiveMode::Recursive)?;

        let known = existing_task_files(&root);
        let debouncer = PathDebouncer::new(self.window, known);
        let listeners = self.listeners.clone();
        let thread_root = root.clone();
        let thread = thread::Builder::new()
            .name("taskdir-watcher".to_string())
            .spawn(move || dispatch_loop(&thread_root, rx, debouncer, &listeners))?;

        log::info!("[taskdir.watcher.start] Watching {:?}", root);
        *running = Some(Running {
            _watcher: watcher,
            control: tx,
            thread,
        });
        Ok(())
    }

    /// Stop watching and wait for the dispatch thread to exit. Safe to call
    /// when not running.
    pub fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(running) = running {
            let Running {
                _watcher: watcher,
                control,
                thread,
            } = running;
            // Dropping the notify watcher closes its sender; Stop wakes the thread now.
            drop(watcher);
            let _ = control.send(WatchMessage::Stop);
            if thread.join().is_err() {
                log::error!("[taskdir.watcher.stop] Dispatch thread panicked");
            }
            log::info!("[taskdir.watcher.stop] Stopped watching {:?}", self.root);
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Register a listener for settled change events. The listener gets its
    /// own thread and receives events in order; the thread exits once the
    /// listener is unsubscribed or the watcher is dropped.
    pub fn on_change<F>(&self, listener: F) -> std::io::Result<ListenerHandle>
    where
        F: Fn(&ChangeEvent) + Send + 'static,
    {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let id = listeners.next_id;
        let (tx, rx) = mpsc::channel::<ChangeEvent>();
        thread::Builder::new()
            .name(format!("taskdir-listener-{}", id))
            .spawn(move || listener_loop(rx, listener))?;
        listeners.next_id += 1;
        listeners.entries.insert(id, tx);
        Ok(ListenerHandle {
            id,
            listeners: Arc::downgrade(&self.listeners),
        })
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn dispatch_loop(
    root: &Path,
    rx: Receiver<WatchMessage>,
    mut debouncer: PathDebouncer,
    listeners: &RwLock<Listeners>,
) {
    loop {
        let wait = debouncer
            .next_deadline()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
            .unwrap_or(IDLE_WAIT);

        match rx.recv_timeout(wait) {
            Ok(WatchMessage::Event(event)) => {
                let now = Instant::now();
                for (path, change) in classify(&event) {
                    if is_watched_path(root, &path) {
                        debouncer.record(path, change, now);
                    }
                }
            }
            Ok(WatchMessage::Error(e)) => {
                log::error!("[taskdir.watcher.error] Watch error: {}", e);
            }
            Ok(WatchMessage::Stop) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }

        for (path, kind) in debouncer.flush_ready(Instant::now()) {
            let event = ChangeEvent::now(kind, path);
            log::debug!("[taskdir.watcher.event] {:?} {:?}", event.kind, event.path);
            dispatch(listeners, &event);
        }
    }
}

/// Queue `event` for every listener without waiting on any of them.
fn dispatch(listeners: &RwLock<Listeners>, event: &ChangeEvent) {
    let listeners = listeners.read().unwrap_or_else(PoisonError::into_inner);
    for (id, tx) in &listeners.entries {
        if tx.send(event.clone()).is_err() {
            log::warn!("[taskdir.watcher.listener] Listener {} has exited", id);
        }
    }
}

/// Run one listener until its sender is dropped. A panic is logged and the
/// listener keeps receiving later events.
fn listener_loop<F>(rx: Receiver<ChangeEvent>, listener: F)
where
    F: Fn(&ChangeEvent),
{
    for event in rx {
        if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
            log::error!("[taskdir.watcher.listener] Listener panicked on {:?}", event.path);
        }
    }
}

/// Translate a raw notify event into per-path observations.
fn classify(event: &Event) -> Vec<(PathBuf, RawChange)> {
    let all = |change: RawChange| -> Vec<(PathBuf, RawChange)> {
        event.paths.iter().map(|p| (p.clone(), change)).collect()
    };

    match &event.kind {
        EventKind::Create(_) => all(RawChange::Created),
        EventKind::Remove(_) => all(RawChange::Removed),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() >= 2 => vec![
            (event.paths[0].clone(), RawChange::Removed),
            (event.paths[1].clone(), RawChange::Created),
        ],
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => all(RawChange::Removed),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => all(RawChange::Created),
        EventKind::Modify(ModifyKind::Name(_)) => event
            .paths
            .iter()
            .map(|p| {
                let change = if p.exists() {
                    RawChange::Created
                } else {
                    RawChange::Removed
                };
                (p.clone(), change)
            })
            .collect(),
        EventKind::Modify(ModifyKind::Metadata(_)) => Vec::new(),
        EventKind::Modify(_) => all(RawChange::Modified),
        _ => Vec::new(),
    }
}

/// Task files anywhere under `root`, skipping hidden files and directories.
fn is_watched_path(root: &Path, path: &Path) -> bool {
    let relative = match path.strip_prefix(root) {
        Ok(relative) => relative,
        Err(_) => path,
    };
    let hidden = relative.components().any(|c| match c {
        Component::Normal(name) => name.to_string_lossy().starts_with('.'),
        _ => false,
    });
    !hidden && codec::is_task_file(path)
}

fn existing_task_files(root: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("[taskdir.watcher.scan] Cannot read {:?}: {}", dir, e);
                continue;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                if is_watched_dir(root, &path) {
                    stack.push(path);
                }
            } else if is_watched_path(root, &path) {
                found.push(path);
            }
        }
    }
    found
}

fn is_watched_dir(root: &Path, dir: &Path) -> bool {
    dir.strip_prefix(root)
        .map(|relative| {
            !relative.components().any(|c| match c {
                Component::Normal(name) => name.to_string_lossy().starts_with('.'),
                _ => false,
            })
        })
        .unwrap_or(false)
}
