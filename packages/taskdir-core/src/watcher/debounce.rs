/// Per-path stability window for raw filesystem notifications.
///
/// Every raw notification for a path restarts that path's window. Once a
/// path has been quiet for the whole window it settles into exactly one
/// `ChangeKind`, decided by whether the file existed before the burst and
/// what the last notification said.
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use super::types::ChangeKind;

pub const DEFAULT_WINDOW: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawChange {
    Created,
    Modified,
    Removed,
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    existed_before: bool,
    last: RawChange,
    last_seen: Instant,
}

#[derive(Debug)]
pub struct PathDebouncer {
    window: Duration,
    /// Paths believed to exist, updated as bursts settle.
    known: HashSet<PathBuf>,
    pending: HashMap<PathBuf, Pending>,
}

impl PathDebouncer {
    pub fn new(window: Duration, known: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            window,
            known: known.into_iter().collect(),
            pending: HashMap::new(),
        }
    }

    pub fn record(&mut self, path: PathBuf, change: RawChange, now: Instant) {
        let existed_before = self.known.contains(&path);
        let entry = self.pending.entry(path).or_insert(Pending {
            existed_before,
            last: change,
            last_seen: now,
        });
        entry.last = change;
        entry.last_seen = now;
    }

    /// Settle every path that has been quiet for the full window, oldest first.
    pub fn flush_ready(&mut self, now: Instant) -> Vec<(PathBuf, ChangeKind)> {
        let window = self.window;
        let mut ready: Vec<(PathBuf, Pending)> = Vec::new();
        self.pending.retain(|path, pending| {
            if now.saturating_duration_since(pending.last_seen) >= window {
                ready.push((path.clone(), *pending));
                false
            } else {
                true
            }
        });
        ready.sort_by(|a, b| a.1.last_seen.cmp(&b.1.last_seen).then_with(|| a.0.cmp(&b.0)));

        let mut settled = Vec::with_capacity(ready.len());
        for (path, pending) in ready {
            let kind = match (pending.existed_before, pending.last) {
                (true, RawChange::Removed) => Some(ChangeKind::Unlink),
                (false, RawChange::Removed) => None,
                (true, _) => Some(ChangeKind::Change),
                (false, _) => Some(ChangeKind::Add),
            };
            if pending.last == RawChange::Removed {
                self.known.remove(&path);
            } else {
                self.known.insert(path.clone());
            }
            if let Some(kind) = kind {
                settled.push((path, kind));
            }
        }
        settled
    }

    /// Earliest instant at which some pending path settles.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.last_seen + self.window).min()
    }

    pub fn is_known(&self, path: &Path) -> bool {
        self.known.contains(path)
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}
