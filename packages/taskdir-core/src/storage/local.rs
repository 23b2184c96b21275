/// Directory-backed task storage.
///
/// One task per `.md` file directly inside the task directory:
/// - Files are decoded independently; a bad file becomes a load warning
/// - Writes are atomic (write to .tmp, fsync, rename)
/// - No in-process state besides the directory path, so concurrent calls
///   only race at the filesystem (last write wins)
use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use chrono::Utc;

use super::{StorageError, TaskStorage};
use crate::codec;
use crate::config::{default_columns, ColumnConfig};
use crate::ordering;
use crate::types::*;

static NEXT_SEQ: AtomicU64 = AtomicU64::new(1);

/// Task files in a single directory.
pub struct TaskStore {
    dir: PathBuf,
    columns: Vec<ColumnConfig>,
}

impl TaskStore {
    pub fn new(dir: impl Into<PathBuf>, columns: Vec<ColumnConfig>) -> Self {
        let columns = if columns.is_empty() {
            default_columns()
        } else {
            columns
        };
        Self {
            dir: dir.into(),
            columns,
        }
    }

    /// Like `new`, but creates the directory if it does not exist yet.
    pub fn open(dir: impl Into<PathBuf>, columns: Vec<ColumnConfig>) -> Result<Self, StorageError> {
        let store = Self::new(dir, columns);
        fs::create_dir_all(&store.dir)?;
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn columns(&self) -> &[ColumnConfig] {
        &self.columns
    }

    /// Decode every task file in the directory (non-recursive).
    /// Unreadable and undecodable files are reported, not fatal.
    fn scan(&self) -> Result<(Vec<Task>, Vec<LoadWarning>), StorageError> {
        let mut tasks = Vec::new();
        let mut warnings = Vec::new();

        for entry in fs::read_dir(&self.dir)? {
            let path = match entry {
                Ok(entry) => entry.path(),
                Err(e) => {
                    log::warn!("[taskdir.store.scan] Failed to read directory entry: {}", e);
                    continue;
                }
            };
            if !path.is_file() || !codec::is_task_file(&path) {
                continue;
            }

            let bytes = match fs::read(&path) {
                Ok(bytes) => bytes,
                Err(e) => {
                    log::warn!("[taskdir.store.scan] Skipping unreadable file {:?}: {}", path, e);
                    warnings.push(LoadWarning {
                        path,
                        reason: format!("unreadable: {}", e),
                    });
                    continue;
                }
            };

            match codec::decode(&path, &bytes) {
                Ok(task) => tasks.push(task),
                Err(failure) => {
                    log::warn!(
                        "[taskdir.store.scan] Skipping {:?}: {} (fields: {:?})",
                        failure.path,
                        failure.reason,
                        failure.raw_fields
                    );
                    warnings.push(LoadWarning {
                        path: failure.path,
                        reason: failure.reason,
                    });
                }
            }
        }

        Ok((tasks, warnings))
    }

    fn generate_id(existing: &HashSet<String>) -> String {
        loop {
            let ts = SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default();
            let seq = NEXT_SEQ.fetch_add(1, Ordering::Relaxed);
            let id = format!(
                "task-{:x}-{:06x}",
                ts.as_millis(),
                (ts.subsec_nanos() as u64 ^ seq.wrapping_mul(0x9E37_79B9)) & 0x00FF_FFFF
            );
            if !existing.contains(&id) {
                return id;
            }
        }
    }

    fn path_for(&self, task: &Task) -> PathBuf {
        self.dir.join(codec::filename(&task.id, &task.title))
    }

    fn write_task(&self, task: &Task) -> Result<(), std::io::Error> {
        Self::atomic_write(&task.file_path, &codec::encode(task))
    }

    /// Atomic write with fsync: write to .tmp, fsync, rename, fsync directory.
    fn atomic_write(path: &Path, content: &str) -> Result<(), std::io::Error> {
        let tmp_path = path.with_extension("taskdir.tmp");
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
        if let Err(e) = fs::rename(&tmp_path, path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e);
        }

        // fsync directory for rename durability
        if let Some(dir) = path.parent() {
            if let Ok(d) = fs::File::open(dir) {
                let _ = d.sync_all();
            }
        }
        Ok(())
    }

    /// Re-space the orders of one column to multiples of `ORDER_GAP`,
    /// keeping the current sort. Only tasks whose order changes are rewritten.
    pub fn compact_column(&self, status: Status) -> Result<Vec<Task>, StorageError> {
        let (tasks, _) = self.scan()?;
        let mut column: Vec<Task> = tasks.into_iter().filter(|t| t.status == status).collect();
        sort_tasks(&mut column);

        let changes = ordering::respace(&column);
        for (id, order) in &changes {
            if let Some(task) = column.iter_mut().find(|t| &t.id == id) {
                task.order = *order;
                self.write_task(task)?;
            }
        }
        log::info!(
            "[taskdir.store.compact] Re-spaced {} of {} tasks in column {}",
            changes.len(),
            column.len(),
            status
        );
        Ok(column)
    }
}

impl TaskStorage for TaskStore {
    fn list(&self) -> Result<Board, StorageError> {
        let (tasks, mut warnings) = self.scan()?;

        let mut columns: Vec<Column> = self
            .columns
            .iter()
            .map(|c| Column {
                id: c.id,
                title: c.title.clone(),
                color: c.color.clone(),
                tasks: Vec::new(),
            })
            .collect();

        for task in tasks {
            match columns.iter_mut().find(|c| c.id == task.status) {
                Some(column) => column.tasks.push(task),
                None => warnings.push(LoadWarning {
                    reason: format!("status '{}' has no configured column", task.status),
                    path: task.file_path,
                }),
            }
        }
        for column in &mut columns {
            sort_tasks(&mut column.tasks);
        }
        warnings.sort_by(|a, b| a.path.cmp(&b.path));

        Ok(Board {
            columns,
            directory: self.dir.clone(),
            loaded_at: Utc::now(),
            warnings,
        })
    }

    fn get_by_id(&self, id: &str) -> Result<Task, StorageError> {
        let (tasks, _) = self.scan()?;
        tasks
            .into_iter()
            .find(|t| t.id == id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))
    }

    fn create(&self, input: CreateTaskInput) -> Result<Task, StorageError> {
        if input.title.trim().is_empty() {
            return Err(StorageError::InvalidInput("title must not be empty".to_string()));
        }
        let (tasks, _) = self.scan()?;
        let existing: HashSet<String> = tasks.into_iter().map(|t| t.id).collect();

        let mut task = Task {
            id: Self::generate_id(&existing),
            title: input.title,
            status: input.status.unwrap_or(Status::Todo),
            priority: input.priority.unwrap_or_default(),
            labels: input.labels.unwrap_or_default(),
            assignee: input.assignee.filter(|a| !a.is_empty()),
            created: Utc::now().date_naive(),
            due: input.due,
            order: 0,
            content: input.content.unwrap_or_default(),
            file_path: PathBuf::new(),
        };
        task.file_path = self.path_for(&task);

        self.write_task(&task)?;
        log::info!("[taskdir.store.create] Created task {} at {:?}", task.id, task.file_path);
        Ok(task)
    }

    fn update(&self, input: UpdateTaskInput) -> Result<Task, StorageError> {
        if input.title.as_deref().is_some_and(|t| t.trim().is_empty()) {
            return Err(StorageError::InvalidInput("title must not be empty".to_string()));
        }
        let existing = self.get_by_id(&input.id)?;
        let old_path = existing.file_path.clone();

        let mut task = existing.clone();
        input.apply_to(&mut task);

        if task.title != existing.title {
            task.file_path = self.path_for(&task);
        }

        self.write_task(&task)?;
        if task.file_path != old_path {
            fs::remove_file(&old_path)?;
            log::info!(
                "[taskdir.store.rename] Task {} moved {:?} -> {:?}",
                task.id,
                old_path,
                task.file_path
            );
        }
        log::debug!("[taskdir.store.update] Updated task {}", task.id);
        Ok(task)
    }

    fn delete(&self, id: &str) -> Result<DeleteResult, StorageError> {
        let task = self.get_by_id(id)?;
        fs::remove_file(&task.file_path)?;
        log::info!("[taskdir.store.delete] Deleted task {} ({:?})", id, task.file_path);
        Ok(DeleteResult {
            success: true,
            id: id.to_string(),
        })
    }
}
