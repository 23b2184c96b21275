/// Optimistic, reconciling cache of a board held by a client.
///
/// A mutation is applied to the cached board immediately, then sent to the
/// remote. On failure the board is first restored to the snapshot taken
/// before the mutation, unless a newer mutation has started since. Either
/// way a reconciliation reload follows once the mutation settles.
///
/// Change notifications trigger a debounced reload. A reload that overlaps
/// any mutation (started before one began, or while one was in flight) is
/// discarded so it can never overwrite newer optimistic state.
pub mod mutation;
pub mod remote;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::types::Board;
use crate::watcher::types::StreamMessage;

pub use mutation::{Mutation, MutationOutcome};
pub use remote::{LocalRemote, RemoteError, TaskRemote};

pub const RECONCILE_DEBOUNCE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CoordinatorError {
    #[error("Board has not been loaded yet")]
    NotLoaded,

    #[error(transparent)]
    Remote(#[from] RemoteError),
}

#[derive(Default)]
struct State {
    board: Option<Board>,
    /// Bumped when a mutation starts and when it settles. A reload only
    /// installs its result if the epoch it started under is still current.
    epoch: u64,
    in_flight: usize,
    next_mutation: u64,
    latest_mutation: u64,
    reload: Option<JoinHandle<()>>,
    debounce: Option<JoinHandle<()>>,
}

impl State {
    fn cancel_pending_reloads(&mut self) {
        if let Some(handle) = self.reload.take() {
            handle.abort();
        }
        if let Some(handle) = self.debounce.take() {
            handle.abort();
        }
    }
}

struct Inner<R> {
    remote: R,
    state: Mutex<State>,
    debounce: Duration,
    next_placeholder: AtomicU64,
}

impl<R> Inner<R> {
    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Marks a mutation as in flight until dropped, including when the
/// mutating future is cancelled mid-request.
struct InFlight<'a, R> {
    inner: &'a Inner<R>,
}

impl<R> Drop for InFlight<'_, R> {
    fn drop(&mut self) {
        let mut state = self.inner.state();
        state.in_flight -= 1;
        state.epoch += 1;
    }
}

pub struct MutationCoordinator<R> {
    inner: Arc<Inner<R>>,
}

impl<R> Clone for MutationCoordinator<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: TaskRemote> MutationCoordinator<R> {
    pub fn new(remote: R) -> Self {
        Self::with_debounce(remote, RECONCILE_DEBOUNCE)
    }

    pub fn with_debounce(remote: R, debounce: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                remote,
                state: Mutex::new(State::default()),
                debounce,
                next_placeholder: AtomicU64::new(1),
            }),
        }
    }

    pub fn remote(&self) -> &R {
        &self.inner.remote
    }

    /// The cached board, if one has been loaded.
    pub fn board(&self) -> Option<Board> {
        self.inner.state().board.clone()
    }

    /// Fetch the authoritative board and install it unless a mutation
    /// overlapped the fetch. Returns whether the result was installed.
    pub async fn reconcile(&self) -> Result<bool, CoordinatorError> {
        reconcile(&self.inner).await
    }

    /// Apply `mutation` optimistically, then send it to the remote.
    pub async fn mutate(&self, mutation: Mutation) -> Result<MutationOutcome, CoordinatorError> {
        let placeholder = format!(
            "pending-{}",
            self.inner.next_placeholder.fetch_add(1, Ordering::Relaxed)
        );

        let (seq, snapshot, guard) = {
            let mut state = self.inner.state();
            let snapshot = state.board.clone().ok_or(CoordinatorError::NotLoaded)?;
            state.cancel_pending_reloads();
            state.epoch += 1;
            state.next_mutation += 1;
            let seq = state.next_mutation;
            state.latest_mutation = seq;
            state.in_flight += 1;
            state.board = Some(mutation.apply(&snapshot, &placeholder));
            (seq, snapshot, InFlight { inner: &*self.inner })
        };

        let result = mutation.execute(&self.inner.remote).await;
        drop(guard);

        match result {
            Ok(outcome) => {
                log::debug!("[taskdir.coordinator.mutate] {} #{} confirmed", mutation.kind(), seq);
                self.schedule_reload();
                Ok(outcome)
            }
            Err(e) => {
                let restored = {
                    let mut state = self.inner.state();
                    if state.latest_mutation == seq {
                        state.board = Some(snapshot);
                        true
                    } else {
                        false
                    }
                };
                if restored {
                    log::info!(
                        "[taskdir.coordinator.rollback] {} #{} failed, rolled back: {}",
                        mutation.kind(),
                        seq,
                        e
                    );
                } else {
                    log::warn!(
                        "[taskdir.coordinator.rollback] {} #{} failed behind a newer mutation: {}",
                        mutation.kind(),
                        seq,
                        e
                    );
                }
                // Snapshots can carry earlier optimistic guesses; settle by reloading.
                self.schedule_reload();
                Err(e.into())
            }
        }
    }

    /// React to a broadcaster message. Changes schedule a debounced reload;
    /// everything else is ignored. Must be called inside a tokio runtime.
    pub fn on_change_event(&self, message: &StreamMessage) {
        match message {
            StreamMessage::Change(event) => {
                log::debug!(
                    "[taskdir.coordinator.change] {:?} {}",
                    event.kind,
                    event.path.display()
                );
                self.schedule_debounced();
            }
            StreamMessage::Connected | StreamMessage::Heartbeat => {}
        }
    }

    /// Like `on_change_event`, for a raw JSON payload. Payloads that are not
    /// a known message are ignored.
    pub fn on_change_payload(&self, payload: &str) {
        match StreamMessage::parse(payload) {
            Some(message) => self.on_change_event(&message),
            None => log::debug!("[taskdir.coordinator.change] Ignoring payload: {}", payload),
        }
    }

    /// Restart the debounce window; the reload runs once it elapses quietly.
    fn schedule_debounced(&self) {
        let inner = Arc::clone(&self.inner);
        let delay = self.inner.debounce;
        let mut state = self.inner.state();
        if let Some(handle) = state.debounce.take() {
            handle.abort();
        }
        state.debounce = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            run_reload(&inner).await;
        }));
    }

    fn schedule_reload(&self) {
        let inner = Arc::clone(&self.inner);
        let mut state = self.inner.state();
        if let Some(handle) = state.reload.take() {
            handle.abort();
        }
        state.reload = Some(tokio::spawn(async move {
            run_reload(&inner).await;
        }));
    }
}

async fn run_reload<R: TaskRemote>(inner: &Inner<R>) {
    if let Err(e) = reconcile(inner).await {
        log::warn!("[taskdir.coordinator.reconcile] Reload failed: {}", e);
    }
}

async fn reconcile<R: TaskRemote>(inner: &Inner<R>) -> Result<bool, CoordinatorError> {
    let epoch = inner.state().epoch;
    let board = inner.remote.get_board().await?;

    let mut state = inner.state();
    if state.epoch != epoch || state.in_flight > 0 {
        log::debug!("[taskdir.coordinator.reconcile] Discarding reload that overlapped a mutation");
        return Ok(false);
    }
    state.board = Some(board);
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::*;
    use crate::watcher::types::{ChangeEvent, ChangeKind};
    use async_trait::async_trait;
    use chrono::{NaiveDate, Utc};
    use std::collections::BTreeSet;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;

    /// In-memory remote with configurable latency and failure injection.
    /// `get_board` snapshots before sleeping, so slow reloads return stale data.
    #[derive(Default)]
    struct MockRemote {
        board: Mutex<Option<Board>>,
        fetch_delay: Duration,
        write_delay: Duration,
        fail_delay: Duration,
        fail_moves: bool,
        fetches: AtomicUsize,
        created: AtomicUsize,
    }

    impl MockRemote {
        fn with_board(board: Board) -> Self {
            Self {
                board: Mutex::new(Some(board)),
                ..Self::default()
            }
        }

        fn current(&self) -> Board {
            self.board.lock().unwrap().clone().unwrap()
        }

        fn fetch_count(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }

        /// Simulate another writer adding a task.
        fn insert(&self, task: Task) {
            let mut guard = self.board.lock().unwrap();
            let column = guard.as_mut().unwrap().column_mut(task.status).unwrap();
            column.tasks.push(task);
            sort_tasks(&mut column.tasks);
        }
    }

    #[async_trait]
    impl TaskRemote for MockRemote {
        async fn get_board(&self) -> Result<Board, RemoteError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let board = self.current();
            tokio::time::sleep(self.fetch_delay).await;
            Ok(board)
        }

        async fn create_task(&self, input: CreateTaskInput) -> Result<Task, RemoteError> {
            tokio::time::sleep(self.write_delay).await;
            let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
            let mut created = task(&format!("real-{}", n), input.status.unwrap_or(Status::Todo), 0);
            created.title = input.title;
            self.insert(created.clone());
            Ok(created)
        }

        async fn update_task(&self, input: UpdateTaskInput) -> Result<Task, RemoteError> {
            tokio::time::sleep(self.write_delay).await;
            let mut guard = self.board.lock().unwrap();
            let board = guard.as_mut().unwrap();
            let mut task = board
                .take_task(&input.id)
                .ok_or_else(|| RemoteError::NotFound(input.id.clone()))?;
            input.apply_to(&mut task);
            let column = board.column_mut(task.status).unwrap();
            column.tasks.push(task.clone());
            sort_tasks(&mut column.tasks);
            Ok(task)
        }

        async fn delete_task(&self, id: &str) -> Result<DeleteResult, RemoteError> {
            let mut guard = self.board.lock().unwrap();
            match guard.as_mut().unwrap().take_task(id) {
                Some(_) => Ok(DeleteResult {
                    success: true,
                    id: id.to_string(),
                }),
                None => Err(RemoteError::NotFound(id.to_string())),
            }
        }

        async fn move_task(&self, input: MoveTaskInput) -> Result<Task, RemoteError> {
            if self.fail_moves {
                tokio::time::sleep(self.fail_delay).await;
                return Err(RemoteError::Rejected {
                    status: 500,
                    message: "disk full".to_string(),
                });
            }
            let mut update = UpdateTaskInput::new(input.id);
            update.status = Some(input.new_status);
            update.order = Some(input.new_order);
            self.update_task(update).await
        }
    }

    fn task(id: &str, status: Status, order: i64) -> Task {
        Task {
            id: id.to_string(),
            title: id.to_string(),
            status,
            priority: Priority::Medium,
            labels: BTreeSet::new(),
            assignee: None,
            created: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            due: None,
            order,
            content: String::new(),
            file_path: PathBuf::from(format!("/tasks/{}.md", id)),
        }
    }

    fn board() -> Board {
        Board {
            columns: Status::ALL
                .iter()
                .map(|status| Column {
                    id: *status,
                    title: status.to_string(),
                    color: None,
                    tasks: Vec::new(),
                })
                .collect(),
            directory: PathBuf::from("/tasks"),
            loaded_at: Utc::now(),
            warnings: Vec::new(),
        }
        .with_tasks(vec![task("t1", Status::Todo, 0), task("t2", Status::Todo, 10)])
    }

    trait WithTasks {
        fn with_tasks(self, tasks: Vec<Task>) -> Self;
    }

    impl WithTasks for Board {
        fn with_tasks(mut self, tasks: Vec<Task>) -> Self {
            for task in tasks {
                self.column_mut(task.status).unwrap().tasks.push(task);
            }
            self
        }
    }

    fn change() -> StreamMessage {
        StreamMessage::Change(ChangeEvent {
            kind: ChangeKind::Change,
            path: PathBuf::from("/tasks/t1.md"),
            timestamp: 0,
        })
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_secs(5)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_mutate_before_load() {
        let coordinator = MutationCoordinator::new(MockRemote::with_board(board()));
        let result = coordinator.mutate(Mutation::delete("t1")).await;
        assert_eq!(result, Err(CoordinatorError::NotLoaded));
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_move_reconciles() {
        let coordinator = MutationCoordinator::new(MockRemote::with_board(board()));
        assert!(coordinator.reconcile().await.unwrap());

        let outcome = coordinator
            .mutate(Mutation::move_task("t1", Status::Done, 5))
            .await
            .unwrap();
        match outcome {
            MutationOutcome::Task(task) => assert_eq!(task.status, Status::Done),
            other => panic!("unexpected outcome {:?}", other),
        }

        settle().await;
        assert_eq!(coordinator.board().unwrap(), coordinator.remote().current());
        assert_eq!(coordinator.remote().fetch_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_move_rolls_back() {
        let remote = MockRemote {
            fail_moves: true,
            fail_delay: Duration::from_millis(50),
            ..MockRemote::with_board(board())
        };
        let coordinator = MutationCoordinator::new(remote);
        coordinator.reconcile().await.unwrap();
        let before = coordinator.board().unwrap();

        let pending = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .mutate(Mutation::move_task("t1", Status::Done, 0))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let optimistic = coordinator.board().unwrap();
        assert_eq!(optimistic.find_task("t1").unwrap().status, Status::Done);

        let result = pending.await.unwrap();
        assert!(matches!(
            result,
            Err(CoordinatorError::Remote(RemoteError::Rejected { status: 500, .. }))
        ));
        assert_eq!(coordinator.board().unwrap(), before);

        settle().await;
        assert_eq!(coordinator.board().unwrap(), before);
        assert_eq!(coordinator.remote().fetch_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_behind_confirmed_create_converges() {
        let remote = MockRemote {
            fail_moves: true,
            write_delay: Duration::from_millis(50),
            fail_delay: Duration::from_millis(100),
            ..MockRemote::with_board(board())
        };
        let coordinator = MutationCoordinator::new(remote);
        coordinator.reconcile().await.unwrap();

        let create = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .mutate(Mutation::Create(CreateTaskInput {
                        title: "new".to_string(),
                        ..CreateTaskInput::default()
                    }))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let failing = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .mutate(Mutation::move_task("t1", Status::Done, 0))
                    .await
            })
        };

        create.await.unwrap().unwrap();
        assert!(failing.await.unwrap().is_err());

        settle().await;
        let settled = coordinator.board().unwrap();
        assert!(settled.find_task("real-1").is_some());
        assert!(settled.tasks().all(|t| !t.id.starts_with("pending-")));
        assert_eq!(settled.find_task("t1").unwrap().status, Status::Todo);
        assert_eq!(settled, coordinator.remote().current());
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_before_failed_mutation_is_not_lost() {
        let remote = MockRemote {
            fail_moves: true,
            fail_delay: Duration::from_millis(50),
            ..MockRemote::with_board(board())
        };
        let coordinator = MutationCoordinator::new(remote);
        coordinator.reconcile().await.unwrap();

        coordinator.remote().insert(task("ext", Status::Todo, 20));
        coordinator.on_change_event(&change());
        tokio::time::sleep(Duration::from_millis(50)).await;

        let result = coordinator
            .mutate(Mutation::move_task("t1", Status::Done, 0))
            .await;
        assert!(result.is_err());

        settle().await;
        let settled = coordinator.board().unwrap();
        assert!(settled.find_task("ext").is_some());
        assert_eq!(settled, coordinator.remote().current());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_reload_cannot_clobber_newer_mutation() {
        let remote = MockRemote {
            fetch_delay: Duration::from_millis(100),
            write_delay: Duration::from_millis(50),
            ..MockRemote::with_board(board())
        };
        let coordinator = MutationCoordinator::new(remote);
        coordinator.reconcile().await.unwrap();

        // First mutation confirms at t=50 and schedules a reload that
        // snapshots the pre-second-mutation board.
        coordinator
            .mutate(Mutation::move_task("t1", Status::InProgress, 0))
            .await
            .unwrap();

        let mut retitle = UpdateTaskInput::new("t1");
        retitle.title = Some("second".to_string());
        let pending = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.mutate(Mutation::Update(retitle)).await })
        };

        // The first reload would have landed here.
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(coordinator.board().unwrap().find_task("t1").unwrap().title, "second");

        pending.await.unwrap().unwrap();
        settle().await;
        let settled = coordinator.board().unwrap();
        let t1 = settled.find_task("t1").unwrap();
        assert_eq!(t1.title, "second");
        assert_eq!(t1.status, Status::InProgress);
        assert_eq!(settled, coordinator.remote().current());
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_burst_reloads_once() {
        let coordinator = MutationCoordinator::new(MockRemote::with_board(board()));
        coordinator.reconcile().await.unwrap();

        for _ in 0..5 {
            coordinator.on_change_event(&change());
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(coordinator.remote().fetch_count(), 1);

        settle().await;
        assert_eq!(coordinator.remote().fetch_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeats_and_junk_are_ignored() {
        let coordinator = MutationCoordinator::new(MockRemote::with_board(board()));
        coordinator.reconcile().await.unwrap();

        coordinator.on_change_event(&StreamMessage::Heartbeat);
        coordinator.on_change_event(&StreamMessage::Connected);
        coordinator.on_change_payload(r#"{"type":"heartbeat"}"#);
        coordinator.on_change_payload("not json");
        coordinator.on_change_payload(r#"{"type":"something-else"}"#);
        settle().await;
        assert_eq!(coordinator.remote().fetch_count(), 1);

        coordinator.on_change_payload(&change().to_json().unwrap());
        settle().await;
        assert_eq!(coordinator.remote().fetch_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_remote_over_store() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(crate::storage::local::TaskStore::new(
            dir.path(),
            crate::config::default_columns(),
        ));
        let coordinator = MutationCoordinator::new(LocalRemote::new(Arc::clone(&store)));
        coordinator.reconcile().await.unwrap();

        let created = coordinator
            .mutate(Mutation::Create(CreateTaskInput {
                title: "Write docs".to_string(),
                ..CreateTaskInput::default()
            }))
            .await
            .unwrap();
        let MutationOutcome::Task(created) = created else {
            panic!("expected a task");
        };

        settle().await;
        let board = coordinator.board().unwrap();
        assert!(board.find_task(&created.id).is_some());
        assert!(board.tasks().all(|t| !t.id.starts_with("pending-")));

        let missing = coordinator.mutate(Mutation::delete("nope")).await;
        assert_eq!(
            missing,
            Err(CoordinatorError::Remote(RemoteError::NotFound("nope".to_string())))
        );
    }
}
