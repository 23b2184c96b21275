/// Mutation commands and their optimistic effect on a cached board.
use chrono::Utc;

use super::remote::{RemoteError, TaskRemote};
use crate::codec;
use crate::types::*;

#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Create(CreateTaskInput),
    Update(UpdateTaskInput),
    Delete { id: String },
    Move(MoveTaskInput),
}

#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome {
    Task(Task),
    Deleted(DeleteResult),
}

impl Mutation {
    pub fn move_task(id: impl Into<String>, new_status: Status, new_order: i64) -> Self {
        Mutation::Move(MoveTaskInput {
            id: id.into(),
            new_status,
            new_order,
        })
    }

    pub fn delete(id: impl Into<String>) -> Self {
        Mutation::Delete { id: id.into() }
    }

    /// The board this mutation should produce, computed locally.
    /// `placeholder_id` names the task a `Create` inserts until the real id
    /// arrives with the next reconciliation. Unknown ids leave the board as is.
    pub fn apply(&self, board: &Board, placeholder_id: &str) -> Board {
        let mut next = board.clone();
        match self {
            Mutation::Create(input) => {
                let mut task = Task {
                    id: placeholder_id.to_string(),
                    title: input.title.clone(),
                    status: input.status.unwrap_or(Status::Todo),
                    priority: input.priority.unwrap_or_default(),
                    labels: input.labels.clone().unwrap_or_default(),
                    assignee: input.assignee.clone().filter(|a| !a.is_empty()),
                    created: Utc::now().date_naive(),
                    due: input.due,
                    order: 0,
                    content: input.content.clone().unwrap_or_default(),
                    file_path: Default::default(),
                };
                task.file_path = next.directory.join(codec::filename(&task.id, &task.title));
                insert_sorted(&mut next, task);
            }
            Mutation::Update(input) => {
                if let Some(mut task) = next.take_task(&input.id) {
                    let old_title = task.title.clone();
                    input.apply_to(&mut task);
                    if task.title != old_title {
                        task.file_path = next.directory.join(codec::filename(&task.id, &task.title));
                    }
                    insert_sorted(&mut next, task);
                }
            }
            Mutation::Delete { id } => {
                next.take_task(id);
            }
            Mutation::Move(input) => {
                if let Some(mut task) = next.take_task(&input.id) {
                    task.status = input.new_status;
                    task.order = input.new_order;
                    insert_sorted(&mut next, task);
                }
            }
        }
        next
    }

    pub(crate) async fn execute<R: TaskRemote + ?Sized>(
        &self,
        remote: &R,
    ) -> Result<MutationOutcome, RemoteError> {
        match self {
            Mutation::Create(input) => remote.create_task(input.clone()).await.map(MutationOutcome::Task),
            Mutation::Update(input) => remote.update_task(input.clone()).await.map(MutationOutcome::Task),
            Mutation::Delete { id } => remote.delete_task(id).await.map(MutationOutcome::Deleted),
            Mutation::Move(input) => remote.move_task(input.clone()).await.map(MutationOutcome::Task),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Mutation::Create(_) => "create",
            Mutation::Update(_) => "update",
            Mutation::Delete { .. } => "delete",
            Mutation::Move(_) => "move",
        }
    }
}

/// Put `task` into its status column, keeping the column sorted. A task whose
/// status has no column is dropped, matching what a reload would show.
fn insert_sorted(board: &mut Board, task: Task) {
    if let Some(column) = board.column_mut(task.status) {
        column.tasks.push(task);
        sort_tasks(&mut column.tasks);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::collections::BTreeSet;
    use std::path::PathBuf;

    fn task(id: &str, status: Status, order: i64) -> Task {
        Task {
            id: id.to_string(),
            title: format!("Task {}", id),
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
        let column = |id: Status, tasks: Vec<Task>| Column {
            id,
            title: id.to_string(),
            color: None,
            tasks,
        };
        Board {
            columns: vec![
                column(Status::Todo, vec![task("a", Status::Todo, 0), task("b", Status::Todo, 10)]),
                column(Status::InProgress, Vec::new()),
                column(Status::Done, vec![task("c", Status::Done, 0)]),
            ],
            directory: PathBuf::from("/tasks"),
            loaded_at: Utc::now(),
            warnings: Vec::new(),
        }
    }

    fn ids(board: &Board, status: Status) -> Vec<String> {
        board.column(status).unwrap().tasks.iter().map(|t| t.id.clone()).collect()
    }

    #[test]
    fn test_create_prepends_placeholder() {
        let input = CreateTaskInput {
            title: "New".to_string(),
            ..CreateTaskInput::default()
        };
        let next = Mutation::Create(input).apply(&board(), "pending-1");
        assert_eq!(ids(&next, Status::Todo), vec!["a", "pending-1", "b"]);
        let created = next.find_task("pending-1").unwrap();
        assert_eq!(created.file_path, PathBuf::from("/tasks/pending-1-new.md"));
    }

    #[test]
    fn test_move_between_columns() {
        let next = Mutation::move_task("a", Status::Done, 5).apply(&board(), "unused");
        assert_eq!(ids(&next, Status::Todo), vec!["b"]);
        assert_eq!(ids(&next, Status::Done), vec!["c", "a"]);
        assert_eq!(next.find_task("a").unwrap().order, 5);
    }

    #[test]
    fn test_update_retitles_and_moves() {
        let mut input = UpdateTaskInput::new("b");
        input.title = Some("Renamed".to_string());
        input.status = Some(Status::InProgress);
        let next = Mutation::Update(input).apply(&board(), "unused");
        let moved = next.find_task("b").unwrap();
        assert_eq!(moved.status, Status::InProgress);
        assert_eq!(moved.file_path, PathBuf::from("/tasks/b-renamed.md"));
        assert_eq!(ids(&next, Status::InProgress), vec!["b"]);
    }

    #[test]
    fn test_delete_and_unknown_ids() {
        let original = board();
        let next = Mutation::delete("c").apply(&original, "unused");
        assert!(next.find_task("c").is_none());

        let untouched = Mutation::move_task("zzz", Status::Done, 1).apply(&original, "unused");
        assert_eq!(untouched, original);
    }
}
