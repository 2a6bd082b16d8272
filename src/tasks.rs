//! Current-task lookup.
//!
//! The agent keeps its task list in `PRD.json` inside the workspace. The loop
//! only reads it to tell the operator which task is in flight and to record
//! that task in a paused [`LoopState`](crate::r#loop::state::LoopState).

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

/// File name of the task list inside a workspace.
pub const PRD_FILE: &str = "PRD.json";

const DONE: &str = "done";
const DEFAULT_PRIORITY: i64 = 999;

/// The next pending task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub id: String,
    pub name: String,
    /// Tasks already marked done.
    pub done: usize,
    /// Tasks in the list.
    pub total: usize,
}

impl TaskInfo {
    /// Label in the form `[3/7] Add parser`.
    ///
    /// # Example
    ///
    /// ```
    /// use ralph::tasks::TaskInfo;
    ///
    /// let task = TaskInfo { id: "T-3".into(), name: "Add parser".into(), done: 2, total: 7 };
    /// assert_eq!(task.label(), "[3/7] Add parser");
    /// ```
    #[must_use]
    pub fn label(&self) -> String {
        format!("[{}/{}] {}", self.done + 1, self.total, self.name)
    }
}

/// Something that knows which task the agent is working on.
pub trait TaskSource: Send + Sync {
    /// The next pending task, or `None` when there is none or it is unknown.
    fn current(&self) -> Option<TaskInfo>;
}

/// No task tracking.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTasks;

impl TaskSource for NoTasks {
    fn current(&self) -> Option<TaskInfo> {
        None
    }
}

#[derive(Debug, Deserialize)]
struct Prd {
    #[serde(default)]
    tasks: Vec<PrdTask>,
}

#[derive(Debug, Deserialize)]
struct PrdTask {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    priority: Option<i64>,
}

/// Reads `PRD.json` afresh on every call, since the agent edits it between
/// iterations.
#[derive(Debug, Clone)]
pub struct PrdTasks {
    path: PathBuf,
}

impl PrdTasks {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn in_workspace(workspace: &Path) -> Self {
        Self::new(workspace.join(PRD_FILE))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Option<Prd> {
        let contents = fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str(&contents) {
            Ok(prd) => Some(prd),
            Err(e) => {
                debug!("Ignoring unreadable {}: {}", self.path.display(), e);
                None
            }
        }
    }
}

impl TaskSource for PrdTasks {
    fn current(&self) -> Option<TaskInfo> {
        let prd = self.read()?;
        let total = prd.tasks.len();
        let done = prd
            .tasks
            .iter()
            .filter(|t| t.status.as_deref() == Some(DONE))
            .count();

        // Stable sort keeps file order among equal priorities.
        let mut pending: Vec<&PrdTask> = prd
            .tasks
            .iter()
            .filter(|t| t.status.as_deref() != Some(DONE))
            .collect();
        pending.sort_by_key(|t| t.priority.unwrap_or(DEFAULT_PRIORITY));

        pending.first().map(|task| TaskInfo {
            id: task.id.clone().unwrap_or_else(|| "?".to_string()),
            name: task.name.clone().unwrap_or_else(|| "Unknown".to_string()),
            done,
            total,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_prd(dir: &TempDir, json: &str) -> PrdTasks {
        fs::write(dir.path().join(PRD_FILE), json).expect("write prd");
        PrdTasks::in_workspace(dir.path())
    }

    #[test]
    fn test_picks_lowest_priority_pending_task() {
        let dir = TempDir::new().expect("tempdir");
        let tasks = write_prd(
            &dir,
            r#"{"tasks":[
                {"id":"T-1","name":"Scaffold","status":"done","priority":1},
                {"id":"T-3","name":"Docs","status":"pending","priority":3},
                {"id":"T-2","name":"Parser","status":"pending","priority":2}
            ]}"#,
        );

        let task = tasks.current().expect("pending task");
        assert_eq!(task.id, "T-2");
        assert_eq!(task.name, "Parser");
        assert_eq!(task.done, 1);
        assert_eq!(task.total, 3);
        assert_eq!(task.label(), "[2/3] Parser");
    }

    #[test]
    fn test_missing_priority_sorts_last() {
        let dir = TempDir::new().expect("tempdir");
        let tasks = write_prd(
            &dir,
            r#"{"tasks":[{"id":"A","name":"later"},{"id":"B","name":"first","priority":5}]}"#,
        );
        assert_eq!(tasks.current().expect("task").id, "B");
    }

    #[test]
    fn test_all_done_yields_none() {
        let dir = TempDir::new().expect("tempdir");
        let tasks = write_prd(&dir, r#"{"tasks":[{"id":"A","status":"done"}]}"#);
        assert!(tasks.current().is_none());
    }

    #[test]
    fn test_missing_or_malformed_file_yields_none() {
        let dir = TempDir::new().expect("tempdir");
        assert!(PrdTasks::in_workspace(dir.path()).current().is_none());
        let tasks = write_prd(&dir, "{ nope");
        assert!(tasks.current().is_none());
    }

    #[test]
    fn test_defaults_for_missing_fields() {
        let dir = TempDir::new().expect("tempdir");
        let tasks = write_prd(&dir, r#"{"tasks":[{}]}"#);
        let task = tasks.current().expect("task");
        assert_eq!(task.id, "?");
        assert_eq!(task.name, "Unknown");
    }

    #[test]
    fn test_no_tasks_source() {
        assert!(NoTasks.current().is_none());
    }
}
