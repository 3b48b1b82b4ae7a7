//! Backlog file parsing: `.leviathan/backlog.yaml` in the
//! target repo, normalized to a flat `Vec<TaskRecord>` regardless of
//! which of the two accepted top-level shapes is used.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BacklogError {
    #[error("failed to parse backlog YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("task at index {index} has no id")]
    MissingId { index: usize },
}

pub type Result<T> = std::result::Result<T, BacklogError>;

/// One task record as it appears in the backlog file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRecord {
    #[serde(default)]
    pub id: Option<String>,
    /// Legacy field name; normalized into `id` by [`parse`].
    #[serde(default, rename = "task_id")]
    pub legacy_task_id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub allowed_paths: Vec<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub estimated_size: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub branch_name: Option<String>,
    #[serde(default)]
    pub pr_number: Option<i64>,
    #[serde(default)]
    pub last_attempt_id: Option<String>,
    #[serde(default)]
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl TaskRecord {
    /// The task's id, normalizing the legacy `task_id` field into `id`.
    fn normalized_id(&self) -> Option<String> {
        self.id.clone().or_else(|| self.legacy_task_id.clone())
    }
}

/// Shape (a): a mapping with a `tasks:` sequence and optional top-level
/// `version`/`max_open_prs`.
#[derive(Debug, Clone, Deserialize)]
struct BacklogMapping {
    #[serde(default)]
    #[allow(dead_code)]
    version: Option<String>,
    #[serde(default)]
    max_open_prs: Option<u32>,
    #[serde(default)]
    tasks: Vec<TaskRecord>,
}

/// Either accepted top-level shape.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum BacklogShape {
    Mapping(BacklogMapping),
    Sequence(Vec<TaskRecord>),
}

/// A normalized backlog: a flat task list plus whatever top-level
/// settings were present (absent when the sequence shape is used).
#[derive(Debug, Clone, Default)]
pub struct Backlog {
    pub max_open_prs: Option<u32>,
    pub tasks: Vec<TaskRecord>,
}

/// Parse and normalize a backlog file's contents.
///
/// Every task's `id`/`task_id` is normalized to `id`; tasks with neither
/// field set are rejected.
pub fn parse(contents: &str) -> Result<Backlog> {
    let shape: BacklogShape = serde_yaml::from_str(contents)?;
    let (max_open_prs, mut tasks) = match shape {
        BacklogShape::Mapping(m) => (m.max_open_prs, m.tasks),
        BacklogShape::Sequence(tasks) => (None, tasks),
    };

    for (index, task) in tasks.iter_mut().enumerate() {
        let normalized = task.normalized_id().ok_or(BacklogError::MissingId { index })?;
        task.id = Some(normalized);
        task.legacy_task_id = None;
    }

    Ok(Backlog { max_open_prs, tasks })
}
