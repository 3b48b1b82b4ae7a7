//! Workspace isolation: two interchangeable realizations of
//! "run this attempt somewhere isolated", chosen by configuration. Both
//! satisfy the invariant that one attempt's on-disk state never
//! influences another's.

pub mod container;
pub mod worktree;

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IsolationError {
    #[error("git command failed: {0}")]
    Git(String),

    #[error("job submission failed: {0}")]
    Job(#[from] reqwest::Error),

    #[error("job {job_id} ended in a non-terminal or failed state: {detail}")]
    JobFailed { job_id: String, detail: String },

    #[error("no writable workspace root is configured")]
    NoWritableRoot,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, IsolationError>;

/// A workspace handed to the worker state machine. `path` is where the
/// attempt's clone of the target lives; for container isolation the job
/// has already finished the attempt end to end by the time this is
/// returned, so `path` is never read and `job_log` carries the job's
/// collected output instead.
#[derive(Debug, Clone)]
pub struct WorkspaceInfo {
    pub path: PathBuf,
    pub branch: String,
    pub job_id: Option<String>,
    pub job_log: Option<String>,
}

#[async_trait]
pub trait Isolation: Send + Sync {
    fn name(&self) -> &str;

    /// Create an isolated workspace rooted on a fresh branch off
    /// `origin/<default_branch>`. `task_id`/`target` are passed through
    /// so a job-based implementation can hand them to the job's own
    /// entrypoint via its environment.
    async fn create_workspace(
        &self,
        attempt_id: &str,
        default_branch: &str,
        task_id: &str,
        target: &str,
    ) -> Result<WorkspaceInfo>;

    /// Tear down a workspace. Failures are logged by the caller, not
    /// propagated as attempt failures.
    async fn destroy_workspace(&self, info: &WorkspaceInfo) -> Result<()>;
}
