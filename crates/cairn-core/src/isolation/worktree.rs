//! Local worktree isolation backend: the controlling process
//! holds a cache clone of the target; each attempt gets its own worktree
//! on a fresh branch off `origin/<default_branch>`, destroyed on
//! completion.

use async_trait::async_trait;

use super::{Isolation, IsolationError, Result, WorkspaceInfo};
use crate::worktree::WorktreeManager;

pub struct WorktreeIsolation {
    manager: WorktreeManager,
}

impl WorktreeIsolation {
    pub fn new(manager: WorktreeManager) -> Self {
        Self { manager }
    }

    fn attempt_branch(attempt_id: &str) -> String {
        format!("attempt/{attempt_id}")
    }
}

#[async_trait]
impl Isolation for WorktreeIsolation {
    fn name(&self) -> &str {
        "worktree"
    }

    async fn create_workspace(
        &self,
        attempt_id: &str,
        default_branch: &str,
        _task_id: &str,
        _target: &str,
    ) -> Result<WorkspaceInfo> {
        self.manager
            .fetch_origin()
            .map_err(|e| IsolationError::Git(e.to_string()))?;

        let branch = Self::attempt_branch(attempt_id);
        let info = self
            .manager
            .create_worktree_from_origin(&branch, default_branch)
            .map_err(|e| IsolationError::Git(e.to_string()))?;

        Ok(WorkspaceInfo {
            path: info.path,
            branch,
            job_id: None,
            job_log: None,
        })
    }

    async fn destroy_workspace(&self, info: &WorkspaceInfo) -> Result<()> {
        self.manager
            .remove_worktree(&info.path)
            .map_err(|e| IsolationError::Git(e.to_string()))?;
        let _ = self.manager.delete_branch(&info.branch);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::TempDir;

    fn create_temp_repo() -> (TempDir, TempDir, std::path::PathBuf) {
        let remote_dir = TempDir::new().unwrap();
        let clone_dir = TempDir::new().unwrap();
        let remote_path = remote_dir.path().to_path_buf();
        let clone_path = clone_dir.path().to_path_buf();

        let run = |args: &[&str], dir: &std::path::Path| {
            let output = Command::new("git").args(args).current_dir(dir).output().unwrap();
            assert!(output.status.success(), "git {} failed", args.join(" "));
        };

        run(&["init", "-b", "main"], &remote_path);
        run(&["config", "user.email", "test@cairn.dev"], &remote_path);
        run(&["config", "user.name", "Cairn Test"], &remote_path);
        std::fs::write(remote_path.join("README.md"), "hello\n").unwrap();
        run(&["add", "."], &remote_path);
        run(&["commit", "-m", "init"], &remote_path);

        run(
            &["clone", remote_path.to_str().unwrap(), clone_path.to_str().unwrap()],
            std::path::Path::new("/"),
        );
        run(&["config", "user.email", "test@cairn.dev"], &clone_path);
        run(&["config", "user.name", "Cairn Test"], &clone_path);

        (remote_dir, clone_dir, clone_path)
    }

    #[tokio::test]
    async fn creates_and_destroys_a_workspace_on_a_fresh_branch() {
        let (_remote, _clone, clone_path) = create_temp_repo();
        let wt_base = TempDir::new().unwrap();
        let manager = WorktreeManager::new(&clone_path, Some(wt_base.path().to_path_buf())).unwrap();
        let isolation = WorktreeIsolation::new(manager);

        let workspace = isolation
            .create_workspace("attempt-1", "main", "task-1", "demo-target")
            .await
            .expect("create_workspace failed");

        assert_eq!(workspace.branch, "attempt/attempt-1");
        assert!(workspace.path.join("README.md").exists());

        isolation
            .destroy_workspace(&workspace)
            .await
            .expect("destroy_workspace failed");
        assert!(!workspace.path.exists());
    }
}
