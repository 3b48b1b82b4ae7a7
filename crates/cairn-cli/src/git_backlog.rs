//! Concrete [`BacklogSource`] implementation: maintains a plain clone of
//! the target repo under its `local_cache_dir` and reads the backlog
//! file straight off disk. Separate from the worker's own git subprocess
//! calls so the scheduler's clone and each attempt's isolated workspace
//! never share a working tree.

use std::path::Path;
use std::process::Command;

use async_trait::async_trait;
use cairn_core::scheduler::BacklogSource;
use cairn_core::target::TargetConfig;

pub struct GitBacklogSource {
    target: TargetConfig,
}

impl GitBacklogSource {
    pub fn new(target: TargetConfig) -> Self {
        Self { target }
    }

    fn ensure_clone(&self) -> Result<(), String> {
        let dir = &self.target.local_cache_dir;
        if dir.join(".git").is_dir() {
            run_git(dir, &["fetch", "origin", &self.target.default_branch])?;
            run_git(
                dir,
                &["reset", "--hard", &format!("origin/{}", self.target.default_branch)],
            )?;
            return Ok(());
        }

        if let Some(parent) = dir.parent() {
            std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }
        run_git(
            Path::new("."),
            &["clone", "--depth", "1", &self.target.repo_url, &dir.to_string_lossy()],
        )?;
        Ok(())
    }
}

fn run_git(dir: &Path, args: &[&str]) -> Result<String, String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .map_err(|e| format!("failed to run git {}: {e}", args.join(" ")))?;
    if !output.status.success() {
        return Err(format!("git {} failed: {}", args.join(" "), String::from_utf8_lossy(&output.stderr)));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[async_trait]
impl BacklogSource for GitBacklogSource {
    async fn fetch(&self, _target: &str) -> Result<String, String> {
        self.ensure_clone()?;
        std::fs::read_to_string(self.target.backlog_path()).map_err(|e| e.to_string())
    }
}

/// Pulls `owner`/`repo` out of either an HTTPS or SSH GitHub remote URL,
/// for constructing an [`octocrab::Octocrab`]-backed hosting client.
pub fn parse_owner_repo(repo_url: &str) -> anyhow::Result<(String, String)> {
    let trimmed = repo_url.trim_end_matches('/').trim_end_matches(".git");

    let path = if let Some(rest) = trimmed.strip_prefix("git@github.com:") {
        rest
    } else if let Some(rest) = trimmed.strip_prefix("https://github.com/") {
        rest
    } else if let Some(rest) = trimmed.strip_prefix("http://github.com/") {
        rest
    } else {
        anyhow::bail!("unrecognized GitHub remote URL: {repo_url}");
    };

    let mut parts = path.splitn(2, '/');
    let owner = parts.next().filter(|s| !s.is_empty());
    let repo = parts.next().filter(|s| !s.is_empty());
    match (owner, repo) {
        (Some(owner), Some(repo)) => Ok((owner.to_owned(), repo.to_owned())),
        _ => anyhow::bail!("could not parse owner/repo from {repo_url}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_https_url() {
        let (owner, repo) = parse_owner_repo("https://github.com/example/radix").unwrap();
        assert_eq!(owner, "example");
        assert_eq!(repo, "radix");
    }

    #[test]
    fn parses_https_url_with_dot_git_suffix() {
        let (owner, repo) = parse_owner_repo("https://github.com/example/radix.git").unwrap();
        assert_eq!(owner, "example");
        assert_eq!(repo, "radix");
    }

    #[test]
    fn parses_ssh_url() {
        let (owner, repo) = parse_owner_repo("git@github.com:example/radix.git").unwrap();
        assert_eq!(owner, "example");
        assert_eq!(repo, "radix");
    }

    #[test]
    fn rejects_unrecognized_host() {
        assert!(parse_owner_repo("https://gitlab.com/example/radix").is_err());
    }
}
