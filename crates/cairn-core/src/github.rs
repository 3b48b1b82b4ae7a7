//! Git hosting REST client: the minimal surface the scheduler
//! and worker need, named by contract rather than by vendor — `octocrab`
//! is the concrete implementation, grounded in the enrichment repos'
//! dependency on it for the same purpose.

use thiserror::Error;

/// Branch names agent-owned PRs are recognized by.
pub const AGENT_BRANCH_PREFIX: &str = "agent/";

#[derive(Debug, Error)]
pub enum GitHostingError {
    #[error("git hosting API error: {0}")]
    Api(#[from] octocrab::Error),
}

pub type Result<T> = std::result::Result<T, GitHostingError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenPullRequest {
    pub number: u64,
    pub branch: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CombinedCheckStatus {
    Success,
    Pending,
    Failure,
}

#[derive(Debug, Clone)]
pub struct NewPullRequest {
    pub title: String,
    pub body: String,
    pub head: String,
    pub base: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedPullRequest {
    pub number: u64,
    pub url: String,
}

#[async_trait::async_trait]
pub trait GitHostingClient: Send + Sync {
    /// Pull requests with `state=open`, filtered to agent-owned branches.
    async fn list_open_agent_prs(&self) -> Result<Vec<OpenPullRequest>>;

    /// File paths modified by a specific PR.
    async fn list_pr_files(&self, pr_number: u64) -> Result<Vec<String>>;

    async fn combined_check_status(&self, commit_sha: &str) -> Result<CombinedCheckStatus>;

    async fn create_pull_request(&self, new_pr: NewPullRequest) -> Result<CreatedPullRequest>;

    /// An already-open PR whose head is `branch`, if one exists. Used by
    /// the worker to reuse a PR across retried attempts instead of
    /// opening a duplicate.
    async fn find_open_pr_by_head(&self, branch: &str) -> Result<Option<CreatedPullRequest>>;
}

pub struct OctocrabClient {
    client: octocrab::Octocrab,
    owner: String,
    repo: String,
}

impl OctocrabClient {
    pub fn new(client: octocrab::Octocrab, owner: impl Into<String>, repo: impl Into<String>) -> Self {
        Self {
            client,
            owner: owner.into(),
            repo: repo.into(),
        }
    }
}

#[async_trait::async_trait]
impl GitHostingClient for OctocrabClient {
    async fn list_open_agent_prs(&self) -> Result<Vec<OpenPullRequest>> {
        let page = self
            .client
            .pulls(&self.owner, &self.repo)
            .list()
            .state(octocrab::params::State::Open)
            .send()
            .await?;

        Ok(page
            .items
            .into_iter()
            .filter_map(|pr| {
                let branch = pr.head.ref_field;
                branch
                    .starts_with(AGENT_BRANCH_PREFIX)
                    .then_some(OpenPullRequest { number: pr.number, branch })
            })
            .collect())
    }

    async fn list_pr_files(&self, pr_number: u64) -> Result<Vec<String>> {
        let page = self
            .client
            .pulls(&self.owner, &self.repo)
            .list_files(pr_number)
            .await?;
        Ok(page.items.into_iter().map(|f| f.filename).collect())
    }

    async fn combined_check_status(&self, commit_sha: &str) -> Result<CombinedCheckStatus> {
        let status = self
            .client
            .repos(&self.owner, &self.repo)
            .combined_status_for_ref(&octocrab::params::repos::Reference::Commit(
                commit_sha.to_owned(),
            ))
            .send()
            .await?;

        Ok(match status.state.as_str() {
            "success" => CombinedCheckStatus::Success,
            "failure" | "error" => CombinedCheckStatus::Failure,
            _ => CombinedCheckStatus::Pending,
        })
    }

    async fn create_pull_request(&self, new_pr: NewPullRequest) -> Result<CreatedPullRequest> {
        let pr = self
            .client
            .pulls(&self.owner, &self.repo)
            .create(new_pr.title, new_pr.head, new_pr.base)
            .body(new_pr.body)
            .send()
            .await?;

        Ok(CreatedPullRequest {
            number: pr.number,
            url: pr
                .html_url
                .map(|u| u.to_string())
                .unwrap_or_else(|| format!("https://github.com/{}/{}/pull/{}", self.owner, self.repo, pr.number)),
        })
    }

    async fn find_open_pr_by_head(&self, branch: &str) -> Result<Option<CreatedPullRequest>> {
        let page = self
            .client
            .pulls(&self.owner, &self.repo)
            .list()
            .state(octocrab::params::State::Open)
            .send()
            .await?;

        Ok(page.items.into_iter().find(|pr| pr.head.ref_field == branch).map(|pr| CreatedPullRequest {
            number: pr.number,
            url: pr
                .html_url
                .map(|u| u.to_string())
                .unwrap_or_else(|| format!("https://github.com/{}/{}/pull/{}", self.owner, self.repo, pr.number)),
        }))
    }
}

/// Extract the task id embedded in an agent branch name, handling all
/// three canonical forms:
/// - `agent/<task_id>`
/// - `agent/<task_id>-<UTC yyyymmddhhmmss>` (collision variant)
/// - `agent/task-exec-attempt-<task_id>-<short attempt hash>` (worker-generated variant)
pub fn task_id_from_branch(branch: &str) -> Option<String> {
    let rest = branch.strip_prefix(AGENT_BRANCH_PREFIX)?;

    if let Some(tail) = rest.strip_prefix("task-exec-attempt-") {
        // <task_id>-<short attempt hash>: the hash is the last '-'-delimited
        // segment; everything before it is the task id.
        let (task_id, _hash) = tail.rsplit_once('-')?;
        return Some(task_id.to_owned());
    }

    // Collision variant appends a 14-digit UTC timestamp.
    if let Some((prefix, suffix)) = rest.rsplit_once('-') {
        if suffix.len() == 14 && suffix.chars().all(|c| c.is_ascii_digit()) {
            return Some(prefix.to_owned());
        }
    }

    Some(rest.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_branch_pattern() {
        assert_eq!(task_id_from_branch("agent/t1"), Some("t1".to_owned()));
    }

    #[test]
    fn parses_collision_branch_pattern() {
        assert_eq!(
            task_id_from_branch("agent/t1-20260315120000"),
            Some("t1".to_owned())
        );
    }

    #[test]
    fn parses_worker_generated_branch_pattern() {
        assert_eq!(
            task_id_from_branch("agent/task-exec-attempt-t1-a1b2c3"),
            Some("t1".to_owned())
        );
    }

    #[test]
    fn task_ids_with_hyphens_survive_collision_parsing() {
        assert_eq!(
            task_id_from_branch("agent/fix-login-bug-20260315120000"),
            Some("fix-login-bug".to_owned())
        );
    }

    #[test]
    fn non_agent_branch_returns_none() {
        assert_eq!(task_id_from_branch("main"), None);
        assert_eq!(task_id_from_branch("feature/something"), None);
    }

    #[test]
    fn worker_generated_pattern_with_hyphenated_task_id() {
        assert_eq!(
            task_id_from_branch("agent/task-exec-attempt-fix-login-bug-a1b2c3"),
            Some("fix-login-bug".to_owned())
        );
    }
}
