//! The attempt executor: an 11-step state machine run once
//! per dispatched attempt — init, clone, load task, generate, apply,
//! test, commit, mergeability probe, push & PR, artifacts, report.
//!
//! Grounded in `lifecycle::run_agent_lifecycle`'s step sequence and
//! event-collection-then-persist pattern, generalized from a single
//! diff-apply step into the oracle/built-in-executor split the backlog
//! scope taxonomy requires.

mod indexer;
mod validate;

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use async_trait::async_trait;
use cairn_store::artifact::{ArtifactKind, ArtifactStore};
use cairn_store::event::{EventType, NewEvent};
use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::backlog;
use crate::github::{GitHostingClient, NewPullRequest};
use crate::isolation::{Isolation, WorkspaceInfo};
use crate::oracle::{FileContext, OracleClient, OracleError, OracleRequest, RetryContext};
use crate::policy;
use crate::scheduler::{AttemptOutcome, AttemptParams, WorkerDispatcher};
use crate::target::TargetConfig;

/// Scopes whose step-4 generation is a built-in executor rather than a
/// round trip through the oracle.
const BUILTIN_SCOPES: &[&str] = &["docs", "tests", "bootstrap", "topology"];

/// Scopes that produce no PR at all: their work is system indexing, not
/// a code change, and the caller skips apply/test/commit/push entirely.
const SYSTEM_SCOPES: &[&str] = &["bootstrap", "topology"];

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("task {0} not found in backlog")]
    TaskNotFound(String),

    #[error("model output invalid: {0}")]
    ModelOutputInvalid(String),

    #[error("path policy violation: {0}")]
    PathViolation(String),

    #[error("unsafe command rejected: {0}")]
    UnsafeCommand(String),

    #[error("task's modified paths span more than one scope: {0}")]
    ScopeMismatch(String),

    #[error("merge conflict predicted against the default branch: {0}")]
    MergeConflictPredicted(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("git hosting error: {0}")]
    GithubError(String),

    #[error("git error: {0}")]
    GitError(String),

    #[error("job submission error: {0}")]
    JobSubmitError(String),

    #[error("worker error: {0}")]
    WorkerError(String),
}

impl WorkerError {
    /// The `failure_type` string reported in `attempt.failed` events and
    /// `AttemptOutcome::Failed`.
    pub fn failure_type(&self) -> &'static str {
        match self {
            Self::TaskNotFound(_) => "task_not_found",
            Self::ModelOutputInvalid(_) => "model_output_invalid",
            Self::PathViolation(_) => "path_violation",
            Self::UnsafeCommand(_) => "UnsafeCommand",
            Self::ScopeMismatch(_) => "scope_mismatch",
            Self::MergeConflictPredicted(_) => "merge_conflict_predicted",
            Self::Timeout(_) => "timeout",
            Self::GithubError(_) => "github_error",
            Self::GitError(_) => "git_error",
            Self::JobSubmitError(_) => "job_submit_error",
            Self::WorkerError(_) => "worker_error",
        }
    }
}

impl From<crate::isolation::IsolationError> for WorkerError {
    fn from(e: crate::isolation::IsolationError) -> Self {
        Self::JobSubmitError(e.to_string())
    }
}

impl From<crate::github::GitHostingError> for WorkerError {
    fn from(e: crate::github::GitHostingError) -> Self {
        Self::GithubError(e.to_string())
    }
}

impl From<OracleError> for WorkerError {
    fn from(e: OracleError) -> Self {
        Self::ModelOutputInvalid(e.to_string())
    }
}

/// A task as resolved for execution: either loaded from the backlog or
/// synthesized for a reserved system-scope id.
#[derive(Debug, Clone)]
pub struct ResolvedTask {
    pub id: String,
    pub title: String,
    pub scope: String,
    pub priority: String,
    pub estimated_size: String,
    pub allowed_paths: Vec<String>,
    pub acceptance_criteria: Vec<String>,
}

/// True for `topology-<target>-v1` / `bootstrap-<target>-v1`, the two
/// reserved ids that get a synthesized system-scope task when absent
/// from the backlog.
fn reserved_system_task(task_id: &str, target_name: &str) -> Option<ResolvedTask> {
    for scope in ["topology", "bootstrap"] {
        let reserved = format!("{scope}-{target_name}-v1");
        if task_id == reserved {
            return Some(ResolvedTask {
                id: task_id.to_owned(),
                title: format!("SYSTEM {scope} scan for {target_name}"),
                scope: scope.to_owned(),
                priority: "system".to_owned(),
                estimated_size: "small".to_owned(),
                allowed_paths: Vec::new(),
                acceptance_criteria: Vec::new(),
            });
        }
    }
    None
}

fn load_task(workspace: &Path, target: &TargetConfig, task_id: &str) -> Result<ResolvedTask, WorkerError> {
    let backlog_path = if target.backlog_path.is_some() {
        target.backlog_path()
    } else {
        workspace.join(".leviathan/backlog.yaml")
    };

    let record = match std::fs::read_to_string(&backlog_path) {
        Ok(contents) => {
            let parsed = backlog::parse(&contents)
                .map_err(|e| WorkerError::WorkerError(format!("backlog_invalid: {e}")))?;
            parsed.tasks.into_iter().find(|t| t.id.as_deref() == Some(task_id))
        }
        Err(_) => None,
    };

    match record {
        Some(task) => Ok(ResolvedTask {
            id: task.id.unwrap_or_else(|| task_id.to_owned()),
            title: task.title.unwrap_or_default(),
            scope: task.scope.unwrap_or_else(|| "tools".to_owned()),
            priority: task.priority.unwrap_or_else(|| "normal".to_owned()),
            estimated_size: task.estimated_size.unwrap_or_else(|| "medium".to_owned()),
            allowed_paths: task.allowed_paths,
            acceptance_criteria: task.acceptance_criteria,
        }),
        None => reserved_system_task(task_id, &target.name).ok_or_else(|| WorkerError::TaskNotFound(task_id.to_owned())),
    }
}

/// Minimal scaffolds for the `docs`/`tests` built-in executor (spec
/// §4.6 step 4). These are not full implementations — there is no
/// oracle call for these scopes — just enough structure for the step-6
/// validator to check against.
fn builtin_scaffold(task: &ResolvedTask) -> BTreeMap<String, String> {
    let mut files = BTreeMap::new();
    for path in &task.allowed_paths {
        let content = if task.scope == "docs" {
            let mut body = format!("# {}\n\n", task.title);
            for criterion in &task.acceptance_criteria {
                body.push_str(&format!("- {criterion}\n"));
            }
            body
        } else {
            let mut body = format!("// {}\n// Task-ID: {}\n\n", task.title, task.id);
            for criterion in &task.acceptance_criteria {
                body.push_str(&format!("// acceptance: {criterion}\n"));
            }
            body
        };
        files.insert(path.clone(), content);
    }
    files
}

fn build_oracle_request(
    task: &ResolvedTask,
    workspace: &Path,
    retry_context: Option<RetryContext>,
) -> OracleRequest {
    let files = task
        .allowed_paths
        .iter()
        .map(|path| {
            let full = workspace.join(path);
            let (content, truncated) = match std::fs::read_to_string(&full) {
                Ok(raw) => crate::oracle::truncate_file_content(&raw, crate::oracle::DEFAULT_MAX_FILE_BYTES),
                Err(_) => (String::new(), false),
            };
            FileContext {
                path: path.clone(),
                content,
                truncated,
            }
        })
        .collect();

    OracleRequest {
        task_id: task.id.clone(),
        title: task.title.clone(),
        scope: task.scope.clone(),
        priority: task.priority.clone(),
        estimated_size: task.estimated_size.clone(),
        allowed_paths: task.allowed_paths.clone(),
        acceptance_criteria: task.acceptance_criteria.clone(),
        files,
        retry_context,
    }
}

/// Scope category a written path belongs to, for the commit-prefix
/// table and the step-9 scope-mismatch check.
fn path_scope_category(path: &str) -> &'static str {
    if path.starts_with("docs/") {
        "docs"
    } else if path.starts_with(".github/workflows/") || path.starts_with("ci/") {
        "ci"
    } else if path.starts_with("tools/") {
        "tools"
    } else if path.starts_with("infra/") {
        "infra"
    } else if path.starts_with("services/") {
        "services"
    } else {
        "default"
    }
}

fn commit_prefix(scope_category: &str, task_id: &str) -> String {
    match scope_category {
        "docs" => "docs".to_owned(),
        "ci" => "fix(ci)".to_owned(),
        "tools" => "feat(tools)".to_owned(),
        "services" if task_id.starts_with("geo-") => "feat(geo)".to_owned(),
        "services" => "feat(research)".to_owned(),
        "infra" => "chore(infra)".to_owned(),
        _ => "chore".to_owned(),
    }
}

fn run_git(workspace: &Path, args: &[&str]) -> Result<String, WorkerError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(workspace)
        .output()
        .map_err(|e| WorkerError::GitError(format!("failed to run git {}: {e}", args.join(" "))))?;
    if !output.status.success() {
        return Err(WorkerError::GitError(format!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn remote_branch_exists(workspace: &Path, branch: &str) -> bool {
    Command::new("git")
        .args(["ls-remote", "--exit-code", "--heads", "origin", branch])
        .current_dir(workspace)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// A best-effort trial merge of `origin/<default_branch>`, aborted
/// immediately either way. Only meaningful for local
/// worktree isolation, where the scheduler's view of "will this merge
/// cleanly" matters before a PR is opened.
fn probe_mergeable(workspace: &Path, default_branch: &str) -> Result<(), WorkerError> {
    run_git(workspace, &["fetch", "origin", default_branch])?;

    let merge = Command::new("git")
        .args(["merge", "--no-ff", "--no-commit", &format!("origin/{default_branch}")])
        .current_dir(workspace)
        .output()
        .map_err(|e| WorkerError::GitError(format!("failed to run git merge: {e}")))?;

    let combined = format!(
        "{}{}",
        String::from_utf8_lossy(&merge.stdout),
        String::from_utf8_lossy(&merge.stderr)
    );
    let _ = Command::new("git").args(["merge", "--abort"]).current_dir(workspace).output();

    if combined.contains("CONFLICT") || combined.contains("Automatic merge failed") {
        return Err(WorkerError::MergeConflictPredicted(combined));
    }
    Ok(())
}

fn new_event(actor_id: &str, event_type: EventType, payload: serde_json::Value) -> NewEvent {
    NewEvent {
        event_id: Uuid::new_v4().to_string(),
        event_type,
        timestamp: Utc::now(),
        actor_id: actor_id.to_owned(),
        payload,
    }
}

/// Like [`new_event`], but with an `event_id` derived from `(attempt_id,
/// discriminator)` instead of a random uuid, so a worker that crashes and
/// restarts with the same `attempt_id` produces the same event on retry.
/// Used for the events whose payload alone determines their identity:
/// attempt lifecycle transitions and per-artifact creation.
fn attempt_event(actor_id: &str, event_type: EventType, attempt_id: &str, discriminator: &str, payload: serde_json::Value) -> NewEvent {
    NewEvent {
        event_id: deterministic_event_id(attempt_id, discriminator),
        event_type,
        timestamp: Utc::now(),
        actor_id: actor_id.to_owned(),
        payload,
    }
}

/// Deterministic event id for idempotent re-ingestion: a hash of the
/// attempt id and a discriminator, not a random uuid.
fn deterministic_event_id(attempt_id: &str, discriminator: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(attempt_id.as_bytes());
    hasher.update(b":");
    hasher.update(discriminator.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Serialize)]
struct IngestBundle {
    target: String,
    bundle_id: String,
    events: Vec<NewEvent>,
    artifacts: Vec<IngestArtifactRef>,
}

#[derive(Serialize)]
struct IngestArtifactRef {
    name: String,
    hash: String,
    uri: String,
}

pub struct Worker {
    isolation: Arc<dyn Isolation>,
    oracle: Arc<dyn OracleClient>,
    hosting: Arc<dyn GitHostingClient>,
    artifacts: Arc<dyn ArtifactStore>,
    http: reqwest::Client,
    target: TargetConfig,
    actor_id: String,
    control_plane_url: String,
    control_plane_token: String,
}

impl Worker {
    pub fn new(
        isolation: Arc<dyn Isolation>,
        oracle: Arc<dyn OracleClient>,
        hosting: Arc<dyn GitHostingClient>,
        artifacts: Arc<dyn ArtifactStore>,
        target: TargetConfig,
        actor_id: impl Into<String>,
        control_plane_url: impl Into<String>,
        control_plane_token: impl Into<String>,
    ) -> Self {
        Self {
            isolation,
            oracle,
            hosting,
            artifacts,
            http: reqwest::Client::new(),
            target,
            actor_id: actor_id.into(),
            control_plane_url: control_plane_url.into(),
            control_plane_token: control_plane_token.into(),
        }
    }

    /// Run the full 11-step state machine for one attempt. Internal
    /// errors are caught here and turned into `AttemptOutcome::Failed`
    /// with the matching `failure_type` — this is the crate's
    /// single top-level `worker_error` catch boundary.
    pub async fn run_attempt(&self, params: &AttemptParams) -> AttemptOutcome {
        match self.run_attempt_inner(params).await {
            Ok(outcome) => outcome,
            Err(e) => AttemptOutcome::Failed {
                failure_type: e.failure_type().to_owned(),
                summary: e.to_string(),
            },
        }
    }

    async fn run_attempt_inner(&self, params: &AttemptParams) -> Result<AttemptOutcome, WorkerError> {
        let mut events = Vec::new();
        events.push(attempt_event(
            &self.actor_id,
            EventType::AttemptStarted,
            &params.attempt_id,
            "started",
            serde_json::json!({ "attempt_id": params.attempt_id, "task_id": params.task_id }),
        ));

        // Step 1/2: init + clone.
        let workspace = self
            .isolation
            .create_workspace(&params.attempt_id, &self.target.default_branch, &params.task_id, &params.target)
            .await?;

        // Container isolation's `create_workspace` already ran the full
        // attempt inside the job; steps 3-10 live there, not here.
        let outcome = if self.isolation.name() == "container" {
            self.container_outcome(&params.attempt_id, &workspace, &mut events).await
        } else {
            self.drive_attempt(params, &workspace, &mut events).await
        };

        let _ = self.isolation.destroy_workspace(&workspace).await;

        let (outcome, artifacts) = match outcome {
            Ok((outcome, artifacts)) => (outcome, artifacts),
            Err(e) => {
                events.push(attempt_event(
                    &self.actor_id,
                    EventType::AttemptFailed,
                    &params.attempt_id,
                    "failed",
                    serde_json::json!({
                        "attempt_id": params.attempt_id,
                        "task_id": params.task_id,
                        "failure_type": e.failure_type(),
                        "summary": e.to_string(),
                    }),
                ));
                self.report(params, &events, Vec::new()).await;
                return Ok(AttemptOutcome::Failed {
                    failure_type: e.failure_type().to_owned(),
                    summary: e.to_string(),
                });
            }
        };

        match &outcome {
            AttemptOutcome::Succeeded { branch, commit_sha, pr_number, .. } => {
                events.push(attempt_event(
                    &self.actor_id,
                    EventType::AttemptSucceeded,
                    &params.attempt_id,
                    "succeeded",
                    serde_json::json!({
                        "attempt_id": params.attempt_id,
                        "task_id": params.task_id,
                        "branch": branch,
                        "commit_sha": commit_sha,
                        "pr_number": pr_number,
                    }),
                ));
            }
            AttemptOutcome::Failed { failure_type, summary } => {
                events.push(attempt_event(
                    &self.actor_id,
                    EventType::AttemptFailed,
                    &params.attempt_id,
                    "failed",
                    serde_json::json!({
                        "attempt_id": params.attempt_id,
                        "task_id": params.task_id,
                        "failure_type": failure_type,
                        "summary": summary,
                    }),
                ));
            }
        }

        self.report(params, &events, artifacts).await;
        Ok(outcome)
    }

    /// Steps 3-10 for container isolation: the job already ran them to
    /// completion and reported its own branch/commit/PR detail to the
    /// control plane via its own ingest call, so there is nothing left
    /// to drive here. All that remains is collecting the job's log
    /// stream as an artifact.
    async fn container_outcome(
        &self,
        attempt_id: &str,
        workspace: &WorkspaceInfo,
        events: &mut Vec<NewEvent>,
    ) -> Result<(AttemptOutcome, Vec<IngestArtifactRef>), WorkerError> {
        let mut artifact_refs = Vec::new();
        if let Some(log) = &workspace.job_log {
            artifact_refs.push(self.store_artifact(attempt_id, events, "container.log", log.as_bytes()).await?);
        }

        Ok((
            AttemptOutcome::Succeeded {
                branch: workspace.branch.clone(),
                commit_sha: String::new(),
                pr_number: None,
                pr_url: None,
            },
            artifact_refs,
        ))
    }

    /// Steps 3-10: everything between a live workspace and the final
    /// ingest report. Returns the outcome plus any stored artifact refs
    /// so step 11 can cite them.
    async fn drive_attempt(
        &self,
        params: &AttemptParams,
        workspace: &WorkspaceInfo,
        events: &mut Vec<NewEvent>,
    ) -> Result<(AttemptOutcome, Vec<IngestArtifactRef>), WorkerError> {
        // Step 3: load task.
        let task = load_task(&workspace.path, &self.target, &params.task_id)?;

        // Step 4: generate.
        if SYSTEM_SCOPES.contains(&task.scope.as_str()) {
            let result = match task.scope.as_str() {
                "bootstrap" => indexer::run_bootstrap(&workspace.path, &task, &self.actor_id),
                _ => indexer::run_topology(&workspace.path, &task, &self.actor_id),
            };
            events.extend(result.events);
            let mut artifact_refs = Vec::new();
            for artifact in result.artifacts {
                artifact_refs.push(self.store_artifact(&params.attempt_id, events, &artifact.name, &artifact.bytes).await?);
            }
            // System scopes never open a PR; the attempt succeeds with
            // no branch/commit to report.
            return Ok((
                AttemptOutcome::Succeeded {
                    branch: workspace.branch.clone(),
                    commit_sha: String::new(),
                    pr_number: None,
                    pr_url: None,
                },
                artifact_refs,
            ));
        }

        let generated = if BUILTIN_SCOPES.contains(&task.scope.as_str()) {
            builtin_scaffold(&task)
        } else {
            self.generate_via_oracle(&task, &workspace.path).await?
        };

        if task.scope == "services" || task.scope == "infra" {
            validate::validate_services_infra(&generated)?;
        }

        // Step 5: apply.
        for path in generated.keys() {
            policy::write_permitted(path, &task.allowed_paths)
                .map_err(|e| WorkerError::PathViolation(e.to_string()))?;
        }
        for (path, content) in &generated {
            let full = workspace.path.join(path);
            if let Some(parent) = full.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| WorkerError::WorkerError(format!("failed to create {parent:?}: {e}")))?;
            }
            let mut content = content.clone();
            if !content.ends_with('\n') {
                content.push('\n');
            }
            std::fs::write(&full, content).map_err(|e| WorkerError::WorkerError(format!("failed to write {path}: {e}")))?;
        }

        // Step 6: test.
        let changed_paths: Vec<String> = generated.keys().cloned().collect();
        match task.scope.as_str() {
            "ci" => validate::validate_ci(&workspace.path, &changed_paths).await?,
            "docs" => validate::validate_docs(&workspace.path, &task.allowed_paths)?,
            "tests" | "services" | "tools" => {
                validate::validate_with_test_runner(&workspace.path, &task.allowed_paths).await?
            }
            _ => {}
        }

        // Step 7: commit.
        let mut branch = format!("agent/{}", task.id);
        if remote_branch_exists(&workspace.path, &branch) {
            branch = format!("agent/{}-{}", task.id, Utc::now().format("%Y%m%d%H%M%S"));
        }

        let _ = run_git(&workspace.path, &["config", "user.email", "cairn@localhost"]);
        let _ = run_git(&workspace.path, &["config", "user.name", "cairn"]);
        run_git(&workspace.path, &["checkout", "-b", &branch])?;
        run_git(&workspace.path, &["add", "-A"])?;

        let status = run_git(&workspace.path, &["status", "--porcelain"])?;
        if status.trim().is_empty() {
            return Err(WorkerError::WorkerError("generation produced no changes".to_owned()));
        }

        let category = changed_paths
            .first()
            .map(|p| path_scope_category(p))
            .unwrap_or("default");
        let distinct_categories: std::collections::BTreeSet<&str> =
            changed_paths.iter().map(|p| path_scope_category(p)).collect();

        let message = format!("{}: {}\n\nTask-ID: {}", commit_prefix(category, &task.id), task.title, task.id);
        run_git(&workspace.path, &["commit", "-m", &message])?;
        let commit_sha = run_git(&workspace.path, &["rev-parse", "HEAD"])?.trim().to_owned();

        // Step 8: mergeability probe (local isolation only).
        if self.isolation.name() == "worktree" {
            probe_mergeable(&workspace.path, &self.target.default_branch)?;
        }

        if distinct_categories.len() > 1 {
            return Err(WorkerError::ScopeMismatch(format!(
                "changed paths span scopes: {:?}",
                distinct_categories
            )));
        }

        // Step 9: push & PR.
        run_git(&workspace.path, &["push", "-u", "origin", &branch])?;

        let existing = self.hosting.find_open_pr_by_head(&branch).await?;
        let (pr_number, pr_url) = match existing {
            Some(pr) => (Some(pr.number), Some(pr.url)),
            None => {
                let pr = self
                    .hosting
                    .create_pull_request(NewPullRequest {
                        title: format!("{}: {}", commit_prefix(category, &task.id), task.title),
                        body: format!("Task-ID: {}\n\nAcceptance criteria:\n{}", task.id, task
                            .acceptance_criteria
                            .iter()
                            .map(|c| format!("- {c}"))
                            .collect::<Vec<_>>()
                            .join("\n")),
                        head: branch.clone(),
                        base: self.target.default_branch.clone(),
                    })
                    .await?;
                events.push(new_event(
                    &self.actor_id,
                    EventType::PrCreated,
                    serde_json::json!({ "task_id": task.id, "pr_number": pr.number, "branch": branch }),
                ));
                (Some(pr.number), Some(pr.url))
            }
        };

        // Step 10: artifacts.
        let summary = format!(
            "Task {}\nScope: {}\nBranch: {}\nCommit: {}\nFiles:\n{}",
            task.id,
            task.scope,
            branch,
            commit_sha,
            changed_paths.join("\n"),
        );
        let artifact_ref = self.store_artifact(&params.attempt_id, events, "summary.log", summary.as_bytes()).await?;

        Ok((
            AttemptOutcome::Succeeded {
                branch,
                commit_sha,
                pr_number,
                pr_url,
            },
            vec![artifact_ref],
        ))
    }

    async fn generate_via_oracle(&self, task: &ResolvedTask, workspace: &Path) -> Result<BTreeMap<String, String>, WorkerError> {
        let request = build_oracle_request(task, workspace, None);
        let raw = self.oracle.generate(&request).await.map_err(WorkerError::from)?;

        match crate::oracle::parse_oracle_response(&raw, &task.allowed_paths) {
            Ok(file_set) => Ok(file_set.files),
            Err(first_error) => {
                let retry_request = build_oracle_request(
                    task,
                    workspace,
                    Some(RetryContext {
                        test_output: String::new(),
                        failure_type: "model_output_invalid".to_owned(),
                    }),
                );
                let raw = self.oracle.generate(&retry_request).await.map_err(WorkerError::from)?;
                let file_set = crate::oracle::parse_oracle_response(&raw, &task.allowed_paths).map_err(|_| {
                    WorkerError::ModelOutputInvalid(first_error.to_string())
                })?;
                Ok(file_set.files)
            }
        }
    }

    /// Stores one artifact and appends its `artifact.created` event (spec
    /// §4.6 step 10). The artifact's content hash doubles as its graph
    /// node id, so re-ingesting the same bytes for a retried attempt
    /// produces the same node rather than a duplicate.
    async fn store_artifact(
        &self,
        attempt_id: &str,
        events: &mut Vec<NewEvent>,
        name: &str,
        bytes: &[u8],
    ) -> Result<IngestArtifactRef, WorkerError> {
        let artifact_ref = self
            .artifacts
            .put(bytes, ArtifactKind::Log)
            .await
            .map_err(|e| WorkerError::WorkerError(format!("failed to store artifact {name}: {e}")))?;

        events.push(new_event(
            &self.actor_id,
            EventType::ArtifactCreated,
            serde_json::json!({
                "artifact_id": artifact_ref.hash,
                "attempt_id": attempt_id,
                "name": name,
                "uri": artifact_ref.uri,
            }),
        ));

        Ok(IngestArtifactRef {
            name: name.to_owned(),
            hash: artifact_ref.hash,
            uri: artifact_ref.uri,
        })
    }

    /// Step 11: a single ingest POST of `{target, bundle_id, events,
    /// artifacts}`. Ingest failures are logged and swallowed — the
    /// attempt's own outcome does not depend on the control plane being
    /// reachable.
    async fn report(&self, params: &AttemptParams, events: &[NewEvent], artifacts: Vec<IngestArtifactRef>) {
        let bundle = IngestBundle {
            target: params.target.clone(),
            bundle_id: deterministic_event_id(&params.attempt_id, "bundle"),
            events: events.to_vec(),
            artifacts,
        };

        if let Err(e) = self
            .http
            .post(format!("{}/ingest", self.control_plane_url))
            .bearer_auth(&self.control_plane_token)
            .json(&bundle)
            .send()
            .await
        {
            tracing::warn!(attempt_id = %params.attempt_id, error = %e, "failed to report attempt ingest bundle");
        }
    }
}

#[async_trait]
impl WorkerDispatcher for Worker {
    async fn dispatch(&self, params: AttemptParams) -> AttemptOutcome {
        self.run_attempt(&params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_bootstrap_id_synthesizes_system_task() {
        let task = reserved_system_task("bootstrap-radix-v1", "radix").expect("should synthesize");
        assert_eq!(task.scope, "bootstrap");
        assert!(task.title.contains("SYSTEM"));
        assert!(task.allowed_paths.is_empty());
    }

    #[test]
    fn reserved_topology_id_synthesizes_system_task() {
        let task = reserved_system_task("topology-radix-v1", "radix").expect("should synthesize");
        assert_eq!(task.scope, "topology");
    }

    #[test]
    fn wrong_version_is_not_reserved() {
        assert!(reserved_system_task("bootstrap-radix-v2", "radix").is_none());
    }

    #[test]
    fn unrelated_id_is_not_reserved() {
        assert!(reserved_system_task("fix-login-bug", "radix").is_none());
    }

    #[test]
    fn commit_prefix_maps_docs_scope() {
        assert_eq!(commit_prefix("docs", "t1"), "docs");
    }

    #[test]
    fn commit_prefix_maps_services_scope_to_research_by_default() {
        assert_eq!(commit_prefix("services", "t1"), "feat(research)");
    }

    #[test]
    fn commit_prefix_maps_geo_prefixed_services_task_to_geo() {
        assert_eq!(commit_prefix("services", "geo-123"), "feat(geo)");
    }

    #[test]
    fn commit_prefix_maps_infra_scope() {
        assert_eq!(commit_prefix("infra", "t1"), "chore(infra)");
    }

    #[test]
    fn commit_prefix_falls_back_to_chore() {
        assert_eq!(commit_prefix("default", "t1"), "chore");
    }

    #[test]
    fn path_scope_category_recognizes_known_prefixes() {
        assert_eq!(path_scope_category("docs/readme.md"), "docs");
        assert_eq!(path_scope_category(".github/workflows/ci.yml"), "ci");
        assert_eq!(path_scope_category("tools/fixit.rs"), "tools");
        assert_eq!(path_scope_category("infra/main.tf"), "infra");
        assert_eq!(path_scope_category("services/api/handler.rs"), "services");
        assert_eq!(path_scope_category("src/lib.rs"), "default");
    }

    #[test]
    fn builtin_scaffold_produces_one_file_per_allowed_path() {
        let task = ResolvedTask {
            id: "t1".to_owned(),
            title: "Document the widget".to_owned(),
            scope: "docs".to_owned(),
            priority: "normal".to_owned(),
            estimated_size: "small".to_owned(),
            allowed_paths: vec!["docs/widget.md".to_owned()],
            acceptance_criteria: vec!["explains the widget".to_owned()],
        };
        let files = builtin_scaffold(&task);
        assert_eq!(files.len(), 1);
        assert!(files["docs/widget.md"].contains("Document the widget"));
    }

    #[test]
    fn deterministic_event_ids_are_stable() {
        let a = deterministic_event_id("attempt-1", "bundle");
        let b = deterministic_event_id("attempt-1", "bundle");
        assert_eq!(a, b);
        assert_ne!(a, deterministic_event_id("attempt-2", "bundle"));
    }
}
