//! Scheduler: one external tick, one task dispatched (or none).

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use cairn_store::event::{Event, EventType, NewEvent};
use cairn_store::graph::{Graph, NodeType, PropertyFilter};
use cairn_store::journal::Journal;
use chrono::{Duration as ChronoDuration, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::backlog::{self, TaskRecord};
use crate::github::{task_id_from_branch, GitHostingClient};
use crate::policy;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Journal(#[from] cairn_store::journal::JournalError),

    #[error(transparent)]
    Graph(#[from] cairn_store::graph::GraphError),

    #[error(transparent)]
    GitHosting(#[from] crate::github::GitHostingError),

    #[error("failed to fetch backlog: {0}")]
    BacklogFetch(String),

    #[error(transparent)]
    Backlog(#[from] backlog::BacklogError),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Fetches the raw backlog YAML for a target. Implemented separately from
/// the worker's git clone so the scheduler can be tested without a git
/// subprocess (e.g. backed by a cached checkout the scheduler maintains,
/// or the hosting API's raw-file endpoint).
#[async_trait]
pub trait BacklogSource: Send + Sync {
    async fn fetch(&self, target: &str) -> std::result::Result<String, String>;
}

/// Outcome of one attempt dispatch, as reported back to the scheduler.
/// Produced by the worker; the scheduler never inspects worker
/// internals, only this outcome.
#[derive(Debug, Clone)]
pub enum AttemptOutcome {
    Succeeded {
        branch: String,
        commit_sha: String,
        pr_number: Option<u64>,
        pr_url: Option<String>,
    },
    Failed {
        failure_type: String,
        summary: String,
    },
}

#[derive(Debug, Clone)]
pub struct AttemptParams {
    pub target: String,
    pub task_id: String,
    pub attempt_id: String,
    pub attempt_number: u32,
}

#[async_trait]
pub trait WorkerDispatcher: Send + Sync {
    async fn dispatch(&self, params: AttemptParams) -> AttemptOutcome;
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts_per_task: u32,
    pub backoff_seconds: i64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts_per_task: 3,
            backoff_seconds: 60,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub target: String,
    pub max_open_prs: u32,
    pub circuit_breaker_failures: u32,
    pub retry: RetryPolicy,
    /// Hot path prefixes; empty disables the check.
    pub hot_paths: Vec<String>,
    /// Path prefixes a task's `allowed_paths` must fall under, from the
    /// target's mounted autonomy config. Empty means unrestricted.
    pub allowed_path_prefixes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// An attempt was dispatched for this task.
    Dispatched { task_id: String, attempt_id: String },
    /// No task was ready, or a guardrail suppressed dispatch this tick.
    Noop { reason: String },
}

pub struct Scheduler {
    journal: Arc<dyn Journal>,
    graph: Arc<dyn Graph>,
    hosting: Arc<dyn GitHostingClient>,
    backlog_source: Arc<dyn BacklogSource>,
    dispatcher: Arc<dyn WorkerDispatcher>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        journal: Arc<dyn Journal>,
        graph: Arc<dyn Graph>,
        hosting: Arc<dyn GitHostingClient>,
        backlog_source: Arc<dyn BacklogSource>,
        dispatcher: Arc<dyn WorkerDispatcher>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            journal,
            graph,
            hosting,
            backlog_source,
            dispatcher,
            config,
        }
    }

    /// Run one tick of the per-tick algorithm.
    pub async fn tick(&self) -> Result<TickOutcome> {
        // Step 1: open-PR capacity.
        let open_prs = self.hosting.list_open_agent_prs().await?;
        if open_prs.len() as u32 >= self.config.max_open_prs {
            return Ok(TickOutcome::Noop {
                reason: "max_open_prs reached".to_owned(),
            });
        }

        // Circuit breaker: sliding window over this target's terminal
        // attempt events, read from the journal in append order.
        if self.circuit_is_open().await? {
            return Ok(TickOutcome::Noop {
                reason: "circuit breaker open".to_owned(),
            });
        }

        // Step 2: ingest backlog.
        let raw = self
            .backlog_source
            .fetch(&self.config.target)
            .await
            .map_err(SchedulerError::BacklogFetch)?;
        let parsed = backlog::parse(&raw)?;
        self.ingest_missing_tasks(&parsed.tasks).await?;

        // Step 3: in-flight latch.
        let in_flight: HashSet<String> = open_prs
            .iter()
            .filter_map(|pr| task_id_from_branch(&pr.branch))
            .collect();

        // Hot-path conflict pre-check (supplement). Build the set of
        // paths already touched by open PRs once, reused per candidate.
        let touched_paths = self.hot_paths_touched_by_open_prs(&open_prs).await?;

        // Step 4: select next task.
        let Some(task) = self.select_next_task(&parsed.tasks, &in_flight, &touched_paths).await? else {
            return Ok(TickOutcome::Noop {
                reason: "no ready task".to_owned(),
            });
        };

        let task_id = task.id.clone().expect("normalized by backlog::parse");
        let attempt_number = self.next_attempt_number(&task_id).await?;
        let attempt_id = format!("attempt-{}", Uuid::new_v4());

        // Step 6: emit attempt.created.
        self.append(
            EventType::AttemptCreated,
            serde_json::json!({
                "attempt_id": attempt_id,
                "task_id": task_id,
                "attempt_number": attempt_number,
                "status": "created",
            }),
        )
        .await?;

        // Step 7: dispatch + attempt.started.
        self.append(
            EventType::AttemptStarted,
            serde_json::json!({"attempt_id": attempt_id, "task_id": task_id}),
        )
        .await?;

        let outcome = self
            .dispatcher
            .dispatch(AttemptParams {
                target: self.config.target.clone(),
                task_id: task_id.clone(),
                attempt_id: attempt_id.clone(),
                attempt_number,
            })
            .await;

        // Step 8-10: record outcome and apply retry policy.
        match outcome {
            AttemptOutcome::Succeeded {
                branch,
                commit_sha,
                pr_number,
                pr_url,
            } => {
                self.append(
                    EventType::AttemptSucceeded,
                    serde_json::json!({
                        "attempt_id": attempt_id,
                        "task_id": task_id,
                        "branch": branch,
                        "commit_sha": commit_sha,
                        "pr_number": pr_number,
                        "pr_url": pr_url,
                    }),
                )
                .await?;
                self.append(
                    EventType::TaskCompleted,
                    serde_json::json!({"task_id": task_id, "status": "completed"}),
                )
                .await?;
            }
            AttemptOutcome::Failed { failure_type, summary } => {
                self.append(
                    EventType::AttemptFailed,
                    serde_json::json!({
                        "attempt_id": attempt_id,
                        "task_id": task_id,
                        "failure_type": failure_type,
                        "summary": summary,
                    }),
                )
                .await?;

                if attempt_number < self.config.retry.max_attempts_per_task {
                    let backoff_until =
                        Utc::now() + ChronoDuration::seconds(self.config.retry.backoff_seconds);
                    self.append(
                        EventType::RetryScheduled,
                        serde_json::json!({
                            "task_id": task_id,
                            "attempt_id": attempt_id,
                            "backoff_until": backoff_until,
                        }),
                    )
                    .await?;
                } else {
                    self.append(
                        EventType::TaskCompleted,
                        serde_json::json!({
                            "task_id": task_id,
                            "status": "failed",
                            "reason": "max_attempts_exceeded",
                        }),
                    )
                    .await?;
                }
            }
        }

        Ok(TickOutcome::Dispatched { task_id, attempt_id })
    }

    async fn append(&self, event_type: EventType, payload: serde_json::Value) -> Result<Event> {
        let event = self
            .journal
            .append(NewEvent {
                event_id: Uuid::new_v4().to_string(),
                event_type,
                timestamp: Utc::now(),
                actor_id: "scheduler".to_owned(),
                payload,
            })
            .await?;
        self.graph.apply(&event).await?;
        Ok(event)
    }

    async fn ingest_missing_tasks(&self, tasks: &[TaskRecord]) -> Result<()> {
        for task in tasks {
            let task_id = task.id.clone().expect("normalized by backlog::parse");
            if self.graph.get_node(&task_id).await?.is_some() {
                continue;
            }
            self.append(
                EventType::TaskCreated,
                serde_json::json!({
                    "task_id": task_id,
                    "target_id": self.config.target,
                    "title": task.title,
                    "scope": task.scope,
                    "priority": task.priority,
                    "estimated_size": task.estimated_size,
                    "allowed_paths": task.allowed_paths,
                    "acceptance_criteria": task.acceptance_criteria,
                    "ready": task.ready,
                    "dependencies": task.dependencies,
                    "status": task.status.clone().unwrap_or_else(|| "pending".to_owned()),
                }),
            )
            .await?;

            if !task.dependencies.is_empty() {
                self.append(
                    EventType::TaskBlocked,
                    serde_json::json!({"task_id": task_id, "status": "blocked"}),
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn select_next_task(
        &self,
        tasks: &[TaskRecord],
        in_flight: &HashSet<String>,
        hot_touched: &HashSet<String>,
    ) -> Result<Option<TaskRecord>> {
        let mut candidates: Vec<&TaskRecord> = Vec::new();
        for task in tasks {
            let task_id = task.id.clone().expect("normalized by backlog::parse");

            if !task.ready {
                continue;
            }
            if !matches!(task.status.as_deref(), Some("pending") | None) {
                continue;
            }
            if !task.dependencies.is_empty() {
                continue;
            }
            if policy::scope_permitted(&task.allowed_paths, &self.config.allowed_path_prefixes, &[]).is_err() {
                continue;
            }
            if in_flight.contains(&task_id) {
                continue;
            }
            if self.next_attempt_number(&task_id).await? > self.config.retry.max_attempts_per_task {
                continue;
            }
            if task
                .allowed_paths
                .iter()
                .any(|p| hot_touched.iter().any(|touched| paths_overlap(p, touched)))
            {
                continue;
            }
            candidates.push(task);
        }

        candidates.sort_by_key(|t| priority_rank(t.priority.as_deref()));
        Ok(candidates.into_iter().next().cloned())
    }

    async fn next_attempt_number(&self, task_id: &str) -> Result<u32> {
        let attempts = self
            .graph
            .query_nodes(
                Some(NodeType::Attempt),
                &[PropertyFilter {
                    key: "task_id".to_owned(),
                    value: serde_json::Value::String(task_id.to_owned()),
                }],
            )
            .await?;
        Ok(attempts.len() as u32 + 1)
    }

    async fn circuit_is_open(&self) -> Result<bool> {
        let window = self.config.circuit_breaker_failures as usize;
        if window == 0 {
            return Ok(false);
        }
        let events = self.journal.scan(None, None).await?;
        let terminal: Vec<&Event> = events
            .iter()
            .filter(|e| {
                matches!(e.event_type, EventType::AttemptFailed | EventType::AttemptSucceeded)
                    && e.payload.get("task_id").and_then(|v| v.as_str()).is_some()
            })
            .collect();

        if terminal.len() < window {
            return Ok(false);
        }
        let recent = &terminal[terminal.len() - window..];
        Ok(recent.iter().all(|e| e.event_type == EventType::AttemptFailed))
    }

    async fn hot_paths_touched_by_open_prs(
        &self,
        open_prs: &[crate::github::OpenPullRequest],
    ) -> Result<HashSet<String>> {
        if self.config.hot_paths.is_empty() {
            return Ok(HashSet::new());
        }
        let mut touched = HashSet::new();
        for pr in open_prs {
            let files = self.hosting.list_pr_files(pr.number).await?;
            for file in files {
                if self.config.hot_paths.iter().any(|hot| paths_overlap(hot, &file)) {
                    touched.insert(file);
                }
            }
        }
        Ok(touched)
    }
}

fn priority_rank(priority: Option<&str>) -> u8 {
    match priority {
        Some("high") => 0,
        Some("medium") => 1,
        Some("low") => 2,
        _ => 1,
    }
}

fn paths_overlap(a: &str, b: &str) -> bool {
    let a = a.trim_end_matches('*').trim_end_matches('/');
    let b = b.trim_end_matches('*').trim_end_matches('/');
    a == b || a.starts_with(b) || b.starts_with(a)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_store::graph::memory::MemoryGraph;
    use cairn_store::journal::ndjson::NdjsonJournal;
    use std::sync::Mutex;

    struct FakeHosting {
        open_prs: Vec<crate::github::OpenPullRequest>,
        files_by_pr: std::collections::HashMap<u64, Vec<String>>,
    }

    #[async_trait]
    impl GitHostingClient for FakeHosting {
        async fn list_open_agent_prs(&self) -> crate::github::Result<Vec<crate::github::OpenPullRequest>> {
            Ok(self.open_prs.clone())
        }
        async fn list_pr_files(&self, pr_number: u64) -> crate::github::Result<Vec<String>> {
            Ok(self.files_by_pr.get(&pr_number).cloned().unwrap_or_default())
        }
        async fn combined_check_status(
            &self,
            _commit_sha: &str,
        ) -> crate::github::Result<crate::github::CombinedCheckStatus> {
            Ok(crate::github::CombinedCheckStatus::Success)
        }
        async fn create_pull_request(
            &self,
            _new_pr: crate::github::NewPullRequest,
        ) -> crate::github::Result<crate::github::CreatedPullRequest> {
            unimplemented!("not exercised by scheduler tests")
        }
    }

    struct FakeBacklog(String);

    #[async_trait]
    impl BacklogSource for FakeBacklog {
        async fn fetch(&self, _target: &str) -> std::result::Result<String, String> {
            Ok(self.0.clone())
        }
    }

    struct FakeDispatcher {
        outcome: Mutex<Option<AttemptOutcome>>,
    }

    #[async_trait]
    impl WorkerDispatcher for FakeDispatcher {
        async fn dispatch(&self, _params: AttemptParams) -> AttemptOutcome {
            self.outcome.lock().unwrap().take().expect("dispatch called once")
        }
    }

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            target: "radix".to_owned(),
            max_open_prs: 5,
            circuit_breaker_failures: 3,
            retry: RetryPolicy::default(),
            hot_paths: vec![],
            allowed_path_prefixes: vec![],
        }
    }

    async fn scheduler(
        backlog_yaml: &str,
        open_prs: Vec<crate::github::OpenPullRequest>,
        outcome: AttemptOutcome,
    ) -> (Scheduler, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let journal = Arc::new(NdjsonJournal::open(dir.path().join("journal.ndjson")).await.unwrap());
        let graph = Arc::new(MemoryGraph::new());
        let hosting = Arc::new(FakeHosting {
            open_prs,
            files_by_pr: Default::default(),
        });
        let backlog_source = Arc::new(FakeBacklog(backlog_yaml.to_owned()));
        let dispatcher = Arc::new(FakeDispatcher {
            outcome: Mutex::new(Some(outcome)),
        });
        (
            Scheduler::new(journal, graph, hosting, backlog_source, dispatcher, config()),
            dir,
        )
    }

    #[tokio::test]
    async fn dispatches_the_first_ready_task() {
        let yaml = r#"
tasks:
  - id: t1
    ready: true
    allowed_paths: ["docs/"]
"#;
        let (scheduler, _dir) = scheduler(
            yaml,
            vec![],
            AttemptOutcome::Succeeded {
                branch: "agent/t1".to_owned(),
                commit_sha: "abc123".to_owned(),
                pr_number: Some(1),
                pr_url: Some("https://host/repo/pull/1".to_owned()),
            },
        )
        .await;

        let outcome = scheduler.tick().await.unwrap();
        assert!(matches!(outcome, TickOutcome::Dispatched { task_id, .. } if task_id == "t1"));
    }

    #[tokio::test]
    async fn not_ready_task_is_skipped() {
        let yaml = r#"
tasks:
  - id: t1
    ready: false
    allowed_paths: ["docs/"]
"#;
        let (scheduler, _dir) = scheduler(
            yaml,
            vec![],
            AttemptOutcome::Failed {
                failure_type: "unused".to_owned(),
                summary: "unused".to_owned(),
            },
        )
        .await;

        let outcome = scheduler.tick().await.unwrap();
        assert!(matches!(outcome, TickOutcome::Noop { .. }));
    }

    #[tokio::test]
    async fn in_flight_task_is_skipped() {
        let yaml = r#"
tasks:
  - id: t1
    ready: true
    allowed_paths: ["docs/"]
"#;
        let (scheduler, _dir) = scheduler(
            yaml,
            vec![crate::github::OpenPullRequest {
                number: 9,
                branch: "agent/t1".to_owned(),
            }],
            AttemptOutcome::Failed {
                failure_type: "unused".to_owned(),
                summary: "unused".to_owned(),
            },
        )
        .await;

        let outcome = scheduler.tick().await.unwrap();
        assert!(matches!(outcome, TickOutcome::Noop { .. }));
    }

    #[tokio::test]
    async fn max_open_prs_suppresses_the_whole_tick() {
        let yaml = r#"
tasks:
  - id: t1
    ready: true
    allowed_paths: ["docs/"]
"#;
        let open_prs: Vec<_> = (0..5)
            .map(|i| crate::github::OpenPullRequest {
                number: i,
                branch: format!("agent/other-{i}"),
            })
            .collect();
        let (scheduler, _dir) = scheduler(
            yaml,
            open_prs,
            AttemptOutcome::Failed {
                failure_type: "unused".to_owned(),
                summary: "unused".to_owned(),
            },
        )
        .await;

        let outcome = scheduler.tick().await.unwrap();
        assert_eq!(
            outcome,
            TickOutcome::Noop { reason: "max_open_prs reached".to_owned() }
        );
    }

    #[tokio::test]
    async fn failed_attempt_under_cap_schedules_retry() {
        let yaml = r#"
tasks:
  - id: t1
    ready: true
    allowed_paths: ["docs/"]
"#;
        let (scheduler, _dir) = scheduler(
            yaml,
            vec![],
            AttemptOutcome::Failed {
                failure_type: "model_output_invalid".to_owned(),
                summary: "bad response".to_owned(),
            },
        )
        .await;

        scheduler.tick().await.unwrap();
        let events = scheduler.journal.scan(None, None).await.unwrap();
        assert!(events.iter().any(|e| e.event_type == EventType::RetryScheduled));
        assert!(!events.iter().any(|e| e.event_type == EventType::TaskCompleted));
    }
}
