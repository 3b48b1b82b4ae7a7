//! Ephemeral container job isolation backend: the scheduler
//! submits a single-shot job to the container orchestrator's HTTP API
//! carrying the worker entrypoint and env vars, polls status until
//! terminal, and collects the job's log stream as an artifact.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{Isolation, IsolationError, Result, WorkspaceInfo};

/// `backoffLimit = 0` (retries are controlled by our scheduler) plus a
/// TTL after finish so artifacts stay collectable but storage is bounded.
#[derive(Debug, Clone)]
pub struct ContainerJobConfig {
    pub orchestrator_url: String,
    pub image: String,
    pub namespace: String,
    pub ttl_seconds_after_finished: u64,
    pub poll_interval: Duration,
}

#[derive(Debug, Serialize)]
struct JobSpec<'a> {
    image: &'a str,
    namespace: &'a str,
    env: Vec<(&'a str, &'a str)>,
    backoff_limit: u32,
    ttl_seconds_after_finished: u64,
}

#[derive(Debug, Deserialize)]
struct SubmittedJob {
    job_id: String,
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
enum JobPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Deserialize)]
struct JobStatus {
    phase: JobPhase,
    #[serde(default)]
    message: Option<String>,
}

pub struct ContainerJobIsolation {
    client: reqwest::Client,
    config: ContainerJobConfig,
}

impl ContainerJobIsolation {
    pub fn new(config: ContainerJobConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    async fn poll_until_terminal(&self, job_id: &str) -> Result<()> {
        loop {
            let status: JobStatus = self
                .client
                .get(format!("{}/jobs/{job_id}", self.config.orchestrator_url))
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;

            match status.phase {
                JobPhase::Succeeded => return Ok(()),
                JobPhase::Failed => {
                    let detail = match status.message {
                        Some(message) if !message.is_empty() => message,
                        _ => self.fetch_logs(job_id).await.unwrap_or_default(),
                    };
                    return Err(IsolationError::JobFailed {
                        job_id: job_id.to_owned(),
                        detail,
                    });
                }
                JobPhase::Pending | JobPhase::Running => {
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }
    }

    /// Fetch the job's log stream, to be stored as an artifact by the caller.
    pub async fn fetch_logs(&self, job_id: &str) -> Result<String> {
        let logs = self
            .client
            .get(format!("{}/jobs/{job_id}/logs", self.config.orchestrator_url))
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(logs)
    }
}

#[async_trait]
impl Isolation for ContainerJobIsolation {
    fn name(&self) -> &str {
        "container"
    }

    async fn create_workspace(
        &self,
        attempt_id: &str,
        default_branch: &str,
        task_id: &str,
        target: &str,
    ) -> Result<WorkspaceInfo> {
        let branch = format!("attempt/{attempt_id}");
        let spec = JobSpec {
            image: &self.config.image,
            namespace: &self.config.namespace,
            env: vec![
                ("CAIRN_ATTEMPT_ID", attempt_id),
                ("CAIRN_DEFAULT_BRANCH", default_branch),
                ("CAIRN_TASK_ID", task_id),
                ("CAIRN_TARGET", target),
            ],
            backoff_limit: 0,
            ttl_seconds_after_finished: self.config.ttl_seconds_after_finished,
        };

        let submitted: SubmittedJob = self
            .client
            .post(format!("{}/jobs", self.config.orchestrator_url))
            .json(&spec)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        // By the time this resolves the job has run the worker entrypoint
        // (`cairn worker run`, parametrized from the env above) to
        // completion inside its own container; there is no local checkout
        // to drive further.
        self.poll_until_terminal(&submitted.job_id).await?;
        let job_log = self.fetch_logs(&submitted.job_id).await.ok();

        Ok(WorkspaceInfo {
            path: PathBuf::from("/workspace"),
            branch,
            job_id: Some(submitted.job_id),
            job_log,
        })
    }

    async fn destroy_workspace(&self, info: &WorkspaceInfo) -> Result<()> {
        if let Some(job_id) = &info.job_id {
            self.client
                .delete(format!("{}/jobs/{job_id}", self.config.orchestrator_url))
                .send()
                .await?
                .error_for_status()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_spec_serializes_with_zero_backoff() {
        let spec = JobSpec {
            image: "cairn-worker:latest",
            namespace: "cairn",
            env: vec![("CAIRN_ATTEMPT_ID", "attempt-1")],
            backoff_limit: 0,
            ttl_seconds_after_finished: 600,
        };
        let value = serde_json::to_value(&spec).unwrap();
        assert_eq!(value["backoff_limit"], 0);
        assert_eq!(value["ttl_seconds_after_finished"], 600);
    }

    #[test]
    fn job_status_parses_terminal_phases() {
        let succeeded: JobStatus = serde_json::from_str(r#"{"phase":"succeeded"}"#).unwrap();
        assert_eq!(succeeded.phase, JobPhase::Succeeded);

        let failed: JobStatus =
            serde_json::from_str(r#"{"phase":"failed","message":"oom"}"#).unwrap();
        assert_eq!(failed.phase, JobPhase::Failed);
        assert_eq!(failed.message.as_deref(), Some("oom"));
    }
}
