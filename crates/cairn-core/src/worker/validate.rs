//! Per-scope test/validator step. Mirrors the
//! subprocess timeout/capture shape used for invariant checks elsewhere
//! in this crate, generalized to a handful of scope-specific validators.

use std::path::Path;
use std::time::Duration;

use regex_lite::Regex;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use super::WorkerError;

const VALIDATOR_TIMEOUT: Duration = Duration::from_secs(120);

/// Shell commands that are never allowed to run for `services`/`infra`
/// scopes, regardless of whether they appear in generated file content
/// or a validator command line.
const FORBIDDEN_COMMAND_PATTERNS: &[&str] = &[
    r"(?i)terraform\s+(apply|destroy)",
    r"(?i)aws\s+.*\s+(create|update|delete|put)",
    r"(?i)sam\s+(deploy|delete)",
    r"(?i)kubectl\s+(apply|create|delete|patch)",
    r"(?i)helm\s+(install|upgrade|delete)",
    r"(?i)gcloud\s+.*\s+(create|update|delete)",
    r"(?i)az\s+.*\s+(create|update|delete)",
];

/// Reject a command or a blob of generated content that references one
/// of the forbidden infrastructure-mutation patterns.
pub fn check_forbidden_commands(text: &str) -> Result<(), WorkerError> {
    for pattern in FORBIDDEN_COMMAND_PATTERNS {
        let re = Regex::new(pattern).expect("static forbidden-command pattern is valid");
        if let Some(m) = re.find(text) {
            return Err(WorkerError::UnsafeCommand(m.as_str().to_owned()));
        }
    }
    Ok(())
}

async fn run_with_timeout(mut command: Command) -> Result<(bool, String), WorkerError> {
    let mut child = command
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .map_err(|e| WorkerError::WorkerError(format!("failed to spawn validator: {e}")))?;

    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();

    let read_output = async {
        let mut out = Vec::new();
        let mut err = Vec::new();
        if let Some(ref mut pipe) = stdout_pipe {
            let _ = pipe.read_to_end(&mut out).await;
        }
        if let Some(ref mut pipe) = stderr_pipe {
            let _ = pipe.read_to_end(&mut err).await;
        }
        (out, err)
    };

    match tokio::time::timeout(VALIDATOR_TIMEOUT, async {
        let (status, (out, err)) = tokio::join!(child.wait(), read_output);
        (status, out, err)
    })
    .await
    {
        Ok((Ok(status), out, err)) => {
            let mut combined = String::from_utf8_lossy(&out).into_owned();
            combined.push_str(&String::from_utf8_lossy(&err));
            Ok((status.success(), combined))
        }
        Ok((Err(e), ..)) => Err(WorkerError::WorkerError(format!("validator wait failed: {e}"))),
        Err(_) => {
            let _ = child.kill().await;
            Err(WorkerError::Timeout("validator exceeded its time budget".to_owned()))
        }
    }
}

/// `ci` scope: shellcheck-style syntax validation for shell scripts,
/// parse validation for workflow YAML.
pub async fn validate_ci(workspace: &Path, changed_paths: &[String]) -> Result<(), WorkerError> {
    for rel in changed_paths {
        let full = workspace.join(rel);
        if rel.ends_with(".sh") {
            let mut cmd = Command::new("bash");
            cmd.args(["-n", &full.to_string_lossy()]);
            let (passed, output) = run_with_timeout(cmd).await?;
            if !passed {
                return Err(WorkerError::WorkerError(format!("shell syntax check failed for {rel}: {output}")));
            }
        } else if rel.ends_with(".yml") || rel.ends_with(".yaml") {
            let contents = tokio::fs::read_to_string(&full)
                .await
                .map_err(|e| WorkerError::WorkerError(format!("failed to read {rel}: {e}")))?;
            serde_yaml::from_str::<serde_yaml::Value>(&contents)
                .map_err(|e| WorkerError::WorkerError(format!("invalid YAML in {rel}: {e}")))?;
        }
    }
    Ok(())
}

/// `docs` scope: existence is the whole contract.
pub fn validate_docs(workspace: &Path, allowed_paths: &[String]) -> Result<(), WorkerError> {
    for rel in allowed_paths {
        if !workspace.join(rel).exists() {
            return Err(WorkerError::WorkerError(format!("expected doc path {rel} was not written")));
        }
    }
    Ok(())
}

/// `tests`/`services`/`tools` scopes: run the project's own test runner,
/// scoped to the files named in `allowed_paths`. An empty list is a
/// pass-by-skip — there is nothing to validate.
pub async fn validate_with_test_runner(workspace: &Path, allowed_paths: &[String]) -> Result<(), WorkerError> {
    if allowed_paths.is_empty() {
        return Ok(());
    }

    let mut cmd = if workspace.join("Cargo.toml").exists() {
        let mut c = Command::new("cargo");
        c.arg("test");
        c
    } else if workspace.join("package.json").exists() {
        let mut c = Command::new("npm");
        c.args(["test", "--silent"]);
        c
    } else {
        // No recognized test runner in the checkout: nothing to invoke.
        return Ok(());
    };
    cmd.current_dir(workspace);

    let (passed, output) = run_with_timeout(cmd).await?;
    if !passed {
        return Err(WorkerError::WorkerError(format!("test run failed:\n{output}")));
    }
    Ok(())
}

/// `services`/`infra` scopes: reject generated content that references
/// a forbidden infrastructure-mutation command before anything is run.
pub fn validate_services_infra(generated: &std::collections::BTreeMap<String, String>) -> Result<(), WorkerError> {
    for content in generated.values() {
        check_forbidden_commands(content)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_terraform_apply() {
        assert!(check_forbidden_commands("run: terraform apply -auto-approve").is_err());
    }

    #[test]
    fn rejects_kubectl_delete() {
        assert!(check_forbidden_commands("kubectl delete pod foo").is_err());
    }

    #[test]
    fn allows_kubectl_get() {
        assert!(check_forbidden_commands("kubectl get pods").is_ok());
    }

    #[test]
    fn allows_plain_shell() {
        assert!(check_forbidden_commands("echo hello && ls -la").is_ok());
    }
}
