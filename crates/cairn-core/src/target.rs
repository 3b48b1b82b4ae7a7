//! Target and autonomy configuration: per-target YAML files,
//! resolvable either by explicit path or by name under a conventional
//! per-user config root.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TargetConfigError {
    #[error("failed to read target config at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse target config YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("could not determine a config root (no home directory)")]
    NoConfigRoot,
}

pub type Result<T> = std::result::Result<T, TargetConfigError>;

/// `.leviathan/{backlog,contract,policy}.yaml` relative to the cache dir.
const DEFAULT_BACKLOG_RELATIVE: &str = ".leviathan/backlog.yaml";
const DEFAULT_CONTRACT_RELATIVE: &str = ".leviathan/contract.yaml";
const DEFAULT_POLICY_RELATIVE: &str = ".leviathan/policy.yaml";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TargetConfig {
    pub name: String,
    pub repo_url: String,
    pub default_branch: String,
    pub local_cache_dir: PathBuf,
    #[serde(default)]
    pub backlog_path: Option<PathBuf>,
    #[serde(default)]
    pub contract_path: Option<PathBuf>,
    #[serde(default)]
    pub policy_path: Option<PathBuf>,
}

impl TargetConfig {
    /// Resolve `backlog_path`/`contract_path`/`policy_path` to absolute
    /// paths: relative paths are resolved under `local_cache_dir`,
    /// absolute paths are honoured verbatim, and a leading `~` is
    /// expanded to the user home.
    pub fn backlog_path(&self) -> PathBuf {
        self.resolve_or_default(&self.backlog_path, DEFAULT_BACKLOG_RELATIVE)
    }

    pub fn contract_path(&self) -> PathBuf {
        self.resolve_or_default(&self.contract_path, DEFAULT_CONTRACT_RELATIVE)
    }

    pub fn policy_path(&self) -> PathBuf {
        self.resolve_or_default(&self.policy_path, DEFAULT_POLICY_RELATIVE)
    }

    fn resolve_or_default(&self, configured: &Option<PathBuf>, default_relative: &str) -> PathBuf {
        match configured {
            Some(path) => resolve_path(path, &self.local_cache_dir),
            None => self.local_cache_dir.join(default_relative),
        }
    }
}

fn resolve_path(path: &Path, cache_dir: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cache_dir.join(path)
    }
}

/// The conventional per-user config root: `~/.cairn/targets/`.
pub fn config_root() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(".cairn").join("targets"))
        .ok_or(TargetConfigError::NoConfigRoot)
}

/// Load a target config by explicit path.
pub fn load_from_path(path: &Path) -> Result<TargetConfig> {
    let contents = std::fs::read_to_string(path).map_err(|source| TargetConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    Ok(serde_yaml::from_str(&contents)?)
}

/// Load a target config by name, resolved under [`config_root`] as
/// `<root>/<name>.yaml`.
pub fn load_by_name(name: &str) -> Result<TargetConfig> {
    let path = config_root()?.join(format!("{name}.yaml"));
    load_from_path(&path)
}

/// Optional mounted autonomy configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AutonomyConfig {
    #[serde(default)]
    pub autonomy_enabled: bool,
    pub target_id: String,
    #[serde(default)]
    pub allowed_path_prefixes: Vec<String>,
    #[serde(default = "default_max_open_prs")]
    pub max_open_prs: u32,
    #[serde(default = "default_max_attempts_per_task")]
    pub max_attempts_per_task: u32,
    #[serde(default = "default_circuit_breaker_failures")]
    pub circuit_breaker_failures: u32,
    pub control_plane_url: String,
    #[serde(default)]
    pub worker_image: Option<String>,
    #[serde(default)]
    pub worker_namespace: Option<String>,
    #[serde(default)]
    pub workspace_dir: Option<PathBuf>,
}

fn default_max_open_prs() -> u32 {
    5
}

fn default_max_attempts_per_task() -> u32 {
    3
}

fn default_circuit_breaker_failures() -> u32 {
    5
}

pub fn load_autonomy_config(path: &Path) -> Result<AutonomyConfig> {
    let contents = std::fs::read_to_string(path).map_err(|source| TargetConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    Ok(serde_yaml::from_str(&contents)?)
}
