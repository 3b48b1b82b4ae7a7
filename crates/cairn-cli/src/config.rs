//! Environment-driven process configuration.
//!
//! Unlike the target/backlog configuration in `cairn_core::target` (YAML,
//! loaded per-target from the cloned repo), this is the orchestrator
//! process's own configuration: which journal/graph/artifact back-ends to
//! use, the control-plane bearer token, and the handful of optional
//! integration settings listed in the environment variable table. Also
//! keeps a small on-disk config file for settings an operator would
//! rather not re-type into every shell, following the same
//! CLI-flag > env var > config file > default resolution chain.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use cairn_store::config::DbConfig;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    pub database: DatabaseSection,
    pub control_plane: ControlPlaneSection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ControlPlaneSection {
    pub token: String,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Always uses XDG layout: `$XDG_CONFIG_HOME/cairn` or `~/.config/cairn`.
/// We intentionally ignore the platform-specific `dirs::config_dir()`
/// (which returns `~/Library/Application Support` on macOS).
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("cairn");
    }
    dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".config").join("cairn")
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix, since `control_plane.token` lives
/// here in plaintext.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir).with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents).with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Backend selection
// -----------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalBackend {
    Ndjson { path: PathBuf },
    Postgres,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphBackend {
    Memory { rebuild_on_start: bool },
    Postgres,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactBackend {
    File { dir: PathBuf },
    Object { base_url: String, bucket: String },
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved process configuration, ready for use by `main.rs`'s
/// subcommands.
#[derive(Debug, Clone)]
pub struct CairnConfig {
    pub db_config: DbConfig,
    pub control_plane_token: String,
    /// Base URL of the running `serve` process a standalone worker posts
    /// its ingest bundle to.
    pub control_plane_url: String,
    pub journal_backend: JournalBackend,
    pub graph_backend: GraphBackend,
    pub artifact_backend: ArtifactBackend,
    pub observability_url: Option<String>,
    pub observability_enabled: bool,
    pub worker_image: Option<String>,
    pub worker_namespace: Option<String>,
    pub worker_orchestrator_url: Option<String>,
    pub workspace_override: Option<PathBuf>,
    pub model_api_key: Option<String>,
    pub model_name: Option<String>,
    pub model_endpoint: Option<String>,
    /// Path to the mounted autonomy configuration file read by `serve`'s
    /// `/v1/autonomy/status` endpoint. `None` if the
    /// process was started without one; autonomy then defaults to off.
    pub autonomy_config_path: Option<PathBuf>,
}

fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

impl CairnConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config
    /// file > default, for the two settings an operator is likely to pass
    /// on the command line; everything else is environment-only.
    pub fn resolve(cli_db_url: Option<&str>, cli_token: Option<&str>) -> Result<Self> {
        let file_config = load_config().ok();

        let db_url = if let Some(url) = cli_db_url {
            url.to_owned()
        } else if let Ok(url) = std::env::var("CAIRN_DATABASE_URL") {
            url
        } else if let Some(ref cfg) = file_config {
            cfg.database.url.clone()
        } else {
            DbConfig::DEFAULT_URL.to_owned()
        };
        let db_config = DbConfig::new(db_url);

        let control_plane_token = if let Some(token) = cli_token {
            token.to_owned()
        } else if let Ok(token) = std::env::var("CAIRN_CONTROL_PLANE_TOKEN") {
            token
        } else if let Some(ref cfg) = file_config {
            cfg.control_plane.token.clone()
        } else {
            bail!(
                "control-plane token not found; set CAIRN_CONTROL_PLANE_TOKEN or write a config file at {}",
                config_path().display()
            );
        };

        let journal_backend = match std::env::var("CAIRN_JOURNAL_BACKEND").as_deref() {
            Ok("postgres") => JournalBackend::Postgres,
            _ => {
                let path = std::env::var("CAIRN_JOURNAL_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| default_data_dir().join("journal.ndjson"));
                JournalBackend::Ndjson { path }
            }
        };

        let graph_backend = match std::env::var("CAIRN_GRAPH_BACKEND").as_deref() {
            Ok("postgres") => GraphBackend::Postgres,
            _ => GraphBackend::Memory { rebuild_on_start: env_flag("CAIRN_REBUILD_ON_START", true) },
        };

        let artifact_backend = match std::env::var("CAIRN_ARTIFACT_BACKEND").as_deref() {
            Ok("s3") | Ok("object") => ArtifactBackend::Object {
                base_url: std::env::var("CAIRN_ARTIFACT_BUCKET_URL")
                    .context("CAIRN_ARTIFACT_BUCKET_URL is required when CAIRN_ARTIFACT_BACKEND=s3")?,
                bucket: std::env::var("CAIRN_ARTIFACT_BUCKET")
                    .context("CAIRN_ARTIFACT_BUCKET is required when CAIRN_ARTIFACT_BACKEND=s3")?,
            },
            _ => {
                let dir = std::env::var("CAIRN_ARTIFACTS_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| default_data_dir().join("artifacts"));
                ArtifactBackend::File { dir }
            }
        };

        let control_plane_url = std::env::var("CAIRN_CONTROL_PLANE_URL").unwrap_or_else(|_| "http://localhost:8080".to_owned());

        Ok(Self {
            db_config,
            control_plane_token,
            control_plane_url,
            journal_backend,
            graph_backend,
            artifact_backend,
            observability_url: std::env::var("CAIRN_OBSERVABILITY_URL").ok(),
            observability_enabled: env_flag("CAIRN_OBSERVABILITY_ENABLED", false),
            worker_image: std::env::var("CAIRN_WORKER_IMAGE").ok(),
            worker_namespace: std::env::var("CAIRN_WORKER_NAMESPACE").ok(),
            worker_orchestrator_url: std::env::var("CAIRN_WORKER_ORCHESTRATOR_URL").ok(),
            workspace_override: std::env::var("CAIRN_WORKSPACE_DIR").ok().map(PathBuf::from),
            model_api_key: std::env::var("CAIRN_MODEL_API_KEY").ok(),
            model_name: std::env::var("CAIRN_MODEL_NAME").ok(),
            model_endpoint: std::env::var("CAIRN_MODEL_ENDPOINT").ok(),
            autonomy_config_path: std::env::var("CAIRN_AUTONOMY_CONFIG_PATH").ok().map(PathBuf::from),
        })
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".local/share/cairn")
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_env() -> std::sync::MutexGuard<'static, ()> {
        crate::test_util::lock_env()
    }

    #[test]
    fn save_and_load_config_roundtrip() {
        let _lock = lock_env();
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = tmp.path().join("cairn");
        let path = dir.join("config.toml");

        let original = ConfigFile {
            database: DatabaseSection { url: "postgresql://testhost:5432/testdb".to_owned() },
            control_plane: ControlPlaneSection { token: "s3cr3t".to_owned() },
        };

        std::fs::create_dir_all(&dir).unwrap();
        let contents = toml::to_string_pretty(&original).unwrap();
        std::fs::write(&path, &contents).unwrap();

        let loaded_contents = std::fs::read_to_string(&path).unwrap();
        let loaded: ConfigFile = toml::from_str(&loaded_contents).unwrap();

        assert_eq!(loaded.database.url, original.database.url);
        assert_eq!(loaded.control_plane.token, original.control_plane.token);
    }

    #[test]
    fn resolve_with_cli_flag_overrides_env() {
        let _lock = lock_env();
        unsafe { std::env::set_var("CAIRN_DATABASE_URL", "postgresql://env:5432/envdb") };
        unsafe { std::env::set_var("CAIRN_CONTROL_PLANE_TOKEN", "env-token") };

        let config = CairnConfig::resolve(Some("postgresql://cli:5432/clidb"), Some("cli-token")).unwrap();
        assert_eq!(config.db_config.database_url, "postgresql://cli:5432/clidb");
        assert_eq!(config.control_plane_token, "cli-token");

        unsafe { std::env::remove_var("CAIRN_DATABASE_URL") };
        unsafe { std::env::remove_var("CAIRN_CONTROL_PLANE_TOKEN") };
    }

    #[test]
    fn resolve_defaults_db_url_when_nothing_set() {
        let _lock = lock_env();
        unsafe { std::env::remove_var("CAIRN_DATABASE_URL") };
        unsafe { std::env::set_var("CAIRN_CONTROL_PLANE_TOKEN", "env-token") };

        let config = CairnConfig::resolve(None, None).unwrap();
        assert_eq!(config.db_config.database_url, DbConfig::DEFAULT_URL);

        unsafe { std::env::remove_var("CAIRN_CONTROL_PLANE_TOKEN") };
    }

    #[test]
    fn resolve_errors_when_no_token() {
        let _lock = lock_env();
        unsafe { std::env::remove_var("CAIRN_CONTROL_PLANE_TOKEN") };
        let tmp = tempfile::TempDir::new().unwrap();
        let orig_home = std::env::var("HOME").ok();
        let orig_xdg = std::env::var("XDG_CONFIG_HOME").ok();
        unsafe { std::env::set_var("HOME", tmp.path()) };
        unsafe { std::env::remove_var("XDG_CONFIG_HOME") };

        let result = CairnConfig::resolve(Some("postgresql://localhost:5432/cairn"), None);

        match orig_home {
            Some(h) => unsafe { std::env::set_var("HOME", h) },
            None => unsafe { std::env::remove_var("HOME") },
        }
        match orig_xdg {
            Some(x) => unsafe { std::env::set_var("XDG_CONFIG_HOME", x) },
            None => unsafe { std::env::remove_var("XDG_CONFIG_HOME") },
        }

        assert!(result.is_err(), "should error when no control-plane token");
    }

    #[test]
    fn journal_backend_defaults_to_ndjson() {
        let _lock = lock_env();
        unsafe { std::env::remove_var("CAIRN_JOURNAL_BACKEND") };
        unsafe { std::env::set_var("CAIRN_CONTROL_PLANE_TOKEN", "t") };
        let config = CairnConfig::resolve(Some("postgresql://localhost:5432/cairn"), None).unwrap();
        assert!(matches!(config.journal_backend, JournalBackend::Ndjson { .. }));
        unsafe { std::env::remove_var("CAIRN_CONTROL_PLANE_TOKEN") };
    }

    #[test]
    fn config_path_ends_with_expected_filename() {
        let path = config_path();
        assert!(path.ends_with("cairn/config.toml"), "unexpected config path: {}", path.display());
    }
}
