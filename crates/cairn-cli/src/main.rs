mod config;
mod git_backlog;
mod serve;
#[cfg(test)]
mod test_util;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use cairn_core::github::{GitHostingClient, OctocrabClient};
use cairn_core::isolation::container::{ContainerJobConfig, ContainerJobIsolation};
use cairn_core::isolation::worktree::WorktreeIsolation;
use cairn_core::isolation::Isolation;
use cairn_core::oracle::HttpOracleClient;
use cairn_core::scheduler::{AttemptParams, RetryPolicy, Scheduler, SchedulerConfig};
use cairn_core::target;
use cairn_core::worker::Worker;
use cairn_core::worktree::WorktreeManager;
use cairn_store::artifact::file::FileArtifactStore;
use cairn_store::artifact::object::ObjectArtifactStore;
use cairn_store::artifact::ArtifactStore;
use cairn_store::graph::memory::MemoryGraph;
use cairn_store::graph::postgres::PostgresGraph;
use cairn_store::graph::Graph;
use cairn_store::journal::ndjson::NdjsonJournal;
use cairn_store::journal::postgres::PostgresJournal;
use cairn_store::journal::{Journal, VerifyOutcome};
use cairn_store::pool;

use config::{CairnConfig, ConfigFile, ControlPlaneSection, DatabaseSection};
use git_backlog::{parse_owner_repo, GitBacklogSource};

#[derive(Parser)]
#[command(name = "cairn", about = "Autonomous code-change orchestrator")]
struct Cli {
    /// Database URL (overrides CAIRN_DATABASE_URL env var / config file)
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Control-plane bearer token (overrides CAIRN_CONTROL_PLANE_TOKEN env var / config file)
    #[arg(long, global = true)]
    control_plane_token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a cairn config file with the database URL and control-plane token
    Init {
        #[arg(long, default_value = "postgresql://localhost:5432/cairn")]
        db_url: String,
        #[arg(long)]
        token: String,
        #[arg(long)]
        force: bool,
    },
    /// Run database migrations
    DbInit,
    /// Run the ingest & query HTTP API
    Serve {
        #[arg(long, default_value = "0.0.0.0")]
        bind: String,
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
    /// Scheduler operations
    Scheduler {
        #[command(subcommand)]
        command: SchedulerCommands,
    },
    /// Run a single worker attempt out of process (used by container isolation)
    Worker {
        #[command(subcommand)]
        command: WorkerCommands,
    },
    /// Journal maintenance
    Journal {
        #[command(subcommand)]
        command: JournalCommands,
    },
}

#[derive(Subcommand)]
enum SchedulerCommands {
    /// Run a single scheduler tick for a target
    Tick {
        #[arg(long)]
        target: String,
    },
    /// Run the scheduler continuously, ticking every `interval_secs`
    Run {
        #[arg(long)]
        target: String,
        #[arg(long, default_value_t = 30)]
        interval_secs: u64,
    },
}

#[derive(Subcommand)]
enum WorkerCommands {
    /// Run the worker's 11-step state machine for one attempt
    Run {
        #[arg(long)]
        target: String,
        #[arg(long)]
        task_id: String,
        #[arg(long)]
        attempt_id: String,
        #[arg(long, default_value_t = 1)]
        attempt_number: u32,
    },
}

#[derive(Subcommand)]
enum JournalCommands {
    /// Verify the hash chain end to end
    Verify,
    /// Rebuild the graph projection from the full journal
    Rebuild,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { db_url, token, force } => {
            let path = config::config_path();
            if path.exists() && !force {
                anyhow::bail!("config file already exists at {}; pass --force to overwrite", path.display());
            }
            config::save_config(&ConfigFile {
                database: DatabaseSection { url: db_url },
                control_plane: ControlPlaneSection { token },
            })?;
            println!("wrote config file to {}", path.display());
            Ok(())
        }
        Commands::DbInit => {
            let config = CairnConfig::resolve(cli.database_url.as_deref(), cli.control_plane_token.as_deref())?;
            pool::ensure_database_exists(&config.db_config).await?;
            let db_pool = pool::create_pool(&config.db_config).await?;
            pool::run_migrations(&db_pool).await?;
            println!("migrations applied");
            Ok(())
        }
        Commands::Serve { bind, port } => {
            let config = CairnConfig::resolve(cli.database_url.as_deref(), cli.control_plane_token.as_deref())?;
            let journal = build_journal(&config).await?;
            let graph = build_graph(&config, &journal).await?;

            let (autonomy_enabled, autonomy_source) = match &config.autonomy_config_path {
                Some(path) => {
                    let autonomy = target::load_autonomy_config(path)
                        .with_context(|| format!("failed to load autonomy config from {}", path.display()))?;
                    (autonomy.autonomy_enabled, path.display().to_string())
                }
                None => (false, "default (no autonomy config mounted)".to_owned()),
            };

            let state = serve::AppState::new(journal, graph, &config, autonomy_enabled, autonomy_source);
            serve::run_serve(state, &bind, port).await
        }
        Commands::Scheduler { command } => run_scheduler_command(cli.database_url.as_deref(), cli.control_plane_token.as_deref(), command).await,
        Commands::Worker { command } => run_worker_command(cli.database_url.as_deref(), cli.control_plane_token.as_deref(), command).await,
        Commands::Journal { command } => run_journal_command(cli.database_url.as_deref(), cli.control_plane_token.as_deref(), command).await,
    }
}

// -----------------------------------------------------------------------
// Backend construction
// -----------------------------------------------------------------------

async fn build_journal(config: &CairnConfig) -> Result<Arc<dyn Journal>> {
    match &config.journal_backend {
        config::JournalBackend::Ndjson { path } => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).with_context(|| format!("failed to create journal directory {}", parent.display()))?;
            }
            Ok(Arc::new(NdjsonJournal::open(path).await.context("failed to open ndjson journal")?))
        }
        config::JournalBackend::Postgres => {
            let db_pool = pool::create_pool(&config.db_config).await?;
            Ok(Arc::new(PostgresJournal::new(db_pool)))
        }
    }
}

async fn build_graph(config: &CairnConfig, journal: &Arc<dyn Journal>) -> Result<Arc<dyn Graph>> {
    match &config.graph_backend {
        config::GraphBackend::Memory { rebuild_on_start } => {
            let graph = MemoryGraph::new();
            if *rebuild_on_start {
                let events = journal.scan(None, None).await.context("failed to scan journal for graph rebuild")?;
                graph.rebuild(&events).await.context("failed to rebuild graph projection")?;
            }
            Ok(Arc::new(graph))
        }
        config::GraphBackend::Postgres => {
            let db_pool = pool::create_pool(&config.db_config).await?;
            Ok(Arc::new(PostgresGraph::new(db_pool)))
        }
    }
}

fn build_artifact_store(config: &CairnConfig) -> Result<Arc<dyn ArtifactStore>> {
    match &config.artifact_backend {
        config::ArtifactBackend::File { dir } => {
            std::fs::create_dir_all(dir).with_context(|| format!("failed to create artifacts directory {}", dir.display()))?;
            Ok(Arc::new(FileArtifactStore::new(dir.clone())))
        }
        config::ArtifactBackend::Object { base_url, bucket } => Ok(Arc::new(ObjectArtifactStore::new(base_url.clone(), bucket.clone()))),
    }
}

fn build_hosting_client(repo_url: &str) -> Result<Arc<dyn GitHostingClient>> {
    let (owner, repo) = parse_owner_repo(repo_url)?;
    let github_token = std::env::var("CAIRN_GITHUB_TOKEN").context("CAIRN_GITHUB_TOKEN is required to talk to the git hosting API")?;
    let octocrab = octocrab::Octocrab::builder()
        .personal_token(github_token)
        .build()
        .context("failed to build GitHub client")?;
    Ok(Arc::new(OctocrabClient::new(octocrab, owner, repo)))
}

fn build_isolation(config: &CairnConfig, repo_path: &std::path::Path) -> Result<Arc<dyn Isolation>> {
    match &config.worker_image {
        Some(image) => {
            let orchestrator_url = config
                .worker_orchestrator_url
                .clone()
                .context("CAIRN_WORKER_ORCHESTRATOR_URL is required for container isolation")?;
            let namespace = config.worker_namespace.clone().unwrap_or_else(|| "default".to_owned());
            Ok(Arc::new(ContainerJobIsolation::new(ContainerJobConfig {
                orchestrator_url,
                image: image.clone(),
                namespace,
                ttl_seconds_after_finished: 3600,
                poll_interval: std::time::Duration::from_secs(5),
            })))
        }
        None => build_local_isolation(config, repo_path),
    }
}

/// Always a local worktree, regardless of `worker_image`. `worker run` is
/// itself the container job's entrypoint — if it deferred to
/// `build_isolation` it would read the same config and recursively submit
/// another container job instead of running the attempt in place.
fn build_local_isolation(config: &CairnConfig, repo_path: &std::path::Path) -> Result<Arc<dyn Isolation>> {
    let manager = WorktreeManager::new(repo_path, config.workspace_override.clone()).context("failed to open worktree manager")?;
    Ok(Arc::new(WorktreeIsolation::new(manager)))
}

fn build_oracle(config: &CairnConfig) -> Arc<dyn cairn_core::oracle::OracleClient> {
    let endpoint = config.model_endpoint.clone().unwrap_or_else(|| "http://localhost:4000/v1/generate".to_owned());
    let client = match &config.model_api_key {
        Some(key) => HttpOracleClient::new(endpoint).with_api_key(key.clone()),
        None => HttpOracleClient::new(endpoint),
    };
    Arc::new(client)
}

fn default_actor_id(target: &str) -> String {
    format!("worker-{target}")
}

// -----------------------------------------------------------------------
// Subcommand handlers
// -----------------------------------------------------------------------

async fn run_scheduler_command(db_url: Option<&str>, token: Option<&str>, command: SchedulerCommands) -> Result<()> {
    match command {
        SchedulerCommands::Tick { target } => {
            let (scheduler, _) = build_scheduler(db_url, token, &target).await?;
            let outcome = scheduler.tick().await.context("scheduler tick failed")?;
            println!("{outcome:?}");
            Ok(())
        }
        SchedulerCommands::Run { target, interval_secs } => {
            let (scheduler, _) = build_scheduler(db_url, token, &target).await?;
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
            loop {
                interval.tick().await;
                match scheduler.tick().await {
                    Ok(outcome) => tracing::info!(?outcome, "scheduler tick completed"),
                    Err(e) => tracing::error!(error = %e, "scheduler tick failed"),
                }
            }
        }
    }
}

async fn build_scheduler(db_url: Option<&str>, token: Option<&str>, target_name: &str) -> Result<(Scheduler, CairnConfig)> {
    let config = CairnConfig::resolve(db_url, token)?;
    let target_config = target::load_by_name(target_name).with_context(|| format!("failed to load target config for {target_name}"))?;

    let journal = build_journal(&config).await?;
    let graph = build_graph(&config, &journal).await?;
    let hosting = build_hosting_client(&target_config.repo_url)?;
    let backlog_source: Arc<dyn cairn_core::scheduler::BacklogSource> = Arc::new(GitBacklogSource::new(target_config.clone()));
    let isolation = build_isolation(&config, &target_config.local_cache_dir)?;
    let artifacts = build_artifact_store(&config)?;
    let oracle = build_oracle(&config);

    let worker = Worker::new(
        isolation,
        oracle,
        hosting.clone(),
        artifacts,
        target_config,
        default_actor_id(target_name),
        config.control_plane_url.clone(),
        config.control_plane_token.clone(),
    );

    let autonomy = match &config.autonomy_config_path {
        Some(path) => Some(
            target::load_autonomy_config(path)
                .with_context(|| format!("failed to load autonomy config from {}", path.display()))?,
        ),
        None => None,
    };

    let scheduler_config = match &autonomy {
        Some(autonomy) => SchedulerConfig {
            target: target_name.to_owned(),
            max_open_prs: autonomy.max_open_prs,
            circuit_breaker_failures: autonomy.circuit_breaker_failures,
            retry: RetryPolicy {
                max_attempts_per_task: autonomy.max_attempts_per_task,
                ..RetryPolicy::default()
            },
            hot_paths: Vec::new(),
            allowed_path_prefixes: autonomy.allowed_path_prefixes.clone(),
        },
        None => SchedulerConfig {
            target: target_name.to_owned(),
            max_open_prs: 5,
            circuit_breaker_failures: 5,
            retry: RetryPolicy::default(),
            hot_paths: Vec::new(),
            allowed_path_prefixes: Vec::new(),
        },
    };

    let scheduler = Scheduler::new(journal, graph, hosting, backlog_source, Arc::new(worker), scheduler_config);
    Ok((scheduler, config))
}

async fn run_worker_command(db_url: Option<&str>, token: Option<&str>, command: WorkerCommands) -> Result<()> {
    let WorkerCommands::Run { target, task_id, attempt_id, attempt_number } = command;

    let config = CairnConfig::resolve(db_url, token)?;
    let target_config = target::load_by_name(&target).with_context(|| format!("failed to load target config for {target}"))?;

    let hosting = build_hosting_client(&target_config.repo_url)?;
    let isolation = build_local_isolation(&config, &target_config.local_cache_dir)?;
    let artifacts = build_artifact_store(&config)?;
    let oracle = build_oracle(&config);

    let worker = Worker::new(
        isolation,
        oracle,
        hosting,
        artifacts,
        target_config,
        default_actor_id(&target),
        config.control_plane_url.clone(),
        config.control_plane_token.clone(),
    );

    let outcome = worker
        .run_attempt(&AttemptParams {
            target,
            task_id,
            attempt_id,
            attempt_number,
        })
        .await;
    println!("{outcome:?}");
    Ok(())
}

async fn run_journal_command(db_url: Option<&str>, token: Option<&str>, command: JournalCommands) -> Result<()> {
    let config = CairnConfig::resolve(db_url, token)?;
    let journal = build_journal(&config).await?;

    match command {
        JournalCommands::Verify => match journal.verify().await? {
            VerifyOutcome::Ok => {
                println!("journal verified: chain intact");
                Ok(())
            }
            VerifyOutcome::Tampered { event_id, reason } => {
                anyhow::bail!("journal tampered at event {event_id}: {reason}");
            }
        },
        JournalCommands::Rebuild => {
            let graph = build_graph(&config, &journal).await?;
            let events = journal.scan(None, None).await?;
            graph.rebuild(&events).await?;
            println!("rebuilt graph projection from {} events", events.len());
            Ok(())
        }
    }
}
