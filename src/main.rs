//! jobwarden - Job scheduler with asset-lock admission control.
//!
//! Usage:
//!   jobwarden run                 Run the scheduler
//!   jobwarden validate [JOB...]   Validate configuration and job files
//!   jobwarden submit <JOB_FILE>   Submit a job from a YAML file
//!   jobwarden list                List stored jobs
//!   jobwarden kill <JOB_ID>       Kill a job
//!   jobwarden retry <JOB_ID>      Send a job back to the queue

use clap::{Parser, Subcommand};
use jobwarden::{
    BackendConfig, EventBus, FilePayloadStore, GlobalConfig, InMemoryStorage, JobFilter, JobId,
    JobLifecycle, JobState, JobStore, KubernetesBackend, KubernetesClient, KubernetesConfig,
    KubernetesSettings, LockStore, LoggingHandler, NullBackend, OrchestrationBackend,
    OrganizationId, PayloadStore, Scheduler, StorageConfig, YamlLoader,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// jobwarden - Job scheduler with asset-lock admission control
#[derive(Parser)]
#[command(name = "jobwarden")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the scheduler configuration file
    #[arg(short, long, global = true, value_name = "CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler until interrupted
    Run {
        /// Override the maximum number of concurrent jobs
        #[arg(short = 'j', long)]
        max_jobs: Option<usize>,

        /// Override the tick interval in seconds
        #[arg(long)]
        tick_interval: Option<u64>,
    },

    /// Validate the configuration and any job files
    Validate {
        /// Job YAML files to check
        #[arg(value_name = "JOB_FILE")]
        jobs: Vec<PathBuf>,
    },

    /// Submit a job from a YAML file
    Submit {
        /// Path to the job YAML file
        #[arg(value_name = "JOB_FILE")]
        job: PathBuf,
    },

    /// List stored jobs
    List {
        /// Only jobs in this state (repeatable)
        #[arg(short, long)]
        state: Vec<JobState>,

        /// Only jobs of this organization
        #[arg(long)]
        organization: Option<OrganizationId>,

        /// Maximum number of jobs to show
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },

    /// Kill a job and delete its cluster resources
    Kill {
        /// Job ID to kill
        #[arg(value_name = "JOB_ID")]
        job_id: JobId,
    },

    /// Delete a job's cluster resources and send it back to the queue
    Retry {
        /// Job ID to retry
        #[arg(value_name = "JOB_ID")]
        job_id: JobId,
    },
}

#[tokio::main]
async fn main() -> CliResult<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            max_jobs,
            tick_interval,
        } => {
            run_scheduler(config, max_jobs, tick_interval).await?;
        }
        Commands::Validate { jobs } => {
            validate(&config, &jobs)?;
        }
        Commands::Submit { job } => {
            submit_job(&config, &job).await?;
        }
        Commands::List {
            state,
            organization,
            limit,
        } => {
            list_jobs(&config, state, organization, limit).await?;
        }
        Commands::Kill { job_id } => {
            let scheduler = build_scheduler(&config).await?;
            let result = scheduler.kill_job(&job_id).await?;
            report(&format!("{} {}", result.operation, job_id), result.success);
        }
        Commands::Retry { job_id } => {
            let scheduler = build_scheduler(&config).await?;
            let result = scheduler.retry_job(&job_id).await?;
            report(&format!("{} {}", result.operation, job_id), result.success);
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> CliResult<GlobalConfig> {
    match path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Ok(YamlLoader::load_global_config(path)?)
        }
        None => Ok(GlobalConfig::default()),
    }
}

/// Open the configured store. The same object backs both store traits.
async fn open_storage(config: &StorageConfig) -> CliResult<(Arc<dyn JobStore>, Arc<dyn LockStore>)> {
    match config {
        StorageConfig::Memory => {
            let storage = Arc::new(InMemoryStorage::new());
            Ok((storage.clone(), storage))
        }
        #[cfg(feature = "sqlite")]
        StorageConfig::Sqlite { path } => {
            let storage = Arc::new(jobwarden::SqliteStorage::new(path).await?);
            Ok((storage.clone(), storage))
        }
        #[cfg(not(feature = "sqlite"))]
        StorageConfig::Sqlite { .. } => {
            Err("sqlite storage requires the `sqlite` feature".into())
        }
    }
}

fn build_payload_store(config: &GlobalConfig) -> Arc<dyn PayloadStore> {
    let mut store = FilePayloadStore::new(&config.payload.dir);
    if let Some(base_url) = &config.payload.base_url {
        store = store.with_base_url(base_url);
    }
    Arc::new(store)
}

fn build_kubernetes_client(config: &KubernetesConfig) -> CliResult<KubernetesClient> {
    let mut client = KubernetesClient::new(&config.url, &config.namespace);
    if let Some(token) = &config.token {
        client = client.with_token(token);
    }
    if let (Some(username), Some(password)) = (&config.username, &config.password) {
        client = client.with_basic_auth(username, password);
    }
    if let Some(path) = &config.ca_cert {
        let pem = std::fs::read(path)
            .map_err(|e| format!("failed to read CA certificate '{}': {}", path.display(), e))?;
        client = client.with_ca_cert(&pem)?;
    }
    Ok(client)
}

fn build_backend(
    config: &GlobalConfig,
    lifecycle: Arc<JobLifecycle>,
    payloads: Arc<dyn PayloadStore>,
) -> CliResult<Arc<dyn OrchestrationBackend>> {
    match &config.backend {
        BackendConfig::Null => Ok(Arc::new(NullBackend)),
        BackendConfig::Kubernetes(kube) => {
            let client = build_kubernetes_client(kube)?;
            let settings = KubernetesSettings {
                image: kube.image.clone(),
                secret_name: kube.secret_name.clone(),
                secret_mount_path: kube.secret_mount_path.clone(),
                backoff_limit: kube.backoff_limit,
            };
            Ok(Arc::new(KubernetesBackend::new(
                Arc::new(client),
                lifecycle,
                payloads,
                settings,
            )))
        }
    }
}

/// Wire storage, lifecycle, backend and scheduler from the configuration.
async fn build_scheduler(config: &GlobalConfig) -> CliResult<Scheduler> {
    let (jobs, locks) = open_storage(&config.storage).await?;

    // Create event bus with logging handler
    let events = Arc::new(EventBus::new());
    events.register(Arc::new(LoggingHandler)).await;

    let payloads = build_payload_store(config);
    let lifecycle = Arc::new(
        JobLifecycle::new(jobs, locks)
            .with_events(events)
            .with_payload_store(payloads.clone()),
    );
    let backend = build_backend(config, lifecycle.clone(), payloads)?;

    Ok(Scheduler::new(lifecycle, backend)
        .with_max_concurrent_jobs(config.max_concurrent_jobs)
        .with_max_job_age_hours(config.max_job_age_hours)
        .with_tick_interval(config.tick_interval())
        .with_gc_interval(config.gc_interval())
        .with_backend_timeout(config.backend_timeout())
        .with_shutdown_timeout(config.shutdown_timeout()))
}

/// Run the scheduler until Ctrl+C.
async fn run_scheduler(
    mut config: GlobalConfig,
    max_jobs: Option<usize>,
    tick_interval: Option<u64>,
) -> CliResult<()> {
    if let Some(max) = max_jobs {
        config.max_concurrent_jobs = max.max(1);
    }
    if let Some(secs) = tick_interval {
        config.tick_interval_secs = secs.max(1);
    }

    if config.storage == StorageConfig::Memory {
        warn!("Using in-memory storage; jobs are lost on exit");
    }

    let scheduler = build_scheduler(&config).await?;

    info!(
        "Starting scheduler (max concurrent jobs: {}, tick interval: {}s)...",
        config.max_concurrent_jobs, config.tick_interval_secs
    );
    info!("Press Ctrl+C to stop");

    let (handle, scheduler_task) = scheduler.start().await;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
            handle.shutdown().await?;
        }
        _ = scheduler_task => {
            info!("Scheduler stopped");
        }
    }

    let stats = handle.stats();
    info!(
        ticks = stats.ticks,
        admitted = stats.admitted,
        launch_failures = stats.launch_failures,
        orphans = stats.orphans,
        gc_deleted = stats.gc_deleted,
        "scheduler totals"
    );
    Ok(())
}

/// Validate the configuration and job files without touching storage.
fn validate(config: &GlobalConfig, jobs: &[PathBuf]) -> CliResult<()> {
    info!(
        "Configuration OK (storage: {:?}, backend: {})",
        config.storage,
        match config.backend {
            BackendConfig::Null => "null",
            BackendConfig::Kubernetes(_) => "kubernetes",
        }
    );

    let mut failed = 0;
    for path in jobs {
        match YamlLoader::load_job_spec(path) {
            Ok(spec) => info!("  - {} ({}): OK", spec.name, path.display()),
            Err(e) => {
                error!("  - {}: {}", path.display(), e);
                failed += 1;
            }
        }
    }

    if failed > 0 {
        return Err(format!("{} job file(s) failed validation", failed).into());
    }
    Ok(())
}

async fn submit_job(config: &GlobalConfig, path: &Path) -> CliResult<()> {
    let spec = YamlLoader::load_job_spec(path)?;
    let scheduler = build_scheduler(config).await?;
    let job = scheduler.lifecycle().submit(&spec).await?;

    println!("{}", job.id);
    if job.state == JobState::Fail {
        return Err(format!("job '{}' failed during setup", job.name).into());
    }
    Ok(())
}

async fn list_jobs(
    config: &GlobalConfig,
    states: Vec<JobState>,
    organization: Option<OrganizationId>,
    limit: Option<usize>,
) -> CliResult<()> {
    let (jobs, _) = open_storage(&config.storage).await?;

    let mut filter = JobFilter::default().with_states(states);
    if let Some(organization) = organization {
        filter = filter.with_organization(organization);
    }
    filter.limit = limit;

    let jobs = jobs.list(&filter).await?;
    if jobs.is_empty() {
        println!("No jobs found");
        return Ok(());
    }

    for job in &jobs {
        println!("ID: {}", job.id);
        println!("  Name: {}", job.name);
        println!("  Organization: {}", job.organization_id);
        println!("  Type: {}", job.job_type);
        println!("  State: {}", job.state);
        println!("  Locks assets: {}", job.lock_assets);
        println!("  Created: {}", job.created_at.to_rfc3339());
        if let Some(started) = job.started_at {
            println!("  Started: {}", started.to_rfc3339());
        }
        if let Some(stopped) = job.stopped_at {
            println!("  Stopped: {}", stopped.to_rfc3339());
        }
        println!();
    }

    Ok(())
}

fn report(operation: &str, success: bool) {
    if success {
        info!("{}: done", operation);
    } else {
        warn!("{}: no change", operation);
    }
}
