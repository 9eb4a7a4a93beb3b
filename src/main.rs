use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use showrunner::config::Settings;
use showrunner::db::{JobStatus, Stage, Store};
use showrunner::orchestrator::Orchestrator;
use showrunner::providers::avatar::AvatarClient;
use showrunner::providers::speech::SpeechClient;
use showrunner::providers::text::TextClient;
use showrunner::providers::video::VideoGenClient;
use showrunner::providers::{PollConfig, RetryPolicy};
use showrunner::queue::{spawn_workers, TaskQueue};
use showrunner::stages::{StageRegistry, StageServices};
use showrunner::storage::{ArtifactStore, BlobStore};
use showrunner::supervisor::{Supervisor, SupervisorConfig};

#[derive(Parser)]
#[command(name = "showrunner")]
#[command(version, about = "Automated episode production orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the database schema and the object-store buckets
    Migrate,
    /// Run the worker pool and the job supervisor
    Worker,
    /// Run only the job supervisor sweeps (orphan reaper + state sync)
    Supervise,
    /// Show the pipeline status of an episode
    Status { episode_id: Uuid },
    /// Run a pipeline for an episode and wait for it to finish
    Run {
        episode_id: Uuid,
        /// Run Stage 1 only (planning -> scripting -> metadata)
        #[arg(long)]
        stage_1: bool,
        /// Resume from a specific stage
        #[arg(long)]
        from: Option<String>,
        /// Stages to skip when resuming
        #[arg(long, value_delimiter = ',')]
        skip: Vec<String>,
    },
    /// Cancel an episode and all of its active jobs
    Cancel { episode_id: Uuid },
    /// Retry a failed job and re-dispatch it
    Retry { job_id: Uuid },
}

struct Runtime {
    orchestrator: Orchestrator,
    store: Store,
    _workers: Vec<tokio::task::JoinHandle<()>>,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_services(settings: &Arc<Settings>, store: &Store) -> Result<Arc<StageServices>> {
    let retry = RetryPolicy {
        max_retries: settings.max_retries,
        base_delay: settings.backoff_base,
        max_delay: settings.backoff_max,
    };
    let poll = PollConfig {
        interval: settings.poll_interval,
        max_poll_time: settings.max_poll_time,
    };

    let blobs: Arc<dyn BlobStore> = Arc::new(ArtifactStore::new(
        &settings.object_store_endpoint,
        &settings.object_store_access_key,
        &settings.object_store_secret_key,
        &settings.object_store_region,
        retry,
    )?);

    let text = Arc::new(TextClient::new(
        &settings.text_base_url,
        &settings.text_api_key,
        retry,
    )?);

    let speech = settings
        .speech_api_key
        .as_deref()
        .map(|key| SpeechClient::new(&settings.speech_base_url, key, retry))
        .transpose()?
        .map(|c| Arc::new(c) as Arc<dyn showrunner::providers::speech::SpeechSynthesizer>);

    let avatar = settings
        .avatar_api_key
        .as_deref()
        .map(|key| AvatarClient::new(&settings.avatar_base_url, key, retry, poll))
        .transpose()?
        .map(|c| Arc::new(c) as Arc<dyn showrunner::providers::avatar::AvatarRenderer>);

    let broll = settings
        .video_api_key
        .as_deref()
        .map(|key| VideoGenClient::new(&settings.video_base_url, key, retry, poll))
        .transpose()?
        .map(|c| Arc::new(c) as Arc<dyn showrunner::providers::video::BrollRenderer>);

    Ok(Arc::new(StageServices {
        store: store.clone(),
        blobs,
        text,
        speech,
        avatar,
        broll,
        settings: Arc::clone(settings),
    }))
}

fn build_runtime(settings: Arc<Settings>, with_supervisor: bool) -> Result<Runtime> {
    let store = Store::open(&settings.database_path)
        .with_context(|| format!("failed to open database at {:?}", settings.database_path))?;
    let services = build_services(&settings, &store)?;
    let (queue, rx) = TaskQueue::channel(settings.queue_capacity);
    let registry = Arc::new(StageRegistry::standard());

    let workers = spawn_workers(
        settings.worker_count,
        rx,
        store.clone(),
        queue.clone(),
        registry,
        services,
    );

    if with_supervisor {
        let supervisor = Supervisor::new(
            store.clone(),
            queue.clone(),
            SupervisorConfig {
                orphan_threshold: settings.orphan_threshold,
                interval: settings.supervisor_interval,
                ..Default::default()
            },
        );
        tokio::spawn(supervisor.run());
    }

    let orchestrator = Orchestrator::new(store.clone(), queue, Arc::clone(&settings));
    Ok(Runtime {
        orchestrator,
        store,
        _workers: workers,
    })
}

async fn wait_for_job(store: &Store, job_id: Uuid) -> Result<JobStatus> {
    loop {
        let job = store.get_job(job_id)?;
        if job.status.is_terminal() {
            if let Some(error) = &job.error_message {
                eprintln!("job {job_id} finished {}: {error}", job.status.as_str());
            }
            return Ok(job.status);
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let settings = Arc::new(Settings::from_env().context("failed to load settings")?);

    match &cli.command {
        Commands::Migrate => {
            let store = Store::open(&settings.database_path)
                .context("failed to open and migrate database")?;
            let services = build_services(&settings, &store)?;
            services
                .blobs
                .ensure_bucket(&settings.bucket_assets)
                .await
                .context("failed to create assets bucket")?;
            services
                .blobs
                .ensure_bucket(&settings.bucket_scripts)
                .await
                .context("failed to create scripts bucket")?;
            println!("schema and buckets ready");
        }
        Commands::Worker => {
            let runtime = build_runtime(Arc::clone(&settings), true)?;
            println!(
                "worker pool running ({} workers); press Ctrl-C to stop",
                settings.worker_count
            );
            tokio::signal::ctrl_c().await.context("signal wait failed")?;
            drop(runtime);
            println!("shutting down");
        }
        Commands::Supervise => {
            let store = Store::open(&settings.database_path)?;
            let (queue, _rx) = TaskQueue::channel(1);
            let supervisor = Supervisor::new(
                store,
                queue,
                SupervisorConfig {
                    orphan_threshold: settings.orphan_threshold,
                    interval: settings.supervisor_interval,
                    ..Default::default()
                },
            );
            println!("supervisor running; press Ctrl-C to stop");
            tokio::select! {
                _ = supervisor.run() => {}
                result = tokio::signal::ctrl_c() => {
                    result.context("signal wait failed")?;
                }
            }
            println!("shutting down");
        }
        Commands::Status { episode_id } => {
            let store = Store::open(&settings.database_path)?;
            let (queue, _rx) = TaskQueue::channel(1);
            let orchestrator = Orchestrator::new(store, queue, Arc::clone(&settings));
            let report = orchestrator.pipeline_status(*episode_id)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Run {
            episode_id,
            stage_1,
            from,
            skip,
        } => {
            let runtime = build_runtime(Arc::clone(&settings), true)?;
            let response = if let Some(from) = from {
                let start = Stage::parse(from)
                    .map_err(|e| anyhow::anyhow!(e))
                    .context("invalid --from stage")?;
                let skip: Vec<Stage> = skip
                    .iter()
                    .map(|s| Stage::parse(s).map_err(|e| anyhow::anyhow!(e)))
                    .collect::<Result<_>>()
                    .context("invalid --skip stage")?;
                runtime
                    .orchestrator
                    .run_from_stage(*episode_id, start, &skip)
                    .await?
            } else if *stage_1 {
                runtime.orchestrator.run_stage_1(*episode_id).await?
            } else {
                runtime.orchestrator.run_full(*episode_id).await?
            };
            println!(
                "pipeline '{}' dispatched as job {}",
                response.stage, response.job_id
            );

            let status = wait_for_job(&runtime.store, response.job_id).await?;
            let report = runtime.orchestrator.pipeline_status(*episode_id)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if status != JobStatus::Completed {
                anyhow::bail!("pipeline finished with status '{}'", status.as_str());
            }
        }
        Commands::Cancel { episode_id } => {
            let store = Store::open(&settings.database_path)?;
            let (queue, _rx) = TaskQueue::channel(1);
            let orchestrator = Orchestrator::new(store, queue, Arc::clone(&settings));
            let outcome = orchestrator.cancel_episode(*episode_id)?;
            println!(
                "episode {} cancelled ({} job(s) cancelled)",
                outcome.episode_id, outcome.cancelled_job_count
            );
        }
        Commands::Retry { job_id } => {
            let runtime = build_runtime(Arc::clone(&settings), true)?;
            let response = runtime.orchestrator.retry_job(*job_id).await?;
            println!(
                "job {} re-dispatched for stage '{}'",
                response.job_id, response.stage
            );
            let status = wait_for_job(&runtime.store, response.job_id).await?;
            if status != JobStatus::Completed {
                anyhow::bail!("retry finished with status '{}'", status.as_str());
            }
            println!("job completed");
        }
    }

    Ok(())
}
