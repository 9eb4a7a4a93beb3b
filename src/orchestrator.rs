//! Pipeline orchestrator: composes stage executors into chains, enforces
//! the episode state machine, and exposes the command surface
//! (trigger/advance/run/cancel/status).
//!
//! Chains run as supervised tokio tasks tracked by their own pseudo-stage
//! job (`full_pipeline`, `stage_1_pipeline`, `pipeline_from_<stage>`).
//! Per-episode serialisation is the active-job guard at dispatch time:
//! concurrent dispatches are a caller-visible `validation` error, not a
//! silent race.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::db::{Episode, EpisodeStatus, Job, JobResult, JobStatus, Stage, Store};
use crate::errors::{CoreError, Result};
use crate::queue::{JobTicket, TaskQueue, TaskState};

#[derive(Clone)]
pub struct Orchestrator {
    store: Store,
    queue: TaskQueue,
    settings: Arc<Settings>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TriggerResponse {
    pub job_id: Uuid,
    pub episode_id: Uuid,
    pub stage: String,
    pub status: JobStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct CancelOutcome {
    pub episode_id: Uuid,
    pub status: EpisodeStatus,
    pub cancelled_job_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageSummary {
    pub status: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_s: Option<f64>,
    pub error: Option<String>,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineProgress {
    pub completed_stages: usize,
    pub total_stages: usize,
    pub percent_complete: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActiveJob {
    pub id: Uuid,
    pub stage: String,
    pub status: JobStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatusReport {
    pub episode_id: Uuid,
    pub episode_status: EpisodeStatus,
    pub progress: PipelineProgress,
    pub stages: Vec<(String, StageSummary)>,
    pub active_jobs: Vec<ActiveJob>,
}

/// Which chain is running; decides the script_review pause behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChainKind {
    Full,
    Stage1,
    FromStage(Stage),
}

impl ChainKind {
    fn job_stage_name(&self) -> String {
        match self {
            Self::Full => "full_pipeline".to_string(),
            Self::Stage1 => "stage_1_pipeline".to_string(),
            Self::FromStage(stage) => format!("pipeline_from_{}", stage.as_str()),
        }
    }

    fn stages(&self) -> Vec<Stage> {
        match self {
            Self::Full => Stage::ORDER.to_vec(),
            Self::Stage1 => Stage::STAGE_1.to_vec(),
            Self::FromStage(start) => {
                let idx = Stage::ORDER.iter().position(|s| s == start).unwrap_or(0);
                Stage::ORDER[idx..].to_vec()
            }
        }
    }

    fn start_stage(&self) -> Stage {
        match self {
            Self::Full | Self::Stage1 => Stage::Planning,
            Self::FromStage(start) => *start,
        }
    }
}

impl Orchestrator {
    pub fn new(store: Store, queue: TaskQueue, settings: Arc<Settings>) -> Self {
        Self {
            store,
            queue,
            settings,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    // ── Single-stage dispatch ─────────────────────────────────────────

    /// Create and enqueue one stage job. Rejects dispatch when another job
    /// for the stage is active, or the stage already completed, unless
    /// `force` is set.
    pub async fn trigger(
        &self,
        episode_id: Uuid,
        stage: Stage,
        params: Value,
        force: bool,
    ) -> Result<TriggerResponse> {
        let episode = self.store.get_episode(episode_id)?;

        if let Some(existing) = self
            .store
            .active_job_for_stage(episode_id, stage.as_str())?
        {
            if !force {
                return Err(CoreError::validation(format!(
                    "a job for stage '{}' is already in progress (job {})",
                    stage.as_str(),
                    existing.id
                )));
            }
        }

        if !force {
            if episode.pipeline_state.is_completed(stage) {
                return Err(CoreError::validation(format!(
                    "stage '{}' has already completed; use force to re-run",
                    stage.as_str()
                )));
            }
            if !stage.allowed_statuses().contains(&episode.status) {
                return Err(CoreError::validation(format!(
                    "stage '{}' cannot run from episode status '{}'",
                    stage.as_str(),
                    episode.status.as_str()
                )));
            }
        }

        self.queue.reset_episode(episode_id);
        let (job, _ticket) = self.dispatch_stage(episode_id, stage, params, force).await?;

        Ok(TriggerResponse {
            job_id: job.id,
            episode_id,
            stage: stage.as_str().to_string(),
            status: job.status,
        })
    }

    async fn dispatch_stage(
        &self,
        episode_id: Uuid,
        stage: Stage,
        params: Value,
        force: bool,
    ) -> Result<(Job, JobTicket)> {
        let job = self.store.create_job(
            episode_id,
            stage.as_str(),
            params.clone(),
            self.settings.max_retries,
        )?;
        self.store.mark_stage_queued(episode_id, stage)?;
        let ticket = self
            .queue
            .enqueue(job.id, episode_id, stage, params, force)
            .await?;
        let job = self.store.set_job_external_task_id(job.id, &ticket.task_id)?;

        info!(
            %episode_id,
            job_id = %job.id,
            stage = stage.as_str(),
            task_id = %ticket.task_id,
            "stage dispatched"
        );
        Ok((job, ticket))
    }

    /// Dispatch the next stage implied by the episode's current status.
    pub async fn advance(&self, episode_id: Uuid) -> Result<TriggerResponse> {
        let episode = self.store.get_episode(episode_id)?;

        if self.store.count_active_jobs(episode_id)? > 0 {
            return Err(CoreError::validation(
                "episode has active jobs; wait for them to complete or cancel them",
            ));
        }

        let next = match episode.status {
            EpisodeStatus::Idea => Stage::Planning,
            EpisodeStatus::Planning => Stage::Scripting,
            EpisodeStatus::Scripting => {
                // Scripting's terminal act: the episode parks at
                // script_review, then metadata runs against it.
                self.store
                    .set_episode_status(episode_id, EpisodeStatus::ScriptReview)?;
                Stage::Metadata
            }
            EpisodeStatus::ScriptReview => Stage::Audio,
            EpisodeStatus::Audio => Stage::Avatar,
            EpisodeStatus::Avatar => Stage::Broll,
            other => {
                return Err(CoreError::validation(format!(
                    "episode with status '{}' cannot be advanced",
                    other.as_str()
                )));
            }
        };

        self.queue.reset_episode(episode_id);
        let (job, _ticket) = self
            .dispatch_stage(episode_id, next, json!({}), false)
            .await?;
        Ok(TriggerResponse {
            job_id: job.id,
            episode_id,
            stage: next.as_str().to_string(),
            status: job.status,
        })
    }

    // ── Chain entry points ────────────────────────────────────────────

    /// Stage 1: planning -> scripting -> metadata.
    pub async fn run_stage_1(&self, episode_id: Uuid) -> Result<TriggerResponse> {
        self.start_chain(episode_id, ChainKind::Stage1, HashSet::new(), false)
            .await
    }

    /// Full pipeline: all six stages, pausing at script_review unless the
    /// episode has `auto_advance` set.
    pub async fn run_full(&self, episode_id: Uuid) -> Result<TriggerResponse> {
        self.start_chain(episode_id, ChainKind::Full, HashSet::new(), false)
            .await
    }

    /// Resume from `start`, running it and every later stage (minus
    /// `skip`). Requires all stages strictly before `start` to be
    /// completed unless they are skipped.
    pub async fn run_from_stage(
        &self,
        episode_id: Uuid,
        start: Stage,
        skip: &[Stage],
    ) -> Result<TriggerResponse> {
        let episode = self.store.get_episode(episode_id)?;
        let skip: HashSet<Stage> = skip.iter().copied().collect();

        for stage in Stage::ORDER {
            if stage == start {
                break;
            }
            if skip.contains(&stage) {
                continue;
            }
            if !episode.pipeline_state.is_completed(stage) {
                return Err(CoreError::validation(format!(
                    "cannot start from '{}': stage '{}' has not completed",
                    start.as_str(),
                    stage.as_str()
                )));
            }
        }

        self.start_chain(episode_id, ChainKind::FromStage(start), skip, false)
            .await
    }

    async fn start_chain(
        &self,
        episode_id: Uuid,
        kind: ChainKind,
        skip: HashSet<Stage>,
        force: bool,
    ) -> Result<TriggerResponse> {
        let episode = self.store.get_episode(episode_id)?;

        // Full restarts only make sense from the start line or a terminal
        // failure; resumes (FromStage) are gated on prerequisites instead.
        if matches!(kind, ChainKind::Full | ChainKind::Stage1) {
            let allowed = [
                EpisodeStatus::Idea,
                EpisodeStatus::Failed,
                EpisodeStatus::Cancelled,
            ];
            if !allowed.contains(&episode.status) {
                return Err(CoreError::validation(format!(
                    "episode must be in 'idea', 'failed', or 'cancelled' status to start the \
                     pipeline; current status is '{}'",
                    episode.status.as_str()
                )));
            }
        }

        let active = self.store.count_active_jobs(episode_id)?;
        if active > 0 {
            return Err(CoreError::validation(format!(
                "episode has {active} active job(s); wait for them to complete or cancel them"
            )));
        }

        let stage_name = kind.job_stage_name();
        let tracking_job =
            self.store
                .create_job(episode_id, &stage_name, json!({}), self.settings.max_retries)?;
        let task_id = self.queue.register_tracking_task();
        self.store
            .set_job_external_task_id(tracking_job.id, &task_id)?;
        self.queue.reset_episode(episode_id);

        info!(
            %episode_id,
            tracking_job_id = %tracking_job.id,
            chain = %stage_name,
            "pipeline chain dispatched"
        );

        let orchestrator = self.clone();
        let tracking_job_id = tracking_job.id;
        tokio::spawn(async move {
            orchestrator
                .run_chain(episode_id, tracking_job_id, task_id, kind, skip, force)
                .await;
        });

        Ok(TriggerResponse {
            job_id: tracking_job.id,
            episode_id,
            stage: stage_name,
            status: tracking_job.status,
        })
    }

    /// The chain body: dispatch each stage in order, wait for its terminal
    /// outcome, abort on failure or cancellation.
    async fn run_chain(
        &self,
        episode_id: Uuid,
        tracking_job_id: Uuid,
        task_id: String,
        kind: ChainKind,
        skip: HashSet<Stage>,
        force: bool,
    ) {
        if self.store.mark_job_running(tracking_job_id).is_err() {
            // Cancelled (or reaped) before the chain began.
            self.queue.set_task_state(&task_id, TaskState::Revoked);
            self.queue.notify_done(tracking_job_id);
            return;
        }

        let outcome = self
            .drive_chain(episode_id, kind, &skip, force)
            .await;

        match outcome {
            Ok(summary) => {
                let result = JobResult {
                    asset_ids: Vec::new(),
                    cost_usd: 0.0,
                    duration_s: None,
                    detail: Some(summary),
                    cached: false,
                };
                if self
                    .store
                    .complete_job(tracking_job_id, &result, None)
                    .is_ok()
                {
                    self.queue.set_task_state(&task_id, TaskState::Success);
                } else {
                    self.queue.set_task_state(&task_id, TaskState::Revoked);
                }
            }
            Err(ChainAbort::Cancelled) => {
                let _ = self
                    .store
                    .cancel_job(tracking_job_id, Some("pipeline cancelled"));
                self.queue.set_task_state(&task_id, TaskState::Revoked);
            }
            Err(ChainAbort::Failed(message)) => {
                let _ = self.store.fail_job(tracking_job_id, &message);
                let _ = self.store.mark_episode_failed(episode_id, &message);
                self.queue.set_task_state(&task_id, TaskState::Failure);
            }
        }
        self.queue.notify_done(tracking_job_id);
    }

    async fn drive_chain(
        &self,
        episode_id: Uuid,
        kind: ChainKind,
        skip: &HashSet<Stage>,
        force: bool,
    ) -> std::result::Result<Value, ChainAbort> {
        let mut executed = Vec::new();

        for stage in kind.stages() {
            if skip.contains(&stage) {
                continue;
            }

            let mut episode = self
                .store
                .get_episode(episode_id)
                .map_err(|e| ChainAbort::Failed(e.to_string()))?;

            // The cancel flag is the live signal; a stale `cancelled`
            // status just means this chain is restarting the episode.
            if self.queue.is_episode_cancelled(episode_id) {
                return Err(ChainAbort::Cancelled);
            }

            if episode.pipeline_state.is_completed(stage) && !force {
                continue;
            }

            // Resuming past a completed scripting stage: park the episode
            // at script_review so the downstream preconditions hold.
            if stage > Stage::Scripting
                && episode.status == EpisodeStatus::Scripting
                && episode.pipeline_state.is_completed(Stage::Scripting)
            {
                episode = self
                    .store
                    .set_episode_status(episode_id, EpisodeStatus::ScriptReview)
                    .map_err(|e| ChainAbort::Failed(e.to_string()))?;
            }

            // The script_review gate: a chain that started before audio
            // does not cross into media production unless the episode opts
            // in with auto_advance.
            if stage == Stage::Audio && kind.start_stage() < Stage::Audio {
                if !episode.auto_advance {
                    info!(
                        %episode_id,
                        "pausing at script_review; set auto_advance or resume from audio"
                    );
                    return Ok(json!({
                        "paused_at_script_review": true,
                        "executed_stages": executed,
                    }));
                }
                warn!(
                    %episode_id,
                    "auto_advance set; skipping the script_review pause"
                );
            }

            let (job, ticket) = self
                .dispatch_stage(episode_id, stage, json!({}), force)
                .await
                .map_err(|e| ChainAbort::Failed(e.to_string()))?;
            ticket.wait().await;

            let job = self
                .store
                .get_job(job.id)
                .map_err(|e| ChainAbort::Failed(e.to_string()))?;
            match job.status {
                JobStatus::Completed => {
                    executed.push(stage.as_str());
                    // Scripting's terminal act: park the episode at
                    // script_review before metadata runs.
                    if stage == Stage::Scripting {
                        let _ = self
                            .store
                            .set_episode_status(episode_id, EpisodeStatus::ScriptReview);
                    }
                }
                JobStatus::Cancelled => return Err(ChainAbort::Cancelled),
                _ => {
                    let message = job
                        .error_message
                        .unwrap_or_else(|| format!("stage '{}' failed", stage.as_str()));
                    return Err(ChainAbort::Failed(message));
                }
            }
        }

        Ok(json!({"executed_stages": executed}))
    }

    // ── Cancellation ──────────────────────────────────────────────────

    /// Cancel an episode: transition it to `cancelled`, cancel every
    /// active job, and best-effort revoke their queue tasks. Idempotent.
    pub fn cancel_episode(&self, episode_id: Uuid) -> Result<CancelOutcome> {
        let episode = self.store.get_episode(episode_id)?;

        if episode.status != EpisodeStatus::Cancelled {
            if !episode.status.can_advance_to(EpisodeStatus::Cancelled) {
                return Err(CoreError::validation(format!(
                    "episode with status '{}' cannot be cancelled",
                    episode.status.as_str()
                )));
            }
            self.store
                .set_episode_status(episode_id, EpisodeStatus::Cancelled)?;
        }

        self.queue.cancel_episode(episode_id);
        let cancelled = self.store.cancel_active_jobs(episode_id)?;
        for job in &cancelled {
            if let Some(task_id) = &job.external_task_id {
                self.queue.revoke(task_id);
            }
            if let Ok(stage) = Stage::parse(&job.stage) {
                let _ = self.store.mark_stage_cancelled(episode_id, stage);
            }
        }

        info!(
            %episode_id,
            cancelled_job_count = cancelled.len(),
            "episode cancelled"
        );

        Ok(CancelOutcome {
            episode_id,
            status: EpisodeStatus::Cancelled,
            cancelled_job_count: cancelled.len(),
        })
    }

    /// Cancel a single job and revoke its queue task.
    pub fn cancel_job(&self, job_id: Uuid) -> Result<Job> {
        let job = self.store.cancel_job(job_id, None)?;
        if let Some(task_id) = &job.external_task_id {
            self.queue.revoke(task_id);
        }
        if let Ok(stage) = Stage::parse(&job.stage) {
            let _ = self.store.mark_stage_cancelled(job.episode_id, stage);
        }
        Ok(job)
    }

    /// Retry a failed job (`failed -> queued`) and re-dispatch it on the
    /// queue. Orchestrator tracking jobs are not retryable; start a new
    /// chain instead.
    pub async fn retry_job(&self, job_id: Uuid) -> Result<TriggerResponse> {
        let job = self.store.get_job(job_id)?;
        let stage = Stage::parse(&job.stage).map_err(|_| {
            CoreError::validation(format!(
                "job for '{}' is an orchestrator tracker; start a new pipeline run instead",
                job.stage
            ))
        })?;

        let job = self.store.retry_job(job_id)?;
        self.queue.reset_episode(job.episode_id);
        self.store.mark_stage_queued(job.episode_id, stage)?;
        let ticket = self
            .queue
            .enqueue(job.id, job.episode_id, stage, job.input_params.clone(), false)
            .await?;
        let job = self.store.set_job_external_task_id(job.id, &ticket.task_id)?;

        info!(
            job_id = %job.id,
            episode_id = %job.episode_id,
            stage = stage.as_str(),
            retry_count = job.retry_count,
            "failed job re-dispatched"
        );

        Ok(TriggerResponse {
            job_id: job.id,
            episode_id: job.episode_id,
            stage: stage.as_str().to_string(),
            status: job.status,
        })
    }

    // ── Status ────────────────────────────────────────────────────────

    pub fn pipeline_status(&self, episode_id: Uuid) -> Result<PipelineStatusReport> {
        let episode = self.store.get_episode(episode_id)?;
        let jobs = self.store.list_jobs_for_episode(episode_id)?;

        let mut stages = Vec::new();
        let mut completed = 0usize;
        for stage in Stage::ORDER {
            let summary = match episode.pipeline_state.get(stage) {
                Some(entry) => {
                    if entry.status == JobStatus::Completed {
                        completed += 1;
                    }
                    StageSummary {
                        status: entry.status.as_str().to_string(),
                        started_at: entry.started_at,
                        completed_at: entry.completed_at,
                        duration_s: match (entry.started_at, entry.completed_at) {
                            (Some(start), Some(end)) => {
                                Some((end - start).num_milliseconds() as f64 / 1000.0)
                            }
                            _ => None,
                        },
                        error: entry.error.clone(),
                        attempts: entry.attempts,
                    }
                }
                None => StageSummary {
                    status: "pending".to_string(),
                    started_at: None,
                    completed_at: None,
                    duration_s: None,
                    error: None,
                    attempts: 0,
                },
            };
            stages.push((stage.as_str().to_string(), summary));
        }

        let total = Stage::ORDER.len();
        let active_jobs = jobs
            .iter()
            .filter(|j| j.status.is_active() && Stage::parse(&j.stage).is_ok())
            .map(|j| ActiveJob {
                id: j.id,
                stage: j.stage.clone(),
                status: j.status,
            })
            .collect();

        Ok(PipelineStatusReport {
            episode_id,
            episode_status: episode.status,
            progress: PipelineProgress {
                completed_stages: completed,
                total_stages: total,
                percent_complete: (completed * 100 / total) as u32,
            },
            stages,
            active_jobs,
        })
    }

    pub fn episode(&self, episode_id: Uuid) -> Result<Episode> {
        self.store.get_episode(episode_id)
    }
}

enum ChainAbort {
    Cancelled,
    Failed(String),
}
