//! Job supervisor: keeps durable Job rows coherent with actual worker
//! activity.
//!
//! Two periodic sweeps: the orphan reaper cancels jobs whose worker died
//! (old enough and no active task behind them), and the state
//! synchroniser reconciles DB job status against the queue's view. Retry
//! itself lives on the store; the orchestrator re-dispatches.

use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::{JobStatus, Stage, Store};
use crate::errors::Result;
use crate::queue::{TaskQueue, TaskState};

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Age after which an active job with no live task is orphaned.
    pub orphan_threshold: Duration,
    /// Sweep period.
    pub interval: Duration,
    /// Task states that count as "the worker is still on it".
    pub active_states: Vec<TaskState>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            orphan_threshold: Duration::from_secs(15 * 60),
            interval: Duration::from_secs(60),
            active_states: vec![
                TaskState::Pending,
                TaskState::Started,
                TaskState::Received,
                TaskState::Retry,
            ],
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReapSummary {
    pub checked_count: usize,
    pub reaped_count: usize,
    pub reaped_job_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncSummary {
    pub checked_count: usize,
    pub synced_count: usize,
    /// Queue says success but the DB still says running: the executor's
    /// commit may have been lost. Logged for operator inspection, never
    /// auto-healed.
    pub commit_warnings: usize,
}

pub struct Supervisor {
    store: Store,
    queue: TaskQueue,
    config: SupervisorConfig,
}

impl Supervisor {
    pub fn new(store: Store, queue: TaskQueue, config: SupervisorConfig) -> Self {
        Self {
            store,
            queue,
            config,
        }
    }

    fn task_is_active(&self, external_task_id: Option<&str>) -> bool {
        let Some(task_id) = external_task_id else {
            return false;
        };
        match self.queue.task_state(task_id) {
            Some(state) => self.config.active_states.contains(&state),
            None => false, // unknown to the queue: definitely not running
        }
    }

    /// Cancel jobs stuck in `queued|running` past the threshold whose
    /// task the queue does not consider active.
    pub fn reap_orphans(&self) -> Result<ReapSummary> {
        let stale = self
            .store
            .find_stale_active_jobs(self.config.orphan_threshold)?;
        let mut summary = ReapSummary {
            checked_count: stale.len(),
            ..Default::default()
        };

        for job in stale {
            if self.task_is_active(job.external_task_id.as_deref()) {
                continue;
            }

            let age_minutes = (Utc::now() - job.created_at).num_seconds() as f64 / 60.0;
            let message = format!(
                "orphaned: stuck in {} state for {age_minutes:.1} minutes; task not active",
                job.status.as_str()
            );
            match self.store.cancel_job(job.id, Some(&message)) {
                Ok(_) => {
                    if let Ok(stage) = Stage::parse(&job.stage) {
                        let _ = self.store.mark_stage_cancelled(job.episode_id, stage);
                    }
                    info!(
                        job_id = %job.id,
                        episode_id = %job.episode_id,
                        stage = %job.stage,
                        age_minutes,
                        "orphaned job reaped"
                    );
                    summary.reaped_job_ids.push(job.id);
                    summary.reaped_count += 1;
                }
                Err(err) => {
                    // Lost the race with a worker finishing it; fine.
                    warn!(job_id = %job.id, error = %err, "orphan reap skipped");
                }
            }
        }
        Ok(summary)
    }

    /// Reconcile DB job status with the queue's view of each task.
    pub fn sync_job_states(&self) -> Result<SyncSummary> {
        let active = self.store.list_active_jobs()?;
        let mut summary = SyncSummary {
            checked_count: active.len(),
            ..Default::default()
        };

        for job in active {
            let Some(task_id) = job.external_task_id.as_deref() else {
                continue;
            };
            let Some(state) = self.queue.task_state(task_id) else {
                continue;
            };

            match state {
                TaskState::Success if job.status == JobStatus::Running => {
                    warn!(
                        job_id = %job.id,
                        stage = %job.stage,
                        "task succeeded but job still running; commit may be lost"
                    );
                    summary.commit_warnings += 1;
                }
                TaskState::Failure => {
                    if self
                        .store
                        .fail_job(job.id, "task failed (detected during sync)")
                        .is_ok()
                    {
                        if let Ok(stage) = Stage::parse(&job.stage) {
                            let _ = self.store.mark_stage_failed(
                                job.episode_id,
                                stage,
                                "task failed (detected during sync)",
                            );
                        }
                        summary.synced_count += 1;
                    }
                }
                TaskState::Revoked => {
                    if self.store.cancel_job(job.id, Some("task revoked")).is_ok() {
                        if let Ok(stage) = Stage::parse(&job.stage) {
                            let _ = self.store.mark_stage_cancelled(job.episode_id, stage);
                        }
                        summary.synced_count += 1;
                    }
                }
                _ => {}
            }
        }

        if summary.synced_count > 0 {
            info!(synced = summary.synced_count, "job states synchronised");
        }
        Ok(summary)
    }

    /// Run both sweeps forever on the configured interval.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = self.reap_orphans() {
                warn!(error = %err, "orphan reap sweep failed");
            }
            if let Err(err) = self.sync_job_states() {
                warn!(error = %err, "state sync sweep failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{AvatarProfile, IdeaBrief, IdeaSource, Priority, VoiceProfile};
    use serde_json::json;

    fn fixture() -> (Store, TaskQueue, Uuid) {
        let store = Store::open_in_memory().unwrap();
        let channel = store
            .create_channel(
                "chan",
                "Chan",
                json!({}),
                json!({}),
                &VoiceProfile::default(),
                &AvatarProfile::default(),
            )
            .unwrap();
        let episode = store
            .create_episode(
                channel.id,
                None,
                &IdeaBrief::default(),
                IdeaSource::Manual,
                Priority::Normal,
                false,
            )
            .unwrap();
        let (queue, _rx) = TaskQueue::channel(4);
        (store, queue, episode.id)
    }

    #[test]
    fn reaper_cancels_stale_job_with_dead_task() {
        let (store, queue, episode_id) = fixture();
        let job = store
            .create_job(episode_id, "audio", json!({}), 3)
            .unwrap();
        store.mark_job_running(job.id).unwrap();
        store.set_job_external_task_id(job.id, "gone").unwrap();
        store
            .backdate_job(job.id, Utc::now() - chrono::Duration::minutes(20))
            .unwrap();

        let supervisor = Supervisor::new(store.clone(), queue, SupervisorConfig::default());
        let summary = supervisor.reap_orphans().unwrap();
        assert_eq!(summary.checked_count, 1);
        assert_eq!(summary.reaped_count, 1);

        let job = store.get_job(job.id).unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.error_message.as_deref().unwrap().contains("orphaned"));
        let completed_at = job.completed_at.unwrap();
        assert!((Utc::now() - completed_at).num_seconds() < 5);
    }

    #[test]
    fn reaper_leaves_fresh_jobs_alone() {
        let (store, queue, episode_id) = fixture();
        let job = store
            .create_job(episode_id, "audio", json!({}), 3)
            .unwrap();
        store.set_job_external_task_id(job.id, "gone").unwrap();

        let supervisor = Supervisor::new(store.clone(), queue, SupervisorConfig::default());
        let summary = supervisor.reap_orphans().unwrap();
        assert_eq!(summary.reaped_count, 0);
        assert_eq!(store.get_job(job.id).unwrap().status, JobStatus::Queued);
    }

    #[test]
    fn reaper_skips_jobs_with_active_tasks() {
        let (store, queue, episode_id) = fixture();
        let job = store
            .create_job(episode_id, "avatar", json!({}), 3)
            .unwrap();
        store.set_job_external_task_id(job.id, "task-live").unwrap();
        store
            .backdate_job(job.id, Utc::now() - chrono::Duration::minutes(30))
            .unwrap();
        queue.set_task_state("task-live", TaskState::Started);

        let supervisor = Supervisor::new(store.clone(), queue, SupervisorConfig::default());
        let summary = supervisor.reap_orphans().unwrap();
        assert_eq!(summary.checked_count, 1);
        assert_eq!(summary.reaped_count, 0);
        assert_eq!(store.get_job(job.id).unwrap().status, JobStatus::Queued);
    }

    #[test]
    fn sync_marks_failed_and_revoked_jobs() {
        let (store, queue, episode_id) = fixture();
        let failed = store
            .create_job(episode_id, "scripting", json!({}), 3)
            .unwrap();
        store.mark_job_running(failed.id).unwrap();
        store
            .set_job_external_task_id(failed.id, "task-failed")
            .unwrap();
        queue.set_task_state("task-failed", TaskState::Failure);

        let revoked = store
            .create_job(episode_id, "audio", json!({}), 3)
            .unwrap();
        store
            .set_job_external_task_id(revoked.id, "task-revoked")
            .unwrap();
        queue.set_task_state("task-revoked", TaskState::Revoked);

        let supervisor = Supervisor::new(store.clone(), queue, SupervisorConfig::default());
        let summary = supervisor.sync_job_states().unwrap();
        assert_eq!(summary.synced_count, 2);

        assert_eq!(store.get_job(failed.id).unwrap().status, JobStatus::Failed);
        assert_eq!(
            store.get_job(revoked.id).unwrap().status,
            JobStatus::Cancelled
        );
    }

    #[test]
    fn sync_only_warns_on_success_mismatch() {
        let (store, queue, episode_id) = fixture();
        let job = store
            .create_job(episode_id, "planning", json!({}), 3)
            .unwrap();
        store.mark_job_running(job.id).unwrap();
        store.set_job_external_task_id(job.id, "task-done").unwrap();
        queue.set_task_state("task-done", TaskState::Success);

        let supervisor = Supervisor::new(store.clone(), queue, SupervisorConfig::default());
        let summary = supervisor.sync_job_states().unwrap();
        assert_eq!(summary.commit_warnings, 1);
        assert_eq!(summary.synced_count, 0);
        // no automatic healing
        assert_eq!(store.get_job(job.id).unwrap().status, JobStatus::Running);
    }
}
