//! In-process task queue and worker pool.
//!
//! The queue carries transient work items only; the durable source of truth
//! is always the Job row. A task-state registry mirrors what an external
//! queue broker would report (`pending`/`started`/`success`/...), which is
//! what the supervisor interrogates, and per-episode cancel flags give
//! in-flight executors their cooperative checkpoints. Delivery is
//! at-least-once from the caller's perspective, hence the idempotence
//! guards in the worker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::{JobResult, Stage, Store};
use crate::errors::{CoreError, Result};
use crate::stages::{StageRegistry, StageServices};

// ── Cancellation ──────────────────────────────────────────────────────

/// Cooperative cancellation flag shared between the orchestrator and the
/// executor working an episode.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ── Task states ───────────────────────────────────────────────────────

/// Broker-side view of a task, as the supervisor sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Received,
    Started,
    Retry,
    Success,
    Failure,
    Revoked,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Received => "received",
            Self::Started => "started",
            Self::Retry => "retry",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Revoked => "revoked",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Pending | Self::Received | Self::Started | Self::Retry
        )
    }
}

/// Transient work item. Carries no state of its own.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub task_id: String,
    pub job_id: Uuid,
    pub episode_id: Uuid,
    pub stage: Stage,
    pub params: Value,
    pub force: bool,
}

// ── Queue ─────────────────────────────────────────────────────────────

#[derive(Default)]
struct QueueInner {
    tasks: HashMap<String, TaskState>,
    episode_cancels: HashMap<Uuid, CancelFlag>,
    completions: HashMap<Uuid, watch::Sender<bool>>,
}

#[derive(Clone)]
pub struct TaskQueue {
    tx: mpsc::Sender<WorkItem>,
    inner: Arc<Mutex<QueueInner>>,
}

/// Shared receiving end for the worker pool.
pub type WorkReceiver = Arc<tokio::sync::Mutex<mpsc::Receiver<WorkItem>>>;

/// Handle returned by `enqueue`; lets the dispatcher await the terminal
/// outcome of the job (the job row itself carries the result).
pub struct JobTicket {
    pub task_id: String,
    done: watch::Receiver<bool>,
}

impl JobTicket {
    /// Wait until the worker has committed a terminal outcome for the job.
    pub async fn wait(mut self) {
        loop {
            if *self.done.borrow() {
                return;
            }
            if self.done.changed().await.is_err() {
                // Sender dropped after signalling (or queue shut down);
                // the caller re-reads the job row either way.
                return;
            }
        }
    }
}

impl TaskQueue {
    pub fn channel(capacity: usize) -> (Self, WorkReceiver) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx,
                inner: Arc::new(Mutex::new(QueueInner::default())),
            },
            Arc::new(tokio::sync::Mutex::new(rx)),
        )
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enqueue a work item for an existing job row. Returns the ticket the
    /// dispatcher can await; the generated task id is what lands in
    /// `job.external_task_id`.
    pub async fn enqueue(
        &self,
        job_id: Uuid,
        episode_id: Uuid,
        stage: Stage,
        params: Value,
        force: bool,
    ) -> Result<JobTicket> {
        let task_id = Uuid::new_v4().to_string();
        let (done_tx, done_rx) = watch::channel(false);
        {
            let mut inner = self.lock();
            inner.tasks.insert(task_id.clone(), TaskState::Pending);
            inner.completions.insert(job_id, done_tx);
        }
        self.tx
            .send(WorkItem {
                task_id: task_id.clone(),
                job_id,
                episode_id,
                stage,
                params,
                force,
            })
            .await
            .map_err(|_| CoreError::internal("task queue is closed"))?;
        Ok(JobTicket {
            task_id,
            done: done_rx,
        })
    }

    /// Register an orchestrator-tracking task that never goes on the work
    /// channel (the chain runs as its own tokio task).
    pub fn register_tracking_task(&self) -> String {
        let task_id = Uuid::new_v4().to_string();
        self.lock().tasks.insert(task_id.clone(), TaskState::Started);
        task_id
    }

    pub fn task_state(&self, task_id: &str) -> Option<TaskState> {
        self.lock().tasks.get(task_id).copied()
    }

    pub fn set_task_state(&self, task_id: &str, state: TaskState) {
        self.lock().tasks.insert(task_id.to_string(), state);
    }

    /// Best-effort revoke: pending tasks never start; started tasks are
    /// reached through the episode cancel flag instead.
    pub fn revoke(&self, task_id: &str) -> bool {
        let mut inner = self.lock();
        match inner.tasks.get_mut(task_id) {
            Some(state) if state.is_active() => {
                *state = TaskState::Revoked;
                true
            }
            _ => false,
        }
    }

    /// Cancel flag for an episode, created on first use.
    pub fn cancel_flag(&self, episode_id: Uuid) -> CancelFlag {
        self.lock()
            .episode_cancels
            .entry(episode_id)
            .or_default()
            .clone()
    }

    pub fn cancel_episode(&self, episode_id: Uuid) {
        self.cancel_flag(episode_id).cancel();
    }

    /// Clear a previous cancellation before a fresh dispatch.
    pub fn reset_episode(&self, episode_id: Uuid) {
        self.lock().episode_cancels.remove(&episode_id);
    }

    pub fn is_episode_cancelled(&self, episode_id: Uuid) -> bool {
        self.lock()
            .episode_cancels
            .get(&episode_id)
            .map(|f| f.is_cancelled())
            .unwrap_or(false)
    }

    /// Signal the dispatcher that the job reached a terminal outcome.
    pub fn notify_done(&self, job_id: Uuid) {
        if let Some(sender) = self.lock().completions.remove(&job_id) {
            let _ = sender.send(true);
        }
    }
}

// ── Worker pool ───────────────────────────────────────────────────────

/// Spawn `count` workers draining the shared receiver. Each worker owns
/// clones of the store/queue/service handles and runs one stage at a time.
pub fn spawn_workers(
    count: usize,
    rx: WorkReceiver,
    store: Store,
    queue: TaskQueue,
    registry: Arc<StageRegistry>,
    services: Arc<StageServices>,
) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|worker_id| {
            let rx = Arc::clone(&rx);
            let store = store.clone();
            let queue = queue.clone();
            let registry = Arc::clone(&registry);
            let services = Arc::clone(&services);
            tokio::spawn(async move {
                loop {
                    let item = { rx.lock().await.recv().await };
                    let Some(item) = item else {
                        break; // queue closed
                    };
                    handle_work_item(worker_id, &store, &queue, &registry, &services, item).await;
                }
            })
        })
        .collect()
}

async fn handle_work_item(
    worker_id: usize,
    store: &Store,
    queue: &TaskQueue,
    registry: &StageRegistry,
    services: &StageServices,
    item: WorkItem,
) {
    let WorkItem {
        task_id,
        job_id,
        episode_id,
        stage,
        params,
        force,
    } = item;

    // Revoked while pending, or the episode was cancelled before we got
    // here: record the cancellation and move on.
    let revoked = queue.task_state(&task_id) == Some(TaskState::Revoked);
    if revoked || queue.is_episode_cancelled(episode_id) {
        if store.cancel_job(job_id, Some("cancelled before start")).is_ok() {
            let _ = store.mark_stage_cancelled(episode_id, stage);
        }
        if !revoked {
            queue.set_task_state(&task_id, TaskState::Revoked);
        }
        queue.notify_done(job_id);
        return;
    }

    queue.set_task_state(&task_id, TaskState::Received);

    let job = match store.mark_job_running(job_id) {
        Ok(job) => job,
        Err(err) => {
            // The job was cancelled or reaped between enqueue and pickup.
            warn!(%job_id, stage = stage.as_str(), error = %err, "job not startable, skipping");
            queue.set_task_state(&task_id, TaskState::Revoked);
            queue.notify_done(job_id);
            return;
        }
    };
    queue.set_task_state(&task_id, TaskState::Started);

    info!(
        worker_id,
        %job_id,
        %episode_id,
        stage = stage.as_str(),
        attempt = job.retry_count + 1,
        "stage started"
    );

    // Idempotent no-op: a completed stage is never re-run without force.
    // The cached reference comes from the latest completed stage job.
    if !force {
        match store.get_episode(episode_id) {
            Ok(episode) if episode.pipeline_state.is_completed(stage) => {
                let prior = store
                    .latest_completed_job_for_stage(episode_id, stage.as_str())
                    .ok()
                    .flatten()
                    .and_then(|j| j.result);
                let result = JobResult {
                    asset_ids: prior.as_ref().map(|r| r.asset_ids.clone()).unwrap_or_default(),
                    cost_usd: 0.0,
                    duration_s: None,
                    detail: None,
                    cached: true,
                };
                match store.complete_job(job_id, &result, None) {
                    Ok(_) => queue.set_task_state(&task_id, TaskState::Success),
                    Err(err) => {
                        warn!(%job_id, error = %err, "cached completion failed");
                        queue.set_task_state(&task_id, TaskState::Failure);
                    }
                }
                queue.notify_done(job_id);
                return;
            }
            _ => {}
        }
    }

    let _ = store.mark_stage_running(episode_id, stage);

    let cancel = queue.cancel_flag(episode_id);
    let outcome = match registry.get(stage) {
        Some(executor) => {
            let ctx = crate::stages::StageContext {
                services,
                episode_id,
                job_id,
                params,
                force,
                cancel: cancel.clone(),
            };
            executor.execute(&ctx).await
        }
        None => Err(CoreError::internal(format!(
            "no executor registered for stage '{}'",
            stage.as_str()
        ))),
    };

    match outcome {
        Ok(outcome) => {
            info!(
                worker_id,
                %job_id,
                stage = stage.as_str(),
                cost_usd = outcome.cost_usd,
                "stage completed"
            );
            queue.set_task_state(&task_id, TaskState::Success);
        }
        Err(CoreError::Cancelled(reason)) => {
            info!(%job_id, stage = stage.as_str(), %reason, "stage cancelled");
            if store.cancel_job(job_id, Some("cancelled")).is_ok() {
                let _ = store.mark_stage_cancelled(episode_id, stage);
            }
            queue.set_task_state(&task_id, TaskState::Revoked);
        }
        Err(err) => {
            let message = err.to_string();
            warn!(%job_id, stage = stage.as_str(), error = %message, "stage failed");
            let _ = store.fail_job(job_id, &message);
            let _ = store.mark_stage_failed(episode_id, stage, &message);
            queue.set_task_state(&task_id, TaskState::Failure);
        }
    }
    queue.notify_done(job_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_flag_is_shared() {
        let flag = CancelFlag::new();
        let other = flag.clone();
        assert!(!other.is_cancelled());
        flag.cancel();
        assert!(other.is_cancelled());
    }

    #[test]
    fn task_states_active_set() {
        for state in [
            TaskState::Pending,
            TaskState::Received,
            TaskState::Started,
            TaskState::Retry,
        ] {
            assert!(state.is_active(), "{} should be active", state.as_str());
        }
        for state in [TaskState::Success, TaskState::Failure, TaskState::Revoked] {
            assert!(!state.is_active(), "{} should be terminal", state.as_str());
        }
    }

    #[tokio::test]
    async fn enqueue_registers_pending_task() {
        let (queue, rx) = TaskQueue::channel(4);
        let job_id = Uuid::new_v4();
        let ticket = queue
            .enqueue(job_id, Uuid::new_v4(), Stage::Planning, Value::Null, false)
            .await
            .unwrap();
        assert_eq!(queue.task_state(&ticket.task_id), Some(TaskState::Pending));

        let item = rx.lock().await.recv().await.unwrap();
        assert_eq!(item.job_id, job_id);
        assert_eq!(item.stage, Stage::Planning);
    }

    #[tokio::test]
    async fn revoke_only_hits_active_tasks() {
        let (queue, _rx) = TaskQueue::channel(4);
        let ticket = queue
            .enqueue(
                Uuid::new_v4(),
                Uuid::new_v4(),
                Stage::Audio,
                Value::Null,
                false,
            )
            .await
            .unwrap();
        assert!(queue.revoke(&ticket.task_id));
        assert_eq!(queue.task_state(&ticket.task_id), Some(TaskState::Revoked));
        // a second revoke is a no-op
        assert!(!queue.revoke(&ticket.task_id));
        // unknown tasks are not revocable
        assert!(!queue.revoke("no-such-task"));
    }

    #[tokio::test]
    async fn ticket_wait_returns_after_notify() {
        let (queue, _rx) = TaskQueue::channel(4);
        let job_id = Uuid::new_v4();
        let ticket = queue
            .enqueue(job_id, Uuid::new_v4(), Stage::Planning, Value::Null, false)
            .await
            .unwrap();

        let waiter = tokio::spawn(ticket.wait());
        queue.notify_done(job_id);
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("ticket.wait should resolve")
            .unwrap();
    }

    #[tokio::test]
    async fn episode_cancel_flag_reset() {
        let (queue, _rx) = TaskQueue::channel(4);
        let episode_id = Uuid::new_v4();
        assert!(!queue.is_episode_cancelled(episode_id));
        queue.cancel_episode(episode_id);
        assert!(queue.is_episode_cancelled(episode_id));
        queue.reset_episode(episode_id);
        assert!(!queue.is_episode_cancelled(episode_id));
    }
}
