//! End-to-end pipeline scenarios driven through the orchestrator, the
//! in-process queue and a real (in-memory) store, with scripted provider
//! mocks and an in-memory blob store standing in for the network.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use showrunner::config::Settings;
use showrunner::db::{
    AssetType, AvatarProfile, EpisodeStatus, IdeaBrief, IdeaSource, Job, JobStatus, Priority,
    Stage, Store, VoiceProfile,
};
use showrunner::errors::{CoreError, Result};
use showrunner::orchestrator::Orchestrator;
use showrunner::providers::avatar::{AvatarRenderRequest, AvatarRenderer};
use showrunner::providers::speech::{SpeechResult, SpeechSynthesizer, VoiceSettings};
use showrunner::providers::text::{TextCompletion, TextGenerator, TextRequest, TokenUsage};
use showrunner::providers::video::{BrollRenderRequest, BrollRenderer};
use showrunner::providers::VideoClip;
use showrunner::queue::{spawn_workers, CancelFlag, TaskQueue};
use showrunner::stages::{StageRegistry, StageServices};
use showrunner::storage::{
    clamp_ttl, BlobStore, ObjectInfo, PresignedPost, UploadResult,
};
use showrunner::supervisor::{Supervisor, SupervisorConfig};

const SCRIPT: &str = "\
[AVATAR: Welcome back, today we talk about testing.]
Every shipped bug started life as an untested path.
[BROLL: montage of red CI dashboards]
[VO: A failing test today is an incident that never ships.]
[BROLL: slow pan over green builds]
[AVATAR: Go write one today.]";

// ── Mock blob store ───────────────────────────────────────────────────

#[derive(Default)]
struct MemoryBlobStore {
    objects: Mutex<HashMap<(String, String), (Vec<u8>, String)>>,
}

impl MemoryBlobStore {
    fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn ensure_bucket(&self, _bucket: &str) -> Result<()> {
        Ok(())
    }

    async fn upload(
        &self,
        bucket: &str,
        key: &str,
        data: Vec<u8>,
        content_type: Option<&str>,
        _metadata: Option<&BTreeMap<String, String>>,
    ) -> Result<UploadResult> {
        let content_type = content_type.unwrap_or("application/octet-stream").to_string();
        let size_bytes = data.len() as u64;
        self.objects.lock().unwrap().insert(
            (bucket.to_string(), key.to_string()),
            (data, content_type.clone()),
        );
        Ok(UploadResult {
            bucket: bucket.to_string(),
            key: key.to_string(),
            uri: format!("s3://{bucket}/{key}"),
            etag: format!("etag-{size_bytes}"),
            content_type,
            size_bytes,
            checksum_md5: format!("md5-{size_bytes}"),
        })
    }

    async fn download(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(&(bucket.to_string(), key.to_string()))
            .map(|(data, _)| data.clone())
            .ok_or_else(|| CoreError::not_found("S3Object", format!("{bucket}/{key}")))
    }

    async fn exists(&self, bucket: &str, key: &str) -> Result<bool> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .contains_key(&(bucket.to_string(), key.to_string())))
    }

    async fn head(&self, bucket: &str, key: &str) -> Result<ObjectInfo> {
        let guard = self.objects.lock().unwrap();
        let (data, content_type) = guard
            .get(&(bucket.to_string(), key.to_string()))
            .ok_or_else(|| CoreError::not_found("S3Object", format!("{bucket}/{key}")))?;
        Ok(ObjectInfo {
            bucket: bucket.to_string(),
            key: key.to_string(),
            uri: format!("s3://{bucket}/{key}"),
            content_type: Some(content_type.clone()),
            size_bytes: Some(data.len() as u64),
            etag: None,
        })
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        self.objects
            .lock()
            .unwrap()
            .remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }

    async fn delete_episode_assets(&self, bucket: &str, episode_id: Uuid) -> Result<u64> {
        let prefix = format!("episodes/{episode_id}/");
        let mut guard = self.objects.lock().unwrap();
        let keys: Vec<_> = guard
            .keys()
            .filter(|(b, k)| b == bucket && k.starts_with(&prefix))
            .cloned()
            .collect();
        for key in &keys {
            guard.remove(key);
        }
        Ok(keys.len() as u64)
    }

    fn presign_get(&self, bucket: &str, key: &str, ttl: Duration) -> Result<String> {
        Ok(format!(
            "memory://{bucket}/{key}?expires={}",
            clamp_ttl(ttl).as_secs()
        ))
    }

    fn presign_post(
        &self,
        bucket: &str,
        key: &str,
        _content_type: &str,
        _ttl: Duration,
    ) -> Result<PresignedPost> {
        Ok(PresignedPost {
            url: format!("memory://{bucket}"),
            fields: BTreeMap::from([("key".to_string(), key.to_string())]),
        })
    }
}

// ── Mock providers ────────────────────────────────────────────────────

#[derive(Default)]
struct MockText {
    /// Schema name that should fail with a server error, if any.
    fail_on: Mutex<Option<String>>,
}

impl MockText {
    fn fail_on(&self, schema_name: &str) {
        *self.fail_on.lock().unwrap() = Some(schema_name.to_string());
    }

    fn heal(&self) {
        *self.fail_on.lock().unwrap() = None;
    }
}

#[async_trait]
impl TextGenerator for MockText {
    async fn complete_json(&self, request: &TextRequest) -> Result<TextCompletion> {
        if self.fail_on.lock().unwrap().as_deref() == Some(request.schema_name.as_str()) {
            return Err(CoreError::external("text", "API error: 500"));
        }
        let content = match request.schema_name.as_str() {
            "episode_plan" => json!({
                "hook": "What if your tests wrote themselves?",
                "intro": "Testing is the habit that compounds.",
                "sections": [
                    {"title": "The cost of not testing", "talking_points": ["incidents", "rework"], "broll_keywords": ["alarms"]},
                    {"title": "Starting small", "talking_points": ["one test a day"], "broll_keywords": ["keyboard"]},
                ],
                "key_facts": ["most outages trace to untested paths"],
                "ctas": ["subscribe for more"],
                "broll_suggestions": ["terminal close-up"],
            }),
            "episode_script" => json!({ "script": SCRIPT }),
            "episode_metadata" => json!({
                "final_title": "Why Testing Matters",
                "title_variants": ["Testing: The Habit That Compounds"],
                "description": "Why every team should invest in tests.",
                "tags": ["testing", "software"],
                "thumbnail_prompt": "developer staring at a wall of green checkmarks",
            }),
            other => json!({"unknown_schema": other}),
        };
        Ok(TextCompletion {
            content,
            usage: TokenUsage {
                input_tokens: 800,
                output_tokens: 200,
                ..Default::default()
            }
            .priced(&request.model),
        })
    }
}

struct MockSpeech;

#[async_trait]
impl SpeechSynthesizer for MockSpeech {
    async fn synthesize(
        &self,
        _voice_id: &str,
        _model_id: Option<&str>,
        text: &str,
        _settings: &VoiceSettings,
    ) -> Result<SpeechResult> {
        let character_count = text.chars().count();
        Ok(SpeechResult {
            audio: vec![0u8; 128],
            content_type: "audio/mpeg".to_string(),
            character_count,
            estimated_duration_ms: character_count as u64 * 80,
            cost_usd: character_count as f64 * 0.00022,
        })
    }
}

#[derive(Default)]
struct MockAvatar {
    /// When set, render blocks until the episode is cancelled (simulating
    /// a long provider poll loop).
    block: AtomicBool,
    started: AtomicBool,
}

#[async_trait]
impl AvatarRenderer for MockAvatar {
    fn provider(&self) -> &'static str {
        "avatar"
    }

    async fn render(
        &self,
        _request: &AvatarRenderRequest,
        cancel: &CancelFlag,
    ) -> Result<VideoClip> {
        self.started.store(true, Ordering::SeqCst);
        if self.block.load(Ordering::SeqCst) {
            for _ in 0..500 {
                if cancel.is_cancelled() {
                    return Err(CoreError::Cancelled("avatar poll loop".into()));
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            return Err(CoreError::external("avatar", "timeout waiting for generation"));
        }
        Ok(VideoClip {
            data: vec![1u8; 256],
            content_type: "video/mp4".to_string(),
            duration_s: Some(42.0),
            provider_job_id: "avatar-job-1".to_string(),
            cost_usd: 1.0,
        })
    }
}

struct MockBroll;

#[async_trait]
impl BrollRenderer for MockBroll {
    fn provider(&self) -> &'static str {
        "video"
    }

    async fn render(
        &self,
        request: &BrollRenderRequest,
        _cancel: &CancelFlag,
    ) -> Result<VideoClip> {
        Ok(VideoClip {
            data: request.prompt.clone().into_bytes(),
            content_type: "video/mp4".to_string(),
            duration_s: Some(request.duration_s as f64),
            provider_job_id: format!("gen-{}", request.prompt.len()),
            cost_usd: request.duration_s as f64 * 0.05,
        })
    }
}

// ── Harness ───────────────────────────────────────────────────────────

struct Harness {
    store: Store,
    queue: TaskQueue,
    orchestrator: Orchestrator,
    text: Arc<MockText>,
    avatar: Arc<MockAvatar>,
    blobs: Arc<MemoryBlobStore>,
}

fn harness() -> Harness {
    let settings = Arc::new(Settings::for_tests());
    let store = Store::open_in_memory().unwrap();
    let (queue, rx) = TaskQueue::channel(settings.queue_capacity);

    let text = Arc::new(MockText::default());
    let avatar = Arc::new(MockAvatar::default());
    let blobs = Arc::new(MemoryBlobStore::default());

    let services = Arc::new(StageServices {
        store: store.clone(),
        blobs: Arc::clone(&blobs) as Arc<dyn BlobStore>,
        text: Arc::clone(&text) as Arc<dyn TextGenerator>,
        speech: Some(Arc::new(MockSpeech)),
        avatar: Some(Arc::clone(&avatar) as Arc<dyn AvatarRenderer>),
        broll: Some(Arc::new(MockBroll)),
        settings: Arc::clone(&settings),
    });

    let _workers = spawn_workers(
        2,
        rx,
        store.clone(),
        queue.clone(),
        Arc::new(StageRegistry::standard()),
        services,
    );

    let orchestrator = Orchestrator::new(store.clone(), queue.clone(), settings);
    Harness {
        store,
        queue,
        orchestrator,
        text,
        avatar,
        blobs,
    }
}

fn seed_episode(store: &Store, auto_advance: bool) -> Uuid {
    let channel = store
        .create_channel(
            "tech-weekly",
            "Tech Weekly",
            json!({"tone": "curious", "pace": "brisk"}),
            json!({"format": "explainer"}),
            &VoiceProfile {
                voice_id: "voice-1".into(),
                ..Default::default()
            },
            &AvatarProfile {
                avatar_id: "avatar-1".into(),
                background: None,
            },
        )
        .unwrap();
    store
        .create_episode(
            channel.id,
            Some("Why testing matters"),
            &IdeaBrief {
                topic: "testing".into(),
                brief: "Why testing matters".into(),
                ..Default::default()
            },
            IdeaSource::Manual,
            Priority::Normal,
            auto_advance,
        )
        .unwrap()
        .id
}

async fn wait_job_terminal(store: &Store, job_id: Uuid) -> Job {
    for _ in 0..1000 {
        let job = store.get_job(job_id).unwrap();
        if job.status.is_terminal() {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {job_id} did not reach a terminal state in time");
}

fn stage_jobs(store: &Store, episode_id: Uuid, stage: &str) -> Vec<Job> {
    store
        .list_jobs_for_episode(episode_id)
        .unwrap()
        .into_iter()
        .filter(|j| j.stage == stage)
        .collect()
}

// ── Scenario 1: happy-path Stage 1 ────────────────────────────────────

#[tokio::test]
async fn stage_1_happy_path() {
    let h = harness();
    let episode_id = seed_episode(&h.store, false);

    let response = h.orchestrator.run_stage_1(episode_id).await.unwrap();
    assert_eq!(response.stage, "stage_1_pipeline");
    let tracking = wait_job_terminal(&h.store, response.job_id).await;
    assert_eq!(tracking.status, JobStatus::Completed);

    let episode = h.store.get_episode(episode_id).unwrap();
    assert_eq!(episode.status, EpisodeStatus::ScriptReview);
    assert_eq!(episode.plan.sections.len(), 2);
    assert!(episode.script.as_deref().unwrap().contains("[AVATAR:"));
    assert_eq!(episode.episode_meta.final_title, "Why Testing Matters");
    assert!(episode.script_metadata.word_count > 0);

    // three stage jobs, all completed, with ordered timestamps
    for stage in ["planning", "scripting", "metadata"] {
        let jobs = stage_jobs(&h.store, episode_id, stage);
        assert_eq!(jobs.len(), 1, "expected one {stage} job");
        let job = &jobs[0];
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.cost_usd.unwrap() > 0.0);
        assert!(job.started_at.unwrap() >= job.created_at);
        assert!(job.completed_at.unwrap() >= job.started_at.unwrap());
    }

    // three primary assets of the right types
    let assets = h.store.list_assets(episode_id).unwrap();
    for asset_type in [AssetType::Plan, AssetType::Script, AssetType::Metadata] {
        let matching: Vec<_> = assets
            .iter()
            .filter(|a| a.asset_type == asset_type)
            .collect();
        assert_eq!(matching.len(), 1);
        assert!(matching[0].is_primary);
        assert_eq!(matching[0].version, 1);
    }
    assert_eq!(h.blobs.object_count(), 3);

    // pipeline_state: attempts exactly 1 per executed stage
    for stage in Stage::STAGE_1 {
        let entry = episode.pipeline_state.get(stage).unwrap();
        assert_eq!(entry.status, JobStatus::Completed);
        assert_eq!(entry.attempts, 1);
        assert!(entry.completed_at.is_some());
    }
}

#[tokio::test]
async fn artifact_layout_and_prefix_cleanup() {
    let h = harness();
    let episode_id = seed_episode(&h.store, false);

    let response = h.orchestrator.run_stage_1(episode_id).await.unwrap();
    wait_job_terminal(&h.store, response.job_id).await;

    let blobs: &dyn BlobStore = h.blobs.as_ref();
    let bucket = "showrunner-scripts";
    let plan_key = format!("episodes/{episode_id}/plan_v1.json");
    assert!(blobs.exists(bucket, &plan_key).await.unwrap());
    let info = blobs.head(bucket, &plan_key).await.unwrap();
    assert_eq!(info.content_type.as_deref(), Some("application/json"));
    assert!(info.size_bytes.unwrap() > 0);

    let url = blobs
        .presign_get(bucket, &plan_key, Duration::from_secs(5))
        .unwrap();
    assert!(url.contains("expires=60"), "TTL should clamp to 60s: {url}");

    let deleted = blobs.delete_episode_assets(bucket, episode_id).await.unwrap();
    assert_eq!(deleted, 3);
    assert!(!blobs.exists(bucket, &plan_key).await.unwrap());
    assert!(
        blobs.download(bucket, &plan_key).await.unwrap_err().kind() == "not_found"
    );
}

// ── Scenarios 2 & 3: provider outage, then retry succeeds ─────────────

#[tokio::test]
async fn provider_outage_fails_stage_then_retry_succeeds() {
    let h = harness();
    let episode_id = seed_episode(&h.store, false);

    // Scenario 2: scripting's provider is down.
    h.text.fail_on("episode_script");
    let response = h.orchestrator.run_stage_1(episode_id).await.unwrap();
    let tracking = wait_job_terminal(&h.store, response.job_id).await;
    assert_eq!(tracking.status, JobStatus::Failed);

    let episode = h.store.get_episode(episode_id).unwrap();
    assert_eq!(episode.status, EpisodeStatus::Failed);
    assert!(episode.last_error.is_some());

    let scripting_jobs = stage_jobs(&h.store, episode_id, "scripting");
    assert_eq!(scripting_jobs.len(), 1);
    let failed_job = &scripting_jobs[0];
    assert_eq!(failed_job.status, JobStatus::Failed);
    assert!(
        failed_job
            .error_message
            .as_deref()
            .unwrap()
            .starts_with("external_service:"),
        "unexpected error message: {:?}",
        failed_job.error_message
    );

    let entry = episode.pipeline_state.get(Stage::Scripting).unwrap();
    assert_eq!(entry.attempts, 1);
    assert!(entry.error.is_some());

    // no script asset was created
    assert!(
        h.store
            .list_assets(episode_id)
            .unwrap()
            .iter()
            .all(|a| a.asset_type != AssetType::Script)
    );

    // Scenario 3: fix the provider and retry the same job row.
    h.text.heal();
    let retried = h.orchestrator.retry_job(failed_job.id).await.unwrap();
    assert_eq!(retried.job_id, failed_job.id, "retry reuses the job row");

    let job = wait_job_terminal(&h.store, failed_job.id).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.retry_count, 1);

    let episode = h.store.get_episode(episode_id).unwrap();
    assert_eq!(episode.status, EpisodeStatus::Scripting);
    assert!(episode.script.is_some());
}

// ── Scenario 4: cancellation during a long poll ───────────────────────

#[tokio::test]
async fn cancel_during_avatar_poll() {
    let h = harness();
    let episode_id = seed_episode(&h.store, true); // auto_advance past review
    h.avatar.block.store(true, Ordering::SeqCst);

    let response = h.orchestrator.run_full(episode_id).await.unwrap();
    assert_eq!(response.stage, "full_pipeline");

    // wait for the avatar render to actually be in flight
    for _ in 0..1000 {
        if h.avatar.started.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(h.avatar.started.load(Ordering::SeqCst), "avatar never started");

    let outcome = h.orchestrator.cancel_episode(episode_id).unwrap();
    assert_eq!(outcome.status, EpisodeStatus::Cancelled);
    assert!(outcome.cancelled_job_count >= 1);

    let tracking = wait_job_terminal(&h.store, response.job_id).await;
    assert_eq!(tracking.status, JobStatus::Cancelled);

    let avatar_jobs = stage_jobs(&h.store, episode_id, "avatar");
    assert_eq!(avatar_jobs.len(), 1);
    let avatar_job = wait_job_terminal(&h.store, avatar_jobs[0].id).await;
    assert_eq!(avatar_job.status, JobStatus::Cancelled);
    assert!(avatar_job.completed_at.is_some());

    let episode = h.store.get_episode(episode_id).unwrap();
    assert_eq!(episode.status, EpisodeStatus::Cancelled);

    // earlier artifacts survive; no avatar video was produced
    let assets = h.store.list_assets(episode_id).unwrap();
    assert!(assets.iter().any(|a| a.asset_type == AssetType::Plan));
    assert!(assets.iter().any(|a| a.asset_type == AssetType::Audio));
    assert!(assets.iter().all(|a| a.asset_type != AssetType::AvatarVideo));

    // cancel is idempotent: nothing further to cancel
    let again = h.orchestrator.cancel_episode(episode_id).unwrap();
    assert_eq!(again.status, EpisodeStatus::Cancelled);
    assert_eq!(again.cancelled_job_count, 0);
}

// ── Scenario 5: orphan reap ───────────────────────────────────────────

#[tokio::test]
async fn orphan_reaper_cancels_dead_job() {
    let h = harness();
    let episode_id = seed_episode(&h.store, false);

    let job = h
        .store
        .create_job(episode_id, "audio", json!({}), 3)
        .unwrap();
    h.store.mark_job_running(job.id).unwrap();
    h.store.set_job_external_task_id(job.id, "gone").unwrap();
    h.store
        .backdate_job(job.id, Utc::now() - chrono::Duration::minutes(20))
        .unwrap();

    let supervisor = Supervisor::new(
        h.store.clone(),
        h.queue.clone(),
        SupervisorConfig::default(),
    );
    let summary = supervisor.reap_orphans().unwrap();
    assert_eq!(summary.reaped_count, 1);

    let job = h.store.get_job(job.id).unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.error_message.as_deref().unwrap().contains("orphaned"));
    assert!((Utc::now() - job.completed_at.unwrap()).num_seconds() < 5);
}

// ── Scenario 6: idempotent re-trigger ─────────────────────────────────

#[tokio::test]
async fn completed_stage_rejects_retrigger_without_force() {
    let h = harness();
    let episode_id = seed_episode(&h.store, false);

    let response = h.orchestrator.run_stage_1(episode_id).await.unwrap();
    let tracking = wait_job_terminal(&h.store, response.job_id).await;
    assert_eq!(tracking.status, JobStatus::Completed);

    let before = h.store.get_episode(episode_id).unwrap();
    let job_count_before = h.store.list_jobs_for_episode(episode_id).unwrap().len();

    let err = h
        .orchestrator
        .trigger(episode_id, Stage::Planning, json!({}), false)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "validation");
    assert!(err.to_string().contains("already completed"));

    // no new job row, episode untouched
    let after = h.store.get_episode(episode_id).unwrap();
    assert_eq!(
        h.store.list_jobs_for_episode(episode_id).unwrap().len(),
        job_count_before
    );
    assert_eq!(after.status, before.status);
    assert_eq!(after.updated_at, before.updated_at);
    assert_eq!(
        serde_json::to_string(&after.plan).unwrap(),
        serde_json::to_string(&before.plan).unwrap()
    );
}

// ── Pause gate and full resume ────────────────────────────────────────

#[tokio::test]
async fn full_pipeline_pauses_at_script_review_then_resumes() {
    let h = harness();
    let episode_id = seed_episode(&h.store, false); // auto_advance off

    let response = h.orchestrator.run_full(episode_id).await.unwrap();
    let tracking = wait_job_terminal(&h.store, response.job_id).await;
    assert_eq!(tracking.status, JobStatus::Completed);
    let detail = tracking.result.unwrap().detail.unwrap();
    assert_eq!(detail["paused_at_script_review"], true);

    let episode = h.store.get_episode(episode_id).unwrap();
    assert_eq!(episode.status, EpisodeStatus::ScriptReview);
    assert!(stage_jobs(&h.store, episode_id, "audio").is_empty());

    // operator reviewed the script; resume from audio
    let response = h
        .orchestrator
        .run_from_stage(episode_id, Stage::Audio, &[])
        .await
        .unwrap();
    assert_eq!(response.stage, "pipeline_from_audio");
    let tracking = wait_job_terminal(&h.store, response.job_id).await;
    assert_eq!(tracking.status, JobStatus::Completed);

    let episode = h.store.get_episode(episode_id).unwrap();
    assert_eq!(episode.status, EpisodeStatus::Broll);

    let assets = h.store.list_assets(episode_id).unwrap();
    assert!(assets.iter().any(|a| a.asset_type == AssetType::Audio));
    assert!(assets.iter().any(|a| a.asset_type == AssetType::AvatarVideo));

    // the script has two [BROLL] cues -> two clips, one primary
    let broll: Vec<_> = assets
        .iter()
        .filter(|a| a.asset_type == AssetType::BRoll)
        .collect();
    assert_eq!(broll.len(), 2);
    assert_eq!(broll.iter().filter(|a| a.is_primary).count(), 1);
    for index in 0..2 {
        assert!(
            broll
                .iter()
                .any(|a| a.key.as_deref().unwrap().contains(&format!("b_roll_{index}_v1"))),
            "missing clip {index}"
        );
    }

    // full run: 2 tracking jobs + 6 stage jobs
    let status = h.orchestrator.pipeline_status(episode_id).unwrap();
    assert_eq!(status.progress.completed_stages, 6);
    assert_eq!(status.progress.percent_complete, 100);
    assert!(status.active_jobs.is_empty());
}

// ── Guards ────────────────────────────────────────────────────────────

#[tokio::test]
async fn entry_points_reject_wrong_status_and_active_jobs() {
    let h = harness();
    let episode_id = seed_episode(&h.store, false);

    // unfinished prerequisite blocks run_from_stage
    let err = h
        .orchestrator
        .run_from_stage(episode_id, Stage::Audio, &[])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "validation");
    assert!(err.to_string().contains("has not completed"));

    // an active job blocks a second entry-point dispatch
    h.store
        .create_job(episode_id, "planning", json!({}), 3)
        .unwrap();
    let err = h.orchestrator.run_stage_1(episode_id).await.unwrap_err();
    assert_eq!(err.kind(), "validation");
    assert!(err.to_string().contains("active job"));
}

#[tokio::test]
async fn advance_walks_the_state_machine() {
    let h = harness();
    let episode_id = seed_episode(&h.store, false);

    // idea -> planning
    let response = h.orchestrator.advance(episode_id).await.unwrap();
    assert_eq!(response.stage, "planning");
    let job = wait_job_terminal(&h.store, response.job_id).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(
        h.store.get_episode(episode_id).unwrap().status,
        EpisodeStatus::Planning
    );

    // planning -> scripting
    let response = h.orchestrator.advance(episode_id).await.unwrap();
    assert_eq!(response.stage, "scripting");
    wait_job_terminal(&h.store, response.job_id).await;

    // scripting -> metadata (parks the episode at script_review first)
    let response = h.orchestrator.advance(episode_id).await.unwrap();
    assert_eq!(response.stage, "metadata");
    wait_job_terminal(&h.store, response.job_id).await;
    let episode = h.store.get_episode(episode_id).unwrap();
    assert_eq!(episode.status, EpisodeStatus::ScriptReview);
    assert!(!episode.episode_meta.is_empty());
}
