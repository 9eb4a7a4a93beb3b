//! SQLite store for channels, episodes, jobs and assets.
//!
//! The store is the serialisation point for all entity writes. It is a
//! synchronous rusqlite connection behind a mutex; every caller re-reads
//! entities from here rather than holding them in memory. Stage completion
//! goes through [`Store::commit_stage_success`], a single transaction that
//! writes the asset rows, the episode content slot, the pipeline-state
//! entry and the job outcome together.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::{CoreError, Result};

use super::models::*;

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

/// Asset fields a stage executor hands to the commit transaction.
#[derive(Debug, Clone)]
pub struct AssetDraft {
    pub asset_type: AssetType,
    pub uri: String,
    pub bucket: Option<String>,
    pub key: Option<String>,
    pub content_type: Option<String>,
    pub size_bytes: Option<u64>,
    pub duration_s: Option<f64>,
    pub provider: Option<String>,
    pub provider_job_id: Option<String>,
    pub version: u32,
    pub metadata: Value,
}

/// Episode content-slot update applied at stage commit. Content slots are
/// write-once per revision: each variant overwrites its slot wholesale.
#[derive(Debug, Clone)]
pub enum ContentUpdate {
    None,
    Plan(Plan),
    Script {
        text: String,
        metadata: ScriptMetadata,
    },
    EpisodeMeta(EpisodeMeta),
}

/// Everything a stage commit writes atomically.
#[derive(Debug)]
pub struct StageCommit {
    pub job_id: Uuid,
    pub episode_id: Uuid,
    pub stage: Stage,
    pub assets: Vec<AssetDraft>,
    pub content: ContentUpdate,
    pub cost_usd: f64,
    pub tokens_used: Option<u64>,
    pub duration_s: Option<f64>,
    pub detail: Option<Value>,
}

fn now_str() -> String {
    Utc::now().to_rfc3339()
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CoreError::internal(format!("invalid timestamp '{s}': {e}")))
}

fn parse_ts_opt(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

impl Store {
    /// Open (or create) the database at the given path and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| CoreError::internal(format!("failed to open database: {e}")))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Create an in-memory database (for tests and ad-hoc runs).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| CoreError::internal(format!("failed to open in-memory database: {e}")))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned store mutex means a writer panicked mid-operation;
        // continuing with the underlying connection is still sound because
        // every write is transactional.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn init(&self) -> Result<()> {
        let conn = self.lock();
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS channels (
                id TEXT PRIMARY KEY,
                slug TEXT NOT NULL,
                name TEXT NOT NULL,
                platform_channel_id TEXT,
                persona TEXT NOT NULL DEFAULT '{}',
                style_guide TEXT NOT NULL DEFAULT '{}',
                voice_profile TEXT NOT NULL DEFAULT '{}',
                avatar_profile TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
                updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
                deleted_at TEXT
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_channels_live_slug
                ON channels(slug) WHERE deleted_at IS NULL;

            CREATE TABLE IF NOT EXISTS episodes (
                id TEXT PRIMARY KEY,
                channel_id TEXT NOT NULL REFERENCES channels(id) ON DELETE RESTRICT,
                title TEXT,
                slug TEXT,
                status TEXT NOT NULL DEFAULT 'idea',
                idea_source TEXT NOT NULL DEFAULT 'manual',
                priority INTEGER NOT NULL DEFAULT 0,
                idea TEXT NOT NULL DEFAULT '{}',
                plan TEXT NOT NULL DEFAULT '{}',
                script TEXT,
                script_metadata TEXT NOT NULL DEFAULT '{}',
                episode_meta TEXT NOT NULL DEFAULT '{}',
                pipeline_state TEXT NOT NULL DEFAULT '{}',
                auto_advance INTEGER NOT NULL DEFAULT 0,
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                published_url TEXT,
                published_at TEXT,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
                updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
                deleted_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_episodes_channel ON episodes(channel_id);
            CREATE INDEX IF NOT EXISTS idx_episodes_status ON episodes(status);

            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                episode_id TEXT NOT NULL REFERENCES episodes(id) ON DELETE CASCADE,
                stage TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'queued',
                external_task_id TEXT,
                input_params TEXT NOT NULL DEFAULT '{}',
                result TEXT,
                error_message TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                cost_usd REAL,
                tokens_used INTEGER,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
                updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
                started_at TEXT,
                completed_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_episode ON jobs(episode_id);
            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
            CREATE INDEX IF NOT EXISTS idx_jobs_episode_stage ON jobs(episode_id, stage);

            CREATE TABLE IF NOT EXISTS assets (
                id TEXT PRIMARY KEY,
                episode_id TEXT NOT NULL REFERENCES episodes(id) ON DELETE CASCADE,
                asset_type TEXT NOT NULL,
                uri TEXT NOT NULL,
                bucket TEXT,
                key TEXT,
                content_type TEXT,
                size_bytes INTEGER,
                duration_s REAL,
                provider TEXT,
                provider_job_id TEXT,
                version INTEGER NOT NULL DEFAULT 1,
                is_primary INTEGER NOT NULL DEFAULT 0,
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
                updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
                deleted_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_assets_episode ON assets(episode_id);
            CREATE INDEX IF NOT EXISTS idx_assets_episode_type ON assets(episode_id, asset_type);

            CREATE TRIGGER IF NOT EXISTS trg_channels_updated_at
                AFTER UPDATE ON channels FOR EACH ROW
            BEGIN
                UPDATE channels SET updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')
                WHERE id = NEW.id;
            END;

            CREATE TRIGGER IF NOT EXISTS trg_episodes_updated_at
                AFTER UPDATE ON episodes FOR EACH ROW
            BEGIN
                UPDATE episodes SET updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')
                WHERE id = NEW.id;
            END;

            CREATE TRIGGER IF NOT EXISTS trg_jobs_updated_at
                AFTER UPDATE ON jobs FOR EACH ROW
            BEGIN
                UPDATE jobs SET updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')
                WHERE id = NEW.id;
            END;

            CREATE TRIGGER IF NOT EXISTS trg_assets_updated_at
                AFTER UPDATE ON assets FOR EACH ROW
            BEGIN
                UPDATE assets SET updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')
                WHERE id = NEW.id;
            END;
            ",
        )?;
        Ok(())
    }

    // ── Channels ──────────────────────────────────────────────────────

    pub fn create_channel(
        &self,
        slug: &str,
        name: &str,
        persona: Value,
        style_guide: Value,
        voice_profile: &VoiceProfile,
        avatar_profile: &AvatarProfile,
    ) -> Result<Channel> {
        let id = Uuid::new_v4();
        let conn = self.lock();
        conn.execute(
            "INSERT INTO channels (id, slug, name, persona, style_guide, voice_profile, avatar_profile)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id.to_string(),
                slug,
                name,
                persona.to_string(),
                style_guide.to_string(),
                serde_json::to_string(voice_profile)?,
                serde_json::to_string(avatar_profile)?,
            ],
        )
        .map_err(|e| {
            if is_constraint_violation(&e) {
                CoreError::conflict(format!("channel slug '{slug}' already exists"))
            } else {
                e.into()
            }
        })?;
        drop(conn);
        self.get_channel(id)
    }

    pub fn get_channel(&self, id: Uuid) -> Result<Channel> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT id, slug, name, platform_channel_id, persona, style_guide,
                        voice_profile, avatar_profile, created_at, updated_at, deleted_at
                 FROM channels WHERE id = ?1 AND deleted_at IS NULL",
                params![id.to_string()],
                |row| {
                    Ok(ChannelRow {
                        id: row.get(0)?,
                        slug: row.get(1)?,
                        name: row.get(2)?,
                        platform_channel_id: row.get(3)?,
                        persona: row.get(4)?,
                        style_guide: row.get(5)?,
                        voice_profile: row.get(6)?,
                        avatar_profile: row.get(7)?,
                        created_at: row.get(8)?,
                        updated_at: row.get(9)?,
                        deleted_at: row.get(10)?,
                    })
                },
            )
            .optional()?;
        row.ok_or_else(|| CoreError::not_found("Channel", id.to_string()))?
            .into_channel()
    }

    // ── Episodes ──────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub fn create_episode(
        &self,
        channel_id: Uuid,
        title: Option<&str>,
        idea: &IdeaBrief,
        idea_source: IdeaSource,
        priority: Priority,
        auto_advance: bool,
    ) -> Result<Episode> {
        let id = Uuid::new_v4();
        let conn = self.lock();
        conn.execute(
            "INSERT INTO episodes (id, channel_id, title, idea, idea_source, priority, auto_advance)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id.to_string(),
                channel_id.to_string(),
                title,
                serde_json::to_string(idea)?,
                idea_source.as_str(),
                priority.to_int(),
                auto_advance as i64,
            ],
        )
        .map_err(|e| {
            if is_constraint_violation(&e) {
                CoreError::not_found("Channel", channel_id.to_string())
            } else {
                e.into()
            }
        })?;
        drop(conn);
        self.get_episode(id)
    }

    pub fn get_episode(&self, id: Uuid) -> Result<Episode> {
        let conn = self.lock();
        Self::get_episode_conn(&conn, id)
    }

    fn get_episode_conn(conn: &Connection, id: Uuid) -> Result<Episode> {
        let row = conn
            .query_row(
                "SELECT id, channel_id, title, slug, status, idea_source, priority, idea, plan,
                        script, script_metadata, episode_meta, pipeline_state, auto_advance,
                        retry_count, last_error, published_url, published_at,
                        created_at, updated_at, deleted_at
                 FROM episodes WHERE id = ?1 AND deleted_at IS NULL",
                params![id.to_string()],
                Self::episode_row,
            )
            .optional()?;
        row.ok_or_else(|| CoreError::not_found("Episode", id.to_string()))?
            .into_episode()
    }

    fn episode_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EpisodeRow> {
        Ok(EpisodeRow {
            id: row.get(0)?,
            channel_id: row.get(1)?,
            title: row.get(2)?,
            slug: row.get(3)?,
            status: row.get(4)?,
            idea_source: row.get(5)?,
            priority: row.get(6)?,
            idea: row.get(7)?,
            plan: row.get(8)?,
            script: row.get(9)?,
            script_metadata: row.get(10)?,
            episode_meta: row.get(11)?,
            pipeline_state: row.get(12)?,
            auto_advance: row.get(13)?,
            retry_count: row.get(14)?,
            last_error: row.get(15)?,
            published_url: row.get(16)?,
            published_at: row.get(17)?,
            created_at: row.get(18)?,
            updated_at: row.get(19)?,
            deleted_at: row.get(20)?,
        })
    }

    pub fn set_episode_status(&self, id: Uuid, status: EpisodeStatus) -> Result<Episode> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE episodes SET status = ?1 WHERE id = ?2 AND deleted_at IS NULL",
            params![status.as_str(), id.to_string()],
        )?;
        if changed == 0 {
            return Err(CoreError::not_found("Episode", id.to_string()));
        }
        Self::get_episode_conn(&conn, id)
    }

    /// Record a chain-level failure on the episode: status `failed`,
    /// `last_error` set, `retry_count` incremented.
    pub fn mark_episode_failed(&self, id: Uuid, error: &str) -> Result<Episode> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE episodes SET status = 'failed', last_error = ?1,
                    retry_count = retry_count + 1
             WHERE id = ?2 AND deleted_at IS NULL",
            params![error, id.to_string()],
        )?;
        if changed == 0 {
            return Err(CoreError::not_found("Episode", id.to_string()));
        }
        Self::get_episode_conn(&conn, id)
    }

    pub fn soft_delete_episode(&self, id: Uuid) -> Result<bool> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE episodes SET deleted_at = ?1 WHERE id = ?2 AND deleted_at IS NULL",
            params![now_str(), id.to_string()],
        )?;
        Ok(changed > 0)
    }

    // ── Pipeline state ────────────────────────────────────────────────

    fn update_pipeline_state<F>(&self, episode_id: Uuid, mutate: F) -> Result<Episode>
    where
        F: FnOnce(&mut PipelineState),
    {
        let conn = self.lock();
        let episode = Self::get_episode_conn(&conn, episode_id)?;
        let mut state = episode.pipeline_state;
        mutate(&mut state);
        conn.execute(
            "UPDATE episodes SET pipeline_state = ?1 WHERE id = ?2",
            params![serde_json::to_string(&state)?, episode_id.to_string()],
        )?;
        Self::get_episode_conn(&conn, episode_id)
    }

    pub fn mark_stage_queued(&self, episode_id: Uuid, stage: Stage) -> Result<Episode> {
        self.update_pipeline_state(episode_id, |state| {
            let entry = state.entry_mut(stage, JobStatus::Queued);
            entry.status = JobStatus::Queued;
            entry.error = None;
            entry.updated_at = Utc::now();
        })
    }

    /// Transition a stage to `running`: stamps `started_at` and counts the
    /// attempt. `attempts >= 1` iff the stage has ever run.
    pub fn mark_stage_running(&self, episode_id: Uuid, stage: Stage) -> Result<Episode> {
        self.update_pipeline_state(episode_id, |state| {
            let now = Utc::now();
            let entry = state.entry_mut(stage, JobStatus::Running);
            entry.status = JobStatus::Running;
            entry.started_at = Some(now);
            entry.completed_at = None;
            entry.error = None;
            entry.attempts += 1;
            entry.updated_at = now;
        })
    }

    pub fn mark_stage_failed(&self, episode_id: Uuid, stage: Stage, error: &str) -> Result<Episode> {
        self.update_pipeline_state(episode_id, |state| {
            let entry = state.entry_mut(stage, JobStatus::Failed);
            entry.status = JobStatus::Failed;
            entry.error = Some(error.to_string());
            entry.updated_at = Utc::now();
        })
    }

    pub fn mark_stage_cancelled(&self, episode_id: Uuid, stage: Stage) -> Result<Episode> {
        self.update_pipeline_state(episode_id, |state| {
            let now = Utc::now();
            let entry = state.entry_mut(stage, JobStatus::Cancelled);
            entry.status = JobStatus::Cancelled;
            entry.completed_at = Some(now);
            entry.updated_at = now;
        })
    }

    // ── Jobs ──────────────────────────────────────────────────────────

    pub fn create_job(
        &self,
        episode_id: Uuid,
        stage: &str,
        input_params: Value,
        max_retries: u32,
    ) -> Result<Job> {
        let id = Uuid::new_v4();
        let conn = self.lock();
        conn.execute(
            "INSERT INTO jobs (id, episode_id, stage, input_params, max_retries)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id.to_string(),
                episode_id.to_string(),
                stage,
                input_params.to_string(),
                max_retries,
            ],
        )
        .map_err(|e| {
            if is_constraint_violation(&e) {
                CoreError::not_found("Episode", episode_id.to_string())
            } else {
                e.into()
            }
        })?;
        drop(conn);
        self.get_job(id)
    }

    pub fn get_job(&self, id: Uuid) -> Result<Job> {
        let conn = self.lock();
        Self::get_job_conn(&conn, id)
    }

    fn get_job_conn(conn: &Connection, id: Uuid) -> Result<Job> {
        let row = conn
            .query_row(
                &format!("{JOB_SELECT} WHERE id = ?1"),
                params![id.to_string()],
                Self::job_row,
            )
            .optional()?;
        row.ok_or_else(|| CoreError::not_found("Job", id.to_string()))?
            .into_job()
    }

    fn job_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobRow> {
        Ok(JobRow {
            id: row.get(0)?,
            episode_id: row.get(1)?,
            stage: row.get(2)?,
            status: row.get(3)?,
            external_task_id: row.get(4)?,
            input_params: row.get(5)?,
            result: row.get(6)?,
            error_message: row.get(7)?,
            retry_count: row.get(8)?,
            max_retries: row.get(9)?,
            cost_usd: row.get(10)?,
            tokens_used: row.get(11)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
            started_at: row.get(14)?,
            completed_at: row.get(15)?,
        })
    }

    pub fn set_job_external_task_id(&self, id: Uuid, task_id: &str) -> Result<Job> {
        let conn = self.lock();
        conn.execute(
            "UPDATE jobs SET external_task_id = ?1 WHERE id = ?2",
            params![task_id, id.to_string()],
        )?;
        Self::get_job_conn(&conn, id)
    }

    /// `queued -> running` is the only permitted start transition.
    pub fn mark_job_running(&self, id: Uuid) -> Result<Job> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE jobs SET status = 'running', started_at = ?1
             WHERE id = ?2 AND status = 'queued'",
            params![now_str(), id.to_string()],
        )?;
        if changed == 0 {
            let job = Self::get_job_conn(&conn, id)?;
            return Err(CoreError::conflict(format!(
                "job {id} cannot start from status '{}'",
                job.status.as_str()
            )));
        }
        Self::get_job_conn(&conn, id)
    }

    pub fn fail_job(&self, id: Uuid, error_message: &str) -> Result<Job> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE jobs SET status = 'failed', error_message = ?1, completed_at = ?2
             WHERE id = ?3 AND status IN ('queued', 'running')",
            params![error_message, now_str(), id.to_string()],
        )?;
        if changed == 0 {
            let job = Self::get_job_conn(&conn, id)?;
            return Err(CoreError::conflict(format!(
                "job {id} cannot fail from terminal status '{}'",
                job.status.as_str()
            )));
        }
        Self::get_job_conn(&conn, id)
    }

    pub fn cancel_job(&self, id: Uuid, error_message: Option<&str>) -> Result<Job> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE jobs SET status = 'cancelled', error_message = ?1, completed_at = ?2
             WHERE id = ?3 AND status IN ('queued', 'running')",
            params![error_message, now_str(), id.to_string()],
        )?;
        if changed == 0 {
            let job = Self::get_job_conn(&conn, id)?;
            return Err(CoreError::validation(format!(
                "job with status '{}' cannot be cancelled",
                job.status.as_str()
            )));
        }
        Self::get_job_conn(&conn, id)
    }

    /// Complete a running job without a stage commit (used for cached
    /// idempotent no-ops).
    pub fn complete_job(
        &self,
        id: Uuid,
        result: &JobResult,
        tokens_used: Option<u64>,
    ) -> Result<Job> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE jobs SET status = 'completed', result = ?1, cost_usd = ?2,
                    tokens_used = ?3, completed_at = ?4
             WHERE id = ?5 AND status = 'running'",
            params![
                serde_json::to_string(result)?,
                result.cost_usd,
                tokens_used,
                now_str(),
                id.to_string(),
            ],
        )?;
        if changed == 0 {
            let job = Self::get_job_conn(&conn, id)?;
            return Err(CoreError::conflict(format!(
                "job {id} cannot complete from status '{}'",
                job.status.as_str()
            )));
        }
        Self::get_job_conn(&conn, id)
    }

    /// `failed -> queued`, bounded by `max_retries`. Clears execution
    /// fields; the caller must re-dispatch.
    pub fn retry_job(&self, id: Uuid) -> Result<Job> {
        let conn = self.lock();
        let job = Self::get_job_conn(&conn, id)?;
        if job.status != JobStatus::Failed {
            return Err(CoreError::validation(format!(
                "job cannot be retried (status: {})",
                job.status.as_str()
            )));
        }
        if job.retry_count >= job.max_retries {
            return Err(CoreError::validation(format!(
                "job cannot be retried (retries: {}/{})",
                job.retry_count, job.max_retries
            )));
        }
        conn.execute(
            "UPDATE jobs SET status = 'queued', retry_count = retry_count + 1,
                    started_at = NULL, completed_at = NULL, error_message = NULL
             WHERE id = ?1",
            params![id.to_string()],
        )?;
        Self::get_job_conn(&conn, id)
    }

    pub fn count_active_jobs(&self, episode_id: Uuid) -> Result<u32> {
        let conn = self.lock();
        let count: u32 = conn.query_row(
            "SELECT COUNT(*) FROM jobs
             WHERE episode_id = ?1 AND status IN ('queued', 'running')",
            params![episode_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn active_job_for_stage(&self, episode_id: Uuid, stage: &str) -> Result<Option<Job>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                &format!(
                    "{JOB_SELECT}
                     WHERE episode_id = ?1 AND stage = ?2 AND status IN ('queued', 'running')
                     ORDER BY created_at DESC LIMIT 1"
                ),
                params![episode_id.to_string(), stage],
                Self::job_row,
            )
            .optional()?;
        row.map(|r| r.into_job()).transpose()
    }

    pub fn latest_completed_job_for_stage(
        &self,
        episode_id: Uuid,
        stage: &str,
    ) -> Result<Option<Job>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                &format!(
                    "{JOB_SELECT}
                     WHERE episode_id = ?1 AND stage = ?2 AND status = 'completed'
                     ORDER BY completed_at DESC LIMIT 1"
                ),
                params![episode_id.to_string(), stage],
                Self::job_row,
            )
            .optional()?;
        row.map(|r| r.into_job()).transpose()
    }

    pub fn list_jobs_for_episode(&self, episode_id: Uuid) -> Result<Vec<Job>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "{JOB_SELECT} WHERE episode_id = ?1 ORDER BY created_at DESC, id DESC"
        ))?;
        let rows = stmt.query_map(params![episode_id.to_string()], Self::job_row)?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row?.into_job()?);
        }
        Ok(jobs)
    }

    /// Cancel every active job for an episode; returns the cancelled jobs.
    pub fn cancel_active_jobs(&self, episode_id: Uuid) -> Result<Vec<Job>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "{JOB_SELECT} WHERE episode_id = ?1 AND status IN ('queued', 'running')"
        ))?;
        let rows = stmt.query_map(params![episode_id.to_string()], Self::job_row)?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?.id);
        }
        drop(stmt);

        let now = now_str();
        let mut cancelled = Vec::new();
        for id in ids {
            conn.execute(
                "UPDATE jobs SET status = 'cancelled', completed_at = ?1 WHERE id = ?2",
                params![now, id],
            )?;
            let uid = Uuid::parse_str(&id)
                .map_err(|e| CoreError::internal(format!("invalid job id '{id}': {e}")))?;
            cancelled.push(Self::get_job_conn(&conn, uid)?);
        }
        Ok(cancelled)
    }

    /// Jobs still `queued|running` whose `created_at` is older than the
    /// threshold. Orphan-reaper input; the queue check happens upstream.
    pub fn find_stale_active_jobs(&self, older_than: Duration) -> Result<Vec<Job>> {
        let cutoff = (Utc::now()
            - chrono::Duration::from_std(older_than)
                .map_err(|e| CoreError::internal(format!("invalid threshold: {e}")))?)
        .to_rfc3339();
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "{JOB_SELECT} WHERE status IN ('queued', 'running') AND created_at < ?1"
        ))?;
        let rows = stmt.query_map(params![cutoff], Self::job_row)?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row?.into_job()?);
        }
        Ok(jobs)
    }

    pub fn list_active_jobs(&self) -> Result<Vec<Job>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "{JOB_SELECT} WHERE status IN ('queued', 'running') ORDER BY created_at"
        ))?;
        let rows = stmt.query_map([], Self::job_row)?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row?.into_job()?);
        }
        Ok(jobs)
    }

    /// Test/maintenance hook: backdate a job's `created_at`.
    pub fn backdate_job(&self, id: Uuid, created_at: DateTime<Utc>) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE jobs SET created_at = ?1 WHERE id = ?2",
            params![created_at.to_rfc3339(), id.to_string()],
        )?;
        Ok(())
    }

    // ── Assets ────────────────────────────────────────────────────────

    /// Next version number for `(episode, asset_type)`, monotonically
    /// increasing across soft-deleted rows too.
    pub fn next_asset_version(&self, episode_id: Uuid, asset_type: AssetType) -> Result<u32> {
        let conn = self.lock();
        let max: u32 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM assets
             WHERE episode_id = ?1 AND asset_type = ?2",
            params![episode_id.to_string(), asset_type.as_str()],
            |row| row.get(0),
        )?;
        Ok(max + 1)
    }

    pub fn create_asset(&self, episode_id: Uuid, draft: &AssetDraft) -> Result<Asset> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let id = Self::insert_asset_tx(&tx, episode_id, draft)?;
        tx.commit()?;
        Self::get_asset_conn(&conn, id)
    }

    /// Insert an asset as primary, demoting live siblings of the same type
    /// in the same transaction.
    fn insert_asset_tx(tx: &Transaction<'_>, episode_id: Uuid, draft: &AssetDraft) -> Result<Uuid> {
        tx.execute(
            "UPDATE assets SET is_primary = 0
             WHERE episode_id = ?1 AND asset_type = ?2 AND deleted_at IS NULL",
            params![episode_id.to_string(), draft.asset_type.as_str()],
        )?;
        let id = Uuid::new_v4();
        tx.execute(
            "INSERT INTO assets (id, episode_id, asset_type, uri, bucket, key, content_type,
                                 size_bytes, duration_s, provider, provider_job_id, version,
                                 is_primary, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 1, ?13)",
            params![
                id.to_string(),
                episode_id.to_string(),
                draft.asset_type.as_str(),
                draft.uri,
                draft.bucket,
                draft.key,
                draft.content_type,
                draft.size_bytes,
                draft.duration_s,
                draft.provider,
                draft.provider_job_id,
                draft.version,
                draft.metadata.to_string(),
            ],
        )?;
        Ok(id)
    }

    pub fn get_asset(&self, id: Uuid) -> Result<Asset> {
        let conn = self.lock();
        Self::get_asset_conn(&conn, id)
    }

    fn get_asset_conn(conn: &Connection, id: Uuid) -> Result<Asset> {
        let row = conn
            .query_row(
                &format!("{ASSET_SELECT} WHERE id = ?1 AND deleted_at IS NULL"),
                params![id.to_string()],
                Self::asset_row,
            )
            .optional()?;
        row.ok_or_else(|| CoreError::not_found("Asset", id.to_string()))?
            .into_asset()
    }

    fn asset_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AssetRow> {
        Ok(AssetRow {
            id: row.get(0)?,
            episode_id: row.get(1)?,
            asset_type: row.get(2)?,
            uri: row.get(3)?,
            bucket: row.get(4)?,
            key: row.get(5)?,
            content_type: row.get(6)?,
            size_bytes: row.get(7)?,
            duration_s: row.get(8)?,
            provider: row.get(9)?,
            provider_job_id: row.get(10)?,
            version: row.get(11)?,
            is_primary: row.get(12)?,
            metadata: row.get(13)?,
            created_at: row.get(14)?,
            updated_at: row.get(15)?,
            deleted_at: row.get(16)?,
        })
    }

    pub fn list_assets(&self, episode_id: Uuid) -> Result<Vec<Asset>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "{ASSET_SELECT} WHERE episode_id = ?1 AND deleted_at IS NULL
             ORDER BY asset_type, version"
        ))?;
        let rows = stmt.query_map(params![episode_id.to_string()], Self::asset_row)?;
        let mut assets = Vec::new();
        for row in rows {
            assets.push(row?.into_asset()?);
        }
        Ok(assets)
    }

    pub fn primary_asset(&self, episode_id: Uuid, asset_type: AssetType) -> Result<Option<Asset>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                &format!(
                    "{ASSET_SELECT}
                     WHERE episode_id = ?1 AND asset_type = ?2 AND is_primary = 1
                       AND deleted_at IS NULL"
                ),
                params![episode_id.to_string(), asset_type.as_str()],
                Self::asset_row,
            )
            .optional()?;
        row.map(|r| r.into_asset()).transpose()
    }

    /// Promote an asset to primary, demoting live siblings of the same type
    /// in the same write.
    pub fn set_primary_asset(&self, id: Uuid) -> Result<Asset> {
        let mut conn = self.lock();
        let asset = Self::get_asset_conn(&conn, id)?;
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE assets SET is_primary = 0
             WHERE episode_id = ?1 AND asset_type = ?2 AND deleted_at IS NULL",
            params![asset.episode_id.to_string(), asset.asset_type.as_str()],
        )?;
        tx.execute(
            "UPDATE assets SET is_primary = 1 WHERE id = ?1",
            params![id.to_string()],
        )?;
        tx.commit()?;
        Self::get_asset_conn(&conn, id)
    }

    // ── Stage commit ──────────────────────────────────────────────────

    /// Atomically commit a successful stage execution: asset rows (primary
    /// demotion included), episode content slot, pipeline-state completion
    /// entry, job outcome and episode status advance in one transaction.
    pub fn commit_stage_success(&self, commit: StageCommit) -> Result<(Job, Vec<Asset>)> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        // Assets, in order; the last inserted clip of a multi-asset stage
        // ends up primary.
        let mut asset_ids = Vec::new();
        for draft in &commit.assets {
            asset_ids.push(Self::insert_asset_tx(&tx, commit.episode_id, draft)?);
        }

        // Episode content slot.
        match &commit.content {
            ContentUpdate::None => {}
            ContentUpdate::Plan(plan) => {
                tx.execute(
                    "UPDATE episodes SET plan = ?1 WHERE id = ?2",
                    params![serde_json::to_string(plan)?, commit.episode_id.to_string()],
                )?;
            }
            ContentUpdate::Script { text, metadata } => {
                tx.execute(
                    "UPDATE episodes SET script = ?1, script_metadata = ?2 WHERE id = ?3",
                    params![
                        text,
                        serde_json::to_string(metadata)?,
                        commit.episode_id.to_string()
                    ],
                )?;
            }
            ContentUpdate::EpisodeMeta(meta) => {
                tx.execute(
                    "UPDATE episodes SET episode_meta = ?1 WHERE id = ?2",
                    params![serde_json::to_string(meta)?, commit.episode_id.to_string()],
                )?;
            }
        }

        // Pipeline state completion entry.
        {
            let episode = Self::get_episode_conn(&tx, commit.episode_id)?;
            let mut state = episode.pipeline_state;
            let now = Utc::now();
            let entry = state.entry_mut(commit.stage, JobStatus::Completed);
            entry.status = JobStatus::Completed;
            entry.completed_at = Some(now);
            entry.updated_at = now;
            entry.error = None;
            entry.cost_usd = Some(commit.cost_usd);
            entry.tokens_used = commit.tokens_used;
            tx.execute(
                "UPDATE episodes SET pipeline_state = ?1 WHERE id = ?2",
                params![serde_json::to_string(&state)?, commit.episode_id.to_string()],
            )?;
        }

        // Episode status advance.
        if let Some(status) = commit.stage.resulting_status() {
            tx.execute(
                "UPDATE episodes SET status = ?1, last_error = NULL WHERE id = ?2",
                params![status.as_str(), commit.episode_id.to_string()],
            )?;
        }

        // Job outcome.
        let result = JobResult {
            asset_ids: asset_ids.clone(),
            cost_usd: commit.cost_usd,
            duration_s: commit.duration_s,
            detail: commit.detail.clone(),
            cached: false,
        };
        let changed = tx.execute(
            "UPDATE jobs SET status = 'completed', result = ?1, cost_usd = ?2,
                    tokens_used = ?3, completed_at = ?4
             WHERE id = ?5 AND status = 'running'",
            params![
                serde_json::to_string(&result)?,
                commit.cost_usd,
                commit.tokens_used,
                now_str(),
                commit.job_id.to_string(),
            ],
        )?;
        if changed == 0 {
            // The job was cancelled or reaped out from under us; roll the
            // whole commit back rather than record a half-finished stage.
            return Err(CoreError::conflict(format!(
                "job {} is no longer running; stage commit aborted",
                commit.job_id
            )));
        }

        tx.commit()?;

        let job = Self::get_job_conn(&conn, commit.job_id)?;
        let mut assets = Vec::new();
        for id in asset_ids {
            assets.push(Self::get_asset_conn(&conn, id)?);
        }
        Ok((job, assets))
    }

}

const JOB_SELECT: &str = "SELECT id, episode_id, stage, status, external_task_id, input_params,
        result, error_message, retry_count, max_retries, cost_usd, tokens_used,
        created_at, updated_at, started_at, completed_at FROM jobs";

const ASSET_SELECT: &str = "SELECT id, episode_id, asset_type, uri, bucket, key, content_type,
        size_bytes, duration_s, provider, provider_job_id, version, is_primary, metadata,
        created_at, updated_at, deleted_at FROM assets";

// ── Internal row helpers ──────────────────────────────────────────────

struct ChannelRow {
    id: String,
    slug: String,
    name: String,
    platform_channel_id: Option<String>,
    persona: String,
    style_guide: String,
    voice_profile: String,
    avatar_profile: String,
    created_at: String,
    updated_at: String,
    deleted_at: Option<String>,
}

impl ChannelRow {
    fn into_channel(self) -> Result<Channel> {
        Ok(Channel {
            id: parse_uuid(&self.id)?,
            slug: self.slug,
            name: self.name,
            platform_channel_id: self.platform_channel_id,
            persona: serde_json::from_str(&self.persona)?,
            style_guide: serde_json::from_str(&self.style_guide)?,
            voice_profile: serde_json::from_str(&self.voice_profile)?,
            avatar_profile: serde_json::from_str(&self.avatar_profile)?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            deleted_at: parse_ts_opt(self.deleted_at)?,
        })
    }
}

struct EpisodeRow {
    id: String,
    channel_id: String,
    title: Option<String>,
    slug: Option<String>,
    status: String,
    idea_source: String,
    priority: i32,
    idea: String,
    plan: String,
    script: Option<String>,
    script_metadata: String,
    episode_meta: String,
    pipeline_state: String,
    auto_advance: i64,
    retry_count: u32,
    last_error: Option<String>,
    published_url: Option<String>,
    published_at: Option<String>,
    created_at: String,
    updated_at: String,
    deleted_at: Option<String>,
}

impl EpisodeRow {
    fn into_episode(self) -> Result<Episode> {
        Ok(Episode {
            id: parse_uuid(&self.id)?,
            channel_id: parse_uuid(&self.channel_id)?,
            title: self.title,
            slug: self.slug,
            status: EpisodeStatus::parse(&self.status).map_err(CoreError::internal)?,
            idea_source: IdeaSource::parse(&self.idea_source).map_err(CoreError::internal)?,
            priority: Priority::from_int(self.priority),
            idea: serde_json::from_str(&self.idea)?,
            plan: serde_json::from_str(&self.plan)?,
            script: self.script,
            script_metadata: serde_json::from_str(&self.script_metadata)?,
            episode_meta: serde_json::from_str(&self.episode_meta)?,
            pipeline_state: serde_json::from_str(&self.pipeline_state)?,
            auto_advance: self.auto_advance != 0,
            retry_count: self.retry_count,
            last_error: self.last_error,
            published_url: self.published_url,
            published_at: parse_ts_opt(self.published_at)?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            deleted_at: parse_ts_opt(self.deleted_at)?,
        })
    }
}

struct JobRow {
    id: String,
    episode_id: String,
    stage: String,
    status: String,
    external_task_id: Option<String>,
    input_params: String,
    result: Option<String>,
    error_message: Option<String>,
    retry_count: u32,
    max_retries: u32,
    cost_usd: Option<f64>,
    tokens_used: Option<u64>,
    created_at: String,
    updated_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl JobRow {
    fn into_job(self) -> Result<Job> {
        Ok(Job {
            id: parse_uuid(&self.id)?,
            episode_id: parse_uuid(&self.episode_id)?,
            stage: self.stage,
            status: JobStatus::parse(&self.status).map_err(CoreError::internal)?,
            external_task_id: self.external_task_id,
            input_params: serde_json::from_str(&self.input_params)?,
            result: self
                .result
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            error_message: self.error_message,
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            cost_usd: self.cost_usd,
            tokens_used: self.tokens_used,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            started_at: parse_ts_opt(self.started_at)?,
            completed_at: parse_ts_opt(self.completed_at)?,
        })
    }
}

struct AssetRow {
    id: String,
    episode_id: String,
    asset_type: String,
    uri: String,
    bucket: Option<String>,
    key: Option<String>,
    content_type: Option<String>,
    size_bytes: Option<u64>,
    duration_s: Option<f64>,
    provider: Option<String>,
    provider_job_id: Option<String>,
    version: u32,
    is_primary: i64,
    metadata: String,
    created_at: String,
    updated_at: String,
    deleted_at: Option<String>,
}

impl AssetRow {
    fn into_asset(self) -> Result<Asset> {
        Ok(Asset {
            id: parse_uuid(&self.id)?,
            episode_id: parse_uuid(&self.episode_id)?,
            asset_type: AssetType::parse(&self.asset_type).map_err(CoreError::internal)?,
            uri: self.uri,
            bucket: self.bucket,
            key: self.key,
            content_type: self.content_type,
            size_bytes: self.size_bytes,
            duration_s: self.duration_s,
            provider: self.provider,
            provider_job_id: self.provider_job_id,
            version: self.version,
            is_primary: self.is_primary != 0,
            metadata: serde_json::from_str(&self.metadata)?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            deleted_at: parse_ts_opt(self.deleted_at)?,
        })
    }
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| CoreError::internal(format!("invalid uuid '{s}': {e}")))
}

// ── Tests ─────────────────────────────────────────────────────────────
