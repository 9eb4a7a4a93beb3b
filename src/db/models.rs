//! Entity types for the showrunner store.
//!
//! Four durable entities (Channel, Episode, Job, Asset) plus the typed
//! records that live in their JSON columns. Enum-valued columns round-trip
//! through `as_str`/`parse` pairs; JSON columns round-trip through serde so
//! no string-keyed reads happen outside this module and the store.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ── Episode lifecycle ─────────────────────────────────────────────────

/// Episode lifecycle status. Linear progression through the first eleven
/// states; `failed` and `cancelled` are terminal off-path states reachable
/// from any in-progress state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeStatus {
    Idea,
    Planning,
    Scripting,
    ScriptReview,
    Audio,
    Avatar,
    Broll,
    Assembly,
    Ready,
    Publishing,
    Published,
    Failed,
    Cancelled,
}

impl EpisodeStatus {
    /// The linear on-path order.
    pub const LINEAR: [EpisodeStatus; 11] = [
        Self::Idea,
        Self::Planning,
        Self::Scripting,
        Self::ScriptReview,
        Self::Audio,
        Self::Avatar,
        Self::Broll,
        Self::Assembly,
        Self::Ready,
        Self::Publishing,
        Self::Published,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idea => "idea",
            Self::Planning => "planning",
            Self::Scripting => "scripting",
            Self::ScriptReview => "script_review",
            Self::Audio => "audio",
            Self::Avatar => "avatar",
            Self::Broll => "broll",
            Self::Assembly => "assembly",
            Self::Ready => "ready",
            Self::Publishing => "publishing",
            Self::Published => "published",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "idea" => Ok(Self::Idea),
            "planning" => Ok(Self::Planning),
            "scripting" => Ok(Self::Scripting),
            "script_review" => Ok(Self::ScriptReview),
            "audio" => Ok(Self::Audio),
            "avatar" => Ok(Self::Avatar),
            "broll" => Ok(Self::Broll),
            "assembly" => Ok(Self::Assembly),
            "ready" => Ok(Self::Ready),
            "publishing" => Ok(Self::Publishing),
            "published" => Ok(Self::Published),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid episode status: {s}")),
        }
    }

    /// Position in the linear order, if on-path.
    pub fn linear_index(&self) -> Option<usize> {
        Self::LINEAR.iter().position(|s| s == self)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Published | Self::Failed | Self::Cancelled)
    }

    /// Advancement from state S is permitted only to S+1 in the linear
    /// order or to `failed`/`cancelled`.
    pub fn can_advance_to(&self, next: EpisodeStatus) -> bool {
        if matches!(next, Self::Failed | Self::Cancelled) {
            return !self.is_terminal();
        }
        match (self.linear_index(), next.linear_index()) {
            (Some(cur), Some(nxt)) => nxt == cur + 1,
            _ => false,
        }
    }
}

// ── Job status ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid job status: {s}")),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }
}

// ── Pipeline stages ───────────────────────────────────────────────────

/// The dispatched pipeline stages, in canonical order. `script_review` is a
/// durable pause state on the episode, not a dispatched stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Planning,
    Scripting,
    Metadata,
    Audio,
    Avatar,
    Broll,
}

impl Stage {
    /// Canonical execution order for the full pipeline.
    pub const ORDER: [Stage; 6] = [
        Self::Planning,
        Self::Scripting,
        Self::Metadata,
        Self::Audio,
        Self::Avatar,
        Self::Broll,
    ];

    /// Stage 1: the content generation phase only.
    pub const STAGE_1: [Stage; 3] = [Self::Planning, Self::Scripting, Self::Metadata];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Scripting => "scripting",
            Self::Metadata => "metadata",
            Self::Audio => "audio",
            Self::Avatar => "avatar",
            Self::Broll => "broll",
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "planning" => Ok(Self::Planning),
            "scripting" => Ok(Self::Scripting),
            "metadata" => Ok(Self::Metadata),
            "audio" => Ok(Self::Audio),
            "avatar" => Ok(Self::Avatar),
            "broll" => Ok(Self::Broll),
            _ => Err(format!("Invalid pipeline stage: {s}")),
        }
    }

    /// Episode statuses from which this stage may be dispatched. `failed`
    /// is accepted everywhere so a repaired episode can resume in place.
    pub fn allowed_statuses(&self) -> &'static [EpisodeStatus] {
        use EpisodeStatus as E;
        match self {
            Self::Planning => &[E::Idea, E::Failed, E::Cancelled],
            Self::Scripting => &[E::Planning, E::Failed],
            Self::Metadata => &[E::ScriptReview, E::Failed],
            Self::Audio => &[E::ScriptReview, E::Failed],
            // Avatar and b-roll both branch off completed audio; in a full
            // chain b-roll runs after avatar, so either status is a valid
            // launch point.
            Self::Avatar => &[E::Audio, E::Failed],
            Self::Broll => &[E::Audio, E::Avatar, E::Failed],
        }
    }

    /// Episode status this stage's commit advances to. `None` means the
    /// status is left untouched (metadata keeps the episode at
    /// `script_review`).
    pub fn resulting_status(&self) -> Option<EpisodeStatus> {
        match self {
            Self::Planning => Some(EpisodeStatus::Planning),
            Self::Scripting => Some(EpisodeStatus::Scripting),
            Self::Metadata => None,
            Self::Audio => Some(EpisodeStatus::Audio),
            Self::Avatar => Some(EpisodeStatus::Avatar),
            Self::Broll => Some(EpisodeStatus::Broll),
        }
    }

    /// Asset type this stage produces.
    pub fn asset_type(&self) -> AssetType {
        match self {
            Self::Planning => AssetType::Plan,
            Self::Scripting => AssetType::Script,
            Self::Metadata => AssetType::Metadata,
            Self::Audio => AssetType::Audio,
            Self::Avatar => AssetType::AvatarVideo,
            Self::Broll => AssetType::BRoll,
        }
    }

    /// Canonical file extension for the produced artifact.
    pub fn file_extension(&self) -> &'static str {
        match self {
            Self::Planning => "json",
            Self::Scripting => "md",
            Self::Metadata => "json",
            Self::Audio => "mp3",
            Self::Avatar => "mp4",
            Self::Broll => "mp4",
        }
    }
}

// ── Classification enums ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdeaSource {
    Manual,
    Pulse,
    Series,
    Followup,
    Repurpose,
}

impl IdeaSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Pulse => "pulse",
            Self::Series => "series",
            Self::Followup => "followup",
            Self::Repurpose => "repurpose",
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "manual" => Ok(Self::Manual),
            "pulse" => Ok(Self::Pulse),
            "series" => Ok(Self::Series),
            "followup" => Ok(Self::Followup),
            "repurpose" => Ok(Self::Repurpose),
            _ => Err(format!("Invalid idea source: {s}")),
        }
    }
}

/// Production priority, stored as an integer in `-1..=2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub fn to_int(self) -> i32 {
        match self {
            Self::Low => -1,
            Self::Normal => 0,
            Self::High => 1,
            Self::Urgent => 2,
        }
    }

    pub fn from_int(value: i32) -> Self {
        match value {
            -1 => Self::Low,
            1 => Self::High,
            2 => Self::Urgent,
            _ => Self::Normal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetType {
    Script,
    Audio,
    AvatarVideo,
    BRoll,
    AssembledVideo,
    Thumbnail,
    Plan,
    Metadata,
}

impl AssetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Script => "script",
            Self::Audio => "audio",
            Self::AvatarVideo => "avatar_video",
            Self::BRoll => "b_roll",
            Self::AssembledVideo => "assembled_video",
            Self::Thumbnail => "thumbnail",
            Self::Plan => "plan",
            Self::Metadata => "metadata",
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "script" => Ok(Self::Script),
            "audio" => Ok(Self::Audio),
            "avatar_video" => Ok(Self::AvatarVideo),
            "b_roll" => Ok(Self::BRoll),
            "assembled_video" => Ok(Self::AssembledVideo),
            "thumbnail" => Ok(Self::Thumbnail),
            "plan" => Ok(Self::Plan),
            "metadata" => Ok(Self::Metadata),
            _ => Err(format!("Invalid asset type: {s}")),
        }
    }
}

// ── Typed JSON records ────────────────────────────────────────────────

/// The idea captured when an episode is created.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdeaBrief {
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub brief: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_audience: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key_points: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_context: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanSection {
    pub title: String,
    #[serde(default)]
    pub talking_points: Vec<String>,
    #[serde(default)]
    pub broll_keywords: Vec<String>,
}

/// Structured outline produced by the planning stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub hook: String,
    #[serde(default)]
    pub intro: String,
    #[serde(default)]
    pub sections: Vec<PlanSection>,
    #[serde(default)]
    pub key_facts: Vec<String>,
    #[serde(default)]
    pub ctas: Vec<String>,
    #[serde(default)]
    pub broll_suggestions: Vec<String>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.hook.is_empty() && self.sections.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScriptMetadata {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub word_count: usize,
    #[serde(default)]
    pub estimated_duration_s: f64,
}

/// SEO metadata produced by the metadata stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EpisodeMeta {
    #[serde(default)]
    pub final_title: String,
    #[serde(default)]
    pub title_variants: Vec<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub thumbnail_prompt: String,
}

impl EpisodeMeta {
    pub fn is_empty(&self) -> bool {
        self.final_title.is_empty() && self.description.is_empty()
    }
}

/// Per-stage progress entry inside `pipeline_state`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageState {
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
}

impl StageState {
    pub fn new(status: JobStatus) -> Self {
        Self {
            status,
            started_at: None,
            completed_at: None,
            updated_at: Utc::now(),
            error: None,
            attempts: 0,
            cost_usd: None,
            tokens_used: None,
        }
    }
}

/// The authoritative per-stage progress record, keyed by stage name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineState(pub BTreeMap<String, StageState>);

impl PipelineState {
    pub fn get(&self, stage: Stage) -> Option<&StageState> {
        self.0.get(stage.as_str())
    }

    pub fn entry_mut(&mut self, stage: Stage, default_status: JobStatus) -> &mut StageState {
        self.0
            .entry(stage.as_str().to_string())
            .or_insert_with(|| StageState::new(default_status))
    }

    pub fn is_completed(&self, stage: Stage) -> bool {
        self.get(stage)
            .map(|s| s.status == JobStatus::Completed)
            .unwrap_or(false)
    }
}

/// Result payload recorded on a completed job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobResult {
    #[serde(default)]
    pub asset_ids: Vec<Uuid>,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_s: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
    #[serde(default)]
    pub cached: bool,
}

/// Voice configuration on a channel, passed verbatim to the speech provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VoiceProfile {
    #[serde(default)]
    pub voice_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stability: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub similarity_boost: Option<f32>,
}

/// Avatar configuration on a channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AvatarProfile {
    #[serde(default)]
    pub avatar_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background: Option<String>,
}

// ── Entities ──────────────────────────────────────────────────────────

/// Read-only channel configuration consumed by stage executors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
    pub platform_channel_id: Option<String>,
    pub persona: Value,
    pub style_guide: Value,
    pub voice_profile: VoiceProfile,
    pub avatar_profile: AvatarProfile,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// The work unit flowing through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    pub id: Uuid,
    pub channel_id: Uuid,
    pub title: Option<String>,
    pub slug: Option<String>,
    pub status: EpisodeStatus,
    pub idea_source: IdeaSource,
    pub priority: Priority,
    pub idea: IdeaBrief,
    pub plan: Plan,
    pub script: Option<String>,
    pub script_metadata: ScriptMetadata,
    pub episode_meta: EpisodeMeta,
    pub pipeline_state: PipelineState,
    pub auto_advance: bool,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub published_url: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// One execution attempt of one stage (or an orchestrator pseudo-stage).
/// Jobs are immutable execution records: no soft delete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub episode_id: Uuid,
    /// Real stage name, or `full_pipeline` / `stage_1_pipeline` /
    /// `pipeline_from_<stage>` for orchestrator trackers.
    pub stage: String,
    pub status: JobStatus,
    pub external_task_id: Option<String>,
    pub input_params: Value,
    pub result: Option<JobResult>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub cost_usd: Option<f64>,
    pub tokens_used: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn duration_s(&self) -> Option<f64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds() as f64 / 1000.0),
            _ => None,
        }
    }

    pub fn can_retry(&self) -> bool {
        self.status == JobStatus::Failed && self.retry_count < self.max_retries
    }
}

/// A produced artifact attached to an episode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    pub id: Uuid,
    pub episode_id: Uuid,
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
    pub is_primary: bool,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}
