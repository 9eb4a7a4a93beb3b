//! Stage executors and their shared contract.
//!
//! Every executor follows the same four steps: load the episode and
//! channel fresh from the store and validate the precondition state,
//! assemble provider input from prior-stage outputs, invoke the provider,
//! and commit the outcome atomically through
//! [`Store::commit_stage_success`]. The stage set is closed: the
//! orchestrator owns an explicit dispatch map built at start-up.

pub mod audio;
pub mod avatar;
pub mod broll;
pub mod metadata;
pub mod planning;
pub mod scripting;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::config::Settings;
use crate::db::{Channel, Episode, Stage, Store};
use crate::errors::{CoreError, Result};
use crate::providers::avatar::AvatarRenderer;
use crate::providers::speech::SpeechSynthesizer;
use crate::providers::text::TextGenerator;
use crate::providers::video::BrollRenderer;
use crate::queue::CancelFlag;
use crate::storage::BlobStore;

/// Shared handles every executor works against. Media providers are
/// optional; stages that need an absent one fail with `validation`.
pub struct StageServices {
    pub store: Store,
    pub blobs: Arc<dyn BlobStore>,
    pub text: Arc<dyn TextGenerator>,
    pub speech: Option<Arc<dyn SpeechSynthesizer>>,
    pub avatar: Option<Arc<dyn AvatarRenderer>>,
    pub broll: Option<Arc<dyn BrollRenderer>>,
    pub settings: Arc<Settings>,
}

/// Per-execution context handed to an executor by the worker.
pub struct StageContext<'a> {
    pub services: &'a StageServices,
    pub episode_id: Uuid,
    pub job_id: Uuid,
    pub params: Value,
    pub force: bool,
    pub cancel: CancelFlag,
}

impl StageContext<'_> {
    pub fn store(&self) -> &Store {
        &self.services.store
    }

    pub fn settings(&self) -> &Settings {
        &self.services.settings
    }

    /// Load step: re-read episode and channel under the job, and fail fast
    /// with `validation` when the episode is not in the stage's
    /// precondition state (skipped under `force`).
    pub fn load(&self, stage: Stage) -> Result<(Episode, Channel)> {
        let episode = self.store().get_episode(self.episode_id)?;
        if !self.force && !stage.allowed_statuses().contains(&episode.status) {
            return Err(CoreError::validation(format!(
                "stage '{}' requires episode status {:?}, current status is '{}'",
                stage.as_str(),
                stage
                    .allowed_statuses()
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>(),
                episode.status.as_str(),
            )));
        }
        let channel = self.store().get_channel(episode.channel_id)?;
        Ok((episode, channel))
    }

    /// Cooperative checkpoint before the commit transaction.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(CoreError::Cancelled("before stage commit".into()));
        }
        Ok(())
    }

    /// Optional free-form operator instructions carried in the trigger
    /// params; text stages append them to the prompt.
    pub fn instructions(&self) -> Option<&str> {
        self.params.get("instructions").and_then(Value::as_str)
    }
}

/// What an executor reports back to the worker after its commit.
#[derive(Debug, Clone, Default)]
pub struct StageOutcome {
    pub asset_ids: Vec<Uuid>,
    pub cost_usd: f64,
    pub tokens_used: Option<u64>,
    pub duration_s: Option<f64>,
    pub cached: bool,
}

#[async_trait]
pub trait StageExecutor: Send + Sync {
    fn stage(&self) -> Stage;

    async fn execute(&self, ctx: &StageContext<'_>) -> Result<StageOutcome>;
}

/// Explicit stage -> executor dispatch map, injected at start-up.
pub struct StageRegistry {
    map: HashMap<Stage, Arc<dyn StageExecutor>>,
}

impl StageRegistry {
    pub fn empty() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    /// Register all six production executors.
    pub fn standard() -> Self {
        Self::empty()
            .with(Arc::new(planning::PlanningStage))
            .with(Arc::new(scripting::ScriptingStage))
            .with(Arc::new(metadata::MetadataStage))
            .with(Arc::new(audio::AudioStage))
            .with(Arc::new(avatar::AvatarStage))
            .with(Arc::new(broll::BrollStage))
    }

    pub fn with(mut self, executor: Arc<dyn StageExecutor>) -> Self {
        self.map.insert(executor.stage(), executor);
        self
    }

    pub fn get(&self, stage: Stage) -> Option<&Arc<dyn StageExecutor>> {
        self.map.get(&stage)
    }

    pub fn stages(&self) -> Vec<Stage> {
        let mut stages: Vec<_> = self.map.keys().copied().collect();
        stages.sort();
        stages
    }
}

/// Compact channel context block shared by the text-stage prompts.
pub fn channel_context(channel: &Channel) -> String {
    format!(
        "Channel: {}\nPersona: {}\nStyle guide: {}",
        channel.name, channel.persona, channel.style_guide
    )
}
