//! Audio stage: voiceover extract of the script -> MP3 via the speech
//! provider.

use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use crate::db::{AssetDraft, ContentUpdate, Stage, StageCommit};
use crate::errors::{CoreError, Result};
use crate::providers::speech::VoiceSettings;
use crate::script;

use super::{StageContext, StageExecutor, StageOutcome};

pub struct AudioStage;

#[async_trait]
impl StageExecutor for AudioStage {
    fn stage(&self) -> Stage {
        Stage::Audio
    }

    async fn execute(&self, ctx: &StageContext<'_>) -> Result<StageOutcome> {
        let speech = ctx
            .services
            .speech
            .as_ref()
            .ok_or_else(|| CoreError::validation("speech provider is not configured"))?;

        let (episode, channel) = ctx.load(Stage::Audio)?;

        let script_text = episode.script.as_deref().ok_or_else(|| {
            CoreError::pipeline("audio", "episode has no script; run the scripting stage first")
        })?;
        let voiceover = script::extract_voiceover(script_text);
        if voiceover.is_empty() {
            return Err(CoreError::pipeline("audio", "script has no voiceover content"));
        }

        let profile = &channel.voice_profile;
        if profile.voice_id.is_empty() {
            return Err(CoreError::validation(
                "channel has no voice profile configured",
            ));
        }
        let settings = VoiceSettings::from_profile(profile);

        let result = speech
            .synthesize(
                &profile.voice_id,
                profile.model_id.as_deref(),
                &voiceover,
                &settings,
            )
            .await?;

        ctx.check_cancelled()?;

        let version = ctx
            .store()
            .next_asset_version(episode.id, Stage::Audio.asset_type())?;
        let duration_s = result.estimated_duration_s();
        let upload = ctx
            .services
            .blobs
            .upload_episode_asset(
                &ctx.settings().bucket_assets,
                episode.id,
                Stage::Audio.asset_type(),
                version,
                "mp3",
                result.audio,
                Some(&result.content_type),
            )
            .await?;

        ctx.check_cancelled()?;

        let (job, assets) = ctx.store().commit_stage_success(StageCommit {
            job_id: ctx.job_id,
            episode_id: episode.id,
            stage: Stage::Audio,
            assets: vec![AssetDraft {
                asset_type: Stage::Audio.asset_type(),
                uri: upload.uri,
                bucket: Some(upload.bucket),
                key: Some(upload.key),
                content_type: Some(upload.content_type),
                size_bytes: Some(upload.size_bytes),
                duration_s: Some(duration_s),
                provider: Some("speech".to_string()),
                provider_job_id: None,
                version,
                metadata: json!({
                    "checksum_md5": upload.checksum_md5,
                    "character_count": result.character_count,
                }),
            }],
            content: ContentUpdate::None,
            cost_usd: result.cost_usd,
            tokens_used: None,
            duration_s: Some(duration_s),
            detail: Some(json!({"voice_id": profile.voice_id})),
        })?;

        info!(
            episode_id = %episode.id,
            job_id = %job.id,
            characters = result.character_count,
            duration_s,
            cost_usd = result.cost_usd,
            "audio committed"
        );

        Ok(StageOutcome {
            asset_ids: assets.iter().map(|a| a.id).collect(),
            cost_usd: result.cost_usd,
            tokens_used: None,
            duration_s: Some(duration_s),
            cached: false,
        })
    }
}
