//! Avatar stage: on-camera extract of the script -> talking-head MP4 via
//! the avatar provider's submit/poll/download flow.

use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use crate::db::{AssetDraft, ContentUpdate, Stage, StageCommit};
use crate::errors::{CoreError, Result};
use crate::providers::avatar::AvatarRenderRequest;
use crate::script;

use super::{StageContext, StageExecutor, StageOutcome};

pub struct AvatarStage;

#[async_trait]
impl StageExecutor for AvatarStage {
    fn stage(&self) -> Stage {
        Stage::Avatar
    }

    async fn execute(&self, ctx: &StageContext<'_>) -> Result<StageOutcome> {
        let renderer = ctx
            .services
            .avatar
            .as_ref()
            .ok_or_else(|| CoreError::validation("avatar provider is not configured"))?;

        let (episode, channel) = ctx.load(Stage::Avatar)?;

        let script_text = episode.script.as_deref().ok_or_else(|| {
            CoreError::pipeline("avatar", "episode has no script; run the scripting stage first")
        })?;
        let avatar_lines = script::extract_avatar_lines(script_text);
        if avatar_lines.is_empty() {
            return Err(CoreError::pipeline("avatar", "script has no avatar segments"));
        }

        let profile = &channel.avatar_profile;
        if profile.avatar_id.is_empty() {
            return Err(CoreError::validation(
                "channel has no avatar profile configured",
            ));
        }

        let voice_id = (!channel.voice_profile.voice_id.is_empty())
            .then(|| channel.voice_profile.voice_id.clone());
        let clip = renderer
            .render(
                &AvatarRenderRequest {
                    avatar_id: profile.avatar_id.clone(),
                    script_text: avatar_lines,
                    voice_id,
                    background: profile.background.clone(),
                },
                &ctx.cancel,
            )
            .await?;

        ctx.check_cancelled()?;

        let version = ctx
            .store()
            .next_asset_version(episode.id, Stage::Avatar.asset_type())?;
        let upload = ctx
            .services
            .blobs
            .upload_episode_asset(
                &ctx.settings().bucket_assets,
                episode.id,
                Stage::Avatar.asset_type(),
                version,
                "mp4",
                clip.data,
                Some(&clip.content_type),
            )
            .await?;

        ctx.check_cancelled()?;

        let (job, assets) = ctx.store().commit_stage_success(StageCommit {
            job_id: ctx.job_id,
            episode_id: episode.id,
            stage: Stage::Avatar,
            assets: vec![AssetDraft {
                asset_type: Stage::Avatar.asset_type(),
                uri: upload.uri,
                bucket: Some(upload.bucket),
                key: Some(upload.key),
                content_type: Some(upload.content_type),
                size_bytes: Some(upload.size_bytes),
                duration_s: clip.duration_s,
                provider: Some(renderer.provider().to_string()),
                provider_job_id: Some(clip.provider_job_id.clone()),
                version,
                metadata: json!({"checksum_md5": upload.checksum_md5}),
            }],
            content: ContentUpdate::None,
            cost_usd: clip.cost_usd,
            tokens_used: None,
            duration_s: clip.duration_s,
            detail: Some(json!({
                "avatar_id": profile.avatar_id,
                "provider_job_id": clip.provider_job_id,
            })),
        })?;

        info!(
            episode_id = %episode.id,
            job_id = %job.id,
            duration_s = ?clip.duration_s,
            cost_usd = clip.cost_usd,
            "avatar video committed"
        );

        Ok(StageOutcome {
            asset_ids: assets.iter().map(|a| a.id).collect(),
            cost_usd: clip.cost_usd,
            tokens_used: None,
            duration_s: clip.duration_s,
            cached: false,
        })
    }
}
