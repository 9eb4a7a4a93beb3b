//! B-roll stage: cue list extracted from the script -> one MP4 clip per
//! cue via the video provider. Clips are rendered sequentially; the cap on
//! clips per run is configuration.

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use crate::db::{AssetDraft, ContentUpdate, Stage, StageCommit};
use crate::errors::{CoreError, Result};
use crate::providers::video::BrollRenderRequest;
use crate::script;
use crate::storage::broll_clip_key;

use super::{StageContext, StageExecutor, StageOutcome};

pub struct BrollStage;

#[async_trait]
impl StageExecutor for BrollStage {
    fn stage(&self) -> Stage {
        Stage::Broll
    }

    async fn execute(&self, ctx: &StageContext<'_>) -> Result<StageOutcome> {
        let renderer = ctx
            .services
            .broll
            .as_ref()
            .ok_or_else(|| CoreError::validation("video provider is not configured"))?;

        let (episode, _channel) = ctx.load(Stage::Broll)?;

        let script_text = episode.script.as_deref().ok_or_else(|| {
            CoreError::pipeline("broll", "episode has no script; run the scripting stage first")
        })?;

        // Cue list comes from the script; the plan's suggestions are the
        // fallback when the script carries no [BROLL] markers.
        let mut cues = script::extract_broll_cues(script_text);
        if cues.is_empty() {
            cues = episode.plan.broll_suggestions.clone();
        }
        if cues.is_empty() {
            return Err(CoreError::pipeline("broll", "no b-roll cues in script or plan"));
        }

        let max_clips = ctx.settings().broll_max_clips.max(1);
        if cues.len() > max_clips {
            warn!(
                episode_id = %episode.id,
                cue_count = cues.len(),
                max_clips,
                "truncating b-roll cue list"
            );
            cues.truncate(max_clips);
        }

        let version = ctx
            .store()
            .next_asset_version(episode.id, Stage::Broll.asset_type())?;
        let bucket = ctx.settings().bucket_assets.clone();

        let mut drafts = Vec::new();
        let mut total_cost = 0.0;
        let mut total_duration = 0.0;
        for (index, cue) in cues.iter().enumerate() {
            if ctx.cancel.is_cancelled() {
                return Err(CoreError::Cancelled("between b-roll clips".into()));
            }

            let clip = renderer
                .render(&BrollRenderRequest::from_prompt(cue), &ctx.cancel)
                .await?;
            let key = broll_clip_key(episode.id, index, version);
            let duration_s = clip.duration_s.unwrap_or(0.0);
            let upload = ctx
                .services
                .blobs
                .upload(&bucket, &key, clip.data, Some(&clip.content_type), None)
                .await?;

            total_cost += clip.cost_usd;
            total_duration += duration_s;
            drafts.push(AssetDraft {
                asset_type: Stage::Broll.asset_type(),
                uri: upload.uri,
                bucket: Some(upload.bucket),
                key: Some(upload.key),
                content_type: Some(upload.content_type),
                size_bytes: Some(upload.size_bytes),
                duration_s: clip.duration_s,
                provider: Some(renderer.provider().to_string()),
                provider_job_id: Some(clip.provider_job_id),
                version,
                metadata: json!({
                    "checksum_md5": upload.checksum_md5,
                    "cue": cue,
                    "clip_index": index,
                }),
            });
        }

        ctx.check_cancelled()?;

        let clip_count = drafts.len();
        let (job, assets) = ctx.store().commit_stage_success(StageCommit {
            job_id: ctx.job_id,
            episode_id: episode.id,
            stage: Stage::Broll,
            assets: drafts,
            content: ContentUpdate::None,
            cost_usd: total_cost,
            tokens_used: None,
            duration_s: Some(total_duration),
            detail: Some(json!({"clip_count": clip_count})),
        })?;

        info!(
            episode_id = %episode.id,
            job_id = %job.id,
            clip_count,
            total_duration_s = total_duration,
            cost_usd = total_cost,
            "b-roll clips committed"
        );

        Ok(StageOutcome {
            asset_ids: assets.iter().map(|a| a.id).collect(),
            cost_usd: total_cost,
            tokens_used: None,
            duration_s: Some(total_duration),
            cached: false,
        })
    }
}
