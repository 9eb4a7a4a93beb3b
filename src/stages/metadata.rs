//! Metadata stage: script + plan -> SEO metadata. Leaves the episode at
//! `script_review`; only `episode_meta` and the pipeline entry change.

use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use crate::db::{AssetDraft, ContentUpdate, EpisodeMeta, Stage, StageCommit};
use crate::errors::{CoreError, Result};
use crate::providers::text::TextRequest;

use super::{channel_context, StageContext, StageExecutor, StageOutcome};

pub struct MetadataStage;

fn meta_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["final_title", "title_variants", "description", "tags", "thumbnail_prompt"],
        "properties": {
            "final_title": {"type": "string"},
            "title_variants": {"type": "array", "items": {"type": "string"}},
            "description": {"type": "string"},
            "tags": {"type": "array", "items": {"type": "string"}},
            "thumbnail_prompt": {"type": "string"},
        },
    })
}

#[async_trait]
impl StageExecutor for MetadataStage {
    fn stage(&self) -> Stage {
        Stage::Metadata
    }

    async fn execute(&self, ctx: &StageContext<'_>) -> Result<StageOutcome> {
        let (episode, channel) = ctx.load(Stage::Metadata)?;

        let script = episode.script.as_deref().ok_or_else(|| {
            CoreError::pipeline("metadata", "episode has no script; run the scripting stage first")
        })?;

        let mut user = format!(
            "Generate publishing metadata for this episode.\nPlan:\n{}\n\nScript:\n{script}",
            serde_json::to_string_pretty(&episode.plan)?
        );
        if let Some(instructions) = ctx.instructions() {
            user.push_str(&format!("\nAdditional instructions: {instructions}"));
        }

        let request = TextRequest {
            model: ctx.settings().model_metadata.clone(),
            system: format!(
                "You write SEO metadata for video platforms.\n{}",
                channel_context(&channel)
            ),
            user,
            schema_name: "episode_metadata".to_string(),
            schema: meta_schema(),
        };

        let completion = ctx.services.text.complete_json(&request).await?;
        let meta: EpisodeMeta = serde_json::from_value(completion.content.clone())
            .map_err(|e| CoreError::external("text", format!("metadata did not match schema: {e}")))?;
        if meta.is_empty() {
            return Err(CoreError::external("text", "provider returned empty metadata"));
        }

        ctx.check_cancelled()?;

        let version = ctx
            .store()
            .next_asset_version(episode.id, Stage::Metadata.asset_type())?;
        let upload = ctx
            .services
            .blobs
            .upload_episode_asset(
                &ctx.settings().bucket_scripts,
                episode.id,
                Stage::Metadata.asset_type(),
                version,
                "json",
                serde_json::to_vec(&meta)?,
                Some("application/json"),
            )
            .await?;

        ctx.check_cancelled()?;

        let (job, assets) = ctx.store().commit_stage_success(StageCommit {
            job_id: ctx.job_id,
            episode_id: episode.id,
            stage: Stage::Metadata,
            assets: vec![AssetDraft {
                asset_type: Stage::Metadata.asset_type(),
                uri: upload.uri,
                bucket: Some(upload.bucket),
                key: Some(upload.key),
                content_type: Some(upload.content_type),
                size_bytes: Some(upload.size_bytes),
                duration_s: None,
                provider: Some("text".to_string()),
                provider_job_id: None,
                version,
                metadata: json!({"checksum_md5": upload.checksum_md5}),
            }],
            content: ContentUpdate::EpisodeMeta(meta.clone()),
            cost_usd: completion.usage.estimated_cost_usd,
            tokens_used: Some(completion.usage.total_tokens()),
            duration_s: None,
            detail: Some(json!({"model": completion.usage.model})),
        })?;

        info!(
            episode_id = %episode.id,
            job_id = %job.id,
            final_title = %meta.final_title,
            "metadata committed"
        );

        Ok(StageOutcome {
            asset_ids: assets.iter().map(|a| a.id).collect(),
            cost_usd: completion.usage.estimated_cost_usd,
            tokens_used: Some(completion.usage.total_tokens()),
            duration_s: None,
            cached: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_requires_seo_fields() {
        let schema = meta_schema();
        let required: Vec<_> = schema["required"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap())
            .collect();
        assert!(required.contains(&"final_title"));
        assert!(required.contains(&"thumbnail_prompt"));
    }
}
