//! Scripting stage: plan + channel config -> marked-up script text.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use crate::db::{AssetDraft, ContentUpdate, ScriptMetadata, Stage, StageCommit};
use crate::errors::{CoreError, Result};
use crate::providers::text::TextRequest;
use crate::script;

use super::{channel_context, StageContext, StageExecutor, StageOutcome};

pub struct ScriptingStage;

fn script_schema() -> Value {
    json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["script"],
        "properties": {
            "script": {
                "type": "string",
                "description": "Full script with [AVATAR: …], [VO: …] and [BROLL: …] markers",
            },
        },
    })
}

#[async_trait]
impl StageExecutor for ScriptingStage {
    fn stage(&self) -> Stage {
        Stage::Scripting
    }

    async fn execute(&self, ctx: &StageContext<'_>) -> Result<StageOutcome> {
        let (episode, channel) = ctx.load(Stage::Scripting)?;

        if episode.plan.is_empty() {
            return Err(CoreError::pipeline(
                "scripting",
                "episode has no plan; run the planning stage first",
            ));
        }

        let mut user = format!(
            "Write the full script for this episode plan:\n{}",
            serde_json::to_string_pretty(&episode.plan)?
        );
        if let Some(instructions) = ctx.instructions() {
            user.push_str(&format!("\nAdditional instructions: {instructions}"));
        }

        let request = TextRequest {
            model: ctx.settings().model_scripting.clone(),
            system: format!(
                "You write video scripts.\n{}\n\
                 Mark on-camera lines as [AVATAR: …], narration as [VO: …], and visual \
                 cues as [BROLL: …]. Unmarked text is narration.",
                channel_context(&channel)
            ),
            user,
            schema_name: "episode_script".to_string(),
            schema: script_schema(),
        };

        let completion = ctx.services.text.complete_json(&request).await?;
        let text = completion
            .content
            .get("script")
            .and_then(Value::as_str)
            .ok_or_else(|| CoreError::external("text", "script response missing script field"))?
            .to_string();
        if text.trim().is_empty() {
            return Err(CoreError::external("text", "provider returned an empty script"));
        }

        let spoken = script::extract_spoken_text(&text);
        let metadata = ScriptMetadata {
            version: episode.script_metadata.version + 1,
            word_count: script::word_count(&spoken),
            estimated_duration_s: script::estimated_duration_s(&spoken),
        };

        ctx.check_cancelled()?;

        let version = ctx
            .store()
            .next_asset_version(episode.id, Stage::Scripting.asset_type())?;
        let upload = ctx
            .services
            .blobs
            .upload_episode_asset(
                &ctx.settings().bucket_scripts,
                episode.id,
                Stage::Scripting.asset_type(),
                version,
                "md",
                text.clone().into_bytes(),
                Some("text/markdown"),
            )
            .await?;

        ctx.check_cancelled()?;

        let (job, assets) = ctx.store().commit_stage_success(StageCommit {
            job_id: ctx.job_id,
            episode_id: episode.id,
            stage: Stage::Scripting,
            assets: vec![AssetDraft {
                asset_type: Stage::Scripting.asset_type(),
                uri: upload.uri,
                bucket: Some(upload.bucket),
                key: Some(upload.key),
                content_type: Some(upload.content_type),
                size_bytes: Some(upload.size_bytes),
                duration_s: Some(metadata.estimated_duration_s),
                provider: Some("text".to_string()),
                provider_job_id: None,
                version,
                metadata: json!({"checksum_md5": upload.checksum_md5}),
            }],
            content: ContentUpdate::Script {
                text,
                metadata: metadata.clone(),
            },
            cost_usd: completion.usage.estimated_cost_usd,
            tokens_used: Some(completion.usage.total_tokens()),
            duration_s: Some(metadata.estimated_duration_s),
            detail: Some(json!({
                "model": completion.usage.model,
                "word_count": metadata.word_count,
            })),
        })?;

        info!(
            episode_id = %episode.id,
            job_id = %job.id,
            word_count = metadata.word_count,
            estimated_duration_s = metadata.estimated_duration_s,
            "script committed"
        );

        Ok(StageOutcome {
            asset_ids: assets.iter().map(|a| a.id).collect(),
            cost_usd: completion.usage.estimated_cost_usd,
            tokens_used: Some(completion.usage.total_tokens()),
            duration_s: Some(metadata.estimated_duration_s),
            cached: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_requires_script_field() {
        let schema = script_schema();
        assert_eq!(schema["required"][0], "script");
        assert_eq!(schema["additionalProperties"], false);
    }
}
