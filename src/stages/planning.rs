//! Planning stage: idea brief + channel config -> structured plan.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use crate::db::{AssetDraft, ContentUpdate, Plan, Stage, StageCommit};
use crate::errors::{CoreError, Result};
use crate::providers::text::TextRequest;

use super::{channel_context, StageContext, StageExecutor, StageOutcome};

pub struct PlanningStage;

fn plan_schema() -> Value {
    json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["hook", "intro", "sections", "key_facts", "ctas", "broll_suggestions"],
        "properties": {
            "hook": {"type": "string"},
            "intro": {"type": "string"},
            "sections": {
                "type": "array",
                "items": {
                    "type": "object",
                    "additionalProperties": false,
                    "required": ["title", "talking_points", "broll_keywords"],
                    "properties": {
                        "title": {"type": "string"},
                        "talking_points": {"type": "array", "items": {"type": "string"}},
                        "broll_keywords": {"type": "array", "items": {"type": "string"}},
                    },
                },
            },
            "key_facts": {"type": "array", "items": {"type": "string"}},
            "ctas": {"type": "array", "items": {"type": "string"}},
            "broll_suggestions": {"type": "array", "items": {"type": "string"}},
        },
    })
}

#[async_trait]
impl StageExecutor for PlanningStage {
    fn stage(&self) -> Stage {
        Stage::Planning
    }

    async fn execute(&self, ctx: &StageContext<'_>) -> Result<StageOutcome> {
        let (episode, channel) = ctx.load(Stage::Planning)?;

        let idea = &episode.idea;
        if idea.topic.is_empty() && idea.brief.is_empty() {
            return Err(CoreError::pipeline(
                "planning",
                "episode has no idea brief to plan from",
            ));
        }

        let mut user = format!(
            "Create a video episode plan.\nTopic: {}\nBrief: {}",
            idea.topic, idea.brief
        );
        if let Some(audience) = &idea.target_audience {
            user.push_str(&format!("\nTarget audience: {audience}"));
        }
        if !idea.key_points.is_empty() {
            user.push_str(&format!("\nKey points: {}", idea.key_points.join("; ")));
        }
        if let Some(instructions) = ctx.instructions() {
            user.push_str(&format!("\nAdditional instructions: {instructions}"));
        }

        let request = TextRequest {
            model: ctx.settings().model_planning.clone(),
            system: format!(
                "You plan short-form video episodes.\n{}\nReturn a tight, producible outline.",
                channel_context(&channel)
            ),
            user,
            schema_name: "episode_plan".to_string(),
            schema: plan_schema(),
        };

        let completion = ctx.services.text.complete_json(&request).await?;
        let plan: Plan = serde_json::from_value(completion.content.clone()).map_err(|e| {
            CoreError::external("text", format!("plan did not match schema: {e}"))
        })?;
        if plan.is_empty() {
            return Err(CoreError::external("text", "provider returned an empty plan"));
        }

        ctx.check_cancelled()?;

        let version = ctx
            .store()
            .next_asset_version(episode.id, Stage::Planning.asset_type())?;
        let upload = ctx
            .services
            .blobs
            .upload_episode_asset(
                &ctx.settings().bucket_scripts,
                episode.id,
                Stage::Planning.asset_type(),
                version,
                "json",
                serde_json::to_vec(&plan)?,
                Some("application/json"),
            )
            .await?;

        ctx.check_cancelled()?;

        let (job, assets) = ctx.store().commit_stage_success(StageCommit {
            job_id: ctx.job_id,
            episode_id: episode.id,
            stage: Stage::Planning,
            assets: vec![AssetDraft {
                asset_type: Stage::Planning.asset_type(),
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
            content: ContentUpdate::Plan(plan),
            cost_usd: completion.usage.estimated_cost_usd,
            tokens_used: Some(completion.usage.total_tokens()),
            duration_s: None,
            detail: Some(json!({"model": completion.usage.model})),
        })?;

        info!(
            episode_id = %episode.id,
            job_id = %job.id,
            version,
            tokens = completion.usage.total_tokens(),
            "plan committed"
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
    fn schema_requires_all_plan_fields() {
        let schema = plan_schema();
        let required: Vec<_> = schema["required"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap())
            .collect();
        for field in ["hook", "sections", "ctas", "broll_suggestions"] {
            assert!(required.contains(&field), "missing {field}");
        }
        assert_eq!(schema["additionalProperties"], false);
    }
}
