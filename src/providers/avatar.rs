//! Avatar video client: submit a script for a talking-head render, poll
//! until the provider finishes, download the result from its CDN URL.
//!
//! Billing unit is credits (one credit per started minute of video).

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use crate::errors::{CoreError, Result};
use crate::queue::CancelFlag;

use super::{poll_until_done, PollConfig, PollPhase, PollStatus, ProviderHttp, RetryPolicy, VideoClip};

const SERVICE: &str = "avatar";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const COST_PER_CREDIT_USD: f64 = 1.0;

#[derive(Debug, Clone)]
pub struct AvatarRenderRequest {
    pub avatar_id: String,
    pub script_text: String,
    pub voice_id: Option<String>,
    pub background: Option<String>,
}

#[async_trait]
pub trait AvatarRenderer: Send + Sync {
    fn provider(&self) -> &'static str;

    /// Full submit/poll/download cycle. Cancellation is observed between
    /// poll iterations.
    async fn render(&self, request: &AvatarRenderRequest, cancel: &CancelFlag)
        -> Result<VideoClip>;
}

/// Credits for a video duration: one per started minute, minimum one.
fn credits_for(duration_s: f64) -> u64 {
    (duration_s / 60.0).ceil().max(1.0) as u64
}

/// Map the provider's status payload onto the shared poll contract.
fn parse_status(response: &Value) -> PollStatus {
    let data = response.get("data").unwrap_or(response);
    PollStatus {
        phase: data
            .get("status")
            .and_then(Value::as_str)
            .map(PollPhase::parse)
            .unwrap_or(PollPhase::Pending),
        progress: data
            .get("progress")
            .and_then(Value::as_f64)
            .map(|p| p as f32),
        output_url: data
            .get("video_url")
            .and_then(Value::as_str)
            .map(str::to_string),
        error: data.get("error").and_then(Value::as_str).map(str::to_string),
        duration_s: data.get("duration").and_then(Value::as_f64),
    }
}

pub struct AvatarClient {
    http: ProviderHttp,
    poll: PollConfig,
}

impl AvatarClient {
    pub fn new(
        base_url: &str,
        api_key: &str,
        retry: RetryPolicy,
        poll: PollConfig,
    ) -> Result<Self> {
        let http = ProviderHttp::new(SERVICE, "credits", base_url, REQUEST_TIMEOUT, retry)?
            .with_header("X-Api-Key", api_key)
            .with_header("Content-Type", "application/json");
        Ok(Self { http, poll })
    }

    pub fn usage(&self) -> super::UsageMetrics {
        self.http.usage()
    }

    async fn submit(&self, request: &AvatarRenderRequest) -> Result<String> {
        let mut character = json!({
            "type": "avatar",
            "avatar_id": request.avatar_id,
        });
        if let Some(background) = &request.background {
            character["background"] = json!(background);
        }
        let mut voice = json!({
            "type": "text",
            "input_text": request.script_text,
        });
        if let Some(voice_id) = &request.voice_id {
            voice["voice_id"] = json!(voice_id);
        }
        let body = json!({
            "video_inputs": [{
                "character": character,
                "voice": voice,
            }],
        });

        let response = self.http.post_json("video/generate", &body).await?;
        response
            .pointer("/data/video_id")
            .or_else(|| response.get("video_id"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| CoreError::external(SERVICE, "submit response missing video_id"))
    }

    async fn poll_once(&self, video_id: &str) -> Result<PollStatus> {
        let response = self
            .http
            .get_json(&format!("video_status.get?video_id={video_id}"))
            .await?;
        Ok(parse_status(&response))
    }
}

#[async_trait]
impl AvatarRenderer for AvatarClient {
    fn provider(&self) -> &'static str {
        SERVICE
    }

    async fn render(
        &self,
        request: &AvatarRenderRequest,
        cancel: &CancelFlag,
    ) -> Result<VideoClip> {
        if request.script_text.trim().is_empty() {
            return Err(CoreError::validation("avatar script must not be empty"));
        }
        if request.avatar_id.is_empty() {
            return Err(CoreError::validation("avatar_id must not be empty"));
        }

        let video_id = self.submit(request).await?;
        info!(%video_id, "avatar render submitted");

        let status =
            poll_until_done(SERVICE, &self.poll, cancel, || self.poll_once(&video_id)).await?;

        let output_url = status
            .output_url
            .ok_or_else(|| CoreError::external(SERVICE, "succeeded without an output URL"))?;
        let data = self.http.download_url(&output_url).await?;

        let duration_s = status.duration_s;
        let credits = credits_for(duration_s.unwrap_or(60.0));
        let cost_usd = credits as f64 * COST_PER_CREDIT_USD;
        self.http.add_usage(credits, cost_usd);

        info!(
            %video_id,
            size_bytes = data.len(),
            ?duration_s,
            credits,
            cost_usd,
            "avatar render downloaded"
        );

        Ok(VideoClip {
            data,
            content_type: "video/mp4".to_string(),
            duration_s,
            provider_job_id: video_id,
            cost_usd,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credits_round_up_with_minimum_one() {
        assert_eq!(credits_for(0.0), 1);
        assert_eq!(credits_for(12.0), 1);
        assert_eq!(credits_for(60.0), 1);
        assert_eq!(credits_for(61.0), 2);
        assert_eq!(credits_for(180.0), 3);
    }

    #[test]
    fn parse_status_reads_nested_data() {
        let status = parse_status(&json!({
            "data": {
                "status": "processing",
                "progress": 0.55,
                "video_url": null,
                "duration": null,
            }
        }));
        assert_eq!(status.phase, PollPhase::Processing);
        assert_eq!(status.progress, Some(0.55));
        assert!(status.output_url.is_none());
    }

    #[test]
    fn parse_status_reads_flat_payload_and_completed_alias() {
        let status = parse_status(&json!({
            "status": "completed",
            "video_url": "https://cdn.example/clip.mp4",
            "duration": 73.5,
        }));
        assert_eq!(status.phase, PollPhase::Succeeded);
        assert_eq!(status.output_url.as_deref(), Some("https://cdn.example/clip.mp4"));
        assert_eq!(status.duration_s, Some(73.5));
    }

    #[test]
    fn parse_status_surfaces_provider_error() {
        let status = parse_status(&json!({
            "data": {"status": "failed", "error": "avatar not found"}
        }));
        assert_eq!(status.phase, PollPhase::Failed);
        assert_eq!(status.error.as_deref(), Some("avatar not found"));
    }

    #[tokio::test]
    async fn empty_script_is_rejected_before_submit() {
        let client = AvatarClient::new(
            "http://127.0.0.1:0",
            "key",
            RetryPolicy::default(),
            PollConfig::default(),
        )
        .unwrap();
        let err = client
            .render(
                &AvatarRenderRequest {
                    avatar_id: "a1".into(),
                    script_text: " ".into(),
                    voice_id: None,
                    background: None,
                },
                &CancelFlag::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
    }
}
