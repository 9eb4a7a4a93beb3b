//! Text-to-video / image-to-video client for b-roll generation.
//!
//! Same submit/poll/download discipline as the avatar client; billing unit
//! is seconds of generated output.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use crate::errors::{CoreError, Result};
use crate::queue::CancelFlag;

use super::{poll_until_done, PollConfig, PollPhase, PollStatus, ProviderHttp, RetryPolicy, VideoClip};

const SERVICE: &str = "video";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const COST_PER_SECOND_USD: f64 = 0.05;
const DEFAULT_CLIP_SECONDS: u32 = 4;

#[derive(Debug, Clone)]
pub struct BrollRenderRequest {
    pub prompt: String,
    pub duration_s: u32,
    pub ratio: String,
    /// When set, the provider animates this image instead of generating
    /// from text alone.
    pub image_url: Option<String>,
}

impl BrollRenderRequest {
    pub fn from_prompt(prompt: &str) -> Self {
        Self {
            prompt: prompt.to_string(),
            duration_s: DEFAULT_CLIP_SECONDS,
            ratio: "16:9".to_string(),
            image_url: None,
        }
    }
}

#[async_trait]
pub trait BrollRenderer: Send + Sync {
    fn provider(&self) -> &'static str;

    async fn render(&self, request: &BrollRenderRequest, cancel: &CancelFlag)
        -> Result<VideoClip>;
}

fn parse_status(response: &Value) -> PollStatus {
    PollStatus {
        phase: response
            .get("status")
            .and_then(Value::as_str)
            .map(PollPhase::parse)
            .unwrap_or(PollPhase::Pending),
        progress: response
            .get("progress")
            .and_then(Value::as_f64)
            .map(|p| p as f32),
        output_url: response
            .pointer("/output/0")
            .and_then(Value::as_str)
            .map(str::to_string),
        error: response
            .get("failure")
            .and_then(Value::as_str)
            .map(str::to_string),
        duration_s: response.get("duration").and_then(Value::as_f64),
    }
}

pub struct VideoGenClient {
    http: ProviderHttp,
    poll: PollConfig,
}

impl VideoGenClient {
    pub fn new(
        base_url: &str,
        api_key: &str,
        retry: RetryPolicy,
        poll: PollConfig,
    ) -> Result<Self> {
        let http = ProviderHttp::new(SERVICE, "seconds", base_url, REQUEST_TIMEOUT, retry)?
            .with_header("Authorization", &format!("Bearer {api_key}"))
            .with_header("Content-Type", "application/json");
        Ok(Self { http, poll })
    }

    pub fn usage(&self) -> super::UsageMetrics {
        self.http.usage()
    }

    async fn submit(&self, request: &BrollRenderRequest) -> Result<String> {
        let mut body = json!({
            "prompt_text": request.prompt,
            "duration": request.duration_s,
            "ratio": request.ratio,
        });
        if let Some(image_url) = &request.image_url {
            body["prompt_image"] = json!(image_url);
        }

        let response = self.http.post_json("generations", &body).await?;
        response
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| CoreError::external(SERVICE, "submit response missing generation id"))
    }

    async fn poll_once(&self, generation_id: &str) -> Result<PollStatus> {
        let response = self
            .http
            .get_json(&format!("generations/{generation_id}"))
            .await?;
        Ok(parse_status(&response))
    }
}

#[async_trait]
impl BrollRenderer for VideoGenClient {
    fn provider(&self) -> &'static str {
        SERVICE
    }

    async fn render(
        &self,
        request: &BrollRenderRequest,
        cancel: &CancelFlag,
    ) -> Result<VideoClip> {
        if request.prompt.trim().is_empty() {
            return Err(CoreError::validation("b-roll prompt must not be empty"));
        }

        let generation_id = self.submit(request).await?;
        info!(%generation_id, prompt = %request.prompt, "b-roll generation submitted");

        let status = poll_until_done(SERVICE, &self.poll, cancel, || {
            self.poll_once(&generation_id)
        })
        .await?;

        let output_url = status
            .output_url
            .ok_or_else(|| CoreError::external(SERVICE, "succeeded without an output URL"))?;
        let data = self.http.download_url(&output_url).await?;

        let duration_s = status.duration_s.unwrap_or(request.duration_s as f64);
        let cost_usd = duration_s * COST_PER_SECOND_USD;
        self.http.add_usage(duration_s.ceil() as u64, cost_usd);

        info!(
            %generation_id,
            size_bytes = data.len(),
            duration_s,
            cost_usd,
            "b-roll clip downloaded"
        );

        Ok(VideoClip {
            data,
            content_type: "video/mp4".to_string(),
            duration_s: Some(duration_s),
            provider_job_id: generation_id,
            cost_usd,
        })
    }
}
