//! External-provider I/O substrate.
//!
//! Every provider client goes through the same HTTP discipline: merge
//! headers, send, measure latency, classify the response (2xx pass, 429
//! honours Retry-After, 5xx and transport errors back off and retry, other
//! 4xx fail immediately), and account usage. Long-running generations use
//! the shared submit/poll/download loop with cooperative cancellation
//! between poll iterations.

pub mod avatar;
pub mod speech;
pub mod text;
pub mod video;

use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;
use reqwest::Method;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::errors::{CoreError, Result};
use crate::queue::CancelFlag;

// ── Retry policy ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Jittered exponential backoff:
    /// `min(base * 2^attempt, max_delay) * (1 + U[0.1, 0.3])`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = (self.base_delay.as_secs_f64() * 2f64.powi(attempt as i32))
            .min(self.max_delay.as_secs_f64());
        let jitter: f64 = rand::rng().random_range(0.1..0.3);
        Duration::from_secs_f64(exp * (1.0 + jitter))
    }

    /// Delay before a 429 retry: the server's Retry-After wins over backoff.
    pub fn delay_for_rate_limit(&self, retry_after_s: Option<f64>, attempt: u32) -> Duration {
        match retry_after_s {
            Some(secs) if secs >= 0.0 => Duration::from_secs_f64(secs),
            _ => self.backoff_delay(attempt),
        }
    }
}

// ── Usage accounting ──────────────────────────────────────────────────

/// Cumulative usage metrics for one provider client instance.
#[derive(Debug, Clone, Default)]
pub struct UsageMetrics {
    pub provider: String,
    pub units_used: u64,
    pub unit_type: String,
    pub estimated_cost_usd: f64,
    pub request_count: u64,
    pub latency_ms: u64,
}

impl UsageMetrics {
    pub fn new(provider: &str, unit_type: &str) -> Self {
        Self {
            provider: provider.to_string(),
            unit_type: unit_type.to_string(),
            ..Default::default()
        }
    }

    pub fn add_units(&mut self, units: u64, cost_usd: f64) {
        self.units_used += units;
        self.estimated_cost_usd += cost_usd;
    }

    pub fn record_request(&mut self, latency_ms: u64) {
        self.request_count += 1;
        self.latency_ms += latency_ms;
    }
}

// ── Poll loop ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct PollConfig {
    pub interval: Duration,
    pub max_poll_time: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            max_poll_time: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollPhase {
    Pending,
    Queued,
    Processing,
    Succeeded,
    Failed,
    Cancelled,
}

impl PollPhase {
    /// Parse a provider status string, tolerating the common vendor
    /// spellings (`completed`, `waiting`, `RUNNING`, ...).
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "pending" | "waiting" | "submitted" => Self::Pending,
            "queued" => Self::Queued,
            "processing" | "running" | "in_progress" | "generating" => Self::Processing,
            "succeeded" | "success" | "completed" | "done" => Self::Succeeded,
            "failed" | "error" => Self::Failed,
            "cancelled" | "canceled" | "revoked" => Self::Cancelled,
            _ => Self::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

/// One observation of a long-running provider job.
#[derive(Debug, Clone)]
pub struct PollStatus {
    pub phase: PollPhase,
    pub progress: Option<f32>,
    pub output_url: Option<String>,
    pub error: Option<String>,
    pub duration_s: Option<f64>,
}

/// Downloaded output of a submit/poll/download generation.
#[derive(Debug, Clone)]
pub struct VideoClip {
    pub data: Vec<u8>,
    pub content_type: String,
    pub duration_s: Option<f64>,
    pub provider_job_id: String,
    pub cost_usd: f64,
}

/// Drive a submit/poll cycle to a terminal state. Cancellation is observed
/// between iterations; `failed`/`cancelled` phases and timeout both raise
/// `external_service`.
pub async fn poll_until_done<F, Fut>(
    service: &str,
    cfg: &PollConfig,
    cancel: &CancelFlag,
    mut poll: F,
) -> Result<PollStatus>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<PollStatus>>,
{
    let start = Instant::now();
    loop {
        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled(format!("{service} poll loop")));
        }

        let status = poll().await?;
        match status.phase {
            PollPhase::Succeeded => return Ok(status),
            PollPhase::Failed | PollPhase::Cancelled => {
                let detail = status
                    .error
                    .unwrap_or_else(|| format!("generation {:?}", status.phase).to_lowercase());
                return Err(CoreError::external(
                    service,
                    format!("generation did not succeed: {detail}"),
                ));
            }
            _ => {}
        }

        if start.elapsed() >= cfg.max_poll_time {
            return Err(CoreError::external(
                service,
                format!(
                    "timeout waiting for generation after {}s",
                    cfg.max_poll_time.as_secs()
                ),
            ));
        }
        tokio::time::sleep(cfg.interval).await;
    }
}

// ── HTTP substrate ────────────────────────────────────────────────────

/// Shared HTTP layer under every provider client. Owns the credentials
/// (default headers), the retry policy, and the cumulative usage counter.
pub struct ProviderHttp {
    service: String,
    base_url: String,
    client: reqwest::Client,
    /// Separate transport for CDN downloads of provider output; signed
    /// URLs do not point at the API host and take longer.
    download_client: reqwest::Client,
    default_headers: Vec<(String, String)>,
    retry: RetryPolicy,
    usage: Mutex<UsageMetrics>,
}

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);
const ERROR_BODY_SNIPPET: usize = 500;

impl ProviderHttp {
    pub fn new(
        service: &str,
        unit_type: &str,
        base_url: &str,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CoreError::internal(format!("failed to build HTTP client: {e}")))?;
        let download_client = reqwest::Client::builder()
            .timeout(DOWNLOAD_TIMEOUT)
            .build()
            .map_err(|e| CoreError::internal(format!("failed to build download client: {e}")))?;
        Ok(Self {
            service: service.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            download_client,
            default_headers: Vec::new(),
            retry,
            usage: Mutex::new(UsageMetrics::new(service, unit_type)),
        })
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.default_headers
            .push((name.to_string(), value.to_string()));
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Snapshot of cumulative usage for this client instance.
    pub fn usage(&self) -> UsageMetrics {
        self.usage.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn add_usage(&self, units: u64, cost_usd: f64) {
        self.usage
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .add_units(units, cost_usd);
    }

    fn record_request(&self, latency_ms: u64) {
        self.usage
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .record_request(latency_ms);
    }

    /// Send a request with the per-request discipline, returning the raw
    /// 2xx response.
    pub async fn send(
        &self,
        method: Method,
        path: &str,
        headers: &[(String, String)],
        json_body: Option<&Value>,
    ) -> Result<reqwest::Response> {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let max = self.retry.max_retries.max(1);
        let mut last_error = String::new();

        for attempt in 0..max {
            let mut req = self.client.request(method.clone(), &url);
            for (name, value) in &self.default_headers {
                req = req.header(name.as_str(), value.as_str());
            }
            for (name, value) in headers {
                req = req.header(name.as_str(), value.as_str());
            }
            if let Some(body) = json_body {
                req = req.json(body);
            }

            let start = Instant::now();
            let outcome = req.send().await;
            let elapsed_ms = start.elapsed().as_millis() as u64;
            self.record_request(elapsed_ms);

            match outcome {
                Ok(response) => {
                    let status = response.status();
                    info!(
                        service = %self.service,
                        %url,
                        status = status.as_u16(),
                        elapsed_ms,
                        attempt = attempt + 1,
                        "provider request"
                    );

                    if status.is_success() {
                        return Ok(response);
                    }

                    if status.as_u16() == 429 {
                        let retry_after = response
                            .headers()
                            .get("Retry-After")
                            .and_then(|v| v.to_str().ok())
                            .and_then(|v| v.parse::<f64>().ok());
                        let delay = self.retry.delay_for_rate_limit(retry_after, attempt);
                        warn!(
                            service = %self.service,
                            attempt = attempt + 1,
                            max_retries = max,
                            delay_s = delay.as_secs_f64(),
                            "rate limit hit, retrying"
                        );
                        if attempt + 1 < max {
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                        return Err(CoreError::RateLimited {
                            message: format!("{} rate limit exceeded after retries", self.service),
                            retry_after_s: Some(delay.as_secs()),
                        });
                    }

                    if status.is_server_error() {
                        last_error = format!("server error {}", status.as_u16());
                        let delay = self.retry.backoff_delay(attempt);
                        warn!(
                            service = %self.service,
                            status = status.as_u16(),
                            attempt = attempt + 1,
                            max_retries = max,
                            delay_s = delay.as_secs_f64(),
                            "server error, retrying"
                        );
                        if attempt + 1 < max {
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                        return Err(CoreError::external(
                            &self.service,
                            format!("API error: {}", status.as_u16()),
                        ));
                    }

                    // Remaining 4xx: no retry.
                    let body = response.text().await.unwrap_or_default();
                    let snippet: String = body.chars().take(ERROR_BODY_SNIPPET).collect();
                    error!(
                        service = %self.service,
                        status = status.as_u16(),
                        error = %snippet,
                        "provider client error"
                    );
                    return Err(CoreError::external(
                        &self.service,
                        format!("API error: {}: {snippet}", status.as_u16()),
                    ));
                }
                Err(e) => {
                    last_error = e.to_string();
                    let delay = self.retry.backoff_delay(attempt);
                    warn!(
                        service = %self.service,
                        attempt = attempt + 1,
                        max_retries = max,
                        delay_s = delay.as_secs_f64(),
                        error = %last_error,
                        "connection error, retrying"
                    );
                    if attempt + 1 < max {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        error!(
            service = %self.service,
            max_retries = max,
            error = %last_error,
            "request failed after all retries"
        );
        Err(CoreError::external(
            &self.service,
            format!("API call failed after retries: {last_error}"),
        ))
    }

    pub async fn post_json(&self, path: &str, body: &Value) -> Result<Value> {
        let response = self.send(Method::POST, path, &[], Some(body)).await?;
        response
            .json()
            .await
            .map_err(|e| CoreError::external(&self.service, format!("invalid JSON response: {e}")))
    }

    pub async fn get_json(&self, path: &str) -> Result<Value> {
        let response = self.send(Method::GET, path, &[], None).await?;
        response
            .json()
            .await
            .map_err(|e| CoreError::external(&self.service, format!("invalid JSON response: {e}")))
    }

    pub async fn post_bytes(&self, path: &str, body: &Value) -> Result<Vec<u8>> {
        let response = self.send(Method::POST, path, &[], Some(body)).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| CoreError::external(&self.service, format!("read body failed: {e}")))?;
        Ok(bytes.to_vec())
    }

    /// Fetch provider output from its (typically CDN) URL.
    pub async fn download_url(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .download_client
            .get(url)
            .send()
            .await
            .map_err(|e| CoreError::external(&self.service, format!("download failed: {e}")))?;
        if !response.status().is_success() {
            return Err(CoreError::external(
                &self.service,
                format!("download failed: {}", response.status().as_u16()),
            ));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| CoreError::external(&self.service, format!("download read failed: {e}")))?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_exponential_bounded_and_jittered() {
        let policy = RetryPolicy::default();
        for attempt in 0..8 {
            let exp = (policy.base_delay.as_secs_f64() * 2f64.powi(attempt))
                .min(policy.max_delay.as_secs_f64());
            let delay = policy.backoff_delay(attempt as u32).as_secs_f64();
            assert!(delay >= exp * 1.1 - 1e-9, "attempt {attempt}: {delay} < {}", exp * 1.1);
            assert!(delay <= exp * 1.3 + 1e-9, "attempt {attempt}: {delay} > {}", exp * 1.3);
        }
        // cap: attempt 10 would be 1024s unbounded
        let capped = policy.backoff_delay(10).as_secs_f64();
        assert!(capped <= 60.0 * 1.3 + 1e-9);
    }

    #[test]
    fn retry_after_header_wins_over_backoff() {
        let policy = RetryPolicy::default();
        let delay = policy.delay_for_rate_limit(Some(2.0), 0);
        assert_eq!(delay, Duration::from_secs(2));
        // absent or negative values fall back to jittered backoff
        let fallback = policy.delay_for_rate_limit(None, 0).as_secs_f64();
        assert!((1.1..=1.3).contains(&fallback));
        let negative = policy.delay_for_rate_limit(Some(-1.0), 0).as_secs_f64();
        assert!((1.1..=1.3).contains(&negative));
    }

    #[test]
    fn poll_phase_parses_vendor_spellings() {
        assert_eq!(PollPhase::parse("SUCCEEDED"), PollPhase::Succeeded);
        assert_eq!(PollPhase::parse("completed"), PollPhase::Succeeded);
        assert_eq!(PollPhase::parse("RUNNING"), PollPhase::Processing);
        assert_eq!(PollPhase::parse("waiting"), PollPhase::Pending);
        assert_eq!(PollPhase::parse("canceled"), PollPhase::Cancelled);
        assert_eq!(PollPhase::parse("weird-new-state"), PollPhase::Pending);
        assert!(PollPhase::Failed.is_terminal());
        assert!(!PollPhase::Processing.is_terminal());
    }

    #[test]
    fn usage_metrics_accumulate() {
        let mut usage = UsageMetrics::new("speech", "characters");
        usage.add_units(1200, 0.36);
        usage.add_units(800, 0.24);
        usage.record_request(150);
        usage.record_request(90);
        assert_eq!(usage.units_used, 2000);
        assert!((usage.estimated_cost_usd - 0.60).abs() < 1e-9);
        assert_eq!(usage.request_count, 2);
        assert_eq!(usage.latency_ms, 240);
    }

    #[tokio::test]
    async fn poll_loop_returns_on_success() {
        let cfg = PollConfig {
            interval: Duration::from_millis(5),
            max_poll_time: Duration::from_secs(1),
        };
        let cancel = CancelFlag::new();
        let calls = std::sync::atomic::AtomicU32::new(0);
        let status = poll_until_done("avatar", &cfg, &cancel, || {
            let n = calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async move {
                Ok(PollStatus {
                    phase: if n < 2 {
                        PollPhase::Processing
                    } else {
                        PollPhase::Succeeded
                    },
                    progress: None,
                    output_url: Some("https://cdn.example/out.mp4".into()),
                    error: None,
                    duration_s: Some(12.0),
                })
            }
        })
        .await
        .unwrap();
        assert_eq!(status.phase, PollPhase::Succeeded);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn poll_loop_times_out_with_external_service() {
        let cfg = PollConfig {
            interval: Duration::from_millis(5),
            max_poll_time: Duration::from_millis(20),
        };
        let cancel = CancelFlag::new();
        let err = poll_until_done("video", &cfg, &cancel, || async {
            Ok(PollStatus {
                phase: PollPhase::Processing,
                progress: Some(0.4),
                output_url: None,
                error: None,
                duration_s: None,
            })
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "external_service");
        assert!(err.to_string().contains("timeout"));
    }

    #[tokio::test]
    async fn poll_loop_observes_cancellation() {
        let cfg = PollConfig {
            interval: Duration::from_millis(5),
            max_poll_time: Duration::from_secs(5),
        };
        let cancel = CancelFlag::new();
        cancel.cancel();
        let err = poll_until_done("avatar", &cfg, &cancel, || async {
            Ok(PollStatus {
                phase: PollPhase::Processing,
                progress: None,
                output_url: None,
                error: None,
                duration_s: None,
            })
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "cancelled");
    }

    #[tokio::test]
    async fn poll_loop_maps_provider_failure() {
        let cfg = PollConfig {
            interval: Duration::from_millis(5),
            max_poll_time: Duration::from_secs(1),
        };
        let cancel = CancelFlag::new();
        let err = poll_until_done("avatar", &cfg, &cancel, || async {
            Ok(PollStatus {
                phase: PollPhase::Failed,
                progress: None,
                output_url: None,
                error: Some("render node crashed".into()),
                duration_s: None,
            })
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "external_service");
        assert!(err.to_string().contains("render node crashed"));
    }
}
