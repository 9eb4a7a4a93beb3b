//! Text LLM client: chat completion with JSON-schema-constrained output.
//!
//! Every content stage (planning, scripting, metadata) talks to the same
//! endpoint with a different model and schema. Cost is accounted from
//! input/output token counts against a per-model pricing table.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use crate::errors::{CoreError, Result};

use super::{ProviderHttp, RetryPolicy};

const SERVICE: &str = "text";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// USD per 1k tokens: (model, input, output). Unknown models fall back to
/// the conservative default below.
const MODEL_PRICING: &[(&str, f64, f64)] = &[
    ("gpt-4o", 0.0025, 0.01),
    ("gpt-4o-mini", 0.00015, 0.0006),
    ("gpt-4.1", 0.002, 0.008),
    ("gpt-4.1-mini", 0.0004, 0.0016),
];
const DEFAULT_PRICING: (f64, f64) = (0.01, 0.03);

#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub model: String,
    pub estimated_cost_usd: f64,
}

impl TokenUsage {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Price this usage against the model table.
    pub fn priced(mut self, model: &str) -> Self {
        let (input_rate, output_rate) = MODEL_PRICING
            .iter()
            .find(|(m, _, _)| *m == model)
            .map(|(_, i, o)| (*i, *o))
            .unwrap_or(DEFAULT_PRICING);
        self.model = model.to_string();
        self.estimated_cost_usd = self.input_tokens as f64 / 1000.0 * input_rate
            + self.output_tokens as f64 / 1000.0 * output_rate;
        self
    }
}

/// A parsed, schema-conforming completion.
#[derive(Debug, Clone)]
pub struct TextCompletion {
    pub content: Value,
    pub usage: TokenUsage,
}

#[derive(Debug, Clone)]
pub struct TextRequest {
    pub model: String,
    pub system: String,
    pub user: String,
    pub schema_name: String,
    pub schema: Value,
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Chat completion constrained to `schema`; returns the parsed value.
    async fn complete_json(&self, request: &TextRequest) -> Result<TextCompletion>;
}

pub struct TextClient {
    http: ProviderHttp,
}

impl TextClient {
    pub fn new(base_url: &str, api_key: &str, retry: RetryPolicy) -> Result<Self> {
        let http = ProviderHttp::new(SERVICE, "tokens", base_url, REQUEST_TIMEOUT, retry)?
            .with_header("Authorization", &format!("Bearer {api_key}"))
            .with_header("Content-Type", "application/json");
        Ok(Self { http })
    }

    pub fn usage(&self) -> super::UsageMetrics {
        self.http.usage()
    }
}

/// Pull the schema-constrained payload and token counts out of a chat
/// completion response.
fn parse_completion(response: &Value) -> Result<(Value, u64, u64)> {
    let content = response
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .ok_or_else(|| CoreError::external(SERVICE, "completion missing message content"))?;
    let parsed: Value = serde_json::from_str(content)
        .map_err(|e| CoreError::external(SERVICE, format!("completion is not valid JSON: {e}")))?;
    let input_tokens = response
        .pointer("/usage/prompt_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let output_tokens = response
        .pointer("/usage/completion_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    Ok((parsed, input_tokens, output_tokens))
}

#[async_trait]
impl TextGenerator for TextClient {
    async fn complete_json(&self, request: &TextRequest) -> Result<TextCompletion> {
        let body = json!({
            "model": request.model,
            "messages": [
                {"role": "system", "content": request.system},
                {"role": "user", "content": request.user},
            ],
            "response_format": {
                "type": "json_schema",
                "json_schema": {
                    "name": request.schema_name,
                    "schema": request.schema,
                    "strict": true,
                },
            },
        });

        let response = self.http.post_json("chat/completions", &body).await?;
        let (content, input_tokens, output_tokens) = parse_completion(&response)?;

        let usage = TokenUsage {
            input_tokens,
            output_tokens,
            ..Default::default()
        }
        .priced(&request.model);
        self.http
            .add_usage(usage.total_tokens(), usage.estimated_cost_usd);

        info!(
            model = %request.model,
            schema = %request.schema_name,
            input_tokens,
            output_tokens,
            cost_usd = usage.estimated_cost_usd,
            "completion generated"
        );

        Ok(TextCompletion { content, usage })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pricing_uses_model_table() {
        let usage = TokenUsage {
            input_tokens: 1000,
            output_tokens: 500,
            ..Default::default()
        }
        .priced("gpt-4o-mini");
        assert_eq!(usage.model, "gpt-4o-mini");
        // 1000/1000 * 0.00015 + 500/1000 * 0.0006
        assert!((usage.estimated_cost_usd - 0.00045).abs() < 1e-9);
        assert_eq!(usage.total_tokens(), 1500);
    }

    #[test]
    fn pricing_falls_back_for_unknown_models() {
        let usage = TokenUsage {
            input_tokens: 2000,
            output_tokens: 1000,
            ..Default::default()
        }
        .priced("mystery-model");
        // 2 * 0.01 + 1 * 0.03
        assert!((usage.estimated_cost_usd - 0.05).abs() < 1e-9);
    }

    #[test]
    fn parse_completion_extracts_payload_and_tokens() {
        let response = json!({
            "choices": [{
                "message": {"content": "{\"hook\": \"What if?\", \"sections\": []}"},
                "finish_reason": "stop",
            }],
            "usage": {"prompt_tokens": 812, "completion_tokens": 241},
        });
        let (content, input, output) = parse_completion(&response).unwrap();
        assert_eq!(content["hook"], "What if?");
        assert_eq!(input, 812);
        assert_eq!(output, 241);
    }

    #[test]
    fn parse_completion_rejects_missing_content() {
        let err = parse_completion(&json!({"choices": []})).unwrap_err();
        assert_eq!(err.kind(), "external_service");
    }

    #[test]
    fn parse_completion_rejects_non_json_content() {
        let response = json!({
            "choices": [{"message": {"content": "not json at all"}}],
        });
        let err = parse_completion(&response).unwrap_err();
        assert_eq!(err.kind(), "external_service");
        assert!(err.to_string().contains("not valid JSON"));
    }
}
