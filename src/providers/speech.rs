//! Speech synthesis client: text in, MP3 bytes out.
//!
//! Billing unit is characters. Duration is estimated at 80 ms/character
//! until real audio metadata is available downstream.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::db::VoiceProfile;
use crate::errors::{CoreError, Result};
use crate::script::MS_PER_CHARACTER;

use super::{ProviderHttp, RetryPolicy};

const SERVICE: &str = "speech";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const COST_PER_CHARACTER_USD: f64 = 0.00022;

/// Synthesis tuning passed through to the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceSettings {
    pub stability: f32,
    pub similarity_boost: f32,
    pub style: f32,
    pub use_speaker_boost: bool,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            stability: 0.5,
            similarity_boost: 0.75,
            style: 0.0,
            use_speaker_boost: true,
        }
    }
}

impl VoiceSettings {
    /// Channel overrides layered over the defaults.
    pub fn from_profile(profile: &VoiceProfile) -> Self {
        let mut settings = Self::default();
        if let Some(stability) = profile.stability {
            settings.stability = stability;
        }
        if let Some(similarity_boost) = profile.similarity_boost {
            settings.similarity_boost = similarity_boost;
        }
        settings
    }
}

#[derive(Debug, Clone)]
pub struct SpeechResult {
    pub audio: Vec<u8>,
    pub content_type: String,
    pub character_count: usize,
    pub estimated_duration_ms: u64,
    pub cost_usd: f64,
}

impl SpeechResult {
    pub fn estimated_duration_s(&self) -> f64 {
        self.estimated_duration_ms as f64 / 1000.0
    }
}

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(
        &self,
        voice_id: &str,
        model_id: Option<&str>,
        text: &str,
        settings: &VoiceSettings,
    ) -> Result<SpeechResult>;
}

pub struct SpeechClient {
    http: ProviderHttp,
    cost_per_character: f64,
}

impl SpeechClient {
    pub fn new(base_url: &str, api_key: &str, retry: RetryPolicy) -> Result<Self> {
        let http = ProviderHttp::new(SERVICE, "characters", base_url, REQUEST_TIMEOUT, retry)?
            .with_header("xi-api-key", api_key)
            .with_header("Accept", "audio/mpeg");
        Ok(Self {
            http,
            cost_per_character: COST_PER_CHARACTER_USD,
        })
    }

    pub fn usage(&self) -> super::UsageMetrics {
        self.http.usage()
    }

    fn cost_for(&self, character_count: usize) -> f64 {
        character_count as f64 * self.cost_per_character
    }
}

#[async_trait]
impl SpeechSynthesizer for SpeechClient {
    async fn synthesize(
        &self,
        voice_id: &str,
        model_id: Option<&str>,
        text: &str,
        settings: &VoiceSettings,
    ) -> Result<SpeechResult> {
        if text.trim().is_empty() {
            return Err(CoreError::validation("speech text must not be empty"));
        }
        if voice_id.is_empty() {
            return Err(CoreError::validation("voice_id must not be empty"));
        }

        let mut body = json!({
            "text": text,
            "voice_settings": settings,
        });
        if let Some(model_id) = model_id {
            body["model_id"] = json!(model_id);
        }

        let audio = self
            .http
            .post_bytes(&format!("text-to-speech/{voice_id}"), &body)
            .await?;

        let character_count = text.chars().count();
        let cost_usd = self.cost_for(character_count);
        self.http.add_usage(character_count as u64, cost_usd);

        info!(
            voice_id,
            character_count,
            size_bytes = audio.len(),
            cost_usd,
            "speech generated"
        );

        Ok(SpeechResult {
            audio,
            content_type: "audio/mpeg".to_string(),
            character_count,
            estimated_duration_ms: character_count as u64 * MS_PER_CHARACTER,
            cost_usd,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn voice_settings_defaults() {
        let settings = VoiceSettings::default();
        assert_eq!(settings.stability, 0.5);
        assert_eq!(settings.similarity_boost, 0.75);
        assert!(settings.use_speaker_boost);
    }

    #[test]
    fn voice_settings_from_profile_overrides() {
        let profile = VoiceProfile {
            voice_id: "v1".into(),
            model_id: None,
            stability: Some(0.8),
            similarity_boost: None,
        };
        let settings = VoiceSettings::from_profile(&profile);
        assert_eq!(settings.stability, 0.8);
        assert_eq!(settings.similarity_boost, 0.75);
    }

    #[test]
    fn cost_is_per_character() {
        let client = SpeechClient::new(
            "http://127.0.0.1:0",
            "key",
            RetryPolicy::default(),
        )
        .unwrap();
        let cost = client.cost_for(1000);
        assert!((cost - 0.22).abs() < 1e-9);
    }

    #[test]
    fn speech_result_duration_conversion() {
        let result = SpeechResult {
            audio: vec![],
            content_type: "audio/mpeg".into(),
            character_count: 100,
            estimated_duration_ms: 8000,
            cost_usd: 0.022,
        };
        assert_eq!(result.estimated_duration_s(), 8.0);
    }

    #[tokio::test]
    async fn empty_text_is_rejected_before_any_request() {
        let client = SpeechClient::new(
            "http://127.0.0.1:0",
            "key",
            RetryPolicy::default(),
        )
        .unwrap();
        let err = client
            .synthesize("voice-1", None, "   ", &VoiceSettings::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
    }
}
