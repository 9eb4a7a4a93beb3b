//! Runtime configuration for showrunner.
//!
//! Settings are loaded from environment variables (with `.env` support via
//! dotenvy). Provider credentials for speech, avatar and video generation
//! are optional; the corresponding stages reject dispatch with a validation
//! error when the credential is absent.

use std::path::PathBuf;
use std::time::Duration;

use crate::errors::{CoreError, Result};

/// Deployment environment. Controls how much detail internal errors expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub environment: Environment,

    /// SQLite database path (`:memory:` is accepted for ad-hoc runs).
    pub database_path: PathBuf,

    /// Worker pool size and queue depth.
    pub worker_count: usize,
    pub queue_capacity: usize,

    // Object store
    pub object_store_endpoint: String,
    pub object_store_access_key: String,
    pub object_store_secret_key: String,
    pub object_store_region: String,
    pub bucket_assets: String,
    pub bucket_scripts: String,

    // Text provider (required)
    pub text_api_key: String,
    pub text_base_url: String,
    pub model_planning: String,
    pub model_scripting: String,
    pub model_metadata: String,

    // Media providers (optional)
    pub speech_api_key: Option<String>,
    pub speech_base_url: String,
    pub avatar_api_key: Option<String>,
    pub avatar_base_url: String,
    pub video_api_key: Option<String>,
    pub video_base_url: String,

    // Retry / backoff defaults, overridable per client
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,

    // Submit/poll/download defaults
    pub poll_interval: Duration,
    pub max_poll_time: Duration,

    // Supervisor
    pub orphan_threshold: Duration,
    pub supervisor_interval: Duration,

    /// Upper bound on clips produced by a single b-roll run.
    pub broll_max_clips: usize,
}

fn var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| CoreError::validation(format!("missing required environment variable {name}")))
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn var_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn var_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Settings {
    /// Load settings from the environment, reading a `.env` file if present.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let environment = match var_or("SHOWRUNNER_ENV", "development").as_str() {
            "production" => Environment::Production,
            _ => Environment::Development,
        };

        Ok(Self {
            environment,
            database_path: PathBuf::from(var_or("DATABASE_PATH", "showrunner.db")),
            worker_count: var_parse("WORKER_COUNT", 4),
            queue_capacity: var_parse("QUEUE_CAPACITY", 64),
            object_store_endpoint: var("OBJECT_STORE_ENDPOINT")?,
            object_store_access_key: var("OBJECT_STORE_ACCESS_KEY")?,
            object_store_secret_key: var("OBJECT_STORE_SECRET_KEY")?,
            object_store_region: var_or("OBJECT_STORE_REGION", "us-east-1"),
            bucket_assets: var_or("BUCKET_ASSETS", "showrunner-assets"),
            bucket_scripts: var_or("BUCKET_SCRIPTS", "showrunner-scripts"),
            text_api_key: var("TEXT_API_KEY")?,
            text_base_url: var_or("TEXT_BASE_URL", "https://api.openai.com/v1"),
            model_planning: var_or("MODEL_PLANNING", "gpt-4o"),
            model_scripting: var_or("MODEL_SCRIPTING", "gpt-4o-mini"),
            model_metadata: var_or("MODEL_METADATA", "gpt-4o-mini"),
            speech_api_key: var_opt("SPEECH_API_KEY"),
            speech_base_url: var_or("SPEECH_BASE_URL", "https://api.elevenlabs.io/v1"),
            avatar_api_key: var_opt("AVATAR_API_KEY"),
            avatar_base_url: var_or("AVATAR_BASE_URL", "https://api.heygen.com/v2"),
            video_api_key: var_opt("VIDEO_API_KEY"),
            video_base_url: var_or("VIDEO_BASE_URL", "https://api.dev.runwayml.com/v1"),
            max_retries: var_parse("PROVIDER_MAX_RETRIES", 3),
            backoff_base: Duration::from_secs_f64(var_parse("BACKOFF_BASE_SECONDS", 1.0)),
            backoff_max: Duration::from_secs_f64(var_parse("BACKOFF_MAX_SECONDS", 60.0)),
            poll_interval: Duration::from_secs_f64(var_parse("POLL_INTERVAL_SECONDS", 10.0)),
            max_poll_time: Duration::from_secs_f64(var_parse("MAX_POLL_SECONDS", 600.0)),
            orphan_threshold: Duration::from_secs(60 * var_parse("ORPHAN_THRESHOLD_MINUTES", 15)),
            supervisor_interval: Duration::from_secs(var_parse("SUPERVISOR_INTERVAL_SECONDS", 60)),
            broll_max_clips: var_parse("BROLL_MAX_CLIPS", 3),
        })
    }

    pub fn is_development(&self) -> bool {
        self.environment == Environment::Development
    }

    /// Settings suitable for tests: in-memory database, dummy credentials,
    /// short timings.
    pub fn for_tests() -> Self {
        Self {
            environment: Environment::Development,
            database_path: PathBuf::from(":memory:"),
            worker_count: 2,
            queue_capacity: 16,
            object_store_endpoint: "http://127.0.0.1:9000".into(),
            object_store_access_key: "test-access".into(),
            object_store_secret_key: "test-secret".into(),
            object_store_region: "us-east-1".into(),
            bucket_assets: "showrunner-assets".into(),
            bucket_scripts: "showrunner-scripts".into(),
            text_api_key: "test-key".into(),
            text_base_url: "http://127.0.0.1:0".into(),
            model_planning: "test-model".into(),
            model_scripting: "test-model".into(),
            model_metadata: "test-model".into(),
            speech_api_key: Some("test-key".into()),
            speech_base_url: "http://127.0.0.1:0".into(),
            avatar_api_key: Some("test-key".into()),
            avatar_base_url: "http://127.0.0.1:0".into(),
            video_api_key: Some("test-key".into()),
            video_base_url: "http://127.0.0.1:0".into(),
            max_retries: 3,
            backoff_base: Duration::from_millis(10),
            backoff_max: Duration::from_millis(50),
            poll_interval: Duration::from_millis(20),
            max_poll_time: Duration::from_millis(500),
            orphan_threshold: Duration::from_secs(900),
            supervisor_interval: Duration::from_millis(100),
            broll_max_clips: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_defaults() {
        let s = Settings::for_tests();
        assert_eq!(s.max_retries, 3);
        assert_eq!(s.bucket_assets, "showrunner-assets");
        assert!(s.is_development());
    }

    #[test]
    fn var_parse_falls_back_on_garbage() {
        // Unset variable falls through to the default.
        assert_eq!(var_parse("SHOWRUNNER_TEST_UNSET_VAR", 7usize), 7);
    }
}
