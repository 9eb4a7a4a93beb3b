//! Typed error hierarchy for the showrunner core.
//!
//! A single enum covers every failure the pipeline distinguishes. Provider
//! clients and stage executors return `CoreError` all the way up; the worker
//! boundary is the only place errors are converted into job outcomes, and
//! the CLI is the only place they are converted into `anyhow` reports.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

/// Failure kinds the core distinguishes.
///
/// `Display` renders `kind: message`, which is exactly what lands in
/// `job.error_message` and `pipeline_state[stage].error`.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Bad inputs, forbidden state transition, missing prerequisite.
    #[error("validation: {0}")]
    Validation(String),

    /// Missing episode/channel/asset/object.
    #[error("not_found: {resource} '{id}' not found")]
    NotFound { resource: &'static str, id: String },

    /// Uniqueness violation or active-job guard; rejected at dispatch.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Provider 429 after retry exhaustion.
    #[error("rate_limited: {message}")]
    RateLimited {
        message: String,
        retry_after_s: Option<u64>,
    },

    /// Provider 4xx/5xx, submit-poll timeout, download error.
    #[error("external_service: {service}: {message}")]
    ExternalService { service: String, message: String },

    /// Artifact-store transport failure after in-flight retries.
    #[error("storage_error: {0}")]
    Storage(String),

    /// Executor-level contract violation (e.g. missing upstream artifact).
    #[error("pipeline: {stage}: {message}")]
    Pipeline { stage: String, message: String },

    /// Cooperative abort observed at a cancellation checkpoint.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Anything else.
    #[error("internal: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(resource: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource,
            id: id.into(),
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn external(service: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ExternalService {
            service: service.into(),
            message: msg.into(),
        }
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn pipeline(stage: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Pipeline {
            stage: stage.into(),
            message: msg.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Machine-readable kind tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound { .. } => "not_found",
            Self::Conflict(_) => "conflict",
            Self::RateLimited { .. } => "rate_limited",
            Self::ExternalService { .. } => "external_service",
            Self::Storage(_) => "storage_error",
            Self::Pipeline { .. } => "pipeline",
            Self::Cancelled(_) => "cancelled",
            Self::Internal(_) => "internal",
        }
    }

    /// Whether a failed job carrying this error is eligible for `job.retry`.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::ExternalService { .. } | Self::Storage(_)
        )
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(err: rusqlite::Error) -> Self {
        CoreError::Internal(format!("database error: {err}"))
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Internal(format!("serialization error: {err}"))
    }
}
