//! Gateway error types.
//!
//! # Error Classification
//!
//! Errors fall into three groups, and the group decides how the rest of the
//! crate reacts:
//!
//! - **Transport**: [`JimengError::UpstreamCallFailed`], [`JimengError::UploadFailed`]
//!   and the polling outcomes that may clear up on a fresh submission. These
//!   are retried by the HTTP layer and by the whole-flow retry envelope.
//! - **Business outcomes**: [`JimengError::ContentFiltered`],
//!   [`JimengError::InsufficientCredit`], [`JimengError::NoRecordId`]. Retrying
//!   only burns upstream quota, so they propagate immediately.
//! - **Caller errors**: [`JimengError::Validation`] and [`JimengError::Config`].
//!
//! Every error raised after submission carries the upstream correlation id so
//! a human can find the job in the upstream web UI.

use thiserror::Error;

/// Gateway errors.
#[derive(Error, Debug)]
pub enum JimengError {
    /// Caller input was rejected before anything was sent upstream.
    #[error("Invalid request: {0}")]
    Validation(String),

    /// Transport or HTTP-level failure talking to the upstream service.
    #[error("Upstream call failed: {0}")]
    UpstreamCallFailed(String),

    /// The account has no credit left for this generation.
    #[error("Insufficient credit: {0}")]
    InsufficientCredit(String),

    /// Upstream refused the prompt or the result on content grounds.
    #[error("Content filtered by upstream (record {correlation_id})")]
    ContentFiltered {
        /// Upstream history record id.
        correlation_id: String,
    },

    /// Upstream reported a failed generation.
    #[error("Generation failed with code {fail_code} (record {correlation_id})")]
    GenerationFailed {
        /// Upstream history record id.
        correlation_id: String,
        /// Upstream failure code, verbatim.
        fail_code: String,
    },

    /// Submission was accepted but no history record id came back.
    #[error("Upstream returned no record id for the submission")]
    NoRecordId,

    /// The history record never appeared while polling.
    #[error("History record {correlation_id} not found upstream")]
    RecordMissing {
        /// Upstream history record id.
        correlation_id: String,
    },

    /// The job completed but no asset URL could be located in the record.
    #[error("Could not extract an asset URL from record {correlation_id}")]
    AssetExtractionFailed {
        /// Upstream history record id.
        correlation_id: String,
    },

    /// A reference asset could not be moved into upstream storage.
    #[error("Upload failed: {0}")]
    UploadFailed(String),

    /// The poll budget ran out while the job was still processing.
    #[error(
        "Generation still running after the poll budget (record {correlation_id}); \
         check the upstream history page later"
    )]
    TimedOut {
        /// Upstream history record id.
        correlation_id: String,
    },

    /// Configuration error.
    #[error("Config error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, JimengError>;

impl JimengError {
    /// Whether the whole generation flow may be re-run after this error.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            JimengError::ContentFiltered { .. }
                | JimengError::InsufficientCredit(_)
                | JimengError::NoRecordId
                | JimengError::Validation(_)
                | JimengError::Config(_)
        )
    }

    /// Upstream correlation id, when the error happened after submission.
    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            JimengError::ContentFiltered { correlation_id }
            | JimengError::GenerationFailed { correlation_id, .. }
            | JimengError::RecordMissing { correlation_id }
            | JimengError::AssetExtractionFailed { correlation_id }
            | JimengError::TimedOut { correlation_id } => Some(correlation_id),
            _ => None,
        }
    }

    /// Short machine-readable error type for API responses.
    pub fn kind(&self) -> &'static str {
        match self {
            JimengError::Validation(_) => "invalid_request_error",
            JimengError::UpstreamCallFailed(_) => "upstream_error",
            JimengError::InsufficientCredit(_) => "insufficient_credit",
            JimengError::ContentFiltered { .. } => "content_filtered",
            JimengError::GenerationFailed { .. } => "generation_failed",
            JimengError::NoRecordId => "no_record_id",
            JimengError::RecordMissing { .. } => "record_missing",
            JimengError::AssetExtractionFailed { .. } => "asset_extraction_failed",
            JimengError::UploadFailed(_) => "upload_failed",
            JimengError::TimedOut { .. } => "timeout",
            JimengError::Config(_) | JimengError::Json(_) | JimengError::Io(_) => "server_error",
        }
    }

    /// HTTP status the server layer answers with.
    pub fn status_code(&self) -> u16 {
        match self {
            JimengError::Validation(_) => 400,
            JimengError::InsufficientCredit(_) => 402,
            JimengError::ContentFiltered { .. } => 422,
            JimengError::UpstreamCallFailed(_) | JimengError::UploadFailed(_) => 502,
            JimengError::TimedOut { .. } => 504,
            JimengError::GenerationFailed { .. }
            | JimengError::NoRecordId
            | JimengError::RecordMissing { .. }
            | JimengError::AssetExtractionFailed { .. } => 502,
            JimengError::Config(_) | JimengError::Json(_) | JimengError::Io(_) => 500,
        }
    }
}

impl From<reqwest::Error> for JimengError {
    fn from(err: reqwest::Error) -> Self {
        JimengError::UpstreamCallFailed(err.to_string())
    }
}

impl From<toml::de::Error> for JimengError {
    fn from(err: toml::de::Error) -> Self {
        JimengError::Config(err.to_string())
    }
}

impl From<base64::DecodeError> for JimengError {
    fn from(err: base64::DecodeError) -> Self {
        JimengError::UploadFailed(format!("Base64 decode error: {err}"))
    }
}
