//! Typed error hierarchy for the CodinIT backend.
//!
//! `SandboxError` covers the remote execution service path; it is what
//! `resolve()` / `evaluate_code()` propagate to callers untranslated.
//! Route-boundary translation to HTTP lives in `api::ApiError`, and
//! telemetry delivery failures never escape the queue at all.

use thiserror::Error;

/// Errors from the remote sandbox service and session registry.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The service credential is absent. Fatal, raised at first use.
    #[error("E2B_API_KEY environment variable not found")]
    MissingApiKey,

    #[error("Sandbox service request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The service answered with a non-success status.
    #[error("Sandbox service returned {status}: {message}")]
    Service { status: u16, message: String },

    #[error("Sandbox {id} not found")]
    NotFound { id: String },

    #[error("Failed to decode sandbox service response: {0}")]
    Decode(String),
}
