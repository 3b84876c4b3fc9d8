//! Error types for the analysis pipeline.
//!
//! [`AnalyzerError`] covers every condition that aborts a run. Notification
//! failures are deliberately absent: by the time a card is sent the decision
//! already stands, so delivery problems are reported through
//! [`crate::dispatch::DispatchReport`] instead.

use std::time::Duration;
use thiserror::Error;

/// Notification transport failures, reported but never run-fatal.
pub type DeliveryError = notify::ChannelError;

/// Run-fatal errors.
#[derive(Debug, Error)]
pub enum AnalyzerError {
    /// The target cannot be turned into a usable selector
    #[error("Cannot resolve target: {0}")]
    Resolution(String),

    /// Every evidence source failed, so there is nothing to reason about
    #[error(
        "All evidence sources unavailable (resources: {resources}; alerts: {alerts}; logs: {logs})"
    )]
    EvidenceUnavailable {
        resources: String,
        alerts: String,
        logs: String,
    },

    /// The request text could not be rendered
    #[error("Failed to render request: {0}")]
    Prompt(String),

    /// The reasoning service could not be reached or answered abnormally
    #[error("Reasoning service call failed: {0}")]
    Transport(#[from] TransportError),

    /// The reasoning service answered with an unusable decision
    #[error(transparent)]
    Decision(#[from] DecisionError),

    /// The caller cancelled the run
    #[error("Run cancelled")]
    Cancelled,

    /// Configuration is missing or inconsistent
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Failures interpreting the reasoning service's response.
#[derive(Debug, Error)]
pub enum DecisionError {
    /// Not JSON, not an object, or no `action` discriminant
    #[error("Response is not a decision document: {reason}")]
    Parse {
        reason: String,
        /// The offending response text, kept for operator diagnosis
        raw: String,
    },

    /// `action` is neither `heal` nor `noop`
    #[error("Unknown action {0:?}")]
    UnknownAction(String),

    /// A decoded payload violates a field constraint
    #[error("Invalid {field}: {reason}")]
    Validation { field: String, reason: String },
}

impl DecisionError {
    pub(crate) fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Failures talking to the reasoning service.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection-level failure
    #[error("Request failed: {0}")]
    Request(String),

    /// The call exceeded its deadline
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Non-success HTTP status
    #[error("Service returned {status}: {body}")]
    Status { status: u16, body: String },

    /// The envelope around the generated text could not be read
    #[error("Malformed response: {0}")]
    Malformed(String),

    /// Credentials or endpoint missing
    #[error("Not configured: {0}")]
    NotConfigured(String),
}

impl TransportError {
    /// Whether another attempt may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Request(_) | Self::Timeout(_) => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::Malformed(_) | Self::NotConfigured(_) => false,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Request(format!("timed out: {e}"))
        } else if e.is_decode() {
            Self::Malformed(e.to_string())
        } else {
            Self::Request(e.to_string())
        }
    }
}
