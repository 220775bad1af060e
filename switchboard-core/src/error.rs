//! Error types for provider adapters and the request execution core.
//!
//! `AdapterError` is what a provider adapter returns; it carries enough
//! structure (status code, readable body) for `classify()` to map it onto
//! an [`Outcome`] without re-parsing anything. `CoreError` is the
//! orchestrator/router-level error surfaced to callers, matching the
//! taxonomy kinds in the canonical error shape.

use thiserror::Error;

use crate::registry::ProviderId;

/// Errors a provider adapter can return from `chat_completion` /
/// `stream_chat_completion` / `health_check`.
#[derive(Error, Debug)]
pub enum AdapterError {
    /// Upstream responded with a 4xx that is not rate-limiting or auth.
    #[error("upstream client error ({status}): {body}")]
    UpstreamClientError { status: u16, body: String },

    /// Upstream responded 401/403.
    #[error("upstream auth error ({status}): {body}")]
    UpstreamAuthError { status: u16, body: String },

    /// Upstream responded 429.
    #[error("upstream rate limit ({status}): {body}")]
    UpstreamRateLimit { status: u16, body: String },

    /// Upstream responded 5xx.
    #[error("upstream server error ({status}): {body}")]
    UpstreamServerError { status: u16, body: String },

    /// Network, TLS, or timeout failure before or during the attempt.
    #[error("transport error: {0}")]
    TransportError(String),

    /// The adapter cannot represent the request (e.g. a role the wire
    /// format has no slot for).
    #[error("request not representable: {0}")]
    UnsupportedRequest(String),

    /// Upstream body did not parse as the expected shape.
    #[error("invalid upstream response: {0}")]
    InvalidResponse(String),

    /// Caller-supplied cancellation token fired.
    #[error("cancelled")]
    Cancelled,

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AdapterError {
    /// Map an HTTP status and readable body onto the right variant.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => AdapterError::UpstreamAuthError { status, body },
            429 => AdapterError::UpstreamRateLimit { status, body },
            500..=599 => AdapterError::UpstreamServerError { status, body },
            _ => AdapterError::UpstreamClientError { status, body },
        }
    }

    /// Classify this error into the outcome class that drives `HealthStore`
    /// updates and orchestrator rotation decisions, per the outcome table.
    pub fn classify(&self) -> Outcome {
        match self {
            AdapterError::UpstreamClientError { .. } => Outcome::ClientError,
            AdapterError::UpstreamAuthError { .. } => Outcome::AuthError,
            AdapterError::UpstreamRateLimit { .. } => Outcome::RateLimit,
            AdapterError::UpstreamServerError { .. } => Outcome::ServerError,
            AdapterError::TransportError(_) | AdapterError::Http(_) => Outcome::TransportError,
            AdapterError::UnsupportedRequest(_) | AdapterError::InvalidResponse(_) => {
                Outcome::ClientError
            }
            AdapterError::Cancelled => Outcome::Cancelled,
            AdapterError::Serialization(_) => Outcome::ClientError,
        }
    }
}

/// Outcome classes recorded against a provider's [`crate::health::HealthStore`]
/// entry, per the outcome-to-cooldown table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Success,
    ClientError,
    RateLimit,
    ServerError,
    AuthError,
    TransportError,
    Cancelled,
}

/// One entry in an `AllCandidatesFailed` aggregation, attributing a failure
/// to the provider that produced it, in attempt order.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AttemptError {
    pub provider: ProviderId,
    pub kind: &'static str,
    pub status: Option<u16>,
    pub message: String,
}

/// Top-level error returned by the Smart Router / Fallback Orchestrator.
#[derive(Error, Debug)]
pub enum CoreError {
    /// `requested-model` does not resolve to any `GlobalModel`, alias, or
    /// provider-specific id.
    #[error("model not found: {0}")]
    ModelNotFound(String),

    /// Tenant's `current-month-spend >= monthly-budget`.
    #[error("budget exceeded for tenant {tenant}, model {model}")]
    BudgetExceeded { tenant: String, model: String },

    /// Router resolved the model but every candidate was filtered out.
    #[error("no usable candidates for model {0}")]
    NoCandidates(String),

    /// Every candidate was attempted and failed.
    #[error("all candidates failed")]
    AllCandidatesFailed(Vec<AttemptError>),

    /// Caller cancellation observed before or during the attempt.
    #[error("cancelled")]
    Cancelled,

    /// An upstream error surfaced once a stream is already committed
    /// (post-first-chunk); not a rotation candidate.
    #[error("stream aborted: {0}")]
    StreamAborted(#[source] AdapterError),

    /// No adapter is registered for a candidate's provider id. Internal
    /// configuration bug, not a user-facing routing failure, but the
    /// orchestrator treats it like any other failed attempt and rotates.
    #[error("no adapter registered for provider {0}")]
    UnknownProvider(ProviderId),
}

impl CoreError {
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::ModelNotFound(_) => "model_not_found",
            CoreError::BudgetExceeded { .. } => "budget_exceeded",
            CoreError::NoCandidates(_) => "no_candidates",
            CoreError::AllCandidatesFailed(_) => "all_candidates_failed",
            CoreError::Cancelled => "cancelled",
            CoreError::StreamAborted(_) => "transport_error",
            CoreError::UnknownProvider(_) => "internal_error",
        }
    }
}
