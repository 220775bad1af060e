//! # Gateway Error Types Module
//!
//! Maps [`switchboard_core::CoreError`] (and the handful of gateway-local
//! failure modes — bad JSON, config errors surfacing at request time) onto
//! the canonical `{error:{kind, message, code, details?}}` HTTP body.
//!
//! ## HTTP status mapping
//!
//! - `400` — `ModelNotFound`, bad request JSON
//! - `402` — `BudgetExceeded`
//! - `404` — `NoCandidates`
//! - `499` — `Cancelled` (client closed request)
//! - `502` — `AllCandidatesFailed`, `StreamAborted`
//! - `500` — internal/unknown-provider errors

use axum::body::Body;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::json;
use switchboard_core::error::{AttemptError, CoreError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("invalid request body: {0}")]
    BadRequest(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::BadRequest(err.to_string())
    }
}

#[derive(Serialize)]
struct AttemptDetail {
    provider: String,
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<u16>,
    message: String,
}

impl From<&AttemptError> for AttemptDetail {
    fn from(e: &AttemptError) -> Self {
        Self {
            provider: e.provider.to_string(),
            kind: e.kind,
            status: e.status,
            message: e.message.clone(),
        }
    }
}

impl GatewayError {
    fn status_and_kind(&self) -> (StatusCode, &'static str) {
        match self {
            GatewayError::Core(CoreError::ModelNotFound(_)) => (StatusCode::BAD_REQUEST, "model_not_found"),
            GatewayError::Core(CoreError::BudgetExceeded { .. }) => {
                (StatusCode::PAYMENT_REQUIRED, "budget_exceeded")
            }
            GatewayError::Core(CoreError::NoCandidates(_)) => (StatusCode::NOT_FOUND, "no_candidates"),
            GatewayError::Core(CoreError::Cancelled) => {
                (StatusCode::from_u16(499).unwrap(), "cancelled")
            }
            GatewayError::Core(CoreError::AllCandidatesFailed(_)) => {
                (StatusCode::BAD_GATEWAY, "all_candidates_failed")
            }
            GatewayError::Core(CoreError::StreamAborted(_)) => (StatusCode::BAD_GATEWAY, "transport_error"),
            GatewayError::Core(CoreError::UnknownProvider(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
            }
            GatewayError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            GatewayError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error"),
        }
    }

    fn details(&self) -> Option<Vec<AttemptDetail>> {
        match self {
            GatewayError::Core(CoreError::AllCandidatesFailed(attempts)) => {
                Some(attempts.iter().map(AttemptDetail::from).collect())
            }
            _ => None,
        }
    }
}

impl GatewayError {
    /// The canonical `{error:{kind,message,code,details?}}` body, shared
    /// between the HTTP error response and the terminal SSE event a
    /// mid-stream abort carries: never a silent close.
    pub fn to_json(&self) -> serde_json::Value {
        let (status, kind) = self.status_and_kind();
        let mut body = json!({
            "error": {
                "kind": kind,
                "message": self.to_string(),
                "code": status.as_u16(),
            }
        });
        if let Some(details) = self.details() {
            body["error"]["details"] = json!(details);
        }
        body
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, _kind) = self.status_and_kind();
        tracing::warn!(status = %status, error = %self, "request failed");
        let body = self.to_json();

        Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    }
}
