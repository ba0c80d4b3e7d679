use std::panic::Location;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::error;

use crate::broker::BrokerError;
use crate::store::StoreError;

#[inline]
#[track_caller]
pub(crate) fn log(source: &dyn std::error::Error) {
    let location = Location::caller();
    let span_trace = tracing_error::SpanTrace::capture();

    error!(
        target: "control_plane",
        %location,
        error = %source,
        "span trace:\n{span_trace}"
    );
}

/// Every failure kind a handler can produce, projected to the HTTP/JSON
/// shape in spec §6/§7. Handlers never match on backend errors directly:
/// `StoreError`/`BrokerError` convert into `Storage` and are logged with
/// context at the conversion site.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("missing bearer token")]
    AuthMissing,
    #[error("invalid bearer token")]
    AuthInvalid,
    #[error("{0}")]
    QuotaExceeded(String),
    #[error("agent not active")]
    AgentNotActive(crate::domain::AgentStatus),
    #[error("{0}")]
    NotFound(String),
    #[error("rate limited")]
    RateLimited,
    #[error("{0}")]
    TooFrequent(String),
    #[error("too many pending agents")]
    PendingFlood,
    #[error("internal error")]
    Storage,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message, agent_status) = match &self {
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone(), None),
            ApiError::AuthMissing => (StatusCode::UNAUTHORIZED, self.to_string(), None),
            ApiError::AuthInvalid => (StatusCode::UNAUTHORIZED, self.to_string(), None),
            ApiError::QuotaExceeded(msg) => (StatusCode::FORBIDDEN, msg.clone(), None),
            ApiError::AgentNotActive(status) => (
                StatusCode::FORBIDDEN,
                "agent not active".to_string(),
                Some(status.as_str().to_string()),
            ),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone(), None),
            ApiError::RateLimited => (StatusCode::TOO_MANY_REQUESTS, self.to_string(), None),
            ApiError::TooFrequent(msg) => (StatusCode::TOO_MANY_REQUESTS, msg.clone(), None),
            ApiError::PendingFlood => (StatusCode::SERVICE_UNAVAILABLE, self.to_string(), None),
            ApiError::Storage => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string(), None),
        };

        let mut response = (
            status,
            Json(ErrorBody {
                error: message,
                status: agent_status,
            }),
        )
            .into_response();

        if matches!(self, ApiError::RateLimited) {
            response
                .headers_mut()
                .insert("Retry-After", "60".parse().unwrap());
        }

        response
    }
}

impl From<StoreError> for ApiError {
    #[track_caller]
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => ApiError::NotFound("not found".into()),
            StoreError::AlreadyExists => ApiError::Validation("already exists".into()),
            other => {
                log(&other);
                ApiError::Storage
            }
        }
    }
}

impl From<BrokerError> for ApiError {
    #[track_caller]
    fn from(err: BrokerError) -> Self {
        log(&err);
        ApiError::Storage
    }
}
