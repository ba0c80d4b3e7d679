//! The fixed, outermost-first middleware chain from spec §4.4: request
//! logging is handled by `tower_http::trace::TraceLayer` in `routes::router`;
//! the remaining three stages (bearer auth, RequireActive, admin key) are
//! hand-rolled `axum::middleware::from_fn_with_state` functions since they
//! need to inject typed extensions and read service state.

use axum::extract::{Query, Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use std::collections::HashMap;
use subtle::ConstantTimeEq;

use crate::domain::AgentStatus;
use crate::error::ApiError;
use crate::state::AppState;

/// Extracts `Authorization: Bearer <token>`, looks it up, and injects the
/// resolved `Agent` as a request extension. Reads and mutations alike pass
/// through this stage; activeness is gated separately.
pub async fn bearer_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(ApiError::AuthMissing)?;

    let agent = state
        .store
        .lookup_by_token(token)
        .await
        .map_err(|_| ApiError::AuthInvalid)?;

    req.extensions_mut().insert(agent);
    Ok(next.run(req).await)
}

/// Rejects unless `agent` is `active` (spec §4.4's RequireActive stage).
/// Several routes share a path with a read-only sibling that must stay
/// open to pending/suspended agents (e.g. `GET` vs `DELETE` on the same
/// backup), so this check lives in each mutating handler rather than as
/// router-wide middleware gated on path alone.
pub fn require_active(agent: &crate::domain::Agent) -> Result<(), ApiError> {
    if agent.status != AgentStatus::Active {
        return Err(ApiError::AgentNotActive(agent.status));
    }
    Ok(())
}

/// Constant-time compare of `X-API-Key` against the configured allowlist.
/// An empty allowlist leaves admin endpoints open, matching spec §4.4's
/// documented local-dev escape hatch.
pub async fn admin_key(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if state.settings.admin_api_keys.is_empty() {
        return Ok(next.run(req).await);
    }

    let presented = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::AuthMissing)?;

    let matches = state
        .settings
        .admin_api_keys
        .iter()
        .any(|k| k.as_bytes().ct_eq(presented.as_bytes()).into());

    if !matches {
        return Err(ApiError::AuthInvalid);
    }
    Ok(next.run(req).await)
}

/// Fixed 60 s window rate limit keyed on client IP, applied only to
/// `POST /v1/agents/register`. Fails open: the limiter itself never errors,
/// but any inability to read request metadata is treated as "allow".
pub async fn register_rate_limit(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let peer = req
        .extensions()
        .get::<axum::extract::ConnectInfo<std::net::SocketAddr>>()
        .map(|c| c.0);
    let key = crate::ratelimit::extract_client_ip(&headers, peer);

    if !state.register_limiter.check(&key) {
        return Err(ApiError::RateLimited);
    }
    Ok(next.run(req).await)
}

/// Pulls `status` out of the admin-list query string into a typed filter,
/// used by the admin agents handler rather than as middleware proper, kept
/// here alongside its sibling extractors for discoverability.
pub fn parse_status_filter(params: &HashMap<String, String>) -> Result<Option<AgentStatus>, ApiError> {
    match params.get("status") {
        None => Ok(None),
        Some(s) => AgentStatus::parse(s)
            .map(Some)
            .ok_or_else(|| ApiError::Validation(format!("unknown status: {s}"))),
    }
}

#[allow(dead_code)]
pub type StatusQuery = Query<HashMap<String, String>>;
