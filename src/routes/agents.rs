//! Agent lifecycle handlers (spec §4.5): register, self-info, token
//! rotation, and the admin list/approve/suspend trio.

use std::collections::HashMap;

use axum::extract::{Extension, Path, Query, State};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::domain::{Agent, AgentStatus};
use crate::error::ApiError;
use crate::identity::{generate_agent_id, generate_token, hash_token};
use crate::middleware::parse_status_filter;
use crate::state::AppState;
use crate::store::StoreError;

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub agent_name: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub arch: String,
    #[serde(default)]
    pub client_version: String,
    #[serde(default)]
    pub fingerprint: String,
    #[serde(default)]
    pub encrypt_tool: String,
    #[serde(default)]
    pub public_key: String,
}

#[derive(Serialize)]
pub struct RegisterResponse {
    pub agent_id: String,
    pub token: String,
    pub status: AgentStatus,
    pub quota_mb: i64,
    pub backup_prefix: String,
}

pub async fn register(
    State(state): State<AppState>,
    Json(body): Json<RegisterRequest>,
) -> Result<(axum::http::StatusCode, Json<RegisterResponse>), ApiError> {
    if body.agent_name.trim().is_empty() {
        return Err(ApiError::Validation("agent_name must not be empty".into()));
    }

    let pending = state.store.count_agents_by_status(AgentStatus::Pending).await?;
    if pending >= state.settings.max_pending_agents {
        return Err(ApiError::PendingFlood);
    }

    let id = generate_agent_id();
    let token = generate_token();
    let agent = Agent {
        id: id.clone(),
        name: body.agent_name,
        hostname: body.hostname,
        os: body.os,
        arch: body.arch,
        client_version: body.client_version,
        fingerprint: body.fingerprint,
        encrypt_tool: body.encrypt_tool,
        public_key: body.public_key,
        token_hash: hash_token(&token),
        status: AgentStatus::Pending,
        quota_bytes: state.settings.default_quota_bytes,
        used_bytes: 0,
        created_at: Utc::now(),
    };

    state.store.create_agent(agent.clone()).await?;

    Ok((
        axum::http::StatusCode::CREATED,
        Json(RegisterResponse {
            agent_id: id.clone(),
            token,
            status: agent.status,
            quota_mb: agent.quota_bytes / (1024 * 1024),
            backup_prefix: format!("{id}/"),
        }),
    ))
}

pub async fn me(
    State(state): State<AppState>,
    Extension(agent): Extension<Agent>,
) -> Result<Json<Agent>, ApiError> {
    state.store.recompute_used_bytes(&agent.id).await?;
    let refreshed = state.store.get_agent(&agent.id).await?;
    Ok(Json(refreshed))
}

#[derive(Serialize)]
pub struct RotateTokenResponse {
    pub token: String,
}

pub async fn rotate_token(
    State(state): State<AppState>,
    Extension(agent): Extension<Agent>,
) -> Result<Json<RotateTokenResponse>, ApiError> {
    let token = generate_token();
    state.store.rotate_token(&agent.id, &hash_token(&token)).await?;
    Ok(Json(RotateTokenResponse { token }))
}

pub async fn admin_list(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Vec<Agent>>, ApiError> {
    let filter = parse_status_filter(&params)?;
    let agents = state.store.list_agents(filter).await?;
    Ok(Json(agents))
}

pub async fn admin_approve(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Agent>, ApiError> {
    state
        .store
        .update_agent_status(&id, AgentStatus::Active)
        .await
        .map_err(|e| match e {
            StoreError::NotFound => ApiError::NotFound(format!("no such agent: {id}")),
            other => other.into(),
        })?;
    let agent = state.store.get_agent(&id).await?;
    Ok(Json(agent))
}

pub async fn admin_suspend(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Agent>, ApiError> {
    state
        .store
        .update_agent_status(&id, AgentStatus::Suspended)
        .await
        .map_err(|e| match e {
            StoreError::NotFound => ApiError::NotFound(format!("no such agent: {id}")),
            other => other.into(),
        })?;
    let agent = state.store.get_agent(&id).await?;
    Ok(Json(agent))
}
