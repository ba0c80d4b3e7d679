//! Backup lifecycle handlers (spec §4.6): upload-URL minting with the full
//! admission chain, list/get, download-URL minting, soft-delete (single and
//! bulk), and undelete.

use std::collections::HashMap;
use std::time::Duration;

use axum::extract::{Extension, Path, Query, State};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::domain::{Agent, Backup};
use crate::error::ApiError;
use crate::middleware::require_active;
use crate::state::AppState;

fn default_files() -> Vec<String> {
    vec!["backup.ciphertext".to_string(), "manifest.meta".to_string()]
}

#[derive(Deserialize)]
pub struct UploadUrlRequest {
    pub timestamp: String,
    #[serde(default = "default_files")]
    pub files: Vec<String>,
    pub encrypted_bytes: i64,
    #[serde(default)]
    pub encrypted_sha256: String,
    #[serde(default)]
    pub source_file_count: i64,
}

#[derive(Serialize)]
pub struct UploadUrlResponse {
    pub urls: HashMap<String, String>,
    pub expires_in: u64,
}

pub async fn upload_url(
    State(state): State<AppState>,
    Extension(agent): Extension<Agent>,
    Json(body): Json<UploadUrlRequest>,
) -> Result<Json<UploadUrlResponse>, ApiError> {
    require_active(&agent)?;
    if body.timestamp.trim().is_empty() {
        return Err(ApiError::Validation("timestamp must not be empty".into()));
    }
    if body.encrypted_bytes <= 0 || body.encrypted_bytes > state.settings.max_upload_bytes {
        return Err(ApiError::Validation(format!(
            "encrypted_bytes must be in (0, {}]",
            state.settings.max_upload_bytes
        )));
    }
    if agent.used_bytes + body.encrypted_bytes > agent.quota_bytes {
        return Err(ApiError::QuotaExceeded(format!(
            "quota exceeded: {} + {} > {}",
            agent.used_bytes, body.encrypted_bytes, agent.quota_bytes
        )));
    }

    if let Some(newest) = state.store.newest_backup(&agent.id).await? {
        let elapsed = Utc::now().signed_duration_since(newest.created_at);
        let min_interval = chrono::Duration::hours(state.settings.min_backup_interval_hours);
        if newest.timestamp != body.timestamp && elapsed < min_interval {
            return Err(ApiError::TooFrequent(format!(
                "minimum backup interval is {} hours",
                state.settings.min_backup_interval_hours
            )));
        }
    }

    let blob_key = Backup::blob_key_for(&agent.id, &body.timestamp);
    let manifest_key = Backup::manifest_key_for(&agent.id, &body.timestamp);

    let backup = Backup {
        agent_id: agent.id.clone(),
        timestamp: body.timestamp.clone(),
        encrypted_bytes: body.encrypted_bytes,
        source_file_count: body.source_file_count,
        encrypted_sha256: body.encrypted_sha256,
        blob_key: blob_key.clone(),
        manifest_key: manifest_key.clone(),
        created_at: Utc::now(),
        deleted_at: None,
        purge_at: None,
    };
    state.store.create_backup(backup).await?;
    state.store.recompute_used_bytes(&agent.id).await?;

    let (visible_count, _) = state.store.count_and_sum(&agent.id).await?;
    if visible_count > state.settings.max_backups_per_agent {
        let surplus = visible_count - state.settings.max_backups_per_agent;
        let grace = chrono::Duration::hours(state.settings.delete_grace_hours);
        state
            .store
            .soft_delete_oldest(&agent.id, surplus, Utc::now(), grace)
            .await?;
        state.store.recompute_used_bytes(&agent.id).await?;
    }

    let expiry = Duration::from_secs(state.settings.presign_expiry_seconds);
    let mut urls = HashMap::new();
    for file in &body.files {
        let url = if file == "backup.ciphertext" {
            state
                .broker
                .presign_put(&blob_key, "application/octet-stream", body.encrypted_bytes, expiry)
                .await?
        } else if file == "manifest.meta" {
            state
                .broker
                .presign_put_unbound(&manifest_key, "application/octet-stream", expiry)
                .await?
        } else {
            continue;
        };
        urls.insert(file.clone(), url);
    }

    Ok(Json(UploadUrlResponse {
        urls,
        expires_in: state.settings.presign_expiry_seconds,
    }))
}

#[derive(Deserialize)]
pub struct ListQuery {
    pub limit: Option<i64>,
    pub count_only: Option<bool>,
}

#[derive(Serialize)]
pub struct ListResponse {
    pub backups: Vec<Backup>,
    pub count: i64,
    pub used_bytes: i64,
    pub quota_bytes: i64,
}

pub async fn list(
    State(state): State<AppState>,
    Extension(agent): Extension<Agent>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListResponse>, ApiError> {
    let (count, _) = state.store.count_and_sum(&agent.id).await?;
    let refreshed = state.store.get_agent(&agent.id).await?;

    let backups = if query.count_only.unwrap_or(false) {
        Vec::new()
    } else {
        state.store.list_backups(&agent.id, query.limit.unwrap_or(i64::MAX)).await?
    };

    Ok(Json(ListResponse {
        backups,
        count,
        used_bytes: refreshed.used_bytes,
        quota_bytes: refreshed.quota_bytes,
    }))
}

pub async fn get(
    State(state): State<AppState>,
    Extension(agent): Extension<Agent>,
    Path(timestamp): Path<String>,
) -> Result<Json<Backup>, ApiError> {
    let backup = state.store.get_backup(&agent.id, &timestamp).await?;
    Ok(Json(backup))
}

#[derive(Deserialize)]
pub struct DownloadUrlRequest {
    pub timestamp: String,
}

#[derive(Serialize)]
pub struct DownloadUrlResponse {
    pub urls: HashMap<String, String>,
    pub expires_in: u64,
}

pub async fn download_url(
    State(state): State<AppState>,
    Extension(agent): Extension<Agent>,
    Json(body): Json<DownloadUrlRequest>,
) -> Result<Json<DownloadUrlResponse>, ApiError> {
    let backup = state.store.get_backup(&agent.id, &body.timestamp).await?;
    let expiry = Duration::from_secs(state.settings.presign_expiry_seconds);

    let mut urls = HashMap::new();
    urls.insert(
        "backup.ciphertext".to_string(),
        state.broker.presign_get(&backup.blob_key, expiry).await?,
    );
    urls.insert(
        "manifest.meta".to_string(),
        state.broker.presign_get(&backup.manifest_key, expiry).await?,
    );

    Ok(Json(DownloadUrlResponse {
        urls,
        expires_in: state.settings.presign_expiry_seconds,
    }))
}

#[derive(Serialize)]
pub struct DeleteResponse {
    pub can_undelete_until: chrono::DateTime<Utc>,
}

pub async fn delete_one(
    State(state): State<AppState>,
    Extension(agent): Extension<Agent>,
    Path(timestamp): Path<String>,
) -> Result<Json<DeleteResponse>, ApiError> {
    require_active(&agent)?;
    let now = Utc::now();
    let grace = chrono::Duration::hours(state.settings.delete_grace_hours);
    let backup = state.store.soft_delete(&agent.id, &timestamp, now, grace).await?;
    state.store.recompute_used_bytes(&agent.id).await?;
    Ok(Json(DeleteResponse {
        can_undelete_until: backup.purge_at.unwrap_or(now + grace),
    }))
}

#[derive(Serialize)]
pub struct DeleteAllResponse {
    pub deleted: usize,
    pub can_undelete_until: Option<chrono::DateTime<Utc>>,
}

pub async fn delete_all(
    State(state): State<AppState>,
    Extension(agent): Extension<Agent>,
) -> Result<Json<DeleteAllResponse>, ApiError> {
    require_active(&agent)?;
    let now = Utc::now();
    let grace = chrono::Duration::hours(state.settings.delete_grace_hours);
    let deleted = state.store.soft_delete_all(&agent.id, now, grace).await?;
    state.store.recompute_used_bytes(&agent.id).await?;
    Ok(Json(DeleteAllResponse {
        can_undelete_until: deleted.first().and_then(|b| b.purge_at),
        deleted: deleted.len(),
    }))
}

pub async fn undelete(
    State(state): State<AppState>,
    Extension(agent): Extension<Agent>,
    Path(timestamp): Path<String>,
) -> Result<Json<Backup>, ApiError> {
    require_active(&agent)?;
    state.store.undelete(&agent.id, &timestamp).await?;
    state.store.recompute_used_bytes(&agent.id).await?;
    let backup = state.store.get_backup(&agent.id, &timestamp).await?;
    Ok(Json(backup))
}
