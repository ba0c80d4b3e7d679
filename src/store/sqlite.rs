use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::{debug_span, Instrument};

use crate::domain::{Agent, AgentStatus, Backup};

use super::{Store, StoreError};

/// Embedded SQL backend (spec §4.2.1): write-ahead logging on, a single
/// connection pool, schema initialised lazily at `open()` via embedded
/// migrations so the `deleted_at` column lands on pre-existing databases
/// without a manual step.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    #[tracing::instrument(level = "info")]
    pub async fn open(database_path: &str) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{database_path}"))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        tracing::info!("starting database migration");
        sqlx::migrate!("./migrations").run(&pool).await?;
        tracing::info!("finished database migration");

        Ok(Self { pool })
    }
}

fn agent_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Agent, StoreError> {
    let status: String = row.try_get("status").map_err(|e| StoreError::Backend(e.into()))?;
    Ok(Agent {
        id: row.try_get("id").map_err(|e| StoreError::Backend(e.into()))?,
        name: row.try_get("name").map_err(|e| StoreError::Backend(e.into()))?,
        hostname: row.try_get("hostname").map_err(|e| StoreError::Backend(e.into()))?,
        os: row.try_get("os").map_err(|e| StoreError::Backend(e.into()))?,
        arch: row.try_get("arch").map_err(|e| StoreError::Backend(e.into()))?,
        client_version: row
            .try_get("client_version")
            .map_err(|e| StoreError::Backend(e.into()))?,
        fingerprint: row.try_get("fingerprint").map_err(|e| StoreError::Backend(e.into()))?,
        encrypt_tool: row.try_get("encrypt_tool").map_err(|e| StoreError::Backend(e.into()))?,
        public_key: row.try_get("public_key").map_err(|e| StoreError::Backend(e.into()))?,
        token_hash: row.try_get("token_hash").map_err(|e| StoreError::Backend(e.into()))?,
        status: AgentStatus::parse(&status).ok_or_else(|| StoreError::Backend(anyhow::anyhow!("bad status"))) ?,
        quota_bytes: row.try_get("quota_bytes").map_err(|e| StoreError::Backend(e.into()))?,
        used_bytes: row.try_get("used_bytes").map_err(|e| StoreError::Backend(e.into()))?,
        created_at: row.try_get("created_at").map_err(|e| StoreError::Backend(e.into()))?,
    })
}

fn backup_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Backup, StoreError> {
    Ok(Backup {
        agent_id: row.try_get("agent_id").map_err(|e| StoreError::Backend(e.into()))?,
        timestamp: row.try_get("timestamp").map_err(|e| StoreError::Backend(e.into()))?,
        encrypted_bytes: row.try_get("encrypted_bytes").map_err(|e| StoreError::Backend(e.into()))?,
        source_file_count: row
            .try_get("source_file_count")
            .map_err(|e| StoreError::Backend(e.into()))?,
        encrypted_sha256: row
            .try_get("encrypted_sha256")
            .map_err(|e| StoreError::Backend(e.into()))?,
        blob_key: row.try_get("blob_key").map_err(|e| StoreError::Backend(e.into()))?,
        manifest_key: row.try_get("manifest_key").map_err(|e| StoreError::Backend(e.into()))?,
        created_at: row.try_get("created_at").map_err(|e| StoreError::Backend(e.into()))?,
        deleted_at: row.try_get("deleted_at").map_err(|e| StoreError::Backend(e.into()))?,
        purge_at: row.try_get("purge_at").map_err(|e| StoreError::Backend(e.into()))?,
    })
}

#[async_trait]
impl Store for SqliteStore {
    #[tracing::instrument(level = "debug", skip(self, agent))]
    async fn create_agent(&self, agent: Agent) -> Result<(), StoreError> {
        let res = sqlx::query(
            r#"INSERT INTO agents
                (id, name, hostname, os, arch, client_version, fingerprint, encrypt_tool,
                 public_key, token_hash, status, quota_bytes, used_bytes, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&agent.id)
        .bind(&agent.name)
        .bind(&agent.hostname)
        .bind(&agent.os)
        .bind(&agent.arch)
        .bind(&agent.client_version)
        .bind(&agent.fingerprint)
        .bind(&agent.encrypt_tool)
        .bind(&agent.public_key)
        .bind(&agent.token_hash)
        .bind(agent.status.as_str())
        .bind(agent.quota_bytes)
        .bind(agent.used_bytes)
        .bind(agent.created_at)
        .execute(&self.pool)
        .instrument(debug_span!("db_insert_agent"))
        .await;

        match res {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => Err(StoreError::AlreadyExists),
            Err(e) => Err(StoreError::Backend(e.into())),
        }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn lookup_by_token(&self, token: &str) -> Result<Agent, StoreError> {
        let hash = crate::identity::hash_token(token);
        let row = sqlx::query("SELECT * FROM agents WHERE token_hash = ?")
            .bind(&hash)
            .fetch_optional(&self.pool)
            .instrument(debug_span!("db_lookup_by_token"))
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        let row = row.ok_or(StoreError::NotFound)?;
        agent_from_row(&row)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_agent(&self, id: &str) -> Result<Agent, StoreError> {
        let row = sqlx::query("SELECT * FROM agents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        let row = row.ok_or(StoreError::NotFound)?;
        agent_from_row(&row)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn list_agents(&self, status_filter: Option<AgentStatus>) -> Result<Vec<Agent>, StoreError> {
        let rows = match status_filter {
            Some(status) => sqlx::query("SELECT * FROM agents WHERE status = ? ORDER BY created_at DESC")
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await,
            None => {
                sqlx::query("SELECT * FROM agents ORDER BY created_at DESC")
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(|e| StoreError::Backend(e.into()))?;

        rows.iter().map(agent_from_row).collect()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn update_agent_status(&self, id: &str, new_status: AgentStatus) -> Result<(), StoreError> {
        let res = sqlx::query("UPDATE agents SET status = ? WHERE id = ?")
            .bind(new_status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        if res.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, new_token_hash))]
    async fn rotate_token(&self, id: &str, new_token_hash: &str) -> Result<(), StoreError> {
        let res = sqlx::query("UPDATE agents SET token_hash = ? WHERE id = ?")
            .bind(new_token_hash)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        if res.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn recompute_used_bytes(&self, id: &str) -> Result<i64, StoreError> {
        let (_, sum) = self.count_and_sum(id).await?;
        sqlx::query("UPDATE agents SET used_bytes = ? WHERE id = ?")
            .bind(sum)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(sum)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn count_agents_by_status(&self, status: AgentStatus) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS c FROM agents WHERE status = ?")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        row.try_get("c").map_err(|e| StoreError::Backend(e.into()))
    }

    #[tracing::instrument(level = "debug", skip(self, backup))]
    async fn create_backup(&self, backup: Backup) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO backups
                (agent_id, timestamp, encrypted_bytes, source_file_count, encrypted_sha256,
                 blob_key, manifest_key, created_at, deleted_at, purge_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, NULL, NULL)
               ON CONFLICT(agent_id, timestamp) DO UPDATE SET
                 encrypted_bytes = excluded.encrypted_bytes,
                 source_file_count = excluded.source_file_count,
                 encrypted_sha256 = excluded.encrypted_sha256,
                 blob_key = excluded.blob_key,
                 manifest_key = excluded.manifest_key,
                 created_at = excluded.created_at,
                 deleted_at = NULL,
                 purge_at = NULL"#,
        )
        .bind(&backup.agent_id)
        .bind(&backup.timestamp)
        .bind(backup.encrypted_bytes)
        .bind(backup.source_file_count)
        .bind(&backup.encrypted_sha256)
        .bind(&backup.blob_key)
        .bind(&backup.manifest_key)
        .bind(backup.created_at)
        .execute(&self.pool)
        .instrument(debug_span!("db_upsert_backup"))
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn list_backups(&self, agent_id: &str, limit: i64) -> Result<Vec<Backup>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM backups WHERE agent_id = ? AND deleted_at IS NULL ORDER BY created_at DESC LIMIT ?",
        )
        .bind(agent_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;
        rows.iter().map(backup_from_row).collect()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn count_and_sum(&self, agent_id: &str) -> Result<(i64, i64), StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS c, COALESCE(SUM(encrypted_bytes), 0) AS s FROM backups
             WHERE agent_id = ? AND deleted_at IS NULL",
        )
        .bind(agent_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;
        let count: i64 = row.try_get("c").map_err(|e| StoreError::Backend(e.into()))?;
        let sum: i64 = row.try_get("s").map_err(|e| StoreError::Backend(e.into()))?;
        Ok((count, sum))
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_backup(&self, agent_id: &str, timestamp: &str) -> Result<Backup, StoreError> {
        let row = sqlx::query("SELECT * FROM backups WHERE agent_id = ? AND timestamp = ? AND deleted_at IS NULL")
            .bind(agent_id)
            .bind(timestamp)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        let row = row.ok_or(StoreError::NotFound)?;
        backup_from_row(&row)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn newest_backup(&self, agent_id: &str) -> Result<Option<Backup>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM backups WHERE agent_id = ? AND deleted_at IS NULL ORDER BY created_at DESC LIMIT 1",
        )
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;
        row.as_ref().map(backup_from_row).transpose()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn soft_delete(
        &self,
        agent_id: &str,
        timestamp: &str,
        now: DateTime<Utc>,
        grace: chrono::Duration,
    ) -> Result<Backup, StoreError> {
        let existing = self.get_backup(agent_id, timestamp).await?;
        let purge_at = now + grace;
        sqlx::query(
            "UPDATE backups SET deleted_at = ?, purge_at = ? WHERE agent_id = ? AND timestamp = ? AND deleted_at IS NULL",
        )
        .bind(now)
        .bind(purge_at)
        .bind(agent_id)
        .bind(timestamp)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(existing)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn soft_delete_all(
        &self,
        agent_id: &str,
        now: DateTime<Utc>,
        grace: chrono::Duration,
    ) -> Result<Vec<Backup>, StoreError> {
        let visible = self.list_backups(agent_id, i64::MAX).await?;
        let purge_at = now + grace;
        sqlx::query("UPDATE backups SET deleted_at = ?, purge_at = ? WHERE agent_id = ? AND deleted_at IS NULL")
            .bind(now)
            .bind(purge_at)
            .bind(agent_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(visible)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn soft_delete_oldest(
        &self,
        agent_id: &str,
        count: i64,
        now: DateTime<Utc>,
        grace: chrono::Duration,
    ) -> Result<Vec<Backup>, StoreError> {
        if count <= 0 {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            "SELECT * FROM backups WHERE agent_id = ? AND deleted_at IS NULL ORDER BY created_at ASC LIMIT ?",
        )
        .bind(agent_id)
        .bind(count)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;

        let mut purged = Vec::with_capacity(rows.len());
        let purge_at = now + grace;
        for row in &rows {
            let backup = backup_from_row(row)?;
            sqlx::query(
                "UPDATE backups SET deleted_at = ?, purge_at = ? WHERE agent_id = ? AND timestamp = ? AND deleted_at IS NULL",
            )
            .bind(now)
            .bind(purge_at)
            .bind(agent_id)
            .bind(&backup.timestamp)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
            purged.push(backup);
        }
        Ok(purged)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn undelete(&self, agent_id: &str, timestamp: &str) -> Result<(), StoreError> {
        let res = sqlx::query(
            "UPDATE backups SET deleted_at = NULL, purge_at = NULL
             WHERE agent_id = ? AND timestamp = ? AND deleted_at IS NOT NULL",
        )
        .bind(agent_id)
        .bind(timestamp)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.into()))?;
        if res.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn purge_due(&self, now: DateTime<Utc>) -> Result<Vec<Backup>, StoreError> {
        let rows = sqlx::query("SELECT * FROM backups WHERE deleted_at IS NOT NULL AND purge_at <= ?")
            .bind(now)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        let due: Vec<Backup> = rows.iter().map(backup_from_row).collect::<Result<_, _>>()?;

        for backup in &due {
            sqlx::query("DELETE FROM backups WHERE agent_id = ? AND timestamp = ?")
                .bind(&backup.agent_id)
                .bind(&backup.timestamp)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::Backend(e.into()))?;
        }
        Ok(due)
    }
}
