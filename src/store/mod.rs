//! The persistence contract (spec §4.2): a single abstract surface over
//! agents and backups, implemented by an embedded SQL backend for local/test
//! use and a cloud key-value backend for production. Handlers depend only on
//! `dyn Store`; concrete backends are injected at startup from `STORE_MODE`.

pub mod dynamo;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{Agent, AgentStatus, Backup};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("no such object")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

/// The newly created agent, its token hash already set by the caller.
pub struct NewAgent {
    pub agent: Agent,
}

#[async_trait]
pub trait Store: Send + Sync + 'static {
    // --- Agent operations -------------------------------------------------

    /// Insert a new agent. Fails with `AlreadyExists` if `id` or
    /// `token_hash` collides with an existing row.
    async fn create_agent(&self, agent: Agent) -> Result<(), StoreError>;

    /// Hash `token` and look up the agent owning it.
    async fn lookup_by_token(&self, token: &str) -> Result<Agent, StoreError>;

    async fn get_agent(&self, id: &str) -> Result<Agent, StoreError>;

    async fn list_agents(&self, status_filter: Option<AgentStatus>) -> Result<Vec<Agent>, StoreError>;

    async fn update_agent_status(&self, id: &str, new_status: AgentStatus) -> Result<(), StoreError>;

    /// Atomically replace `token_hash`. The previous token must become
    /// unusable the instant this commits.
    async fn rotate_token(&self, id: &str, new_token_hash: &str) -> Result<(), StoreError>;

    /// Recompute and persist `used_bytes` as the sum of `encrypted_bytes`
    /// over the agent's currently visible backups. Idempotent.
    async fn recompute_used_bytes(&self, id: &str) -> Result<i64, StoreError>;

    async fn count_agents_by_status(&self, status: AgentStatus) -> Result<i64, StoreError>;

    // --- Backup operations --------------------------------------------------

    /// Insert a new backup row. Repeated creation with the same
    /// `(agent_id, timestamp)` replaces the existing row (clients retry).
    async fn create_backup(&self, backup: Backup) -> Result<(), StoreError>;

    /// Newest-first by `created_at`, excluding soft-deleted rows.
    async fn list_backups(&self, agent_id: &str, limit: i64) -> Result<Vec<Backup>, StoreError>;

    /// (visible count, sum of `encrypted_bytes`).
    async fn count_and_sum(&self, agent_id: &str) -> Result<(i64, i64), StoreError>;

    /// Returns `NotFound` for absent or soft-deleted records.
    async fn get_backup(&self, agent_id: &str, timestamp: &str) -> Result<Backup, StoreError>;

    /// Returns the most recently created visible backup, if any; used to
    /// enforce the minimum backup interval.
    async fn newest_backup(&self, agent_id: &str) -> Result<Option<Backup>, StoreError>;

    /// Marks `deleted_at = now`, `purge_at = now + grace`; returns the
    /// pre-delete snapshot.
    async fn soft_delete(
        &self,
        agent_id: &str,
        timestamp: &str,
        now: DateTime<Utc>,
        grace: chrono::Duration,
    ) -> Result<Backup, StoreError>;

    /// Soft-deletes every visible backup for the agent; returns the list.
    async fn soft_delete_all(
        &self,
        agent_id: &str,
        now: DateTime<Utc>,
        grace: chrono::Duration,
    ) -> Result<Vec<Backup>, StoreError>;

    /// Soft-deletes the oldest `count` visible backups (used by the
    /// rotation policy after `max_backups_per_agent` is exceeded).
    async fn soft_delete_oldest(
        &self,
        agent_id: &str,
        count: i64,
        now: DateTime<Utc>,
        grace: chrono::Duration,
    ) -> Result<Vec<Backup>, StoreError>;

    /// Clears `deleted_at`/`purge_at`. Fails with `NotFound` when the record
    /// is not currently soft-deleted.
    async fn undelete(&self, agent_id: &str, timestamp: &str) -> Result<(), StoreError>;

    /// Removes every soft-deleted backup whose `purge_at <= now` and returns
    /// the removed rows so their objects can be deleted. Under the KV
    /// backend this is a no-op (the table's TTL already reaps the rows).
    async fn purge_due(&self, now: DateTime<Utc>) -> Result<Vec<Backup>, StoreError>;
}
