use std::collections::HashMap;

use async_trait::async_trait;
use aws_sdk_dynamodb::types::AttributeValue;
use aws_sdk_dynamodb::Client;
use chrono::{DateTime, TimeZone, Utc};

use crate::domain::{Agent, AgentStatus, Backup};

use super::{Store, StoreError};

/// Cloud key-value backend (spec §4.2.2): agents keyed by `id` with a
/// global secondary index on `token_hash`; backups keyed by
/// `(agent_id, timestamp)` with `timestamp` as the sort key. `purge_at` is
/// stored as epoch seconds and registered as the table's TTL attribute, so
/// soft-deleted rows are reaped by the store itself rather than by a
/// background job (see `purge_due`, which is a no-op here).
pub struct DynamoStore {
    client: Client,
    agents_table: String,
    backups_table: String,
    token_index: String,
}

impl DynamoStore {
    pub fn new(client: Client, agents_table: String, backups_table: String, token_index: String) -> Self {
        Self {
            client,
            agents_table,
            backups_table,
            token_index,
        }
    }

    /// Builds a client from `Settings`, honoring `KV_ENDPOINT` for local
    /// DynamoDB-compatible test servers the same way `S3Broker` honors
    /// `OBJECT_ENDPOINT`.
    pub async fn from_settings(settings: &crate::config::Settings) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_sdk_dynamodb::config::Region::new(settings.kv_region.clone()));
        if let Some(endpoint) = &settings.kv_endpoint {
            loader = loader.endpoint_url(endpoint.clone());
        }
        let config = loader.load().await;
        let client = Client::new(&config);
        Self::new(
            client,
            settings.kv_agents_table.clone(),
            settings.kv_backups_table.clone(),
            settings.kv_token_index.clone(),
        )
    }
}

fn s(v: impl Into<String>) -> AttributeValue {
    AttributeValue::S(v.into())
}

fn n(v: i64) -> AttributeValue {
    AttributeValue::N(v.to_string())
}

fn get_s(item: &HashMap<String, AttributeValue>, key: &str) -> Result<String, StoreError> {
    item.get(key)
        .and_then(|v| v.as_s().ok())
        .cloned()
        .ok_or_else(|| StoreError::Backend(anyhow::anyhow!("missing attribute {key}")))
}

fn get_n(item: &HashMap<String, AttributeValue>, key: &str) -> Result<i64, StoreError> {
    item.get(key)
        .and_then(|v| v.as_n().ok())
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| StoreError::Backend(anyhow::anyhow!("missing attribute {key}")))
}

fn get_opt_n(item: &HashMap<String, AttributeValue>, key: &str) -> Option<i64> {
    item.get(key).and_then(|v| v.as_n().ok()).and_then(|v| v.parse().ok())
}

fn epoch_to_dt(epoch: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(epoch, 0).single().unwrap_or_else(Utc::now)
}

fn agent_to_item(agent: &Agent) -> HashMap<String, AttributeValue> {
    HashMap::from([
        ("id".to_string(), s(&agent.id)),
        ("name".to_string(), s(&agent.name)),
        ("hostname".to_string(), s(&agent.hostname)),
        ("os".to_string(), s(&agent.os)),
        ("arch".to_string(), s(&agent.arch)),
        ("client_version".to_string(), s(&agent.client_version)),
        ("fingerprint".to_string(), s(&agent.fingerprint)),
        ("encrypt_tool".to_string(), s(&agent.encrypt_tool)),
        ("public_key".to_string(), s(&agent.public_key)),
        ("token_hash".to_string(), s(&agent.token_hash)),
        ("status".to_string(), s(agent.status.as_str())),
        ("quota_bytes".to_string(), n(agent.quota_bytes)),
        ("used_bytes".to_string(), n(agent.used_bytes)),
        ("created_at".to_string(), n(agent.created_at.timestamp())),
    ])
}

fn item_to_agent(item: &HashMap<String, AttributeValue>) -> Result<Agent, StoreError> {
    let status = get_s(item, "status")?;
    Ok(Agent {
        id: get_s(item, "id")?,
        name: get_s(item, "name")?,
        hostname: get_s(item, "hostname")?,
        os: get_s(item, "os")?,
        arch: get_s(item, "arch")?,
        client_version: get_s(item, "client_version")?,
        fingerprint: get_s(item, "fingerprint")?,
        encrypt_tool: get_s(item, "encrypt_tool")?,
        public_key: get_s(item, "public_key")?,
        token_hash: get_s(item, "token_hash")?,
        status: AgentStatus::parse(&status).ok_or_else(|| StoreError::Backend(anyhow::anyhow!("bad status")))?,
        quota_bytes: get_n(item, "quota_bytes")?,
        used_bytes: get_n(item, "used_bytes")?,
        created_at: epoch_to_dt(get_n(item, "created_at")?),
    })
}

fn backup_to_item(backup: &Backup) -> HashMap<String, AttributeValue> {
    let mut item = HashMap::from([
        ("agent_id".to_string(), s(&backup.agent_id)),
        ("timestamp".to_string(), s(&backup.timestamp)),
        ("encrypted_bytes".to_string(), n(backup.encrypted_bytes)),
        ("source_file_count".to_string(), n(backup.source_file_count)),
        ("encrypted_sha256".to_string(), s(&backup.encrypted_sha256)),
        ("blob_key".to_string(), s(&backup.blob_key)),
        ("manifest_key".to_string(), s(&backup.manifest_key)),
        ("created_at".to_string(), n(backup.created_at.timestamp())),
    ]);
    if let Some(deleted_at) = backup.deleted_at {
        item.insert("deleted_at".to_string(), n(deleted_at.timestamp()));
    }
    if let Some(purge_at) = backup.purge_at {
        item.insert("purge_at".to_string(), n(purge_at.timestamp()));
    }
    item
}

fn item_to_backup(item: &HashMap<String, AttributeValue>) -> Result<Backup, StoreError> {
    Ok(Backup {
        agent_id: get_s(item, "agent_id")?,
        timestamp: get_s(item, "timestamp")?,
        encrypted_bytes: get_n(item, "encrypted_bytes")?,
        source_file_count: get_n(item, "source_file_count")?,
        encrypted_sha256: get_s(item, "encrypted_sha256")?,
        blob_key: get_s(item, "blob_key")?,
        manifest_key: get_s(item, "manifest_key")?,
        created_at: epoch_to_dt(get_n(item, "created_at")?),
        deleted_at: get_opt_n(item, "deleted_at").map(epoch_to_dt),
        purge_at: get_opt_n(item, "purge_at").map(epoch_to_dt),
    })
}

#[async_trait]
impl Store for DynamoStore {
    #[tracing::instrument(level = "debug", skip(self, agent))]
    async fn create_agent(&self, agent: Agent) -> Result<(), StoreError> {
        let res = self
            .client
            .put_item()
            .table_name(&self.agents_table)
            .set_item(Some(agent_to_item(&agent)))
            .condition_expression("attribute_not_exists(id)")
            .send()
            .await;

        match res {
            Ok(_) => Ok(()),
            Err(e) if e.as_service_error().map(|e| e.is_conditional_check_failed_exception()).unwrap_or(false) => {
                Err(StoreError::AlreadyExists)
            }
            Err(e) => Err(StoreError::Backend(e.into())),
        }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn lookup_by_token(&self, token: &str) -> Result<Agent, StoreError> {
        let hash = crate::identity::hash_token(token);
        let res = self
            .client
            .query()
            .table_name(&self.agents_table)
            .index_name(&self.token_index)
            .key_condition_expression("token_hash = :h")
            .expression_attribute_values(":h", s(&hash))
            .limit(1)
            .send()
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;

        let item = res.items().first().ok_or(StoreError::NotFound)?;
        item_to_agent(item)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_agent(&self, id: &str) -> Result<Agent, StoreError> {
        let res = self
            .client
            .get_item()
            .table_name(&self.agents_table)
            .key("id", s(id))
            .send()
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        let item = res.item().ok_or(StoreError::NotFound)?;
        item_to_agent(item)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn list_agents(&self, status_filter: Option<AgentStatus>) -> Result<Vec<Agent>, StoreError> {
        let mut scan = self.client.scan().table_name(&self.agents_table);
        if let Some(status) = status_filter {
            scan = scan
                .filter_expression("#s = :s")
                .expression_attribute_names("#s", "status")
                .expression_attribute_values(":s", s(status.as_str()));
        }
        let res = scan.send().await.map_err(|e| StoreError::Backend(e.into()))?;
        res.items().iter().map(item_to_agent).collect()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn update_agent_status(&self, id: &str, new_status: AgentStatus) -> Result<(), StoreError> {
        let res = self
            .client
            .update_item()
            .table_name(&self.agents_table)
            .key("id", s(id))
            .condition_expression("attribute_exists(id)")
            .update_expression("SET #s = :s")
            .expression_attribute_names("#s", "status")
            .expression_attribute_values(":s", s(new_status.as_str()))
            .send()
            .await;
        match res {
            Ok(_) => Ok(()),
            Err(e) if e.as_service_error().map(|e| e.is_conditional_check_failed_exception()).unwrap_or(false) => {
                Err(StoreError::NotFound)
            }
            Err(e) => Err(StoreError::Backend(e.into())),
        }
    }

    #[tracing::instrument(level = "debug", skip(self, new_token_hash))]
    async fn rotate_token(&self, id: &str, new_token_hash: &str) -> Result<(), StoreError> {
        let res = self
            .client
            .update_item()
            .table_name(&self.agents_table)
            .key("id", s(id))
            .condition_expression("attribute_exists(id)")
            .update_expression("SET token_hash = :t")
            .expression_attribute_values(":t", s(new_token_hash))
            .send()
            .await;
        match res {
            Ok(_) => Ok(()),
            Err(e) if e.as_service_error().map(|e| e.is_conditional_check_failed_exception()).unwrap_or(false) => {
                Err(StoreError::NotFound)
            }
            Err(e) => Err(StoreError::Backend(e.into())),
        }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn recompute_used_bytes(&self, id: &str) -> Result<i64, StoreError> {
        let (_, sum) = self.count_and_sum(id).await?;
        self.client
            .update_item()
            .table_name(&self.agents_table)
            .key("id", s(id))
            .update_expression("SET used_bytes = :u")
            .expression_attribute_values(":u", n(sum))
            .send()
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(sum)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn count_agents_by_status(&self, status: AgentStatus) -> Result<i64, StoreError> {
        Ok(self.list_agents(Some(status)).await?.len() as i64)
    }

    #[tracing::instrument(level = "debug", skip(self, backup))]
    async fn create_backup(&self, backup: Backup) -> Result<(), StoreError> {
        self.client
            .put_item()
            .table_name(&self.backups_table)
            .set_item(Some(backup_to_item(&backup)))
            .send()
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn list_backups(&self, agent_id: &str, limit: i64) -> Result<Vec<Backup>, StoreError> {
        let res = self
            .client
            .query()
            .table_name(&self.backups_table)
            .key_condition_expression("agent_id = :a")
            .filter_expression("attribute_not_exists(deleted_at)")
            .expression_attribute_values(":a", s(agent_id))
            .scan_index_forward(false)
            .send()
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;

        let mut backups: Vec<Backup> = res.items().iter().map(item_to_backup).collect::<Result<_, _>>()?;
        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if limit >= 0 && (limit as usize) < backups.len() {
            backups.truncate(limit as usize);
        }
        Ok(backups)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn count_and_sum(&self, agent_id: &str) -> Result<(i64, i64), StoreError> {
        let backups = self.list_backups(agent_id, i64::MAX).await?;
        let sum: i64 = backups.iter().map(|b| b.encrypted_bytes).sum();
        Ok((backups.len() as i64, sum))
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_backup(&self, agent_id: &str, timestamp: &str) -> Result<Backup, StoreError> {
        let res = self
            .client
            .get_item()
            .table_name(&self.backups_table)
            .key("agent_id", s(agent_id))
            .key("timestamp", s(timestamp))
            .send()
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
        let item = res.item().ok_or(StoreError::NotFound)?;
        let backup = item_to_backup(item)?;
        if backup.deleted_at.is_some() {
            return Err(StoreError::NotFound);
        }
        Ok(backup)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn newest_backup(&self, agent_id: &str) -> Result<Option<Backup>, StoreError> {
        Ok(self.list_backups(agent_id, 1).await?.into_iter().next())
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
        self.client
            .update_item()
            .table_name(&self.backups_table)
            .key("agent_id", s(agent_id))
            .key("timestamp", s(timestamp))
            .update_expression("SET deleted_at = :d, purge_at = :p")
            .expression_attribute_values(":d", n(now.timestamp()))
            .expression_attribute_values(":p", n(purge_at.timestamp()))
            .send()
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
        for backup in &visible {
            self.soft_delete(agent_id, &backup.timestamp, now, grace).await?;
        }
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
        let mut visible = self.list_backups(agent_id, i64::MAX).await?;
        visible.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let oldest: Vec<Backup> = visible.into_iter().take(count as usize).collect();
        for backup in &oldest {
            self.soft_delete(agent_id, &backup.timestamp, now, grace).await?;
        }
        Ok(oldest)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn undelete(&self, agent_id: &str, timestamp: &str) -> Result<(), StoreError> {
        let res = self
            .client
            .update_item()
            .table_name(&self.backups_table)
            .key("agent_id", s(agent_id))
            .key("timestamp", s(timestamp))
            .condition_expression("attribute_exists(deleted_at)")
            .update_expression("REMOVE deleted_at, purge_at")
            .send()
            .await;
        match res {
            Ok(_) => Ok(()),
            Err(e) if e.as_service_error().map(|e| e.is_conditional_check_failed_exception()).unwrap_or(false) => {
                Err(StoreError::NotFound)
            }
            Err(e) => Err(StoreError::Backend(e.into())),
        }
    }

    /// The backups table's `purge_at` attribute is registered as the
    /// table's native TTL attribute, so DynamoDB reaps soft-deleted rows on
    /// its own. The background purge job therefore has nothing to do here.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn purge_due(&self, _now: DateTime<Utc>) -> Result<Vec<Backup>, StoreError> {
        Ok(Vec::new())
    }
}
