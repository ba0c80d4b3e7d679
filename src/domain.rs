use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of an enrolled agent. Transitions only via the admin
/// approve/suspend handlers (spec §4.5); never modeled as a state machine
/// type beyond this enum because the only illegal transition (terminal
/// suspension reverting on its own) simply never happens in the handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Pending,
    Active,
    Suspended,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Pending => "pending",
            AgentStatus::Active => "active",
            AgentStatus::Suspended => "suspended",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(AgentStatus::Pending),
            "active" => Some(AgentStatus::Active),
            "suspended" => Some(AgentStatus::Suspended),
            _ => None,
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An enrolled client process, identified by `id` and authenticated by the
/// hash of its bearer token. See spec §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub client_version: String,
    pub fingerprint: String,
    pub encrypt_tool: String,
    pub public_key: String,
    #[serde(skip_serializing)]
    pub token_hash: String,
    pub status: AgentStatus,
    pub quota_bytes: i64,
    pub used_bytes: i64,
    pub created_at: DateTime<Utc>,
}

/// One snapshot metadata record. Keyed by `(agent_id, timestamp)`; `timestamp`
/// is an opaque ASCII ordering key supplied by the client, never parsed as a
/// calendar type by this service (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backup {
    pub agent_id: String,
    pub timestamp: String,
    pub encrypted_bytes: i64,
    pub source_file_count: i64,
    pub encrypted_sha256: String,
    pub blob_key: String,
    pub manifest_key: String,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub purge_at: Option<DateTime<Utc>>,
}

impl Backup {
    pub fn blob_key_for(agent_id: &str, timestamp: &str) -> String {
        format!("{agent_id}/{timestamp}/backup.ciphertext")
    }

    pub fn manifest_key_for(agent_id: &str, timestamp: &str) -> String {
        format!("{agent_id}/{timestamp}/manifest.meta")
    }

    pub fn is_visible(&self) -> bool {
        self.deleted_at.is_none()
    }
}
