//! Typed configuration assembled from environment variables (spec §6).
//! Every knob carries the default called out in the spec; `STORE_MODE`
//! auto-switches to `kv` under a hosting-platform env marker the same way
//! the teacher's `Settings` was assembled from a single `Environment`
//! source, except here each variable is read and defaulted explicitly so
//! the exact env names in the spec stay grep-able.

use std::env;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    Sql,
    Kv,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub listen_addr: String,
    pub store_mode: StoreMode,
    pub database_path: String,

    pub kv_agents_table: String,
    pub kv_backups_table: String,
    pub kv_token_index: String,
    pub kv_region: String,
    pub kv_endpoint: Option<String>,

    pub object_endpoint: String,
    pub object_public_endpoint: Option<String>,
    pub object_region: String,
    pub object_bucket: String,
    pub object_access_key: String,
    pub object_secret_key: String,
    pub object_insecure: bool,

    pub admin_api_keys: Vec<String>,

    pub default_quota_bytes: i64,
    pub max_upload_bytes: i64,
    pub min_backup_interval_hours: i64,
    pub max_backups_per_agent: i64,
    pub max_pending_agents: i64,
    pub register_rate_limit: u32,
    pub presign_expiry_seconds: u64,
    pub retention_days: i64,
    pub delete_grace_hours: i64,
    pub purge_interval_seconds: u64,
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl Settings {
    /// Loads every knob in spec §6 from the environment, plus
    /// `PURGE_INTERVAL_SECONDS` (default 60) for the background hard-purge
    /// sweep added in SPEC_FULL.md §4.7, with the spec's documented
    /// defaults. `STORE_MODE` defaults to `sql` unless the process is
    /// running under a hosting-platform marker (`FLY_APP_NAME`), in which
    /// case it defaults to `kv`; an explicit `STORE_MODE` always
    /// wins.
    pub fn from_env() -> Self {
        let hosted = env::var("FLY_APP_NAME").is_ok();
        let store_mode = match env::var("STORE_MODE").as_deref() {
            Ok("kv") => StoreMode::Kv,
            Ok("sql") => StoreMode::Sql,
            _ if hosted => StoreMode::Kv,
            _ => StoreMode::Sql,
        };

        let admin_api_keys = env::var("ADMIN_API_KEY")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Self {
            listen_addr: env_string("LISTEN_ADDR", "0.0.0.0:8080"),
            store_mode,
            database_path: env_string("DATABASE_PATH", "./control-plane.db"),

            kv_agents_table: env_string("KV_AGENTS_TABLE", "agents"),
            kv_backups_table: env_string("KV_BACKUPS_TABLE", "backups"),
            kv_token_index: env_string("KV_TOKEN_INDEX", "token_hash-index"),
            kv_region: env_string("KV_REGION", "us-east-1"),
            kv_endpoint: env::var("KV_ENDPOINT").ok(),

            object_endpoint: env_string("OBJECT_ENDPOINT", "localhost:9000"),
            object_public_endpoint: env::var("OBJECT_PUBLIC_ENDPOINT").ok(),
            object_region: env_string("OBJECT_REGION", "us-east-1"),
            object_bucket: env_string("OBJECT_BUCKET", "agent-backups"),
            object_access_key: env_string("OBJECT_ACCESS_KEY", ""),
            object_secret_key: env_string("OBJECT_SECRET_KEY", ""),
            object_insecure: env_parsed("OBJECT_INSECURE", false),

            admin_api_keys,

            default_quota_bytes: env_parsed("DEFAULT_QUOTA_BYTES", 500 * 1024 * 1024),
            max_upload_bytes: env_parsed("MAX_UPLOAD_BYTES", 5 * 1024 * 1024),
            min_backup_interval_hours: env_parsed("MIN_BACKUP_INTERVAL_HOURS", 12),
            max_backups_per_agent: env_parsed("MAX_BACKUPS_PER_AGENT", 7),
            max_pending_agents: env_parsed("MAX_PENDING_AGENTS", 100),
            register_rate_limit: env_parsed("REGISTER_RATE_LIMIT", 10),
            presign_expiry_seconds: env_parsed("PRESIGN_EXPIRY_SECONDS", 900),
            retention_days: env_parsed("RETENTION_DAYS", 7),
            delete_grace_hours: env_parsed("DELETE_GRACE_HOURS", 72),
            purge_interval_seconds: env_parsed("PURGE_INTERVAL_SECONDS", 60),
        }
    }
}
