//! The object-store brokerage contract (spec §4.3): mint time-limited
//! presigned PUT/GET URLs bound to a key, content type, and (for PUT) exact
//! byte length, and delete objects server-side. This is the sole mechanism
//! that enforces the declared `encrypted_bytes` on upload; the service
//! itself never sees the ciphertext.

pub mod s3;

use async_trait::async_trait;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("presign error: {0}")]
    Presign(#[from] anyhow::Error),
}

#[async_trait]
pub trait ObjectBroker: Send + Sync + 'static {
    /// Mint a PUT URL valid for `expiry`, binding `content_length` into the
    /// signature so the store rejects a body of a different length.
    async fn presign_put(
        &self,
        key: &str,
        content_type: &str,
        content_length: i64,
        expiry: Duration,
    ) -> Result<String, BrokerError>;

    /// Mint a PUT URL valid for `expiry` with no length binding. Used for
    /// the manifest object, whose size is not known at mint time (spec
    /// §4.3: "the manifest URL is unbound").
    async fn presign_put_unbound(
        &self,
        key: &str,
        content_type: &str,
        expiry: Duration,
    ) -> Result<String, BrokerError>;

    /// Mint a GET URL valid for `expiry`; length is unbound.
    async fn presign_get(&self, key: &str, expiry: Duration) -> Result<String, BrokerError>;

    /// Authoritative server-side delete of a single object.
    async fn delete(&self, key: &str) -> Result<(), BrokerError>;

    /// Best-effort delete of both objects belonging to a backup. Failures
    /// are logged and never fatal: the metadata store remains the source of
    /// truth for visibility regardless of whether the underlying objects
    /// are actually gone yet.
    async fn delete_backup_objects(&self, blob_key: &str, manifest_key: &str) {
        if let Err(e) = self.delete(blob_key).await {
            crate::error::log(&e);
        }
        if let Err(e) = self.delete(manifest_key).await {
            crate::error::log(&e);
        }
    }
}
