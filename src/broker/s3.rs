use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::Client;

use crate::config::Settings;

use super::{BrokerError, ObjectBroker};

/// Presigned-URL broker backed by any S3-compatible object store. A
/// `public_endpoint` override lets the service sign URLs against an address
/// clients can actually reach when it differs from the address the service
/// itself uses internally (dev-mode NAT, spec §4.3).
pub struct S3Broker {
    client: Client,
    bucket: String,
    public_endpoint: Option<String>,
}

impl Debug for S3Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Broker").field("bucket", &self.bucket).finish()
    }
}

impl S3Broker {
    pub async fn new(settings: &Arc<Settings>) -> Self {
        let cred = Credentials::new(
            &settings.object_access_key,
            &settings.object_secret_key,
            None,
            None,
            "agent-backup-control-plane",
        );

        let url = format!(
            "{}://{}",
            if settings.object_insecure { "http" } else { "https" },
            settings.object_endpoint
        );

        let s3_config = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .endpoint_url(url)
            .credentials_provider(cred)
            .region(aws_sdk_s3::config::Region::new(settings.object_region.clone()))
            .force_path_style(true)
            .build();

        Self {
            client: Client::from_conf(s3_config),
            bucket: settings.object_bucket.clone(),
            public_endpoint: settings.object_public_endpoint.clone(),
        }
    }

    fn rewrite_for_public_endpoint(&self, url: String) -> String {
        let Some(public) = &self.public_endpoint else {
            return url;
        };
        match url::Url::parse(&url) {
            Ok(mut parsed) => {
                if let Ok(public_url) = url::Url::parse(public) {
                    let _ = parsed.set_scheme(public_url.scheme());
                    let _ = parsed.set_host(public_url.host_str());
                    let _ = parsed.set_port(public_url.port());
                }
                parsed.to_string()
            }
            Err(_) => url,
        }
    }
}

#[async_trait]
impl ObjectBroker for S3Broker {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn presign_put(
        &self,
        key: &str,
        content_type: &str,
        content_length: i64,
        expiry: Duration,
    ) -> Result<String, BrokerError> {
        let presigning = PresigningConfig::expires_in(expiry).map_err(|e| BrokerError::Presign(e.into()))?;
        let presigned = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .content_length(content_length)
            .presigned(presigning)
            .await
            .map_err(|e| BrokerError::Presign(e.into()))?;
        Ok(self.rewrite_for_public_endpoint(presigned.uri().to_string()))
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn presign_put_unbound(
        &self,
        key: &str,
        content_type: &str,
        expiry: Duration,
    ) -> Result<String, BrokerError> {
        let presigning = PresigningConfig::expires_in(expiry).map_err(|e| BrokerError::Presign(e.into()))?;
        let presigned = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .presigned(presigning)
            .await
            .map_err(|e| BrokerError::Presign(e.into()))?;
        Ok(self.rewrite_for_public_endpoint(presigned.uri().to_string()))
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn presign_get(&self, key: &str, expiry: Duration) -> Result<String, BrokerError> {
        let presigning = PresigningConfig::expires_in(expiry).map_err(|e| BrokerError::Presign(e.into()))?;
        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|e| BrokerError::Presign(e.into()))?;
        Ok(self.rewrite_for_public_endpoint(presigned.uri().to_string()))
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn delete(&self, key: &str) -> Result<(), BrokerError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| BrokerError::Presign(e.into()))?;
        Ok(())
    }
}
