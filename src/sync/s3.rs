//! S3-compatible remote storage.
//!
//! A fresh client is built per call from the settings in effect at that
//! moment, so credential changes apply immediately without restarting the
//! daemon. Custom endpoints (DigitalOcean Spaces, MinIO) are supported via
//! `endpoint_url` and path-style addressing.

use async_trait::async_trait;
use aws_sdk_s3 as s3;
use s3::config::Region;
use s3::primitives::ByteStream;
use std::path::Path;

use super::RemoteStorage;
use crate::config::RemoteStorageSettings;
use crate::errors::{AppError, Result};

pub struct S3RemoteStorage;

fn required<'a>(value: &'a Option<String>, name: &str) -> Result<&'a str> {
    match value.as_deref() {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(AppError::MissingConfig(format!("{} is not set", name))),
    }
}

async fn build_client(settings: &RemoteStorageSettings) -> Result<s3::Client> {
    let region = required(&settings.region, "region")?.to_string();
    let access_key_id = required(&settings.access_key_id, "access_key_id")?;
    let secret_access_key = required(&settings.secret_access_key, "secret_access_key")?;

    let mut loader = aws_config::defaults(s3::config::BehaviorVersion::latest())
        .region(Region::new(region))
        .credentials_provider(s3::config::Credentials::new(
            access_key_id,
            secret_access_key,
            None,
            None,
            "Static",
        ));
    if let Some(endpoint) = settings.endpoint_url.as_deref().filter(|e| !e.is_empty()) {
        loader = loader.endpoint_url(endpoint);
    }
    let sdk_config = loader.load().await;

    let s3_config = s3::config::Builder::from(&sdk_config)
        .force_path_style(settings.path_style)
        .build();
    Ok(s3::Client::from_conf(s3_config))
}

#[async_trait]
impl RemoteStorage for S3RemoteStorage {
    async fn put_object(
        &self,
        settings: &RemoteStorageSettings,
        key: &str,
        file_path: &Path,
    ) -> Result<()> {
        let bucket = required(&settings.bucket, "bucket")?;
        let client = build_client(settings).await?;

        let body = ByteStream::from_path(file_path).await.map_err(|e| {
            AppError::Storage(format!(
                "failed to read {} for upload: {}",
                file_path.display(),
                e
            ))
        })?;

        client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(|e| AppError::S3Sdk(format!("put_object {} failed: {}", key, e)))?;
        Ok(())
    }

    async fn delete_object(&self, settings: &RemoteStorageSettings, key: &str) -> Result<()> {
        let bucket = required(&settings.bucket, "bucket")?;
        let client = build_client(settings).await?;

        client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| AppError::S3Sdk(format!("delete_object {} failed: {}", key, e)))?;
        Ok(())
    }

    async fn head_bucket(&self, settings: &RemoteStorageSettings) -> Result<()> {
        let bucket = required(&settings.bucket, "bucket")?;
        let client = build_client(settings).await?;

        client
            .head_bucket()
            .bucket(bucket)
            .send()
            .await
            .map_err(|e| AppError::S3Sdk(format!("bucket {} is not accessible: {}", bucket, e)))?;
        Ok(())
    }
}
