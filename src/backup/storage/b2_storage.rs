//! Backblaze B2 reachability probe through its S3-compatible endpoint

use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sdk_s3::Client as S3Client;
use aws_sdk_s3::error::SdkError;
use aws_types::region::Region;
use tracing::{error, info};

use crate::backup::runtime_env::{b2_endpoint, normalize_region, split_backup_path};
use crate::backup::{BackupError, Result};
use crate::db::BackupSettings;

use super::BucketProbe;

/// Issues a `HeadBucket` against the configured bucket
#[derive(Debug, Default)]
pub struct B2BucketProbe;

impl B2BucketProbe {
    pub fn new() -> Self {
        Self
    }

    async fn client(settings: &BackupSettings, region: &str) -> S3Client {
        let credentials = Credentials::new(
            settings.b2_key_id.trim(),
            settings.b2_application_key.trim(),
            None,
            None,
            "backup-settings",
        );

        let sdk_config = aws_config::from_env()
            .region(Region::new(region.to_string()))
            .credentials_provider(credentials)
            .load()
            .await;

        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .endpoint_url(b2_endpoint(region))
            .force_path_style(true)
            .build();

        S3Client::from_conf(s3_config)
    }
}

/// Map SDK errors to a message the operator can act on
fn map_s3_error<E: std::fmt::Debug>(error: SdkError<E>, bucket: &str) -> BackupError {
    match &error {
        SdkError::ConstructionFailure(_) => {
            BackupError::Storage(format!("S3 client construction error: {:?}", error))
        }
        SdkError::DispatchFailure(err) => BackupError::Storage(format!(
            "Could not reach the B2 endpoint: {:?}",
            err
        )),
        SdkError::TimeoutError(_) => {
            BackupError::Storage("Timed out contacting the B2 endpoint".to_string())
        }
        SdkError::ServiceError(service_err) => {
            match service_err.raw().http().status().as_u16() {
                404 => BackupError::Storage(format!("Bucket {} does not exist", bucket)),
                401 | 403 => BackupError::Storage(format!(
                    "Access to bucket {} was denied; check the key ID and application key",
                    bucket
                )),
                status => BackupError::Storage(format!(
                    "Bucket {} check failed with HTTP {}",
                    bucket, status
                )),
            }
        }
        _ => BackupError::Storage(format!("Bucket {} check failed: {:?}", bucket, error)),
    }
}

#[async_trait]
impl BucketProbe for B2BucketProbe {
    async fn check(&self, settings: &BackupSettings) -> Result<()> {
        let (bucket, _) = split_backup_path(&settings.backup_path);
        if bucket.is_empty() {
            return Err(BackupError::ConfigurationIncomplete);
        }
        let region = normalize_region(&settings.b2_region);
        let client = Self::client(settings, &region).await;

        match client.head_bucket().bucket(&bucket).send().await {
            Ok(_) => {
                info!(bucket = %bucket, region = %region, "bucket reachable");
                Ok(())
            }
            Err(err) => {
                error!(bucket = %bucket, region = %region, error = %err, "bucket probe failed");
                Err(map_s3_error(err, &bucket))
            }
        }
    }
}
