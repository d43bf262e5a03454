//! Bucket provisioning for namespace-derived volumes
//!
//! A volume created without an explicit bucket maps to `<namespace><name>`.
//! When provisioning is enabled, that bucket is created on `Create`; it is
//! never deleted by the driver.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::types::{BucketLocationConstraint, CreateBucketConfiguration};
use aws_sdk_s3::Client;
use tracing::{debug, info};

use crate::error::{DriverError, Result};

/// Ensures a bucket exists before a volume is registered against it
#[async_trait]
pub trait BucketProvisioner: Send + Sync {
    async fn ensure_bucket(&self, bucket: &str) -> Result<()>;
}

/// Connection settings for [`S3BucketProvisioner`]
#[derive(Debug, Clone, Default)]
pub struct S3ProvisionerConfig {
    pub region: Option<String>,
    /// Custom endpoint for S3-compatible services; enables path-style addressing
    pub endpoint: Option<String>,
    pub profile: Option<String>,
}

/// Creates buckets through the S3 API
pub struct S3BucketProvisioner {
    client: Client,
    region: Option<String>,
}

impl S3BucketProvisioner {
    pub async fn new(config: S3ProvisionerConfig) -> Result<Self> {
        let mut sdk_config_builder = aws_config::defaults(BehaviorVersion::latest());

        if let Some(region) = &config.region {
            sdk_config_builder = sdk_config_builder.region(Region::new(region.clone()));
        }
        if let Some(profile) = &config.profile {
            sdk_config_builder = sdk_config_builder.profile_name(profile);
        }

        let sdk_config = sdk_config_builder.load().await;
        let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&sdk_config);

        if let Some(endpoint) = &config.endpoint {
            s3_config_builder = s3_config_builder
                .endpoint_url(endpoint)
                .force_path_style(true);
        }

        let region = sdk_config.region().map(|r| r.to_string());
        debug!(?region, endpoint = ?config.endpoint, "S3 provisioner configured");

        Ok(Self {
            client: Client::from_conf(s3_config_builder.build()),
            region,
        })
    }

    fn location_constraint(&self) -> Option<CreateBucketConfiguration> {
        // us-east-1 is the implicit default and rejects an explicit constraint
        self.region
            .as_deref()
            .filter(|region| *region != "us-east-1")
            .map(|region| {
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(region))
                    .build()
            })
    }
}

#[async_trait]
impl BucketProvisioner for S3BucketProvisioner {
    async fn ensure_bucket(&self, bucket: &str) -> Result<()> {
        let result = self
            .client
            .create_bucket()
            .bucket(bucket)
            .set_create_bucket_configuration(self.location_constraint())
            .send()
            .await;

        match result {
            Ok(_) => {
                info!(bucket = %bucket, "bucket created");
                Ok(())
            }
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_bucket_already_owned_by_you() {
                    debug!(bucket = %bucket, "bucket already exists");
                    return Ok(());
                }
                Err(DriverError::Provisioning(format!(
                    "create bucket {}: {}",
                    bucket, service_error
                )))
            }
        }
    }
}
