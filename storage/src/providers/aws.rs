use crate::{StorageConfig, StorageError, StorageObject, StorageProvider};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::provider::SharedCredentialsProvider;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::Client;
use chrono::{TimeZone, Utc};
use log::{debug, error, info};
use std::collections::HashMap;

pub struct S3Provider {
    client: Client,
    region: String,
}

impl S3Provider {
    /// Creates a new S3 provider
    pub async fn new(config: StorageConfig) -> Result<Self, StorageError> {
        let region_str = config.region.unwrap_or_else(|| "us-east-1".to_string());
        let region = Region::new(region_str.clone());

        let mut config_builder = aws_config::defaults(BehaviorVersion::v2025_01_17())
            .region(region)
            .retry_config(aws_config::retry::RetryConfig::standard().with_max_attempts(3));

        match (config.access_key, config.secret_key) {
            (Some(access_key), Some(secret_key)) => {
                let credentials = aws_sdk_s3::config::Credentials::new(
                    access_key,
                    secret_key,
                    None,
                    None,
                    "static-credentials-provider",
                );
                config_builder = config_builder
                    .credentials_provider(SharedCredentialsProvider::new(credentials));
            }
            (None, None) => {}
            _ => {
                return Err(StorageError::Configuration(
                    "access key and secret key must be given together".to_string(),
                ))
            }
        }

        if let Some(ref endpoint) = config.endpoint {
            info!("Using custom endpoint: {endpoint}");
            config_builder = config_builder.endpoint_url(endpoint);
        } else {
            debug!("Using default AWS endpoint for region: {region_str}");
        }

        let sdk_config = config_builder.load().await;

        // custom endpoints (minio, localstack) only serve path-style requests
        let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if config.endpoint.is_some() {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        Ok(Self {
            client: Client::from_conf(s3_config_builder.build()),
            region: region_str,
        })
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    fn convert_s3_object(obj: &aws_sdk_s3::types::Object) -> StorageObject {
        StorageObject {
            key: obj.key().unwrap_or_default().to_string(),
            size: obj.size().and_then(|size| size.try_into().ok()).unwrap_or(0),
            last_modified: obj
                .last_modified()
                .and_then(|t| Utc.timestamp_opt(t.secs(), 0).single()),
            etag: obj.e_tag().map(|s| s.to_string()),
        }
    }
}

#[async_trait]
impl StorageProvider for S3Provider {
    fn name(&self) -> &str {
        "AWS S3"
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: Option<&str>,
    ) -> Result<Vec<StorageObject>, StorageError> {
        let mut objects = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .set_continuation_token(continuation_token.take());
            if let Some(prefix) = prefix {
                request = request.prefix(prefix);
            }

            let page = request.send().await.map_err(|e| {
                error!("Failed to list objects in bucket {bucket}: {e}");
                report_s3_error_to_sentry("list_objects", &e, bucket, prefix.unwrap_or_default());
                StorageError::request("ListObjectsV2", bucket, &e)
            })?;

            objects.extend(page.contents().iter().map(Self::convert_s3_object));

            match page.next_continuation_token() {
                Some(token) if page.is_truncated().unwrap_or(false) => {
                    continuation_token = Some(token.to_string());
                }
                _ => break,
            }
        }

        debug!("Listed {} objects in {bucket}", objects.len());
        Ok(objects)
    }

    async fn object_exists(&self, bucket: &str, key: &str) -> Result<bool, StorageError> {
        match self.client.head_object().bucket(bucket).key(key).send().await {
            Ok(_) => Ok(true),
            Err(e) => {
                if e.as_service_error().is_some_and(|se| se.is_not_found()) {
                    return Ok(false);
                }
                error!("Failed to check object {bucket}/{key}: {e}");
                report_s3_error_to_sentry("object_exists", &e, bucket, key);
                Err(StorageError::request("HeadObject", bucket, &e))
            }
        }
    }
}

fn report_s3_error_to_sentry(
    operation: &str,
    error: &dyn std::error::Error,
    bucket: &str,
    key: &str,
) {
    let mut extra = HashMap::new();
    extra.insert("bucket", bucket);
    extra.insert("key", key);

    let error_message = format!("{operation}: {error}");
    let extra_json = serde_json::to_string(&extra).unwrap_or_default();
    let sentry_message = format!("{error_message} | context: {extra_json}");
    sentry::capture_message(&sentry_message, sentry::Level::Error);
}
