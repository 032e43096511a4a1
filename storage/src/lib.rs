//! Object storage access for pgdock backups.
//!
//! Backups themselves are written by WAL-G inside the backup runner
//! container. This crate only reads the bucket: [`StorageProvider`] lists
//! and probes objects on an S3-compatible service and [`WalgCatalog`]
//! interprets the WAL-G layout to enumerate and resolve base backups.

mod error;
pub mod providers;
mod types;
mod walg;

pub use error::StorageError;
pub use providers::aws::S3Provider;
pub use types::*;
pub use walg::{WalgCatalog, LATEST_BACKUP};

use async_trait::async_trait;

/// Read access to an S3-compatible storage service.
#[async_trait]
pub trait StorageProvider: Send + Sync + 'static {
    /// Returns the name of the storage provider.
    fn name(&self) -> &str;

    /// Lists objects in a bucket with an optional prefix.
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: Option<&str>,
    ) -> Result<Vec<StorageObject>, StorageError>;

    /// Checks if an object exists.
    async fn object_exists(&self, bucket: &str, key: &str) -> Result<bool, StorageError>;
}

/// Factory for creating storage providers.
pub struct StorageProviderFactory;

impl StorageProviderFactory {
    pub async fn create_s3_provider(
        config: StorageConfig,
    ) -> Result<Box<dyn StorageProvider>, StorageError> {
        let provider = S3Provider::new(config).await?;
        Ok(Box::new(provider))
    }
}
