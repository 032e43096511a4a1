//! Cluster and backup metadata persisted in SQLite.

mod error;
mod models;
mod sqlite;

pub use error::StoreError;
pub use models::*;
pub use sqlite::SqliteStore;

use async_trait::async_trait;

/// Persistent records of provisioned clusters and their backup schedules.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Records a cluster; returns the row id.
    async fn insert_service(&self, cluster: &ClusterInfo) -> Result<i64, StoreError>;

    /// Records a backup configuration for a cluster; returns the row id.
    async fn insert_backup(&self, cluster_id: &str, backup: &BackupConfig)
        -> Result<i64, StoreError>;

    async fn all_clusters(&self) -> Result<Vec<ClusterInfo>, StoreError>;

    async fn get_cluster_by_id(&self, cluster_id: &str) -> Result<ClusterInfo, StoreError>;

    /// Returns the most recent backup configuration for the cluster.
    async fn get_backup_config_for_cluster(
        &self,
        cluster_id: &str,
    ) -> Result<BackupConfig, StoreError>;

    /// Returns the most recent backup configuration of every cluster that has one.
    async fn all_backups(&self) -> Result<Vec<(String, BackupConfig)>, StoreError>;
}
