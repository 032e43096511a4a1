//! Scheduled WAL-G backups and restores of cluster data directories.

mod job;
mod restore;

pub use job::{BackupJob, BACKUP_CONTAINER_PREFIX};
pub use restore::RESTORE_CONTAINER_PREFIX;

use async_trait::async_trait;
use common::config::PgdockConfig;
use engine::{Client, Container};
use log::{info, warn};
use metastore::{BackupConfig, ClusterInfo, Destination, MetadataStore, AWS_DESTINATION};
use std::path::PathBuf;
use std::sync::Arc;
use storage::{BackupEntry, StorageConfig, StorageProviderFactory, WalgCatalog};

use crate::container::container_name;
use crate::hba::{patch_pg_hba, reload_postgres};
use crate::scheduler::BackupScheduler;
use crate::PostgresError;

/// Settings the backup service takes from the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupOptions {
    pub network: String,
    pub backup_image: String,
    /// Host directory receiving fetched base backups
    pub restore_dir: PathBuf,
    pub verify_before_restore: bool,
}

impl BackupOptions {
    pub fn from_config(config: &PgdockConfig) -> Self {
        Self {
            network: config.common.network_name.clone(),
            backup_image: config.images.backup_runner.clone(),
            restore_dir: config.backup.restore_dir(),
            verify_before_restore: config.backup.verify_before_restore,
        }
    }
}

/// Opens the WAL-G catalog behind a backup destination.
#[async_trait]
pub trait CatalogFactory: Send + Sync {
    async fn catalog(&self, destination: &Destination) -> Result<WalgCatalog, PostgresError>;
}

/// [`CatalogFactory`] for S3 buckets.
pub struct S3Catalogs {
    region: String,
    endpoint: Option<String>,
}

impl S3Catalogs {
    pub fn new(region: impl Into<String>, endpoint: Option<String>) -> Self {
        Self {
            region: region.into(),
            endpoint,
        }
    }

    pub fn from_config(config: &PgdockConfig) -> Self {
        Self::new(config.backup.region.clone(), config.backup.endpoint.clone())
    }
}

#[async_trait]
impl CatalogFactory for S3Catalogs {
    async fn catalog(&self, destination: &Destination) -> Result<WalgCatalog, PostgresError> {
        let provider = StorageProviderFactory::create_s3_provider(StorageConfig {
            region: Some(self.region.clone()),
            endpoint: self.endpoint.clone(),
            access_key: Some(destination.api_key_id.clone()),
            secret_key: Some(destination.api_key_secret.clone()),
        })
        .await?;
        Ok(WalgCatalog::new(
            provider,
            &format!("s3://{}", destination.bucket_name),
        )?)
    }
}

/// Rejects destinations a backup could never be written to.
pub fn validate_backup_config(config: &BackupConfig) -> Result<(), PostgresError> {
    let destination = &config.destination;
    if destination.name != AWS_DESTINATION {
        return Err(PostgresError::InvalidBackupConfig(format!(
            "destination {:?} is not supported, only {AWS_DESTINATION} is",
            destination.name
        )));
    }

    let missing: Vec<&str> = [
        ("apiKeyID", &destination.api_key_id),
        ("apiKeySecret", &destination.api_key_secret),
        ("bucketName", &destination.bucket_name),
    ]
    .into_iter()
    .filter(|(_, value)| value.trim().is_empty())
    .map(|(field, _)| field)
    .collect();
    if !missing.is_empty() {
        return Err(PostgresError::InvalidBackupConfig(format!(
            "destination is missing {}",
            missing.join(", ")
        )));
    }
    Ok(())
}

pub struct BackupService {
    client: Client,
    store: Arc<dyn MetadataStore>,
    scheduler: Arc<BackupScheduler>,
    catalogs: Arc<dyn CatalogFactory>,
    options: BackupOptions,
}

impl BackupService {
    pub fn new(
        client: Client,
        store: Arc<dyn MetadataStore>,
        scheduler: Arc<BackupScheduler>,
        catalogs: Arc<dyn CatalogFactory>,
        options: BackupOptions,
    ) -> Self {
        Self {
            client,
            store,
            scheduler,
            catalogs,
            options,
        }
    }

    pub fn scheduler(&self) -> &Arc<BackupScheduler> {
        &self.scheduler
    }

    /// Stores a backup configuration for a cluster, prepares the database for
    /// WAL-G and schedules the backups.
    pub async fn create_backup(
        &self,
        cluster_id: &str,
        config: &BackupConfig,
    ) -> Result<(), PostgresError> {
        validate_backup_config(config)?;

        let cluster = self.cluster(cluster_id).await?;
        let container = self.database_container(&cluster).await?;

        let expression = config.schedule.cron_expression();
        BackupScheduler::parse(&expression)?;

        self.store
            .insert_backup(cluster_id, config)
            .await
            .map_err(PostgresError::store("saving backup config to store"))?;

        patch_pg_hba(&self.client, &container).await?;
        reload_postgres(&self.client, &container, cluster.maj_version).await?;

        info!("Scheduling backup of {} at {expression}", cluster.name);
        self.schedule(&cluster, &config.destination, &expression)
    }

    /// Schedules every stored backup configuration that is not scheduled yet
    /// or whose schedule or destination changed. Returns how many schedules
    /// were (re)created. Rows of clusters that no longer exist are skipped.
    pub async fn sync_schedules(&self) -> Result<usize, PostgresError> {
        let backups = self
            .store
            .all_backups()
            .await
            .map_err(PostgresError::store("loading backup configs"))?;

        let mut synced = 0;
        for (cluster_id, config) in backups {
            let cluster = match self.cluster(&cluster_id).await {
                Ok(cluster) => cluster,
                Err(PostgresError::ClusterNotFound(_)) => {
                    warn!("skipping backup config of unknown cluster {cluster_id}");
                    continue;
                }
                Err(e) => return Err(e),
            };

            let expression = config.schedule.cron_expression();
            let job = self.backup_job(&cluster, &config.destination);
            if self.scheduler.is_current(&cluster_id, &expression, &job) {
                continue;
            }
            self.scheduler
                .schedule(&cluster_id, &expression, Arc::new(job))?;
            synced += 1;
        }
        Ok(synced)
    }

    /// Lists the base backups stored for a cluster, oldest first.
    pub async fn list_backups(&self, cluster_id: &str) -> Result<Vec<BackupEntry>, PostgresError> {
        self.cluster(cluster_id).await?;
        let config = self.backup_config(cluster_id).await?;
        let catalog = self.catalogs.catalog(&config.destination).await?;
        Ok(catalog.list_backups().await?)
    }

    fn backup_job(&self, cluster: &ClusterInfo, destination: &Destination) -> BackupJob {
        BackupJob::new(
            self.client.clone(),
            cluster,
            destination,
            &self.options.backup_image,
            &self.options.network,
        )
    }

    fn schedule(
        &self,
        cluster: &ClusterInfo,
        destination: &Destination,
        expression: &str,
    ) -> Result<(), PostgresError> {
        let job = self.backup_job(cluster, destination);
        self.scheduler
            .schedule(&cluster.cluster_id, expression, Arc::new(job))
    }

    async fn cluster(&self, cluster_id: &str) -> Result<ClusterInfo, PostgresError> {
        match self.store.get_cluster_by_id(cluster_id).await {
            Ok(cluster) => Ok(cluster),
            Err(e) if e.is_not_found() => Err(PostgresError::ClusterNotFound(cluster_id.to_string())),
            Err(e) => Err(PostgresError::Store {
                step: "failed to get cluster".to_string(),
                source: e,
            }),
        }
    }

    async fn backup_config(&self, cluster_id: &str) -> Result<BackupConfig, PostgresError> {
        self.store
            .get_backup_config_for_cluster(cluster_id)
            .await
            .map_err(PostgresError::store(format!(
                "failed to get backup config for cluster {cluster_id}"
            )))
    }

    async fn database_container(&self, cluster: &ClusterInfo) -> Result<Container, PostgresError> {
        let name = container_name(&cluster.name);
        self.client
            .get_container(&name)
            .await
            .map_err(PostgresError::engine("failed to find existing database container"))?
            .ok_or(PostgresError::ContainerMissing(name))
    }
}
