use anyhow::{Context, Result};
use common::config::PgdockConfig;
use engine::{Client, ContainerEngine, ContainerEngineFactory};
use metastore::{MetadataStore, SqliteStore};
use postgres::{BackupOptions, BackupScheduler, BackupService, CatalogFactory, S3Catalogs};
use std::sync::Arc;

use crate::ClusterService;

/// Services wired from one configuration.
pub struct App {
    pub config: Arc<PgdockConfig>,
    pub client: Client,
    pub clusters: ClusterService,
    pub backups: BackupService,
}

impl App {
    /// Connects to the Docker daemon and opens the metadata store.
    pub async fn connect(config: PgdockConfig) -> Result<Self> {
        let engine = ContainerEngineFactory::create_docker_engine(config.docker.socket.as_deref())
            .await
            .context("Failed to connect to the Docker daemon")?;

        let path = config.common.metastore_path();
        let store = SqliteStore::from_path(&path)
            .await
            .with_context(|| format!("Failed to open metadata store at {}", path.display()))?;

        let catalogs = S3Catalogs::from_config(&config);
        Ok(Self::new(config, engine, Arc::new(store), Arc::new(catalogs)))
    }

    pub fn new(
        config: PgdockConfig,
        engine: Arc<dyn ContainerEngine>,
        store: Arc<dyn MetadataStore>,
        catalogs: Arc<dyn CatalogFactory>,
    ) -> Self {
        let config = Arc::new(config);
        let client = Client::new(
            engine,
            config.docker.stop_timeout(),
            config.docker.exec_timeout(),
        );
        let backups = BackupService::new(
            client.clone(),
            Arc::clone(&store),
            Arc::new(BackupScheduler::new()),
            catalogs,
            BackupOptions::from_config(&config),
        );
        let clusters = ClusterService::new(client.clone(), store, Arc::clone(&config));

        Self {
            config,
            client,
            clusters,
            backups,
        }
    }
}
