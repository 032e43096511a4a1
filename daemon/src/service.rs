use common::config::PgdockConfig;
use engine::Client;
use log::{info, warn};
use metastore::{ClusterInfo, MetadataStore, POSTGRES_ENGINE};
use monitor::{MonitorRuntime, MonitorSettings, Target};
use postgres::container::image_reference;
use postgres::{provision, ContainerProps};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

use crate::monitoring::{Registration, SharedMonitor};
use crate::ports::allocate_port;
use crate::ServiceError;

/// Creates database clusters and answers questions about them.
pub struct ClusterService {
    client: Client,
    store: Arc<dyn MetadataStore>,
    config: Arc<PgdockConfig>,
    monitor: Arc<SharedMonitor>,
    registrations: Mutex<HashMap<String, watch::Receiver<Registration>>>,
}

impl ClusterService {
    pub fn new(client: Client, store: Arc<dyn MetadataStore>, config: Arc<PgdockConfig>) -> Self {
        let monitor = SharedMonitor::new(client.clone(), MonitorSettings::from_config(&config));
        Self {
            client,
            store,
            config,
            monitor: Arc::new(monitor),
            registrations: Mutex::new(HashMap::new()),
        }
    }

    fn registrations(&self) -> MutexGuard<'_, HashMap<String, watch::Receiver<Registration>>> {
        match self.registrations.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Provisions a database container for `cluster` and records it.
    ///
    /// On success `cluster` carries its container id, port and host. When
    /// monitoring is requested the cluster is registered with the stack in
    /// the background; see [`ClusterService::registration`].
    pub async fn create_service(&self, cluster: &mut ClusterInfo) -> Result<(), ServiceError> {
        if cluster.engine_type.is_empty() {
            cluster.engine_type = POSTGRES_ENGINE.to_string();
        }
        if cluster.engine_type != POSTGRES_ENGINE {
            return Err(ServiceError::UnsupportedEngine(cluster.engine_type.clone()));
        }
        if cluster.architecture.is_empty() {
            cluster.architecture = self.config.common.architecture.clone();
        }
        if cluster.port == 0 {
            cluster.port = self.free_port().await?;
        }
        cluster.host = self.config.common.host.clone();

        let props = ContainerProps {
            name: cluster.name.clone(),
            username: cluster.username.clone(),
            password: cluster.password.clone(),
            port: cluster.port,
            memory: cluster.memory,
            cpu_shares: cluster.cpu,
            image: image_reference(&cluster.architecture, cluster.maj_version, cluster.min_version),
            network: self.config.common.network_name.clone(),
        };
        info!("Creating cluster {} from {}", cluster.name, props.image);
        let provisioned = provision(&self.client, &props).await?;
        cluster.cluster_id = provisioned.outcome.id.clone();

        cluster.id = self
            .store
            .insert_service(cluster)
            .await
            .map_err(ServiceError::store("saving cluster to store"))?;
        info!(
            "Cluster {} ({}) is listening on port {}",
            cluster.name, cluster.cluster_id, cluster.port
        );

        if cluster.monitoring {
            let target = Target {
                container_name: provisioned.container.name().to_string(),
                username: cluster.username.clone(),
                password: cluster.password.clone(),
                port: cluster.port,
            };
            let registration = self.monitor.register(target);
            self.registrations()
                .insert(cluster.cluster_id.clone(), registration);
        }
        Ok(())
    }

    /// Monitoring registration progress of a cluster created by this service.
    pub fn registration(&self, cluster_id: &str) -> Option<watch::Receiver<Registration>> {
        self.registrations().get(cluster_id).cloned()
    }

    /// The shared monitoring stack, bootstrapped on first use.
    pub async fn monitor_runtime(&self) -> Result<Arc<MonitorRuntime>, ServiceError> {
        Ok(self.monitor.runtime().await?)
    }

    pub async fn list_clusters(&self) -> Result<Vec<ClusterInfo>, ServiceError> {
        let mut clusters = self
            .store
            .all_clusters()
            .await
            .map_err(ServiceError::store("listing clusters"))?;
        for cluster in &mut clusters {
            cluster.host = self.config.common.host.clone();
        }
        Ok(clusters)
    }

    /// Looks a cluster up by container id, with its latest backup configuration.
    pub async fn get_cluster_by_id(&self, cluster_id: &str) -> Result<ClusterInfo, ServiceError> {
        let mut cluster = match self.store.get_cluster_by_id(cluster_id).await {
            Ok(cluster) => cluster,
            Err(e) if e.is_not_found() => return Err(ServiceError::NotFound(cluster_id.to_string())),
            Err(e) => {
                return Err(ServiceError::Store {
                    step: format!("loading cluster {cluster_id}"),
                    source: e,
                })
            }
        };
        cluster.host = self.config.common.host.clone();

        cluster.backup = match self.store.get_backup_config_for_cluster(cluster_id).await {
            Ok(backup) => Some(backup),
            Err(e) if e.is_not_found() => None,
            Err(e) => {
                warn!("could not load backup config of {cluster_id}: {e}");
                None
            }
        };
        Ok(cluster)
    }

    async fn free_port(&self) -> Result<u16, ServiceError> {
        let (min, max) = self
            .config
            .common
            .port_range()
            .ok_or_else(|| ServiceError::NoFreePort("an empty port range".to_string()))?;
        let taken: HashSet<u16> = self
            .store
            .all_clusters()
            .await
            .map_err(ServiceError::store("listing clusters"))?
            .into_iter()
            .map(|cluster| cluster.port)
            .collect();

        allocate_port(min, max, &taken)
            .await
            .ok_or_else(|| ServiceError::NoFreePort(format!("{min}-{max}")))
    }
}
