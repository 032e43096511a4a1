use engine::{Client, Container, ContainerSpec, Mount, PortBinding};
use log::{error, info};
use std::path::Path;
use tokio::sync::Mutex;

use crate::settings::{
    grafana_datasource, path_str, prometheus_config, EXPORTER_PORT, GRAFANA_PORT,
    PROMETHEUS_PORT,
};
use crate::lock::ExporterLock;
use crate::target::append_dsn;
use crate::{MonitorError, MonitorSettings, Target};

const DSN_ENV: &str = "DATA_SOURCE_NAME";

#[derive(Default)]
struct RuntimeState {
    exporter: Option<Container>,
    prometheus: Option<Container>,
    grafana: Option<Container>,
    gateway: Option<String>,
    dsn: String,
    targets: Vec<Target>,
}

/// The shared monitoring stack of one network.
///
/// All mutations go through one async mutex. Exporter changes additionally
/// hold a file lock, so registrations from separate pgdock processes never
/// overlap either.
pub struct MonitorRuntime {
    client: Client,
    settings: MonitorSettings,
    state: Mutex<RuntimeState>,
}

impl MonitorRuntime {
    pub fn new(client: Client, settings: MonitorSettings) -> Self {
        Self {
            client,
            settings,
            state: Mutex::new(RuntimeState::default()),
        }
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    pub async fn gateway(&self) -> Option<String> {
        self.state.lock().await.gateway.clone()
    }

    /// Current exporter DSN, empty while no database is registered.
    pub async fn dsn(&self) -> String {
        self.state.lock().await.dsn.clone()
    }

    pub async fn targets(&self) -> Vec<Target> {
        self.state.lock().await.targets.clone()
    }

    /// Stack containers as last seen by this runtime.
    pub async fn containers(&self) -> Vec<Container> {
        let state = self.state.lock().await;
        [&state.prometheus, &state.exporter, &state.grafana]
            .into_iter()
            .flatten()
            .cloned()
            .collect()
    }

    /// Brings the stack up, reusing containers that already exist.
    ///
    /// Containers started by a failed pass are stopped again before the
    /// error is returned.
    pub async fn bootstrap(&self) -> Result<(), MonitorError> {
        let mut state = self.state.lock().await;
        let mut started = Vec::new();

        match self.bootstrap_pass(&mut state, &mut started).await {
            Ok(()) => {
                info!(
                    "Monitoring stack on {} is up, using docker host address {}",
                    self.settings.network,
                    state.gateway.as_deref().unwrap_or_default()
                );
                Ok(())
            }
            Err(e) => {
                for container in &started {
                    if let Err(stop_err) = self.client.stop(container).await {
                        error!("stopping {} container: {stop_err}", container.name());
                    }
                }
                Err(e)
            }
        }
    }

    async fn bootstrap_pass(
        &self,
        state: &mut RuntimeState,
        started: &mut Vec<Container>,
    ) -> Result<(), MonitorError> {
        let network = &self.settings.network;
        self.client
            .ensure_network(network)
            .await
            .map_err(MonitorError::engine(format!("ensuring network {network}")))?;
        let gateway = self
            .client
            .network_gateway(network)
            .await
            .map_err(MonitorError::engine(format!("inspecting network {network}")))?
            .ok_or_else(|| MonitorError::NoGateway(network.clone()))?;
        state.gateway = Some(gateway.clone());

        state.prometheus = Some(self.ensure_prometheus(&gateway, started).await?);

        let exporter = self.ensure_exporter(started).await?;
        state.dsn = exporter.get_env(DSN_ENV).unwrap_or_default();
        state.exporter = Some(exporter);

        state.grafana = Some(self.ensure_grafana(&gateway, started).await?);
        Ok(())
    }

    /// Starts an existing container when it is not running. Returns `None`
    /// when no container with that name exists.
    async fn reuse(
        &self,
        name: &str,
        started: &mut Vec<Container>,
    ) -> Result<Option<Container>, MonitorError> {
        let Some(mut container) = self
            .client
            .get_container(name)
            .await
            .map_err(MonitorError::engine(format!("looking up {name} container")))?
        else {
            return Ok(None);
        };

        info!("reusing existing {name} container");
        if !container.is_running() {
            self.client
                .start_existing(&mut container)
                .await
                .map_err(MonitorError::engine(format!("starting {name} container")))?;
            started.push(container.clone());
        }
        Ok(Some(container))
    }

    async fn create(
        &self,
        spec: ContainerSpec,
        started: &mut Vec<Container>,
    ) -> Result<Container, MonitorError> {
        let name = spec.name.clone();
        let mut container = Container::new(spec);
        self.client
            .start(&mut container)
            .await
            .map_err(MonitorError::engine(format!("failed to start {name} container")))?;
        started.push(container.clone());
        Ok(container)
    }

    async fn ensure_prometheus(
        &self,
        gateway: &str,
        started: &mut Vec<Container>,
    ) -> Result<Container, MonitorError> {
        let name = self.settings.prometheus_name();
        // an existing container keeps the config it was started with
        if let Some(container) = self.reuse(&name, started).await? {
            return Ok(container);
        }

        let config_path = self.settings.prometheus_config_path();
        write_file(&config_path, &prometheus_config(gateway)).await?;
        let data_dir = self.settings.prometheus_data_dir();
        tokio::fs::create_dir_all(&data_dir)
            .await
            .map_err(MonitorError::io(&data_dir))?;

        let spec = ContainerSpec::new(name, self.settings.prometheus_image.clone())
            .with_user("root")
            .with_port(PortBinding::tcp(PROMETHEUS_PORT, PROMETHEUS_PORT))
            .with_mount(Mount::bind(
                path_str(&config_path),
                "/opt/bitnami/prometheus/conf/prometheus.yml",
            ))
            .with_mount(Mount::bind(
                path_str(&data_dir),
                "/opt/bitnami/prometheus/data",
            ))
            .with_network(self.settings.network.clone());
        self.create(spec, started).await
    }

    fn exporter_spec(&self, dsn: &str) -> ContainerSpec {
        let mut spec = ContainerSpec::new(
            self.settings.exporter_name(),
            self.settings.exporter_image.clone(),
        )
        .with_port(PortBinding::tcp(EXPORTER_PORT, EXPORTER_PORT))
        .with_network(self.settings.network.clone());
        if !dsn.is_empty() {
            spec = spec.with_env(DSN_ENV, dsn);
        }
        spec
    }

    async fn ensure_exporter(&self, started: &mut Vec<Container>) -> Result<Container, MonitorError> {
        if let Some(container) = self.reuse(&self.settings.exporter_name(), started).await? {
            return Ok(container);
        }
        self.create(self.exporter_spec(""), started).await
    }

    async fn ensure_grafana(
        &self,
        gateway: &str,
        started: &mut Vec<Container>,
    ) -> Result<Container, MonitorError> {
        write_file(
            &self.settings.grafana_datasource_path(),
            &grafana_datasource(gateway),
        )
        .await?;

        let name = self.settings.grafana_name();
        let mut container = match self.reuse(&name, started).await? {
            Some(container) => container,
            None => {
                let spec = ContainerSpec::new(name.clone(), self.settings.grafana_image.clone())
                    .with_port(PortBinding::tcp(GRAFANA_PORT, GRAFANA_PORT))
                    .with_mount(Mount::bind(
                        path_str(&self.settings.grafana_provisioning_dir()),
                        "/etc/grafana/provisioning",
                    ))
                    .with_network(self.settings.network.clone());
                self.create(spec, started).await?
            }
        };

        // grafana only reads provisioning files at startup
        self.client
            .restart(&mut container)
            .await
            .map_err(MonitorError::engine(format!("restarting {name} container")))?;
        Ok(container)
    }

    /// Adds a database to the exporter by recreating it with the extended DSN.
    ///
    /// The exporter is looked up again under the lock, since another process
    /// may have replaced it since this runtime last saw it.
    pub async fn add_target(&self, target: Target) -> Result<(), MonitorError> {
        let mut state = self.state.lock().await;
        let gateway = state.gateway.clone().ok_or(MonitorError::NotBootstrapped)?;
        let exporter_name = self.settings.exporter_name();
        let _lock = ExporterLock::acquire(self.settings.exporter_lock_path()).await?;

        state.exporter = None;
        let current = self
            .client
            .get_container(&exporter_name)
            .await
            .map_err(MonitorError::engine(format!("looking up {exporter_name} container")))?;

        if let Some(exporter) = current {
            state.dsn = exporter.get_env(DSN_ENV).unwrap_or_default();
            self.client
                .stop(&exporter)
                .await
                .map_err(MonitorError::engine(format!("stopping {exporter_name} container")))?;
            self.client
                .remove(&exporter)
                .await
                .map_err(MonitorError::engine(format!("removing {exporter_name} container")))?;
        }

        let dsn = append_dsn(&state.dsn, &target.connection_string(&gateway));
        let mut replacement = Container::new(self.exporter_spec(&dsn));
        if let Err(e) = self.client.start(&mut replacement).await {
            if let Err(stop_err) = self.client.stop(&replacement).await {
                error!("stopping {exporter_name} container: {stop_err}");
            }
            return Err(MonitorError::Engine {
                step: format!("failed to start {exporter_name} container"),
                source: e,
            });
        }

        info!(
            "Registered {} with {} on port {}",
            target.container_name, exporter_name, target.port
        );
        state.dsn = dsn;
        state.exporter = Some(replacement);
        state.targets.push(target);
        Ok(())
    }
}

async fn write_file(path: &Path, contents: &str) -> Result<(), MonitorError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(MonitorError::io(parent))?;
    }
    tokio::fs::write(path, contents)
        .await
        .map_err(MonitorError::io(path))
}
