use common::config::PgdockConfig;
use std::path::{Path, PathBuf};

pub const PROMETHEUS_PORT: u16 = 9090;
pub const EXPORTER_PORT: u16 = 9187;
pub const GRAFANA_PORT: u16 = 3000;

/// Where and how the monitoring stack of one network runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorSettings {
    pub network: String,
    /// Host directory holding generated config and Prometheus data
    pub root_dir: PathBuf,
    pub exporter_image: String,
    pub prometheus_image: String,
    pub grafana_image: String,
}

impl MonitorSettings {
    pub fn from_config(config: &PgdockConfig) -> Self {
        let network = config.common.network_name.clone();
        Self {
            root_dir: config.common.project_dir().join("monitoring").join(&network),
            network,
            exporter_image: config.images.exporter.clone(),
            prometheus_image: config.images.prometheus.clone(),
            grafana_image: config.images.grafana.clone(),
        }
    }

    pub fn exporter_name(&self) -> String {
        format!("pgdock-postgres-exporter-{}", self.network)
    }

    pub fn prometheus_name(&self) -> String {
        format!("pgdock-prometheus-{}", self.network)
    }

    pub fn grafana_name(&self) -> String {
        format!("pgdock-grafana-{}", self.network)
    }

    pub fn prometheus_config_path(&self) -> PathBuf {
        self.root_dir.join("prometheus.yml")
    }

    pub fn prometheus_data_dir(&self) -> PathBuf {
        self.root_dir.join("prom_data")
    }

    pub fn grafana_provisioning_dir(&self) -> PathBuf {
        self.root_dir.join("grafana").join("provisioning")
    }

    /// Lock serialising exporter changes across processes
    pub fn exporter_lock_path(&self) -> PathBuf {
        self.root_dir.join("exporter.lock")
    }

    pub fn grafana_datasource_path(&self) -> PathBuf {
        self.grafana_provisioning_dir()
            .join("datasources")
            .join("datasource.yml")
    }
}

pub(crate) fn prometheus_config(gateway: &str) -> String {
    format!(
        r#"scrape_configs:
  - job_name: prometheus
    scrape_interval: 5s
    static_configs:
    - targets:
      - "{gateway}:{PROMETHEUS_PORT}"
  - job_name: pg_exporter
    scrape_interval: 5s
    static_configs:
    - targets:
      - "{gateway}:{EXPORTER_PORT}"
"#
    )
}

pub(crate) fn grafana_datasource(gateway: &str) -> String {
    format!(
        r#"apiVersion: 1

datasources:
  - name: Prometheus
    type: prometheus
    access: proxy
    url: http://{gateway}:{PROMETHEUS_PORT}
    isDefault: true
"#
    )
}

pub(crate) fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
