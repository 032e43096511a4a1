use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, File};
use log::info;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::DEFAULT_NETWORK_NAME;

const CONFIG_PATHS: [&str; 3] = [
    "/etc/pgdock/pgdock.toml",
    "~/.config/pgdock/pgdock.toml",
    "pgdock.toml",
];

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PgdockConfig {
    pub sentry_dsn: Option<String>,
    pub common: CommonConfig,
    pub docker: DockerConfig,
    pub images: ImagesConfig,
    pub backup: BackupSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CommonConfig {
    /// Image architecture prefix, e.g. `amd64` for `amd64/postgres:16.2`
    pub architecture: String,
    pub project_dir: String,
    /// Address clients use to reach the published database ports
    pub host: String,
    /// Lowest and highest port handed out when a cluster is created without one
    pub ports: Vec<u16>,
    pub network_name: String,
    pub monitoring: bool,
    pub metastore_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DockerConfig {
    /// Unix socket or tcp address of the engine; local defaults when unset
    pub socket: Option<String>,
    pub stop_timeout_secs: u64,
    pub exec_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ImagesConfig {
    pub backup_runner: String,
    pub exporter: String,
    pub prometheus: String,
    pub grafana: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackupSettings {
    pub region: String,
    pub endpoint: Option<String>,
    pub verify_before_restore: bool,
    pub restore_dir: String,
    pub sync_interval_secs: u64,
}

impl PgdockConfig {
    /// Serializes the effective configuration back to TOML
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    pub fn pid_file(&self) -> PathBuf {
        self.common.project_dir().join("pgdock.pid")
    }

    pub fn log_file(&self) -> PathBuf {
        self.common.project_dir().join("pgdock.log")
    }
}

impl CommonConfig {
    pub fn project_dir(&self) -> PathBuf {
        PathBuf::from(expand(&self.project_dir))
    }

    pub fn metastore_path(&self) -> PathBuf {
        match &self.metastore_path {
            Some(path) => PathBuf::from(expand(path)),
            None => self.project_dir().join("pgdock.db"),
        }
    }

    /// Inclusive port range derived from the configured port list.
    pub fn port_range(&self) -> Option<(u16, u16)> {
        let min = self.ports.iter().min()?;
        let max = self.ports.iter().max()?;
        Some((*min, *max))
    }
}

impl DockerConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn exec_timeout(&self) -> Duration {
        Duration::from_secs(self.exec_timeout_secs)
    }
}

impl BackupSettings {
    pub fn restore_dir(&self) -> PathBuf {
        PathBuf::from(expand(&self.restore_dir))
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs.max(1))
    }
}

fn expand(path: &str) -> String {
    shellexpand::full(path)
        .map(|expanded| expanded.into_owned())
        .unwrap_or_else(|_| path.to_string())
}

fn builder_with_defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    Config::builder()
        .set_default("common.architecture", "amd64")?
        .set_default("common.project_dir", "~/.local/share/pgdock")?
        .set_default("common.host", "localhost")?
        .set_default("common.ports", vec![5432, 5500])?
        .set_default("common.network_name", DEFAULT_NETWORK_NAME)?
        .set_default("common.monitoring", false)?
        .set_default("common.metastore_path", None::<String>)?
        .set_default("docker.socket", None::<String>)?
        .set_default("docker.stop_timeout_secs", 20)?
        .set_default("docker.exec_timeout_secs", 600)?
        .set_default("images.backup_runner", "spinuphost/walg:latest")?
        .set_default(
            "images.exporter",
            "quay.io/prometheuscommunity/postgres-exporter:latest",
        )?
        .set_default("images.prometheus", "bitnami/prometheus:latest")?
        .set_default("images.grafana", "grafana/grafana-oss:latest")?
        .set_default("backup.region", "us-east-1")?
        .set_default("backup.endpoint", None::<String>)?
        .set_default("backup.verify_before_restore", true)?
        .set_default("backup.restore_dir", "/tmp")?
        .set_default("backup.sync_interval_secs", 60)?
        .set_default("sentry_dsn", None::<String>)
}

/// Loads the configuration from the default locations, later files overriding earlier ones.
pub fn load_config() -> Result<PgdockConfig, ConfigError> {
    // Create config builder and apply default values
    let config_builder = builder_with_defaults()?;

    // Add config sources
    let config_builder = CONFIG_PATHS.iter().fold(config_builder, |builder, path| {
        let path = expand(path);
        if Path::new(&path).exists() {
            info!("Loading configuration from {}", path);
            builder.add_source(File::with_name(&path))
        } else {
            builder
        }
    });

    // Build and deserialize
    config_builder.build()?.try_deserialize()
}

/// Loads the configuration from a single explicit file on top of the defaults.
pub fn load_config_from(path: &Path) -> Result<PgdockConfig, ConfigError> {
    info!("Loading configuration from {}", path.display());
    builder_with_defaults()?
        .add_source(File::from(path))
        .build()?
        .try_deserialize()
}
