//! Metrics stack for pgdock databases: Prometheus, a postgres exporter and
//! Grafana, one set per managed network.

mod error;
mod lock;
mod runtime;
mod settings;
mod target;

pub use error::MonitorError;
pub use runtime::MonitorRuntime;
pub use settings::{MonitorSettings, EXPORTER_PORT, GRAFANA_PORT, PROMETHEUS_PORT};
pub use target::Target;

#[cfg(test)]
mod tests;
