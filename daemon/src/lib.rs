//! Cluster lifecycle service and the long-running pgdock daemon.

mod app;
pub mod cli;
mod error;
mod monitoring;
pub mod ports;
mod service;

pub use app::App;
pub use error::ServiceError;
pub use monitoring::Registration;
pub use service::ClusterService;

use anyhow::{Context, Result};
use log::{error, info};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;
use tokio::time::{interval, MissedTickBehavior};

/// Owns the backup scheduler and keeps it in line with the metadata store.
pub struct Daemon {
    app: App,
    shutdown: Arc<Notify>,
}

impl Daemon {
    pub fn new(app: App) -> Self {
        Daemon {
            app,
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn app(&self) -> &App {
        &self.app
    }

    /// Prepares the host, then re-syncs backup schedules until ctrl-c,
    /// SIGTERM or [`Daemon::stop`].
    pub async fn start(&self) -> Result<()> {
        let network = &self.app.config.common.network_name;
        let handle = self
            .app
            .client
            .ensure_network(network)
            .await
            .with_context(|| format!("Failed to ensure network {network}"))?;
        if handle.created {
            info!("Created network {network}");
        }

        if self.app.config.common.monitoring {
            self.app
                .clusters
                .monitor_runtime()
                .await
                .context("Failed to bootstrap the monitoring stack")?;
        }

        let mut terminate =
            signal(SignalKind::terminate()).context("Failed to listen for SIGTERM")?;
        let mut ticker = interval(self.app.config.backup.sync_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Daemon started");
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sync().await,
                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl+C, shutting down...");
                    break;
                }
                _ = terminate.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = self.shutdown.notified() => break,
            }
        }

        self.app.backups.scheduler().shutdown();
        info!("Daemon stopped");
        Ok(())
    }

    /// Makes a running [`Daemon::start`] return.
    pub fn stop(&self) {
        self.shutdown.notify_one();
    }

    async fn sync(&self) {
        match self.app.backups.sync_schedules().await {
            Ok(0) => {}
            Ok(count) => info!("Synced {count} backup schedules"),
            Err(e) => error!("Failed to sync backup schedules: {e}"),
        }
    }
}
