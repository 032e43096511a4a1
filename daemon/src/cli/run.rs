use anyhow::{Context, Result};
use common::config::PgdockConfig;
use log::{error, info};
use std::fs;
use std::io::ErrorKind;
use std::process;

use crate::{App, Daemon};

/// Runs the daemon in the foreground until it is told to stop.
pub async fn execute(config: PgdockConfig) -> Result<()> {
    info!("Running pgdock daemon in the foreground...");

    let pid_file = config.pid_file();
    if let Some(parent) = pid_file.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let pid = process::id();
    fs::write(&pid_file, pid.to_string())
        .with_context(|| format!("Failed to create PID file at {}", pid_file.display()))?;
    info!("Created PID file at {} with PID {}", pid_file.display(), pid);

    let result = match App::connect(config).await {
        Ok(app) => Daemon::new(app).start().await,
        Err(e) => Err(e),
    };
    if let Err(ref e) = result {
        error!("Daemon error: {e:#}");
    }

    if let Err(e) = fs::remove_file(&pid_file) {
        if e.kind() != ErrorKind::NotFound {
            error!("Failed to remove PID file: {e}");
        }
    }
    info!("Daemon shutdown complete");
    result
}
