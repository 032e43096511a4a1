use anyhow::{bail, Context, Result};
use common::config::PgdockConfig;
use log::info;
use std::env;
use std::fs::{self, OpenOptions};
use std::process::{Command, Stdio};

use super::{daemon_status, DaemonStatus};

/// Starts the daemon as a detached background process logging to the log file.
pub async fn execute(config: &PgdockConfig, config_path: Option<&str>) -> Result<()> {
    if let DaemonStatus::Running(pid) = daemon_status(&config.pid_file())? {
        bail!("Daemon is already running with PID {pid}");
    }
    info!("Starting pgdock daemon as a background service...");

    let log_file = config.log_file();
    if let Some(parent) = log_file.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_file)
        .with_context(|| format!("Failed to open log file {}", log_file.display()))?;

    let mut command = Command::new(env::current_exe()?);
    if let Some(path) = config_path {
        command.arg("--config").arg(path);
    }
    let child = command
        .arg("run")
        .stdin(Stdio::null())
        .stdout(log.try_clone()?)
        .stderr(log)
        .spawn()
        .context("Failed to spawn the daemon process")?;

    info!(
        "Daemon started in the background with PID {}, logging to {}",
        child.id(),
        log_file.display()
    );
    Ok(())
}
