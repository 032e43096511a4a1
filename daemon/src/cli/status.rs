use anyhow::Result;
use common::config::PgdockConfig;
use log::info;
use std::fs;

use super::{daemon_status, DaemonStatus};

pub async fn execute(config: &PgdockConfig) -> Result<DaemonStatus> {
    info!("Checking pgdock daemon status...");
    let pid_file = config.pid_file();

    let status = daemon_status(&pid_file)?;
    match status {
        DaemonStatus::Running(pid) => info!("Daemon is running with PID {pid}"),
        DaemonStatus::Stale(_) => {
            info!("Daemon is not running (stale PID file found)");
            fs::remove_file(&pid_file)?;
        }
        DaemonStatus::NotRunning => info!("Daemon is not running (no PID file found)"),
    }
    Ok(status)
}
