use anyhow::{Context, Result};
use common::config::PgdockConfig;
use log::info;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fs;

use super::{daemon_status, DaemonStatus};

/// Sends SIGTERM to the daemon named in the PID file.
pub async fn execute(config: &PgdockConfig) -> Result<()> {
    info!("Stopping pgdock daemon...");
    let pid_file = config.pid_file();

    match daemon_status(&pid_file)? {
        DaemonStatus::Running(pid) => {
            kill(Pid::from_raw(pid), Signal::SIGTERM)
                .with_context(|| format!("Failed to signal daemon with PID {pid}"))?;
            info!("Sent SIGTERM to daemon with PID {pid}");
        }
        DaemonStatus::Stale(pid) => {
            info!("Daemon with PID {pid} is not running, removing stale PID file");
            fs::remove_file(&pid_file)?;
        }
        DaemonStatus::NotRunning => info!("No PID file found, daemon may not be running"),
    }
    Ok(())
}
