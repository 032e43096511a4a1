pub mod run;
pub mod start;
pub mod status;
pub mod stop;

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

/// What the PID file says about the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonStatus {
    Running(i32),
    /// The PID file names a process that is gone
    Stale(i32),
    NotRunning,
}

/// Reads the PID recorded in `pid_file`, if there is one.
pub fn read_pid(pid_file: &Path) -> Result<Option<i32>> {
    match fs::read_to_string(pid_file) {
        Ok(contents) => {
            let pid = contents
                .trim()
                .parse::<i32>()
                .with_context(|| format!("Invalid PID file {}", pid_file.display()))?;
            Ok(Some(pid))
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).context(format!("Failed to read PID file {}", pid_file.display())),
    }
}

/// Probes a process with signal 0.
pub fn process_alive(pid: i32) -> bool {
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        // exists but belongs to someone else
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

pub fn daemon_status(pid_file: &Path) -> Result<DaemonStatus> {
    Ok(match read_pid(pid_file)? {
        Some(pid) if process_alive(pid) => DaemonStatus::Running(pid),
        Some(pid) => DaemonStatus::Stale(pid),
        None => DaemonStatus::NotRunning,
    })
}
