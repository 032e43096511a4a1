use nix::fcntl::{Flock, FlockArg};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use crate::MonitorError;

/// Exclusive `flock` on a file under the stack's directory.
///
/// Every pgdock process on the host takes it before touching the exporter,
/// released on drop.
pub(crate) struct ExporterLock {
    _file: Flock<File>,
}

impl ExporterLock {
    pub(crate) async fn acquire(path: PathBuf) -> Result<Self, MonitorError> {
        let lock_path = path.clone();
        tokio::task::spawn_blocking(move || Self::acquire_blocking(&path))
            .await
            .map_err(|e| MonitorError::Lock {
                path: lock_path,
                source: io::Error::other(e),
            })?
    }

    fn acquire_blocking(path: &Path) -> Result<Self, MonitorError> {
        let locking = |source: io::Error| MonitorError::Lock {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(locking)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(locking)?;
        let file = Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| locking(io::Error::from(errno)))?;
        Ok(Self { _file: file })
    }
}
