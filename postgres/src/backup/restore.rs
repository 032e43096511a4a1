use chrono::Utc;
use engine::{ArchiveOptions, Client, Container, ContainerSpec, ExecCommand, Mount};
use log::{info, warn};
use metastore::Destination;
use std::fs::Permissions;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use storage::LATEST_BACKUP;
use tokio::fs;

use super::job::destination_env;
use super::BackupService;
use crate::container::PG_DATA_DIR;
use crate::PostgresError;

pub const RESTORE_CONTAINER_PREFIX: &str = "pgdock-pg-restore-";

const RESTORE_MOUNT_ROOT: &str = "/tmp/restore";
/// uid and gid of the postgres user in the official images
const POSTGRES_OWNER: (u64, u64) = (999, 999);

fn data_dir_options() -> ArchiveOptions {
    ArchiveOptions {
        owner: Some(POSTGRES_OWNER),
        dir_mode: Some(0o700),
        file_mode: Some(0o600),
    }
}

impl BackupService {
    /// Replaces a cluster's data directory with a WAL-G base backup.
    ///
    /// Nothing destructive happens until the backup has been fetched. Once the
    /// database container is stopped, a failure leaves it stopped.
    pub async fn restore(
        &self,
        network: &str,
        cluster_id: &str,
        backup_name: &str,
    ) -> Result<(), PostgresError> {
        let backup_name = if backup_name.is_empty() {
            LATEST_BACKUP
        } else {
            backup_name
        };
        validate_backup_name(backup_name)?;

        let cluster = self.cluster(cluster_id).await?;
        let config = self.backup_config(cluster_id).await?;
        let mut database = self.database_container(&cluster).await?;
        if self.options.verify_before_restore {
            self.verify_backup(&config.destination, backup_name).await?;
        }

        let helper_name = format!("{RESTORE_CONTAINER_PREFIX}{}", cluster.name);
        self.remove_stale_helper(&helper_name).await?;

        let timestamp = Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
        let host_dir = self
            .options
            .restore_dir
            .join(format!("pgdock-restore-{backup_name}{timestamp}"));
        create_restore_dir(&host_dir).await?;
        let mount_dir = format!("{RESTORE_MOUNT_ROOT}/{timestamp}/");

        let helper = self
            .fetch_backup(
                &helper_name,
                network,
                &config.destination,
                &host_dir,
                &mount_dir,
                backup_name,
            )
            .await?;

        info!("Stopping {} to replace its data directory", database.name());
        self.client
            .stop(&database)
            .await
            .map_err(PostgresError::engine("failed to stop database container"))?;

        self.client
            .copy_path_to_container(&database, &host_dir, PG_DATA_DIR, &data_dir_options())
            .await
            .map_err(PostgresError::engine("failed to copy backup into database container"))?;

        stop_best_effort(&self.client, &helper).await;

        self.client
            .restart(&mut database)
            .await
            .map_err(PostgresError::engine("failed to restart database container"))?;
        info!(
            "Restored backup {backup_name} into {} ({})",
            database.name(),
            cluster.version()
        );
        Ok(())
    }

    async fn verify_backup(
        &self,
        destination: &Destination,
        backup_name: &str,
    ) -> Result<(), PostgresError> {
        let catalog = self.catalogs.catalog(destination).await?;
        if !catalog.exists(backup_name).await? {
            return Err(PostgresError::BackupNotFound {
                backup: backup_name.to_string(),
                bucket: catalog.bucket().to_string(),
            });
        }
        Ok(())
    }

    async fn remove_stale_helper(&self, name: &str) -> Result<(), PostgresError> {
        let step =
            format!("failed to remove existing {name} container, remove it manually and retry");
        let existing = self
            .client
            .get_container(name)
            .await
            .map_err(PostgresError::engine(step.clone()))?;
        if let Some(stale) = existing {
            info!("Removing leftover restore container {name}");
            self.client
                .stop(&stale)
                .await
                .map_err(PostgresError::engine(step.clone()))?;
            self.client
                .remove(&stale)
                .await
                .map_err(PostgresError::engine(step))?;
        }
        Ok(())
    }

    /// Starts the helper and has WAL-G download the backup into the bind mount.
    async fn fetch_backup(
        &self,
        helper_name: &str,
        network: &str,
        destination: &Destination,
        host_dir: &Path,
        mount_dir: &str,
        backup_name: &str,
    ) -> Result<Container, PostgresError> {
        let mut spec = ContainerSpec::new(helper_name, self.options.backup_image.clone())
            .with_network(network)
            .with_entrypoint(vec!["sleep".into()], vec!["infinity".into()])
            .with_mount(
                Mount::bind(host_dir.to_string_lossy(), mount_dir).with_create_mountpoint(),
            );
        for (key, value) in destination_env(destination) {
            spec = spec.with_env(key, value);
        }

        let mut helper = Container::new(spec);
        self.client
            .start(&mut helper)
            .await
            .map_err(PostgresError::engine("failed to start restore container"))?;

        let commands = [
            ExecCommand::new(["wal-g", "backup-fetch", mount_dir, backup_name])
                .user("root")
                .working_dir(mount_dir),
            ExecCommand::new(["chmod", "-R", "777", mount_dir]).user("root"),
        ];
        for command in &commands {
            if let Err(e) = self.client.exec_checked(&helper, command).await {
                stop_best_effort(&self.client, &helper).await;
                return Err(PostgresError::Engine {
                    step: format!("failed to run `{}` in restore container", command.program()),
                    source: e,
                });
            }
        }
        Ok(helper)
    }
}

async fn stop_best_effort(client: &Client, container: &Container) {
    if let Err(e) = client.stop(container).await {
        warn!("failed to stop {}: {e}", container.name());
    }
}

/// Backup names end up in a host path, so they must stay a single component.
fn validate_backup_name(name: &str) -> Result<(), PostgresError> {
    let valid = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        && !name.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(PostgresError::InvalidBackupName(name.to_string()))
    }
}

async fn create_restore_dir(dir: &Path) -> Result<(), PostgresError> {
    let context = format!("creating restore directory {}", dir.display());
    fs::create_dir_all(dir)
        .await
        .map_err(PostgresError::io(context.clone()))?;
    fs::set_permissions(dir, Permissions::from_mode(0o777))
        .await
        .map_err(PostgresError::io(context))
}
