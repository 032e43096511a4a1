//! Postgres clusters in containers: provisioning, the pg_hba patch WAL-G
//! needs, scheduled backups and restores from a bucket.

pub mod backup;
pub mod container;
mod error;
pub mod hba;
pub mod scheduler;

pub use backup::{
    validate_backup_config, BackupJob, BackupOptions, BackupService, CatalogFactory, S3Catalogs,
    BACKUP_CONTAINER_PREFIX, RESTORE_CONTAINER_PREFIX,
};
pub use container::{provision, ContainerProps, Provisioned, POSTGRES_CONTAINER_PREFIX};
pub use error::PostgresError;
pub use scheduler::{BackupScheduler, ScheduledJob};
