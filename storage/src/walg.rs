use log::debug;

use crate::{BackupEntry, StorageError, StorageProvider};

/// Backup name WAL-G resolves to the newest base backup
pub const LATEST_BACKUP: &str = "LATEST";

const BASEBACKUP_DIR: &str = "basebackups_005/";
const SENTINEL_SUFFIX: &str = "_backup_stop_sentinel.json";

/// Base backups WAL-G stored under a `s3://bucket[/path]` prefix.
///
/// Every completed base backup leaves a stop sentinel object next to its
/// data directory; the sentinel is what marks the backup as usable.
pub struct WalgCatalog {
    provider: Box<dyn StorageProvider>,
    bucket: String,
    prefix: String,
}

impl WalgCatalog {
    /// Builds a catalog for a `WALG_S3_PREFIX` style location.
    pub fn new(provider: Box<dyn StorageProvider>, s3_prefix: &str) -> Result<Self, StorageError> {
        let location = s3_prefix.strip_prefix("s3://").ok_or_else(|| {
            StorageError::Configuration(format!("{s3_prefix} is not an s3:// location"))
        })?;
        let (bucket, path) = location.split_once('/').unwrap_or((location, ""));
        if bucket.is_empty() {
            return Err(StorageError::Configuration(format!(
                "{s3_prefix} does not name a bucket"
            )));
        }

        let path = path.trim_matches('/');
        let prefix = if path.is_empty() {
            BASEBACKUP_DIR.to_string()
        } else {
            format!("{path}/{BASEBACKUP_DIR}")
        };

        Ok(Self {
            provider,
            bucket: bucket.to_string(),
            prefix,
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Lists completed base backups, oldest first.
    pub async fn list_backups(&self) -> Result<Vec<BackupEntry>, StorageError> {
        let objects = self
            .provider
            .list_objects(&self.bucket, Some(&self.prefix))
            .await?;

        let mut backups: Vec<BackupEntry> = objects
            .into_iter()
            .filter_map(|object| {
                let name = object
                    .key
                    .strip_prefix(&self.prefix)?
                    .strip_suffix(SENTINEL_SUFFIX)?;
                // sentinels sit at the top of the directory
                if name.is_empty() || name.contains('/') {
                    return None;
                }
                Some(BackupEntry {
                    name: name.to_string(),
                    modified: object.last_modified,
                    sentinel_size: object.size,
                })
            })
            .collect();

        backups.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.name.cmp(&b.name)));
        debug!(
            "Found {} base backups in s3://{}/{}",
            backups.len(),
            self.bucket,
            self.prefix
        );
        Ok(backups)
    }

    /// Resolves a backup name; an empty name or `LATEST` picks the newest backup.
    pub async fn resolve(&self, name: &str) -> Result<BackupEntry, StorageError> {
        let backups = self.list_backups().await?;
        let found = if name.is_empty() || name == LATEST_BACKUP {
            backups.into_iter().last()
        } else {
            backups.into_iter().find(|backup| backup.name == name)
        };

        found.ok_or_else(|| {
            StorageError::NotFound(format!(
                "backup {} in s3://{}",
                if name.is_empty() { LATEST_BACKUP } else { name },
                self.bucket
            ))
        })
    }

    /// Checks the stop sentinel of a named backup directly.
    pub async fn exists(&self, name: &str) -> Result<bool, StorageError> {
        if name.is_empty() || name == LATEST_BACKUP {
            return Ok(!self.list_backups().await?.is_empty());
        }
        let key = format!("{}{name}{SENTINEL_SUFFIX}", self.prefix);
        self.provider.object_exists(&self.bucket, &key).await
    }
}
