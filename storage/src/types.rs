use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Represents an object in storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageObject {
    /// Key (path) of the object
    pub key: String,
    /// Size of the object in bytes
    pub size: u64,
    /// Last modified time
    pub last_modified: Option<DateTime<Utc>>,
    pub etag: Option<String>,
}

/// Connection settings for an S3-compatible endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageConfig {
    pub region: Option<String>,
    /// Custom endpoint URL, switches the client to path-style addressing
    pub endpoint: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
}

/// A WAL-G base backup found in a bucket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupEntry {
    /// Backup name as accepted by `wal-g backup-fetch`, e.g. `base_000000010000000000000002`
    pub name: String,
    pub modified: Option<DateTime<Utc>>,
    /// Size of the stop sentinel object
    pub sentinel_size: u64,
}
