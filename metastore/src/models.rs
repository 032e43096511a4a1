use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Engine type accepted for new clusters
pub const POSTGRES_ENGINE: &str = "postgres";

/// Destination name accepted for backups
pub const AWS_DESTINATION: &str = "AWS";

/// A provisioned database cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterInfo {
    #[serde(default)]
    pub architecture: String,
    #[serde(rename = "type", default)]
    pub engine_type: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub cluster_id: String,
    pub name: String,
    #[serde(default)]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(rename = "majversion")]
    pub maj_version: u32,
    #[serde(rename = "minversion", default)]
    pub min_version: u32,
    #[serde(default)]
    pub monitoring: bool,
    /// CPU shares, 0 leaves the engine default
    #[serde(default)]
    pub cpu: i64,
    /// Memory limit in bytes, 0 leaves the engine default
    #[serde(default)]
    pub memory: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<BackupConfig>,
}

impl ClusterInfo {
    pub fn new(name: &str, username: &str, password: &str, maj_version: u32, min_version: u32) -> Self {
        Self {
            architecture: String::new(),
            engine_type: POSTGRES_ENGINE.to_string(),
            host: String::new(),
            id: 0,
            cluster_id: String::new(),
            name: name.to_string(),
            port: 0,
            username: username.to_string(),
            password: password.to_string(),
            maj_version,
            min_version,
            monitoring: false,
            cpu: 0,
            memory: 0,
            backup: None,
        }
    }

    pub fn version(&self) -> String {
        format!("{}.{}", self.maj_version, self.min_version)
    }
}

/// When and where a cluster is backed up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupConfig {
    #[serde(default)]
    pub schedule: Schedule,
    #[serde(rename = "dest")]
    pub destination: Destination,
}

/// Five cron fields; an unset field matches every value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    #[serde(default, deserialize_with = "cron_field", skip_serializing_if = "Option::is_none")]
    pub minute: Option<String>,
    #[serde(default, deserialize_with = "cron_field", skip_serializing_if = "Option::is_none")]
    pub hour: Option<String>,
    #[serde(default, deserialize_with = "cron_field", skip_serializing_if = "Option::is_none")]
    pub dom: Option<String>,
    #[serde(default, deserialize_with = "cron_field", skip_serializing_if = "Option::is_none")]
    pub month: Option<String>,
    #[serde(default, deserialize_with = "cron_field", skip_serializing_if = "Option::is_none")]
    pub dow: Option<String>,
}

impl Schedule {
    /// Renders the schedule as a five field cron expression.
    pub fn cron_expression(&self) -> String {
        [&self.minute, &self.hour, &self.dom, &self.month, &self.dow]
            .iter()
            .map(|field| match field.as_deref().map(str::trim) {
                Some(value) if !value.is_empty() => value.to_string(),
                _ => "*".to_string(),
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.cron_expression())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CronValue {
    Text(String),
    Number(u64),
}

fn cron_field<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<CronValue>::deserialize(deserializer)?.map(|value| match value {
        CronValue::Text(text) => text,
        CronValue::Number(number) => number.to_string(),
    }))
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    pub name: String,
    #[serde(rename = "bucketName")]
    pub bucket_name: String,
    #[serde(rename = "apiKeyID")]
    pub api_key_id: String,
    #[serde(rename = "apiKeySecret")]
    pub api_key_secret: String,
}

impl fmt::Debug for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Destination")
            .field("name", &self.name)
            .field("bucket_name", &self.bucket_name)
            .field("api_key_id", &self.api_key_id)
            .field("api_key_secret", &"<redacted>")
            .finish()
    }
}
