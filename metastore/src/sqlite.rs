use async_trait::async_trait;
use log::{debug, info};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;

use crate::{BackupConfig, ClusterInfo, Destination, MetadataStore, Schedule, StoreError};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

const CLUSTER_COLUMNS: &str = "id, clusterId, name, username, password, port, majVersion, \
                               minVersion, architecture, monitoring, cpu, memory";

const BACKUP_COLUMNS: &str = "clusterid, destination, bucket, aws_access_key, aws_secret_key, \
                              minute, hour, dom, month, dow";

/// [`MetadataStore`] on a SQLite database file.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens or creates the database at `path` and applies pending migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(Self::connect_options(&url)?)
            .await?;
        info!("Opened metadata store at {}", path.display());
        Self::migrated(pool).await
    }

    /// Private in-memory database, mostly for tests.
    pub async fn in_memory() -> Result<Self, StoreError> {
        // a single connection keeps every query on the same in-memory database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(Self::connect_options("sqlite::memory:")?)
            .await?;
        Self::migrated(pool).await
    }

    // backup rows may reference clusters recorded by an older install
    fn connect_options(url: &str) -> Result<SqliteConnectOptions, StoreError> {
        Ok(SqliteConnectOptions::from_str(url)?.foreign_keys(false))
    }

    async fn migrated(pool: SqlitePool) -> Result<Self, StoreError> {
        MIGRATOR.run(&pool).await?;
        Ok(Self { pool })
    }

    fn cluster_from_row(row: &SqliteRow) -> Result<ClusterInfo, StoreError> {
        Ok(ClusterInfo {
            architecture: row.try_get("architecture")?,
            engine_type: crate::POSTGRES_ENGINE.to_string(),
            host: String::new(),
            id: row.try_get("id")?,
            cluster_id: row.try_get::<Option<String>, _>("clusterId")?.unwrap_or_default(),
            name: row.try_get::<Option<String>, _>("name")?.unwrap_or_default(),
            port: Self::int_column(row, "port")?,
            username: row.try_get::<Option<String>, _>("username")?.unwrap_or_default(),
            password: row.try_get::<Option<String>, _>("password")?.unwrap_or_default(),
            maj_version: Self::int_column(row, "majVersion")?,
            min_version: Self::int_column(row, "minVersion")?,
            monitoring: row.try_get("monitoring")?,
            cpu: row.try_get("cpu")?,
            memory: row.try_get("memory")?,
            backup: None,
        })
    }

    /// Reads a nullable integer column into a narrower type, NULL as zero.
    fn int_column<T>(row: &SqliteRow, column: &'static str) -> Result<T, StoreError>
    where
        T: TryFrom<i64> + Default,
    {
        match row.try_get::<Option<i64>, _>(column)? {
            None => Ok(T::default()),
            Some(value) => {
                T::try_from(value).map_err(|_| StoreError::OutOfRange { column, value })
            }
        }
    }

    fn backup_from_row(row: &SqliteRow) -> Result<(String, BackupConfig), StoreError> {
        let text = |column: &str| -> Result<String, StoreError> {
            Ok(row.try_get::<Option<String>, _>(column)?.unwrap_or_default())
        };
        let field = |column: &str| -> Result<Option<String>, StoreError> {
            Ok(row.try_get::<Option<String>, _>(column)?)
        };

        let config = BackupConfig {
            schedule: Schedule {
                minute: field("minute")?,
                hour: field("hour")?,
                dom: field("dom")?,
                month: field("month")?,
                dow: field("dow")?,
            },
            destination: Destination {
                name: text("destination")?,
                bucket_name: text("bucket")?,
                api_key_id: text("aws_access_key")?,
                api_key_secret: text("aws_secret_key")?,
            },
        };
        Ok((text("clusterid")?, config))
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn insert_service(&self, cluster: &ClusterInfo) -> Result<i64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "INSERT INTO clusterInfo (clusterId, name, username, password, port, majVersion, \
             minVersion, architecture, monitoring, cpu, memory) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&cluster.cluster_id)
        .bind(&cluster.name)
        .bind(&cluster.username)
        .bind(&cluster.password)
        .bind(cluster.port as i64)
        .bind(cluster.maj_version as i64)
        .bind(cluster.min_version as i64)
        .bind(&cluster.architecture)
        .bind(cluster.monitoring)
        .bind(cluster.cpu)
        .bind(cluster.memory)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        debug!("rows inserted into clusterInfo table: {}", result.rows_affected());
        Ok(result.last_insert_rowid())
    }

    async fn insert_backup(
        &self,
        cluster_id: &str,
        backup: &BackupConfig,
    ) -> Result<i64, StoreError> {
        let schedule = &backup.schedule;
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "INSERT INTO backup (clusterid, destination, bucket, aws_secret_key, aws_access_key, \
             minute, hour, dom, month, dow) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(cluster_id)
        .bind(&backup.destination.name)
        .bind(&backup.destination.bucket_name)
        .bind(&backup.destination.api_key_secret)
        .bind(&backup.destination.api_key_id)
        .bind(&schedule.minute)
        .bind(&schedule.hour)
        .bind(&schedule.dom)
        .bind(&schedule.month)
        .bind(&schedule.dow)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        debug!("rows inserted into backup table: {}", result.rows_affected());
        Ok(result.last_insert_rowid())
    }

    async fn all_clusters(&self) -> Result<Vec<ClusterInfo>, StoreError> {
        let rows = sqlx::query(&format!("SELECT {CLUSTER_COLUMNS} FROM clusterInfo ORDER BY id"))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::cluster_from_row).collect()
    }

    async fn get_cluster_by_id(&self, cluster_id: &str) -> Result<ClusterInfo, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {CLUSTER_COLUMNS} FROM clusterInfo WHERE clusterId = ? ORDER BY id DESC LIMIT 1"
        ))
        .bind(cluster_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound {
            kind: "cluster",
            id: cluster_id.to_string(),
        })?;
        Self::cluster_from_row(&row)
    }

    async fn get_backup_config_for_cluster(
        &self,
        cluster_id: &str,
    ) -> Result<BackupConfig, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {BACKUP_COLUMNS} FROM backup WHERE clusterid = ? ORDER BY id DESC LIMIT 1"
        ))
        .bind(cluster_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound {
            kind: "backup config for cluster",
            id: cluster_id.to_string(),
        })?;
        Ok(Self::backup_from_row(&row)?.1)
    }

    async fn all_backups(&self) -> Result<Vec<(String, BackupConfig)>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {BACKUP_COLUMNS} FROM backup WHERE id IN \
             (SELECT MAX(id) FROM backup GROUP BY clusterid) ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::backup_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(name: &str, cluster_id: &str) -> ClusterInfo {
        let mut cluster = ClusterInfo::new(name, "postgres", "secret", 16, 2);
        cluster.cluster_id = cluster_id.to_string();
        cluster.port = 5433;
        cluster.architecture = "arm64v8".to_string();
        cluster.monitoring = true;
        cluster.memory = 512 * 1024 * 1024;
        cluster
    }

    fn backup(bucket: &str, minute: &str) -> BackupConfig {
        BackupConfig {
            schedule: Schedule {
                minute: Some(minute.to_string()),
                hour: Some("3".to_string()),
                ..Default::default()
            },
            destination: Destination {
                name: "AWS".to_string(),
                bucket_name: bucket.to_string(),
                api_key_id: "AKIA".to_string(),
                api_key_secret: "secret".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn inserted_cluster_reads_back() {
        let store = SqliteStore::in_memory().await.unwrap();
        let id = store.insert_service(&cluster("orders", "c1")).await.unwrap();

        let found = store.get_cluster_by_id("c1").await.unwrap();
        assert_eq!(found.id, id);
        assert_eq!(found.name, "orders");
        assert_eq!(found.port, 5433);
        assert_eq!(found.version(), "16.2");
        assert_eq!(found.architecture, "arm64v8");
        assert!(found.monitoring);
        assert_eq!(found.memory, 512 * 1024 * 1024);
    }

    #[tokio::test]
    async fn missing_cluster_is_not_found() {
        let store = SqliteStore::in_memory().await.unwrap();
        let err = store.get_cluster_by_id("nope").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn out_of_range_port_is_an_error() {
        let store = SqliteStore::in_memory().await.unwrap();
        sqlx::query(
            "INSERT INTO clusterInfo (clusterId, name, port, majVersion, minVersion) \
             VALUES ('c1', 'orders', 70000, 16, 2)",
        )
        .execute(&store.pool)
        .await
        .unwrap();

        let err = store.get_cluster_by_id("c1").await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::OutOfRange {
                column: "port",
                value: 70000
            }
        ));
    }

    #[tokio::test]
    async fn null_version_columns_read_as_zero() {
        let store = SqliteStore::in_memory().await.unwrap();
        sqlx::query("INSERT INTO clusterInfo (clusterId, name) VALUES ('c1', 'orders')")
            .execute(&store.pool)
            .await
            .unwrap();

        let found = store.get_cluster_by_id("c1").await.unwrap();
        assert_eq!((found.port, found.maj_version, found.min_version), (0, 0, 0));
    }

    #[tokio::test]
    async fn all_clusters_keeps_insertion_order() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.insert_service(&cluster("a", "c1")).await.unwrap();
        store.insert_service(&cluster("b", "c2")).await.unwrap();

        let names: Vec<String> = store
            .all_clusters()
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn latest_backup_config_wins() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.insert_service(&cluster("a", "c1")).await.unwrap();
        store.insert_backup("c1", &backup("first", "0")).await.unwrap();
        store.insert_backup("c1", &backup("second", "15")).await.unwrap();

        let config = store.get_backup_config_for_cluster("c1").await.unwrap();
        assert_eq!(config.destination.bucket_name, "second");
        assert_eq!(config.destination.api_key_id, "AKIA");
        assert_eq!(config.destination.api_key_secret, "secret");
        assert_eq!(config.schedule.cron_expression(), "15 3 * * *");
    }

    #[tokio::test]
    async fn backup_for_unknown_cluster_is_not_found() {
        let store = SqliteStore::in_memory().await.unwrap();
        assert!(store
            .get_backup_config_for_cluster("c9")
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn all_backups_returns_latest_per_cluster() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.insert_backup("c1", &backup("old", "0")).await.unwrap();
        store.insert_backup("c2", &backup("other", "5")).await.unwrap();
        store.insert_backup("c1", &backup("new", "10")).await.unwrap();

        let backups = store.all_backups().await.unwrap();
        let summary: Vec<(&str, &str)> = backups
            .iter()
            .map(|(id, config)| (id.as_str(), config.destination.bucket_name.as_str()))
            .collect();
        assert_eq!(summary, vec![("c2", "other"), ("c1", "new")]);
    }

    #[tokio::test]
    async fn file_store_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("pgdock.db");

        let store = SqliteStore::from_path(&path).await.unwrap();
        store.insert_service(&cluster("a", "c1")).await.unwrap();
        drop(store);

        let reopened = SqliteStore::from_path(&path).await.unwrap();
        assert_eq!(reopened.all_clusters().await.unwrap().len(), 1);
    }
}
