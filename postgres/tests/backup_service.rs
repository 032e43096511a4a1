use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use engine::fake::FakeEngine;
use engine::{Client, Container, ContainerSpec, ContainerState};
use metastore::{
    BackupConfig, ClusterInfo, Destination, MetadataStore, Schedule, SqliteStore, StoreError,
};
use mockall::mock;
use postgres::{
    BackupOptions, BackupScheduler, BackupService, CatalogFactory, PostgresError,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use storage::{StorageError, StorageObject, StorageProvider, WalgCatalog};

const DB_CONTAINER: &str = "pgdock-postgres-orders";
const HELPER: &str = "pgdock-pg-restore-orders";
const RUNNER_IMAGE: &str = "spinuphost/walg:latest";
const SENTINEL: &str = "basebackups_005/base_000000010000000000000002_backup_stop_sentinel.json";

mock! {
    pub Store {}

    #[async_trait]
    impl MetadataStore for Store {
        async fn insert_service(&self, cluster: &ClusterInfo) -> Result<i64, StoreError>;
        async fn insert_backup(&self, cluster_id: &str, backup: &BackupConfig) -> Result<i64, StoreError>;
        async fn all_clusters(&self) -> Result<Vec<ClusterInfo>, StoreError>;
        async fn get_cluster_by_id(&self, cluster_id: &str) -> Result<ClusterInfo, StoreError>;
        async fn get_backup_config_for_cluster(&self, cluster_id: &str) -> Result<BackupConfig, StoreError>;
        async fn all_backups(&self) -> Result<Vec<(String, BackupConfig)>, StoreError>;
    }
}

struct Bucket {
    keys: Vec<String>,
}

#[async_trait]
impl StorageProvider for Bucket {
    fn name(&self) -> &str {
        "memory"
    }

    async fn list_objects(
        &self,
        _bucket: &str,
        prefix: Option<&str>,
    ) -> Result<Vec<StorageObject>, StorageError> {
        Ok(self
            .keys
            .iter()
            .filter(|key| key.starts_with(prefix.unwrap_or_default()))
            .map(|key| StorageObject {
                key: key.clone(),
                size: 42,
                last_modified: Utc.timestamp_opt(1_700_000_000, 0).single(),
                etag: None,
            })
            .collect())
    }

    async fn object_exists(&self, _bucket: &str, key: &str) -> Result<bool, StorageError> {
        Ok(self.keys.iter().any(|k| k == key))
    }
}

struct MemoryCatalogs {
    keys: Vec<String>,
}

#[async_trait]
impl CatalogFactory for MemoryCatalogs {
    async fn catalog(&self, destination: &Destination) -> Result<WalgCatalog, PostgresError> {
        let bucket = Bucket {
            keys: self.keys.clone(),
        };
        Ok(WalgCatalog::new(
            Box::new(bucket),
            &format!("s3://{}", destination.bucket_name),
        )?)
    }
}

fn cluster() -> ClusterInfo {
    let mut cluster = ClusterInfo::new("orders", "app", "s3cret", 16, 2);
    cluster.cluster_id = "c1".into();
    cluster.port = 5433;
    cluster
}

fn backup_config(minute: &str) -> BackupConfig {
    BackupConfig {
        schedule: Schedule {
            minute: Some(minute.into()),
            hour: Some("3".into()),
            ..Schedule::default()
        },
        destination: Destination {
            name: "AWS".into(),
            bucket_name: "orders-backups".into(),
            api_key_id: "AKIA".into(),
            api_key_secret: "secret".into(),
        },
    }
}

fn options(restore_dir: &Path, verify: bool) -> BackupOptions {
    BackupOptions {
        network: "pgdock_services".into(),
        backup_image: RUNNER_IMAGE.into(),
        restore_dir: restore_dir.to_path_buf(),
        verify_before_restore: verify,
    }
}

fn client(fake: &Arc<FakeEngine>) -> Client {
    Client::new(fake.clone(), Duration::from_secs(1), Duration::from_secs(5))
}

async fn running_database(fake: &Arc<FakeEngine>) {
    let spec = ContainerSpec::new(DB_CONTAINER, "amd64/postgres:16.2").with_network("pgdock_services");
    client(fake).start(&mut Container::new(spec)).await.unwrap();
    fake.add_image(RUNNER_IMAGE);
    fake.clear_ops();
}

struct Harness {
    fake: Arc<FakeEngine>,
    store: SqliteStore,
    service: BackupService,
    restore_dir: tempfile::TempDir,
}

async fn harness(verify: bool, keys: &[&str]) -> Harness {
    let fake = Arc::new(FakeEngine::new());
    let store = SqliteStore::in_memory().await.unwrap();
    let restore_dir = tempfile::tempdir().unwrap();
    let service = BackupService::new(
        client(&fake),
        Arc::new(store.clone()),
        Arc::new(BackupScheduler::new()),
        Arc::new(MemoryCatalogs {
            keys: keys.iter().map(|k| k.to_string()).collect(),
        }),
        options(restore_dir.path(), verify),
    );
    Harness {
        fake,
        store,
        service,
        restore_dir,
    }
}

fn position(ops: &[String], prefix: &str) -> usize {
    ops.iter()
        .position(|op| op.starts_with(prefix))
        .unwrap_or_else(|| panic!("no `{prefix}` in {ops:?}"))
}

#[tokio::test]
async fn invalid_destination_is_rejected_before_store_or_engine() {
    let fake = Arc::new(FakeEngine::new());
    let service = BackupService::new(
        client(&fake),
        Arc::new(MockStore::new()),
        Arc::new(BackupScheduler::new()),
        Arc::new(MemoryCatalogs { keys: vec![] }),
        options(Path::new("/tmp"), false),
    );

    let mut config = backup_config("0");
    config.destination.api_key_secret.clear();
    let err = service.create_backup("c1", &config).await.unwrap_err();

    assert!(matches!(err, PostgresError::InvalidBackupConfig(_)));
    assert!(fake.ops().is_empty());
}

#[tokio::test]
async fn invalid_schedule_is_rejected_before_persisting() {
    let fake = Arc::new(FakeEngine::new());
    running_database(&fake).await;

    let mut store = MockStore::new();
    store
        .expect_get_cluster_by_id()
        .times(1)
        .returning(|_| Ok(cluster()));
    store.expect_insert_backup().never();

    let service = BackupService::new(
        client(&fake),
        Arc::new(store),
        Arc::new(BackupScheduler::new()),
        Arc::new(MemoryCatalogs { keys: vec![] }),
        options(Path::new("/tmp"), false),
    );

    let err = service
        .create_backup("c1", &backup_config("99"))
        .await
        .unwrap_err();

    assert!(err.is_user_error());
    assert!(matches!(err, PostgresError::InvalidSchedule { .. }));
    assert!(fake.uploads().is_empty());
    assert!(!service.scheduler().is_scheduled("c1"));
}

#[tokio::test]
async fn create_backup_needs_a_database_container() {
    let h = harness(false, &[]).await;
    h.store.insert_service(&cluster()).await.unwrap();

    let err = h
        .service
        .create_backup("c1", &backup_config("0"))
        .await
        .unwrap_err();

    assert!(matches!(err, PostgresError::ContainerMissing(name) if name == DB_CONTAINER));
    assert!(h.store.get_backup_config_for_cluster("c1").await.is_err());
}

#[tokio::test]
async fn create_backup_for_unknown_cluster() {
    let h = harness(false, &[]).await;

    let err = h
        .service
        .create_backup("missing", &backup_config("0"))
        .await
        .unwrap_err();

    assert!(matches!(err, PostgresError::ClusterNotFound(id) if id == "missing"));
}

#[tokio::test]
async fn create_backup_patches_database_and_schedules() {
    let h = harness(false, &[]).await;
    h.store.insert_service(&cluster()).await.unwrap();
    running_database(&h.fake).await;

    h.service
        .create_backup("c1", &backup_config("0"))
        .await
        .unwrap();

    let stored = h.store.get_backup_config_for_cluster("c1").await.unwrap();
    assert_eq!(stored.schedule.cron_expression(), "0 3 * * *");

    let uploads = h.fake.uploads();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].container, DB_CONTAINER);
    assert_eq!(uploads[0].path, "/etc/postgresql");

    let programs: Vec<String> = h
        .fake
        .execs()
        .iter()
        .map(|exec| exec.command.program().to_string())
        .collect();
    assert_eq!(programs, vec!["./modify-pghba", "pg_ctl"]);

    assert_eq!(
        h.service.scheduler().scheduled(),
        vec![("c1".to_string(), "0 3 * * *".to_string())]
    );
}

#[tokio::test]
async fn failed_hba_patch_is_reported_with_step() {
    let h = harness(false, &[]).await;
    h.store.insert_service(&cluster()).await.unwrap();
    running_database(&h.fake).await;
    h.fake.set_exit_code("./modify-pghba", 1);

    let err = h
        .service
        .create_backup("c1", &backup_config("0"))
        .await
        .unwrap_err();

    assert!(err.to_string().starts_with("updating pg_hba.conf"));
    assert!(!h.service.scheduler().is_scheduled("c1"));
}

#[tokio::test]
async fn sync_schedules_picks_up_stored_backups_once() {
    let h = harness(false, &[]).await;
    h.store.insert_service(&cluster()).await.unwrap();
    h.store
        .insert_backup("c1", &backup_config("15"))
        .await
        .unwrap();

    assert_eq!(h.service.sync_schedules().await.unwrap(), 1);
    assert_eq!(h.service.sync_schedules().await.unwrap(), 0);

    h.store
        .insert_backup("c1", &backup_config("45"))
        .await
        .unwrap();
    assert_eq!(h.service.sync_schedules().await.unwrap(), 1);
    assert_eq!(
        h.service.scheduler().scheduled(),
        vec![("c1".to_string(), "45 3 * * *".to_string())]
    );
}

#[tokio::test]
async fn sync_schedules_replaces_a_changed_destination() {
    let h = harness(false, &[]).await;
    h.store.insert_service(&cluster()).await.unwrap();
    h.store
        .insert_backup("c1", &backup_config("15"))
        .await
        .unwrap();
    assert_eq!(h.service.sync_schedules().await.unwrap(), 1);

    let mut moved = backup_config("15");
    moved.destination.bucket_name = "orders-archive".into();
    h.store.insert_backup("c1", &moved).await.unwrap();

    assert_eq!(h.service.sync_schedules().await.unwrap(), 1);
    assert_eq!(h.service.sync_schedules().await.unwrap(), 0);
}

#[tokio::test]
async fn sync_schedules_skips_backups_of_missing_clusters() {
    let h = harness(false, &[]).await;
    h.store
        .insert_backup("gone", &backup_config("5"))
        .await
        .unwrap();
    h.store.insert_service(&cluster()).await.unwrap();
    h.store
        .insert_backup("c1", &backup_config("15"))
        .await
        .unwrap();

    assert_eq!(h.service.sync_schedules().await.unwrap(), 1);
    assert_eq!(
        h.service.scheduler().scheduled(),
        vec![("c1".to_string(), "15 3 * * *".to_string())]
    );
}

#[tokio::test]
async fn list_backups_reads_the_stored_bucket() {
    let h = harness(false, &[SENTINEL, "wal_005/000000010000000000000002.br"]).await;
    h.store.insert_service(&cluster()).await.unwrap();
    h.store
        .insert_backup("c1", &backup_config("0"))
        .await
        .unwrap();

    let backups = h.service.list_backups("c1").await.unwrap();

    assert_eq!(backups.len(), 1);
    assert_eq!(backups[0].name, "base_000000010000000000000002");
}

#[tokio::test]
async fn restore_swaps_the_data_directory_in_order() {
    let h = harness(false, &[]).await;
    h.store.insert_service(&cluster()).await.unwrap();
    h.store
        .insert_backup("c1", &backup_config("0"))
        .await
        .unwrap();
    running_database(&h.fake).await;

    h.service.restore("pgdock_services", "c1", "").await.unwrap();

    let ops = h.fake.ops();
    let fetch = position(&ops, &format!("exec {HELPER} wal-g backup-fetch /tmp/restore/"));
    let chmod = position(&ops, &format!("exec {HELPER} chmod -R 777"));
    let stop_db = position(&ops, &format!("stop {DB_CONTAINER}"));
    let copy = position(&ops, &format!("upload {DB_CONTAINER} /var/lib/postgresql/data"));
    let stop_helper = position(&ops, &format!("stop {HELPER}"));
    let restart = position(&ops, &format!("restart {DB_CONTAINER}"));
    assert!(position(&ops, &format!("start {HELPER}")) < fetch);
    assert!(fetch < chmod && chmod < stop_db && stop_db < copy);
    assert!(copy < stop_helper && stop_helper < restart);
    assert!(ops[fetch].ends_with(" LATEST"));

    let helper = h.fake.container_named(HELPER).unwrap();
    assert_eq!(helper.spec.entrypoint, Some(vec!["sleep".to_string()]));
    assert!(helper
        .spec
        .env
        .contains(&"WALG_S3_PREFIX=s3://orders-backups".to_string()));

    let dirs: Vec<String> = std::fs::read_dir(h.restore_dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(dirs.len(), 1);
    assert!(dirs[0].starts_with("pgdock-restore-LATEST"));

    let database = h.fake.container_named(DB_CONTAINER).unwrap();
    assert_eq!(database.state, ContainerState::Running);
}

#[tokio::test]
async fn restore_without_database_container_touches_nothing() {
    let h = harness(false, &[]).await;
    h.store.insert_service(&cluster()).await.unwrap();
    h.store
        .insert_backup("c1", &backup_config("0"))
        .await
        .unwrap();

    let err = h
        .service
        .restore("pgdock_services", "c1", "base_000000010000000000000002")
        .await
        .unwrap_err();

    assert!(matches!(err, PostgresError::ContainerMissing(_)));
    assert!(h.fake.ops().is_empty());
    assert!(h.fake.container_named(HELPER).is_none());
}

#[tokio::test]
async fn restore_rejects_backup_names_leaving_the_restore_dir() {
    let h = harness(false, &[]).await;
    h.store.insert_service(&cluster()).await.unwrap();
    h.store
        .insert_backup("c1", &backup_config("0"))
        .await
        .unwrap();
    running_database(&h.fake).await;

    let err = h
        .service
        .restore("pgdock_services", "c1", "../../etc")
        .await
        .unwrap_err();

    assert!(matches!(err, PostgresError::InvalidBackupName(_)));
    assert!(err.is_user_error());
    assert!(h.fake.ops().is_empty());
    assert_eq!(std::fs::read_dir(h.restore_dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn failed_fetch_leaves_database_running() {
    let h = harness(false, &[]).await;
    h.store.insert_service(&cluster()).await.unwrap();
    h.store
        .insert_backup("c1", &backup_config("0"))
        .await
        .unwrap();
    running_database(&h.fake).await;
    h.fake.set_exit_code("wal-g", 1);

    let err = h
        .service
        .restore("pgdock_services", "c1", "")
        .await
        .unwrap_err();

    assert!(err.to_string().contains("wal-g"));
    let ops = h.fake.ops();
    assert!(!ops.iter().any(|op| op == &format!("stop {DB_CONTAINER}")));
    assert!(ops.iter().any(|op| op == &format!("stop {HELPER}")));
    assert_eq!(
        h.fake.container_named(DB_CONTAINER).unwrap().state,
        ContainerState::Running
    );
}

#[tokio::test]
async fn restore_replaces_a_leftover_helper() {
    let h = harness(false, &[]).await;
    h.store.insert_service(&cluster()).await.unwrap();
    h.store
        .insert_backup("c1", &backup_config("0"))
        .await
        .unwrap();
    running_database(&h.fake).await;
    let stale = ContainerSpec::new(HELPER, RUNNER_IMAGE);
    client(&h.fake)
        .start(&mut Container::new(stale))
        .await
        .unwrap();
    h.fake.clear_ops();

    h.service.restore("pgdock_services", "c1", "").await.unwrap();

    let ops = h.fake.ops();
    assert_eq!(ops[0], format!("stop {HELPER}"));
    assert_eq!(ops[1], format!("remove {HELPER}"));
    assert_eq!(ops[2], format!("create {HELPER}"));
}

#[tokio::test]
async fn verification_rejects_unknown_backups() {
    let h = harness(true, &[SENTINEL]).await;
    h.store.insert_service(&cluster()).await.unwrap();
    h.store
        .insert_backup("c1", &backup_config("0"))
        .await
        .unwrap();
    running_database(&h.fake).await;

    let err = h
        .service
        .restore("pgdock_services", "c1", "base_000000010000000000000009")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PostgresError::BackupNotFound { ref bucket, .. } if bucket == "orders-backups"
    ));
    assert!(h.fake.ops().is_empty());

    h.service
        .restore("pgdock_services", "c1", "base_000000010000000000000002")
        .await
        .unwrap();
}
