use engine::fake::FakeEngine;
use engine::{Client, ContainerState};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use crate::{MonitorError, MonitorRuntime, MonitorSettings, Target};

const NETWORK: &str = "pgdock_test";

fn settings(dir: &TempDir) -> MonitorSettings {
    MonitorSettings {
        network: NETWORK.to_string(),
        root_dir: dir.path().join("monitoring").join(NETWORK),
        exporter_image: "quay.io/prometheuscommunity/postgres-exporter:latest".to_string(),
        prometheus_image: "bitnami/prometheus:latest".to_string(),
        grafana_image: "grafana/grafana-oss:latest".to_string(),
    }
}

fn runtime(fake: &Arc<FakeEngine>, dir: &TempDir) -> MonitorRuntime {
    let client = Client::new(fake.clone(), Duration::from_secs(1), Duration::from_secs(5));
    MonitorRuntime::new(client, settings(dir))
}

fn target(name: &str, port: u16) -> Target {
    Target {
        container_name: format!("pgdock-postgres-{name}"),
        username: "postgres".to_string(),
        password: format!("{name}-pw"),
        port,
    }
}

fn exporter_dsn(fake: &FakeEngine, settings: &MonitorSettings) -> Option<String> {
    fake.container_named(&settings.exporter_name())?
        .spec
        .env
        .iter()
        .find_map(|entry| entry.strip_prefix("DATA_SOURCE_NAME=").map(str::to_string))
}

#[tokio::test]
async fn bootstrap_creates_stack_and_writes_config() {
    let fake = Arc::new(FakeEngine::new());
    let dir = tempfile::tempdir().unwrap();
    let runtime = runtime(&fake, &dir);

    runtime.bootstrap().await.unwrap();

    let settings = runtime.settings();
    for name in [
        settings.prometheus_name(),
        settings.exporter_name(),
        settings.grafana_name(),
    ] {
        let container = fake.container_named(&name).unwrap();
        assert_eq!(container.state, ContainerState::Running, "{name}");
        assert_eq!(container.spec.network.as_deref(), Some(NETWORK));
    }
    assert_eq!(runtime.gateway().await.as_deref(), Some(FakeEngine::GATEWAY));
    assert_eq!(runtime.dsn().await, "");
    assert_eq!(exporter_dsn(&fake, settings), None);

    let prometheus = std::fs::read_to_string(settings.prometheus_config_path()).unwrap();
    assert!(prometheus.contains(&format!("{}:9090", FakeEngine::GATEWAY)));
    assert!(prometheus.contains(&format!("{}:9187", FakeEngine::GATEWAY)));
    let datasource = std::fs::read_to_string(settings.grafana_datasource_path()).unwrap();
    assert!(datasource.contains(&format!("http://{}:9090", FakeEngine::GATEWAY)));
    assert!(settings.prometheus_data_dir().is_dir());
}

#[tokio::test]
async fn second_bootstrap_reuses_containers_and_restarts_grafana() {
    let fake = Arc::new(FakeEngine::new());
    let dir = tempfile::tempdir().unwrap();
    let runtime = runtime(&fake, &dir);

    runtime.bootstrap().await.unwrap();
    runtime.bootstrap().await.unwrap();

    let ops = fake.ops();
    let creates = ops.iter().filter(|op| op.starts_with("create ")).count();
    assert_eq!(creates, 3);
    let grafana_restarts = ops
        .iter()
        .filter(|op| **op == format!("restart {}", runtime.settings().grafana_name()))
        .count();
    assert_eq!(grafana_restarts, 2);
    assert_eq!(fake.networks().len(), 1);
}

#[tokio::test]
async fn existing_prometheus_keeps_its_config() {
    let fake = Arc::new(FakeEngine::new());
    let dir = tempfile::tempdir().unwrap();
    runtime(&fake, &dir).bootstrap().await.unwrap();

    let config_path = settings(&dir).prometheus_config_path();
    std::fs::write(&config_path, "# edited by hand\n").unwrap();

    runtime(&fake, &dir).bootstrap().await.unwrap();
    assert_eq!(
        std::fs::read_to_string(&config_path).unwrap(),
        "# edited by hand\n"
    );
}

#[tokio::test]
async fn failed_bootstrap_stops_what_it_started() {
    let fake = Arc::new(FakeEngine::new());
    let dir = tempfile::tempdir().unwrap();
    let runtime = runtime(&fake, &dir);
    fake.fail_start_of(&runtime.settings().grafana_name());

    let err = runtime.bootstrap().await.unwrap_err();
    assert!(matches!(err, MonitorError::Engine { .. }));

    let settings = runtime.settings();
    for name in [settings.prometheus_name(), settings.exporter_name()] {
        assert_eq!(
            fake.container_named(&name).unwrap().state,
            ContainerState::Stopped,
            "{name}"
        );
    }
}

#[tokio::test]
async fn add_target_before_bootstrap_is_rejected() {
    let fake = Arc::new(FakeEngine::new());
    let dir = tempfile::tempdir().unwrap();
    let err = runtime(&fake, &dir)
        .add_target(target("orders", 5432))
        .await
        .unwrap_err();
    assert!(matches!(err, MonitorError::NotBootstrapped));
}

#[tokio::test]
async fn targets_accumulate_on_a_single_exporter() {
    let fake = Arc::new(FakeEngine::new());
    let dir = tempfile::tempdir().unwrap();
    let runtime = runtime(&fake, &dir);
    runtime.bootstrap().await.unwrap();

    runtime.add_target(target("orders", 5432)).await.unwrap();
    runtime.add_target(target("billing", 5433)).await.unwrap();

    let settings = runtime.settings();
    let exporters: Vec<_> = fake
        .containers()
        .into_iter()
        .filter(|c| c.spec.name == settings.exporter_name())
        .collect();
    assert_eq!(exporters.len(), 1);
    assert_eq!(exporters[0].state, ContainerState::Running);

    let expected = format!(
        "postgresql://postgres:orders-pw@{gw}:5432/?sslmode=disable,\
         postgresql://postgres:billing-pw@{gw}:5433/?sslmode=disable",
        gw = FakeEngine::GATEWAY
    );
    assert_eq!(exporter_dsn(&fake, settings).as_deref(), Some(expected.as_str()));
    assert_eq!(runtime.dsn().await, expected);
    assert_eq!(runtime.targets().await.len(), 2);
}

#[tokio::test]
async fn restarted_runtime_keeps_registered_dsn() {
    let fake = Arc::new(FakeEngine::new());
    let dir = tempfile::tempdir().unwrap();
    let first = runtime(&fake, &dir);
    first.bootstrap().await.unwrap();
    first.add_target(target("orders", 5432)).await.unwrap();

    let second = runtime(&fake, &dir);
    second.bootstrap().await.unwrap();
    second.add_target(target("billing", 5433)).await.unwrap();

    let dsn = exporter_dsn(&fake, second.settings()).unwrap();
    assert_eq!(dsn.split(',').count(), 2);
    assert!(dsn.starts_with("postgresql://postgres:orders-pw@"));
}

fn exporter_count(fake: &FakeEngine, settings: &MonitorSettings) -> usize {
    fake.containers()
        .into_iter()
        .filter(|c| c.spec.name == settings.exporter_name())
        .count()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_registrations_keep_every_target() {
    let fake = Arc::new(FakeEngine::new());
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(runtime(&fake, &dir));
    runtime.bootstrap().await.unwrap();

    let tasks: Vec<_> = (0..8u16)
        .map(|i| {
            let runtime = runtime.clone();
            tokio::spawn(async move { runtime.add_target(target(&format!("db{i}"), 6000 + i)).await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(exporter_count(&fake, runtime.settings()), 1);
    let dsn = exporter_dsn(&fake, runtime.settings()).unwrap();
    assert_eq!(dsn.split(',').count(), 8);
    for i in 0..8u16 {
        assert!(dsn.contains(&format!(":{}/", 6000 + i)), "port {} missing", 6000 + i);
    }
    assert_eq!(runtime.containers().await.len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn separate_runtimes_do_not_lose_registrations() {
    let fake = Arc::new(FakeEngine::new());
    let dir = tempfile::tempdir().unwrap();
    let runtimes: Vec<Arc<MonitorRuntime>> =
        (0..4).map(|_| Arc::new(runtime(&fake, &dir))).collect();
    for runtime in &runtimes {
        runtime.bootstrap().await.unwrap();
    }

    let tasks: Vec<_> = runtimes
        .iter()
        .enumerate()
        .map(|(i, runtime)| {
            let runtime = runtime.clone();
            let port = 7000 + i as u16;
            tokio::spawn(async move { runtime.add_target(target(&format!("db{i}"), port)).await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let settings = runtimes[0].settings();
    assert_eq!(exporter_count(&fake, settings), 1);
    let dsn = exporter_dsn(&fake, settings).unwrap();
    assert_eq!(dsn.split(',').count(), 4);
}

#[tokio::test]
async fn exporter_start_failure_is_reported() {
    let fake = Arc::new(FakeEngine::new());
    let dir = tempfile::tempdir().unwrap();
    let runtime = runtime(&fake, &dir);
    runtime.bootstrap().await.unwrap();
    fake.fail_start_of(&runtime.settings().exporter_name());

    let err = runtime.add_target(target("orders", 5432)).await.unwrap_err();
    assert!(err.to_string().contains("failed to start"));
    assert!(runtime.targets().await.is_empty());
    let exporter = fake.container_named(&runtime.settings().exporter_name()).unwrap();
    assert_ne!(exporter.state, ContainerState::Running);
}
