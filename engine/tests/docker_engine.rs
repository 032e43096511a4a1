//! Runs against a live Docker daemon: `cargo test -p engine -- --ignored`

use engine::{Client, Container, ContainerEngineFactory, ContainerSpec, EngineError, ExecCommand};
use std::time::Duration;

const IMAGE: &str = "alpine:3.20";

async fn client() -> Client {
    let engine = ContainerEngineFactory::create_docker_engine(None)
        .await
        .expect("docker daemon reachable");
    Client::new(engine, Duration::from_secs(2), Duration::from_secs(60))
}

fn sleeper(name: &str) -> ContainerSpec {
    ContainerSpec::new(name, IMAGE)
        .with_env("PGDOCK_TEST", "lifecycle")
        .with_entrypoint(vec!["sleep".into()], vec!["infinity".into()])
}

#[tokio::test]
#[ignore]
#[serial_test::serial]
async fn container_lifecycle_against_docker() {
    let client = client().await;
    let name = "pgdock-engine-it-lifecycle";
    if let Some(stale) = client.get_container(name).await.unwrap() {
        client.stop(&stale).await.unwrap();
        client.remove(&stale).await.unwrap();
    }

    let mut container = Container::new(sleeper(name));
    client.start(&mut container).await.unwrap();
    assert!(container.is_running());

    let found = client.get_container(name).await.unwrap().expect("container listed");
    assert_eq!(found.id, container.id);
    assert_eq!(found.get_env("PGDOCK_TEST").unwrap(), "lifecycle");

    let output = client
        .exec(&found, &ExecCommand::new(["sh", "-c", "echo hi; exit 3"]))
        .await
        .unwrap();
    assert_eq!(output.exit_code, Some(3));
    assert_eq!(output.stdout.trim(), "hi");

    let err = client
        .exec_checked(&found, &ExecCommand::new(["false"]))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::CommandFailed { exit_code: 1, .. }));

    client.stop(&found).await.unwrap();
    client.remove(&found).await.unwrap();
    // both are idempotent once the container is gone
    client.stop(&found).await.unwrap();
    client.remove(&found).await.unwrap();
    assert!(client.get_container(name).await.unwrap().is_none());
}

#[tokio::test]
#[ignore]
#[serial_test::serial]
async fn network_is_created_once() {
    let client = client().await;
    let name = "pgdock-engine-it-net";
    client.remove_network(name).await.unwrap();

    let first = client.ensure_network(name).await.unwrap();
    let second = client.ensure_network(name).await.unwrap();
    assert!(first.created);
    assert!(!second.created);
    assert_eq!(first.id, second.id);
    assert!(client.network_gateway(name).await.unwrap().is_some());

    client.remove_network(name).await.unwrap();
}
