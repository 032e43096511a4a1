use engine::{
    Client, Container, ContainerSpec, EngineError, Mount, PortBinding, Resources, StartOutcome,
};
use log::{error, info, warn};
use std::collections::HashMap;

use crate::PostgresError;

pub const POSTGRES_CONTAINER_PREFIX: &str = "pgdock-postgres-";
pub const PG_DATA_DIR: &str = "/var/lib/postgresql/data/";
pub const POSTGRES_PORT: u16 = 5432;

/// Name of the database container of a cluster.
pub fn container_name(cluster_name: &str) -> String {
    format!("{POSTGRES_CONTAINER_PREFIX}{cluster_name}")
}

/// Name of the volume holding a cluster's data directory.
pub fn volume_name(cluster_name: &str) -> String {
    format!("pgdock-{cluster_name}-data")
}

pub fn image_reference(architecture: &str, maj_version: u32, min_version: u32) -> String {
    format!("{architecture}/postgres:{maj_version}.{min_version}")
}

/// Everything needed to run one database container.
#[derive(Clone, PartialEq, Eq)]
pub struct ContainerProps {
    pub name: String,
    pub username: String,
    pub password: String,
    /// Host port published for 5432
    pub port: u16,
    pub memory: i64,
    pub cpu_shares: i64,
    pub image: String,
    pub network: String,
}

impl std::fmt::Debug for ContainerProps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerProps")
            .field("name", &self.name)
            .field("username", &self.username)
            .field("port", &self.port)
            .field("image", &self.image)
            .field("network", &self.network)
            .finish_non_exhaustive()
    }
}

impl ContainerProps {
    pub fn container_name(&self) -> String {
        container_name(&self.name)
    }

    pub fn spec(&self, volume: &str) -> ContainerSpec {
        let mut spec = ContainerSpec::new(self.container_name(), self.image.clone())
            .with_env("POSTGRES_USER", &self.username)
            .with_env("POSTGRES_PASSWORD", &self.password)
            .with_port(PortBinding::tcp(POSTGRES_PORT, self.port))
            .with_mount(Mount::volume(volume, PG_DATA_DIR.trim_end_matches('/')))
            .with_network(self.network.clone())
            .with_label("pgdock.cluster", self.name.clone());
        spec.resources = Resources {
            cpu_shares: (self.cpu_shares > 0).then_some(self.cpu_shares),
            memory: (self.memory > 0).then_some(self.memory),
        };
        spec
    }
}

/// A started database container.
#[derive(Debug)]
pub struct Provisioned {
    pub container: Container,
    pub outcome: StartOutcome,
}

/// What a provisioning call acquired and must give back on failure.
#[derive(Default)]
struct Acquired {
    volume: Option<String>,
    network: Option<String>,
    container: Option<Container>,
}

/// Creates the data volume, makes sure the network exists and starts the
/// database container.
///
/// On failure everything this call acquired is released again; a network that
/// existed before the call is left alone.
pub async fn provision(client: &Client, props: &ContainerProps) -> Result<Provisioned, PostgresError> {
    let mut acquired = Acquired::default();
    match provision_steps(client, props, &mut acquired).await {
        Ok(provisioned) => Ok(provisioned),
        Err(original) => match release(client, acquired).await {
            Ok(()) => Err(original),
            Err(cleanup) => {
                error!("cleanup after failed provisioning of {}: {cleanup}", props.name);
                Err(PostgresError::CleanupFailed {
                    original: Box::new(original),
                    cleanup,
                })
            }
        },
    }
}

async fn provision_steps(
    client: &Client,
    props: &ContainerProps,
    acquired: &mut Acquired,
) -> Result<Provisioned, PostgresError> {
    let name = props.container_name();
    let existing = client
        .get_container(&name)
        .await
        .map_err(PostgresError::engine("creating new postgres container"))?;
    if existing.is_some() {
        return Err(PostgresError::Engine {
            step: "creating new postgres container".to_string(),
            source: EngineError::DuplicateContainerName(name),
        });
    }

    let volume = volume_name(&props.name);
    let labels = HashMap::from([("purpose".to_string(), "postgres data".to_string())]);
    client
        .create_volume(&volume, &labels)
        .await
        .map_err(PostgresError::engine("creating postgres data volume"))?;
    acquired.volume = Some(volume.clone());

    let network = client
        .ensure_network(&props.network)
        .await
        .map_err(PostgresError::engine("creating postgres network"))?;
    if network.created {
        acquired.network = Some(network.name.clone());
    }

    let mut container = Container::new(props.spec(&volume));
    let result = client.start(&mut container).await;
    if !container.id.is_empty() {
        acquired.container = Some(container.clone());
    }
    let outcome = result.map_err(PostgresError::engine("creating new postgres container"))?;

    for warning in &outcome.warnings {
        warn!("container {} may be unhealthy: {warning}", container.name());
    }
    info!(
        "Provisioned {} ({}) on port {}",
        container.name(),
        props.image,
        props.port
    );
    Ok(Provisioned { container, outcome })
}

async fn release(client: &Client, acquired: Acquired) -> Result<(), String> {
    let mut failures = Vec::new();

    if let Some(container) = acquired.container {
        let removed = match client.stop(&container).await {
            Ok(()) => client.remove(&container).await,
            Err(e) => Err(e),
        };
        if let Err(e) = removed {
            failures.push(e.to_string());
        }
    }
    if let Some(volume) = acquired.volume {
        if let Err(e) = client.remove_volume(&volume).await {
            failures.push(e.to_string());
        }
    }
    if let Some(network) = acquired.network {
        if let Err(e) = client.remove_network(&network).await {
            failures.push(e.to_string());
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(failures.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine::fake::FakeEngine;
    use engine::ContainerState;
    use std::sync::Arc;
    use std::time::Duration;

    fn props(name: &str, network: &str) -> ContainerProps {
        ContainerProps {
            name: name.to_string(),
            username: "postgres".to_string(),
            password: "secret".to_string(),
            port: 5433,
            memory: 0,
            cpu_shares: 512,
            image: image_reference("amd64", 16, 2),
            network: network.to_string(),
        }
    }

    fn client(fake: &Arc<FakeEngine>) -> Client {
        Client::new(fake.clone(), Duration::from_secs(1), Duration::from_secs(5))
    }

    #[test]
    fn spec_carries_credentials_port_and_volume() {
        let spec = props("orders", "pgdock_services").spec("pgdock-orders-data");
        assert_eq!(spec.name, "pgdock-postgres-orders");
        assert_eq!(spec.image, "amd64/postgres:16.2");
        assert!(spec.env.contains(&"POSTGRES_USER=postgres".to_string()));
        assert!(spec.env.contains(&"POSTGRES_PASSWORD=secret".to_string()));
        assert_eq!(spec.ports[0].container_port, 5432);
        assert_eq!(spec.ports[0].host_port, 5433);
        assert_eq!(spec.mounts[0].target, "/var/lib/postgresql/data");
        assert_eq!(spec.resources.cpu_shares, Some(512));
        assert_eq!(spec.resources.memory, None);
    }

    #[tokio::test]
    async fn provision_starts_container_on_network() {
        let fake = Arc::new(FakeEngine::new());
        let provisioned = provision(&client(&fake), &props("orders", "pgdock_services"))
            .await
            .unwrap();

        assert!(!provisioned.outcome.id.is_empty());
        let container = fake.container_named("pgdock-postgres-orders").unwrap();
        assert_eq!(container.state, ContainerState::Running);
        assert_eq!(fake.volumes(), vec!["pgdock-orders-data".to_string()]);
        assert_eq!(fake.networks().len(), 1);
    }

    #[tokio::test]
    async fn failed_start_releases_volume_and_new_network() {
        let fake = Arc::new(FakeEngine::new());
        fake.fail_start_of("pgdock-postgres-orders");

        let err = provision(&client(&fake), &props("orders", "pgdock_new"))
            .await
            .unwrap_err();

        assert!(err.to_string().starts_with("creating new postgres container"));
        assert!(fake.volumes().is_empty());
        assert!(fake.networks().is_empty());
        assert!(fake.container_named("pgdock-postgres-orders").is_none());
    }

    #[tokio::test]
    async fn failed_create_keeps_preexisting_network() {
        let fake = Arc::new(FakeEngine::new());
        fake.add_network("pgdock_services");
        fake.fail_create_of("pgdock-postgres-orders");

        provision(&client(&fake), &props("orders", "pgdock_services"))
            .await
            .unwrap_err();

        assert!(fake.volumes().is_empty());
        assert_eq!(fake.networks().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_name_is_reported_without_second_container() {
        let fake = Arc::new(FakeEngine::new());
        let client = client(&fake);
        provision(&client, &props("orders", "pgdock_services"))
            .await
            .unwrap();

        let err = provision(&client, &props("orders", "pgdock_services"))
            .await
            .unwrap_err();
        assert!(err
            .engine_error()
            .is_some_and(|e| e.is_duplicate_container_name()));
        let named = fake
            .containers()
            .into_iter()
            .filter(|c| c.spec.name == "pgdock-postgres-orders")
            .count();
        assert_eq!(named, 1);
        assert_eq!(fake.volumes(), vec!["pgdock-orders-data".to_string()]);
    }
}
