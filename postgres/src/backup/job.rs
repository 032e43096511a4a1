use async_trait::async_trait;
use engine::{Client, Container, ContainerSpec};
use log::{error, info, warn};
use metastore::{ClusterInfo, Destination};

use crate::container::container_name;
use crate::scheduler::ScheduledJob;
use crate::PostgresError;

pub const BACKUP_CONTAINER_PREFIX: &str = "pgdock-pg-backup-";

/// Credentials and location WAL-G reads from its environment.
pub(crate) fn destination_env(destination: &Destination) -> Vec<(&'static str, String)> {
    vec![
        ("AWS_SECRET_ACCESS_KEY", destination.api_key_secret.clone()),
        ("AWS_ACCESS_KEY_ID", destination.api_key_id.clone()),
        ("WALG_S3_PREFIX", format!("s3://{}", destination.bucket_name)),
    ]
}

/// One scheduled WAL-G base backup of a cluster.
///
/// The runner container pushes a backup when it starts, so a trigger either
/// starts the existing runner again or creates it. A runner created from an
/// older destination or different credentials is replaced.
pub struct BackupJob {
    client: Client,
    spec: ContainerSpec,
}

impl BackupJob {
    pub fn new(
        client: Client,
        cluster: &ClusterInfo,
        destination: &Destination,
        image: &str,
        network: &str,
    ) -> Self {
        let mut spec = ContainerSpec::new(
            format!("{BACKUP_CONTAINER_PREFIX}{}", cluster.name),
            image.to_string(),
        )
        .with_network(network.to_string())
        .with_label("pgdock.cluster", cluster.name.clone());
        for (key, value) in destination_env(destination) {
            spec = spec.with_env(key, value);
        }
        spec = spec
            .with_env("PGHOST", container_name(&cluster.name))
            .with_env("PGPASSWORD", &cluster.password)
            .with_env("PGDATABASE", "postgres")
            .with_env("PGUSER", &cluster.username);

        Self { client, spec }
    }

    pub fn container_name(&self) -> &str {
        &self.spec.name
    }

    /// The runner's recorded environment still holds every variable of the job.
    fn is_current(&self, runner: &Container) -> bool {
        self.spec.env.iter().all(|entry| runner.env.contains(entry))
    }

    async fn replace_runner(&self, runner: &Container) -> Result<(), PostgresError> {
        info!(
            "backup container {} was created with another destination, recreating it",
            self.spec.name
        );
        self.client
            .stop(runner)
            .await
            .map_err(PostgresError::engine("failed to stop outdated walg container"))?;
        self.client
            .remove(runner)
            .await
            .map_err(PostgresError::engine("failed to remove outdated walg container"))
    }

    pub async fn trigger(&self) -> Result<(), PostgresError> {
        info!("starting backup with {}", self.spec.name);
        let existing = match self.client.get_container(&self.spec.name).await {
            Ok(existing) => existing,
            Err(e) => {
                warn!(
                    "could not get info for backup container {}, it will be recreated: {e}",
                    self.spec.name
                );
                None
            }
        };

        let existing = match existing {
            Some(runner) if !self.is_current(&runner) => {
                self.replace_runner(&runner).await?;
                None
            }
            other => other,
        };

        match existing {
            Some(mut runner) => {
                self.client
                    .start_existing(&mut runner)
                    .await
                    .map_err(PostgresError::engine("failed to start existing walg container"))?;
                info!("reusing existing walg container {}", self.spec.name);
            }
            None => {
                let mut runner = Container::new(self.spec.clone());
                let outcome = self
                    .client
                    .start(&mut runner)
                    .await
                    .map_err(PostgresError::engine("failed to start backup container"))?;
                info!("started backup container {}", outcome.id);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ScheduledJob for BackupJob {
    async fn run(&self) {
        if let Err(e) = self.trigger().await {
            error!("backup with {} failed: {e}", self.spec.name);
            sentry::capture_message(
                &format!("scheduled backup with {} failed: {e}", self.spec.name),
                sentry::Level::Error,
            );
        }
    }

    /// Changes whenever the destination, credentials, image or network change.
    fn fingerprint(&self) -> String {
        let network = self.spec.network.as_deref().unwrap_or_default();
        format!("{}|{}|{}", self.spec.image, network, self.spec.env.join("\n"))
    }
}
