use log::{info, warn};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::archive::{self, ArchiveOptions};
use crate::{
    ContainerDetails, ContainerEngine, ContainerSpec, ContainerState, EndpointSettings,
    EngineError, ExecCommand, ExecOutput, NetworkHandle, StartOutcome,
};

/// A container as known to the client: the spec it was (or would be) created
/// from plus the state last observed on the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    /// Empty until the container has been created
    pub id: String,
    pub spec: ContainerSpec,
    pub state: ContainerState,
    /// Environment recorded by the engine, image defaults included
    pub env: Vec<String>,
    pub networks: HashMap<String, EndpointSettings>,
    pub warnings: Vec<String>,
}

impl Container {
    /// A container that has not been created yet.
    pub fn new(spec: ContainerSpec) -> Self {
        let env = spec.env.clone();
        Self {
            id: String::new(),
            spec,
            state: ContainerState::Created,
            env,
            networks: HashMap::new(),
            warnings: Vec::new(),
        }
    }

    fn from_details(details: ContainerDetails) -> Self {
        let mut spec = ContainerSpec::new(details.name, details.image);
        spec.env = details.env.clone();
        spec.network = details.networks.keys().next().cloned();
        Self {
            id: details.id,
            spec,
            state: details.state,
            env: details.env,
            networks: details.networks,
            warnings: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    /// Returns the value of an environment variable recorded for the container.
    pub fn get_env(&self, key: &str) -> Result<String, EngineError> {
        self.env
            .iter()
            .filter_map(|entry| entry.split_once('='))
            .filter(|(name, _)| *name == key)
            .map(|(_, value)| value.to_string())
            .last()
            .ok_or_else(|| EngineError::NoMatchingEnv(key.to_string()))
    }

    /// Gateway address of the container's endpoint on `network`.
    pub fn gateway(&self, network: &str) -> Option<&str> {
        self.networks
            .get(network)
            .and_then(|endpoint| endpoint.gateway.as_deref())
            .filter(|gateway| !gateway.is_empty())
    }

    fn refresh_from(&mut self, details: ContainerDetails) {
        self.state = details.state;
        self.env = details.env;
        self.networks = details.networks;
    }
}

/// Idempotency-aware wrapper over a [`ContainerEngine`].
#[derive(Clone)]
pub struct Client {
    engine: Arc<dyn ContainerEngine>,
    stop_timeout: Duration,
    deadline: Duration,
}

impl Client {
    pub fn new(engine: Arc<dyn ContainerEngine>, stop_timeout: Duration, deadline: Duration) -> Self {
        Self {
            engine,
            stop_timeout,
            deadline,
        }
    }

    pub fn engine(&self) -> &Arc<dyn ContainerEngine> {
        &self.engine
    }

    /// Looks a container up by its exact name. A missing container is `Ok(None)`.
    pub async fn get_container(&self, name: &str) -> Result<Option<Container>, EngineError> {
        let wanted = format!("/{name}");
        let summaries = self
            .engine
            .list_containers(name)
            .await
            .map_err(|e| e.context(format!("listing containers named {name}")))?;

        let Some(summary) = summaries
            .into_iter()
            .find(|summary| summary.names.iter().any(|n| *n == wanted || n.as_str() == name))
        else {
            return Ok(None);
        };

        match self.engine.inspect_container(&summary.id).await {
            Ok(details) => Ok(Some(Container::from_details(details))),
            // removed between list and inspect
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.context(format!("inspecting container {name}"))),
        }
    }

    /// Makes sure `reference` is available locally, pulling it on a miss.
    pub async fn ensure_image(&self, reference: &str) -> Result<(), EngineError> {
        let exists = self
            .engine
            .image_exists(reference)
            .await
            .map_err(|e| e.context("checking whether the image exists locally"))?;
        if exists {
            return Ok(());
        }

        info!("Image {reference} doesn't exist on the host, pulling it");
        self.engine
            .pull_image(reference)
            .await
            .map_err(|e| e.context(format!("pulling image {reference} from registry")))?;
        info!("Pulled image {reference}");
        Ok(())
    }

    /// Creates and starts a new container, then records its endpoints.
    pub async fn start(&self, container: &mut Container) -> Result<StartOutcome, EngineError> {
        self.ensure_image(&container.spec.image).await?;

        let created = match self.engine.create_container(&container.spec).await {
            Ok(created) => created,
            Err(e) if e.is_duplicate_container_name() => return Err(e),
            Err(e) => {
                return Err(e.context(format!(
                    "unable to create container with image {}",
                    container.spec.image
                )))
            }
        };
        container.id = created.id.clone();
        container.warnings = created.warnings.clone();

        self.engine.start_container(&created.id).await.map_err(|e| {
            e.context(format!(
                "unable to start container for image {}",
                container.spec.image
            ))
        })?;
        self.refresh(container).await?;

        info!("Started {} container with id {}", container.name(), container.id);
        Ok(StartOutcome {
            id: created.id,
            warnings: created.warnings,
        })
    }

    /// Starts a container that already exists without re-creating it.
    pub async fn start_existing(&self, container: &mut Container) -> Result<(), EngineError> {
        self.require_id(container)?;
        self.engine
            .start_container(&container.id)
            .await
            .map_err(|e| e.context(format!("unable to start container {}", container.name())))?;
        self.refresh(container).await
    }

    pub async fn restart(&self, container: &mut Container) -> Result<(), EngineError> {
        self.require_id(container)?;
        info!("Restarting container {}", container.name());
        self.engine
            .restart_container(&container.id, self.stop_timeout)
            .await
            .map_err(|e| {
                e.context(format!("unable to restart container {}", container.name()))
            })?;
        self.refresh(container).await
    }

    /// Gracefully stops a container. A container that is gone is not an error.
    pub async fn stop(&self, container: &Container) -> Result<(), EngineError> {
        if container.id.is_empty() {
            return Ok(());
        }
        info!("Stopping container {}", container.name());
        match self
            .engine
            .stop_container(&container.id, self.stop_timeout)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                info!("Container {} is already gone", container.name());
                Ok(())
            }
            Err(e) => Err(e.context(format!("unable to stop container {}", container.name()))),
        }
    }

    /// Removes a stopped container. A container that is gone is not an error.
    pub async fn remove(&self, container: &Container) -> Result<(), EngineError> {
        if container.id.is_empty() {
            return Ok(());
        }
        info!("Removing container {}", container.name());
        match self.engine.remove_container(&container.id).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.context(format!(
                "unable to remove container {}",
                container.name()
            ))),
        }
    }

    /// Runs a one-shot command in a running container. The command's own exit
    /// code is reported in the output, not as an error; see [`Client::exec_checked`].
    pub async fn exec(
        &self,
        container: &Container,
        command: &ExecCommand,
    ) -> Result<ExecOutput, EngineError> {
        if container.id.is_empty() {
            return Err(EngineError::EmptyContainerId);
        }
        if let Err(e) = self.engine.inspect_container(&container.id).await {
            return Err(if e.is_not_found() {
                EngineError::ContainerNotFound(container.name().to_string())
            } else {
                e.context(format!("inspecting container {}", container.name()))
            });
        }

        info!("Executing `{}` in {}", command, container.name());
        let deadline = command.timeout.unwrap_or(self.deadline);
        let output = self
            .with_deadline(
                format!("exec `{command}` in {}", container.name()),
                deadline,
                self.engine.exec(&container.id, command),
            )
            .await
            .map_err(|e| e.context(format!("executing `{}`", command.program())))?;

        for line in output.stdout.lines() {
            info!("[{}] {}", container.name(), line);
        }
        for line in output.stderr.lines() {
            warn!("[{}] {}", container.name(), line);
        }
        Ok(output)
    }

    /// Like [`Client::exec`], but a non-zero exit becomes [`EngineError::CommandFailed`].
    pub async fn exec_checked(
        &self,
        container: &Container,
        command: &ExecCommand,
    ) -> Result<ExecOutput, EngineError> {
        let output = self.exec(container, command).await?;
        match output.exit_code {
            Some(0) => Ok(output),
            Some(exit_code) => Err(EngineError::CommandFailed {
                command: command.to_string(),
                exit_code,
                output: if output.stderr.trim().is_empty() {
                    output.stdout.trim().to_string()
                } else {
                    output.stderr.trim().to_string()
                },
            }),
            None => {
                warn!("Engine did not report an exit code for `{command}`");
                Ok(output)
            }
        }
    }

    /// Extracts a prepared tar archive into `dest` inside the container.
    pub async fn copy_to_container(
        &self,
        container: &Container,
        archive: Vec<u8>,
        dest: &str,
    ) -> Result<(), EngineError> {
        self.require_id(container)?;
        info!("Copying archive into {}:{}", container.name(), dest);
        self.with_deadline(
            format!("copy to {}:{dest}", container.name()),
            self.deadline,
            self.engine.upload_archive(&container.id, dest, archive),
        )
        .await
        .map_err(|e| e.context(format!("copying to {}:{dest}", container.name())))
    }

    /// Archives a local file or directory contents and extracts it into `dest`.
    pub async fn copy_path_to_container(
        &self,
        container: &Container,
        src: &Path,
        dest: &str,
        options: &ArchiveOptions,
    ) -> Result<(), EngineError> {
        let src_owned: PathBuf = src.to_path_buf();
        let options = *options;
        let archive = tokio::task::spawn_blocking(move || archive::path_archive(&src_owned, &options))
            .await
            .map_err(|e| EngineError::Task(e.to_string()))?
            .map_err(|e| EngineError::Io(e).context(format!("archiving {}", src.display())))?;

        self.copy_to_container(container, archive, dest).await
    }

    /// Downloads `src` from the container and unpacks it under `dest_dir`.
    pub async fn copy_from_container(
        &self,
        container: &Container,
        src: &str,
        dest_dir: &Path,
    ) -> Result<(), EngineError> {
        self.require_id(container)?;
        info!("Copying {}:{} to {}", container.name(), src, dest_dir.display());
        let archive = self
            .with_deadline(
                format!("copy from {}:{src}", container.name()),
                self.deadline,
                self.engine.download_archive(&container.id, src),
            )
            .await
            .map_err(|e| e.context(format!("copying from {}:{src}", container.name())))?;

        let dest = dest_dir.to_path_buf();
        tokio::task::spawn_blocking(move || archive::unpack_archive(&archive, &dest))
            .await
            .map_err(|e| EngineError::Task(e.to_string()))?
            .map_err(|e| EngineError::Io(e).context(format!("unpacking into {}", dest_dir.display())))
    }

    /// Creates a network, or resolves the single existing network of that name.
    pub async fn create_network(&self, name: &str) -> Result<String, EngineError> {
        Ok(self.ensure_network(name).await?.id)
    }

    /// Same as [`Client::create_network`], also reporting whether this call created it.
    pub async fn ensure_network(&self, name: &str) -> Result<NetworkHandle, EngineError> {
        if let Some(id) = self.find_network(name).await? {
            return Ok(NetworkHandle {
                id,
                name: name.to_string(),
                created: false,
            });
        }

        match self.engine.create_network(name).await {
            Ok(id) => {
                info!("Created network {name} with id {id}");
                Ok(NetworkHandle {
                    id,
                    name: name.to_string(),
                    created: true,
                })
            }
            Err(e) if e.is_conflict() => {
                info!("Network {name} already exists, resolving it");
                match self.find_network(name).await? {
                    Some(id) => Ok(NetworkHandle {
                        id,
                        name: name.to_string(),
                        created: false,
                    }),
                    None => Err(e.context(format!("creating network {name}"))),
                }
            }
            Err(e) => Err(e.context(format!("creating network {name}"))),
        }
    }

    async fn find_network(&self, name: &str) -> Result<Option<String>, EngineError> {
        let matching: Vec<_> = self
            .engine
            .list_networks(name)
            .await
            .map_err(|e| e.context(format!("listing networks named {name}")))?
            .into_iter()
            .filter(|network| network.name == name)
            .collect();

        match matching.len() {
            0 => Ok(None),
            1 => Ok(matching.into_iter().next().map(|network| network.id)),
            _ => Err(EngineError::DuplicateNetwork(name.to_string())),
        }
    }

    /// Gateway address of the network's IPAM configuration.
    pub async fn network_gateway(&self, name: &str) -> Result<Option<String>, EngineError> {
        let details = self
            .engine
            .inspect_network(name)
            .await
            .map_err(|e| e.context(format!("inspecting network {name}")))?;
        Ok(details.gateway.filter(|gateway| !gateway.is_empty()))
    }

    pub async fn remove_network(&self, name: &str) -> Result<(), EngineError> {
        info!("Removing network {name}");
        match self.engine.remove_network(name).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.context(format!("removing network {name}"))),
        }
    }

    pub async fn create_volume(
        &self,
        name: &str,
        labels: &HashMap<String, String>,
    ) -> Result<String, EngineError> {
        info!("Creating volume {name}");
        self.engine
            .create_volume(name, labels)
            .await
            .map_err(|e| e.context(format!("creating volume {name}")))
    }

    pub async fn remove_volume(&self, name: &str) -> Result<(), EngineError> {
        info!("Removing volume {name}");
        match self.engine.remove_volume(name).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.context(format!("removing volume {name}"))),
        }
    }

    async fn refresh(&self, container: &mut Container) -> Result<(), EngineError> {
        let details = self
            .engine
            .inspect_container(&container.id)
            .await
            .map_err(|e| e.context(format!("getting data for container {}", container.id)))?;
        container.refresh_from(details);
        Ok(())
    }

    fn require_id(&self, container: &Container) -> Result<(), EngineError> {
        if container.id.is_empty() {
            Err(EngineError::EmptyContainerId)
        } else {
            Ok(())
        }
    }

    async fn with_deadline<T>(
        &self,
        operation: String,
        deadline: Duration,
        fut: impl Future<Output = Result<T, EngineError>>,
    ) -> Result<T, EngineError> {
        match tokio::time::timeout(deadline, fut).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout {
                operation,
                after: deadline,
            }),
        }
    }
}
