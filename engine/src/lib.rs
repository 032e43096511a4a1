//! Container lifecycle layer for pgdock.
//!
//! [`ContainerEngine`] is the narrow seam over the engine's control API and
//! [`Client`] builds the idempotent operations the orchestrators rely on:
//! lookups that treat "not found" as a normal outcome, image pulls on miss,
//! duplicate-name and duplicate-network detection, exec with exit codes and
//! archive copies in and out of containers.

pub mod archive;
mod client;
mod docker;
mod error;
#[cfg(any(test, feature = "fake"))]
pub mod fake;
mod types;

pub use archive::ArchiveOptions;
pub use client::{Client, Container};
pub use docker::DockerEngine;
pub use error::EngineError;
pub use types::*;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Raw container engine operations. Implementations report engine failures
/// with [`EngineError::NotFound`], [`EngineError::Conflict`] or
/// [`EngineError::Api`] and leave idempotency decisions to [`Client`].
#[async_trait]
pub trait ContainerEngine: Send + Sync + 'static {
    /// Returns the name of the engine implementation.
    fn name(&self) -> &str;

    /// Lists containers, running or not, whose name matches the filter.
    async fn list_containers(&self, name_filter: &str)
        -> Result<Vec<ContainerSummary>, EngineError>;

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails, EngineError>;

    /// Creates a container. A name collision is reported as
    /// [`EngineError::DuplicateContainerName`].
    async fn create_container(&self, spec: &ContainerSpec)
        -> Result<CreatedContainer, EngineError>;

    async fn start_container(&self, id: &str) -> Result<(), EngineError>;

    /// Stops a container, killing it once the timeout elapses.
    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<(), EngineError>;

    async fn restart_container(&self, id: &str, timeout: Duration) -> Result<(), EngineError>;

    async fn remove_container(&self, id: &str) -> Result<(), EngineError>;

    /// Checks whether an image reference is present in the local store.
    async fn image_exists(&self, reference: &str) -> Result<bool, EngineError>;

    async fn pull_image(&self, reference: &str) -> Result<(), EngineError>;

    /// Runs a command to completion and reports its output and exit code.
    async fn exec(&self, id: &str, command: &ExecCommand) -> Result<ExecOutput, EngineError>;

    /// Extracts a tar archive into a directory of the container.
    async fn upload_archive(
        &self,
        id: &str,
        path: &str,
        archive: Vec<u8>,
    ) -> Result<(), EngineError>;

    /// Reads a path of the container as a tar archive.
    async fn download_archive(&self, id: &str, path: &str) -> Result<Vec<u8>, EngineError>;

    async fn create_network(&self, name: &str) -> Result<String, EngineError>;

    /// Lists networks whose name matches the filter.
    async fn list_networks(&self, name_filter: &str) -> Result<Vec<NetworkSummary>, EngineError>;

    async fn inspect_network(&self, id_or_name: &str) -> Result<NetworkDetails, EngineError>;

    async fn remove_network(&self, id: &str) -> Result<(), EngineError>;

    async fn create_volume(
        &self,
        name: &str,
        labels: &HashMap<String, String>,
    ) -> Result<String, EngineError>;

    async fn remove_volume(&self, name: &str) -> Result<(), EngineError>;
}

/// Factory for creating container engines.
pub struct ContainerEngineFactory;

impl ContainerEngineFactory {
    /// Connects to a Docker daemon at `socket`, or the local default socket.
    pub async fn create_docker_engine(
        socket: Option<&str>,
    ) -> Result<Arc<dyn ContainerEngine>, EngineError> {
        let engine = DockerEngine::connect(socket)?;
        engine.ping().await?;
        Ok(Arc::new(engine))
    }
}
