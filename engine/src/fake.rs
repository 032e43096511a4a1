//! In-memory [`ContainerEngine`] for tests.
//!
//! Mirrors the engine behaviour the client depends on: name collisions on
//! create, not-found on unknown ids, conflict when removing a running
//! container, substring name filters. Every mutating call is appended to an
//! operation log so tests can assert on ordering.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::{
    ContainerDetails, ContainerEngine, ContainerSpec, ContainerState, ContainerSummary,
    CreatedContainer, EndpointSettings, EngineError, ExecCommand, ExecOutput, NetworkDetails,
    NetworkSummary,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeContainer {
    pub id: String,
    pub spec: ContainerSpec,
    pub state: ContainerState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeUpload {
    /// Container name
    pub container: String,
    pub path: String,
    pub archive: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeExec {
    pub container: String,
    pub command: ExecCommand,
}

#[derive(Default)]
struct FakeState {
    next_id: u64,
    containers: Vec<FakeContainer>,
    images: HashSet<String>,
    pulled: Vec<String>,
    networks: Vec<NetworkSummary>,
    volumes: HashMap<String, HashMap<String, String>>,
    execs: Vec<FakeExec>,
    exit_codes: HashMap<String, i64>,
    uploads: Vec<FakeUpload>,
    downloads: HashMap<String, Vec<u8>>,
    failing_starts: HashSet<String>,
    failing_creates: HashSet<String>,
    ops: Vec<String>,
}

impl FakeState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}{:012x}", self.next_id)
    }

    fn container(&self, id: &str) -> Result<&FakeContainer, EngineError> {
        self.containers
            .iter()
            .find(|c| c.id == id || c.spec.name == id)
            .ok_or_else(|| EngineError::NotFound(format!("No such container: {id}")))
    }

    fn container_mut(&mut self, id: &str) -> Result<&mut FakeContainer, EngineError> {
        self.containers
            .iter_mut()
            .find(|c| c.id == id || c.spec.name == id)
            .ok_or_else(|| EngineError::NotFound(format!("No such container: {id}")))
    }
}

/// In-memory container engine
#[derive(Default)]
pub struct FakeEngine {
    state: Mutex<FakeState>,
}

impl FakeEngine {
    /// Gateway reported for every network
    pub const GATEWAY: &'static str = "172.30.0.1";

    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn add_image(&self, reference: &str) {
        self.lock().images.insert(reference.to_string());
    }

    /// Registers a network without any duplicate check.
    pub fn add_network(&self, name: &str) -> String {
        let mut state = self.lock();
        let id = state.next_id("net");
        state.networks.push(NetworkSummary {
            id: id.clone(),
            name: name.to_string(),
        });
        id
    }

    /// Makes `start_container` fail for containers with this name.
    pub fn fail_start_of(&self, name: &str) {
        self.lock().failing_starts.insert(name.to_string());
    }

    /// Makes `create_container` fail for containers with this name.
    pub fn fail_create_of(&self, name: &str) {
        self.lock().failing_creates.insert(name.to_string());
    }

    /// Exit code reported for commands whose program is `program`.
    pub fn set_exit_code(&self, program: &str, code: i64) {
        self.lock().exit_codes.insert(program.to_string(), code);
    }

    /// Archive returned when `path` is downloaded from any container.
    pub fn set_download(&self, path: &str, archive: Vec<u8>) {
        self.lock().downloads.insert(path.to_string(), archive);
    }

    pub fn containers(&self) -> Vec<FakeContainer> {
        self.lock().containers.clone()
    }

    pub fn container_named(&self, name: &str) -> Option<FakeContainer> {
        self.lock()
            .containers
            .iter()
            .find(|c| c.spec.name == name)
            .cloned()
    }

    pub fn pulled_images(&self) -> Vec<String> {
        self.lock().pulled.clone()
    }

    pub fn networks(&self) -> Vec<NetworkSummary> {
        self.lock().networks.clone()
    }

    pub fn volumes(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().volumes.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn execs(&self) -> Vec<FakeExec> {
        self.lock().execs.clone()
    }

    pub fn uploads(&self) -> Vec<FakeUpload> {
        self.lock().uploads.clone()
    }

    /// Operation log, e.g. `create pgdock-postgres-a`, `stop pgdock-postgres-a`.
    pub fn ops(&self) -> Vec<String> {
        self.lock().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.lock().ops.clear();
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    fn name(&self) -> &str {
        "fake"
    }

    async fn list_containers(
        &self,
        name_filter: &str,
    ) -> Result<Vec<ContainerSummary>, EngineError> {
        Ok(self
            .lock()
            .containers
            .iter()
            .filter(|c| c.spec.name.contains(name_filter))
            .map(|c| ContainerSummary {
                id: c.id.clone(),
                names: vec![format!("/{}", c.spec.name)],
                state: c.state.clone(),
                image: c.spec.image.clone(),
            })
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails, EngineError> {
        let state = self.lock();
        let container = state.container(id)?;
        let mut networks = HashMap::new();
        if let Some(network) = &container.spec.network {
            let attached = container.state == ContainerState::Running;
            networks.insert(
                network.clone(),
                EndpointSettings {
                    network_id: state
                        .networks
                        .iter()
                        .find(|n| &n.name == network)
                        .map(|n| n.id.clone()),
                    gateway: attached.then(|| Self::GATEWAY.to_string()),
                    ip_address: attached.then(|| "172.30.0.10".to_string()),
                },
            );
        }
        Ok(ContainerDetails {
            id: container.id.clone(),
            name: container.spec.name.clone(),
            state: container.state.clone(),
            image: container.spec.image.clone(),
            env: container.spec.env.clone(),
            networks,
        })
    }

    async fn create_container(
        &self,
        spec: &ContainerSpec,
    ) -> Result<CreatedContainer, EngineError> {
        let mut state = self.lock();
        if state.containers.iter().any(|c| c.spec.name == spec.name) {
            return Err(EngineError::DuplicateContainerName(spec.name.clone()));
        }
        if state.failing_creates.contains(&spec.name) {
            return Err(EngineError::Api {
                status: 500,
                message: format!("fake create failure for {}", spec.name),
            });
        }
        let id = state.next_id("c");
        state.containers.push(FakeContainer {
            id: id.clone(),
            spec: spec.clone(),
            state: ContainerState::Created,
        });
        state.ops.push(format!("create {}", spec.name));
        Ok(CreatedContainer {
            id,
            warnings: Vec::new(),
        })
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        let mut state = self.lock();
        let failing = state.failing_starts.clone();
        let container = state.container_mut(id)?;
        let name = container.spec.name.clone();
        if failing.contains(&name) {
            return Err(EngineError::Api {
                status: 500,
                message: format!("fake start failure for {name}"),
            });
        }
        container.state = ContainerState::Running;
        state.ops.push(format!("start {name}"));
        Ok(())
    }

    async fn stop_container(&self, id: &str, _timeout: Duration) -> Result<(), EngineError> {
        let mut state = self.lock();
        let container = state.container_mut(id)?;
        let name = container.spec.name.clone();
        if container.state == ContainerState::Running {
            container.state = ContainerState::Stopped;
        }
        state.ops.push(format!("stop {name}"));
        Ok(())
    }

    async fn restart_container(&self, id: &str, _timeout: Duration) -> Result<(), EngineError> {
        let mut state = self.lock();
        let container = state.container_mut(id)?;
        let name = container.spec.name.clone();
        container.state = ContainerState::Running;
        state.ops.push(format!("restart {name}"));
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), EngineError> {
        let mut state = self.lock();
        let container = state.container(id)?.clone();
        if container.state == ContainerState::Running {
            return Err(EngineError::Conflict(format!(
                "You cannot remove a running container {}",
                container.id
            )));
        }
        state.containers.retain(|c| c.id != container.id);
        state.ops.push(format!("remove {}", container.spec.name));
        Ok(())
    }

    async fn image_exists(&self, reference: &str) -> Result<bool, EngineError> {
        Ok(self.lock().images.contains(reference))
    }

    async fn pull_image(&self, reference: &str) -> Result<(), EngineError> {
        let mut state = self.lock();
        state.images.insert(reference.to_string());
        state.pulled.push(reference.to_string());
        state.ops.push(format!("pull {reference}"));
        Ok(())
    }

    async fn exec(&self, id: &str, command: &ExecCommand) -> Result<ExecOutput, EngineError> {
        let mut state = self.lock();
        let name = state.container(id)?.spec.name.clone();
        let exit_code = state
            .exit_codes
            .get(command.program())
            .copied()
            .unwrap_or(0);
        state.execs.push(FakeExec {
            container: name.clone(),
            command: command.clone(),
        });
        state.ops.push(format!("exec {name} {command}"));
        Ok(ExecOutput {
            exit_code: Some(exit_code),
            stdout: String::new(),
            stderr: if exit_code == 0 {
                String::new()
            } else {
                format!("{} failed", command.program())
            },
        })
    }

    async fn upload_archive(
        &self,
        id: &str,
        path: &str,
        archive: Vec<u8>,
    ) -> Result<(), EngineError> {
        let mut state = self.lock();
        let name = state.container(id)?.spec.name.clone();
        state.uploads.push(FakeUpload {
            container: name.clone(),
            path: path.to_string(),
            archive,
        });
        state.ops.push(format!("upload {name} {path}"));
        Ok(())
    }

    async fn download_archive(&self, id: &str, path: &str) -> Result<Vec<u8>, EngineError> {
        let mut state = self.lock();
        let name = state.container(id)?.spec.name.clone();
        let archive = state
            .downloads
            .get(path)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("Could not find the file {path}")))?;
        state.ops.push(format!("download {name} {path}"));
        Ok(archive)
    }

    async fn create_network(&self, name: &str) -> Result<String, EngineError> {
        let mut state = self.lock();
        if state.networks.iter().any(|n| n.name == name) {
            return Err(EngineError::Conflict(format!(
                "network with name {name} already exists"
            )));
        }
        let id = state.next_id("net");
        state.networks.push(NetworkSummary {
            id: id.clone(),
            name: name.to_string(),
        });
        state.ops.push(format!("create_network {name}"));
        Ok(id)
    }

    async fn list_networks(&self, name_filter: &str) -> Result<Vec<NetworkSummary>, EngineError> {
        Ok(self
            .lock()
            .networks
            .iter()
            .filter(|n| n.name.contains(name_filter))
            .cloned()
            .collect())
    }

    async fn inspect_network(&self, id_or_name: &str) -> Result<NetworkDetails, EngineError> {
        self.lock()
            .networks
            .iter()
            .find(|n| n.id == id_or_name || n.name == id_or_name)
            .map(|n| NetworkDetails {
                id: n.id.clone(),
                name: n.name.clone(),
                gateway: Some(Self::GATEWAY.to_string()),
            })
            .ok_or_else(|| EngineError::NotFound(format!("network {id_or_name} not found")))
    }

    async fn remove_network(&self, id: &str) -> Result<(), EngineError> {
        let mut state = self.lock();
        let network = state
            .networks
            .iter()
            .find(|n| n.id == id || n.name == id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("network {id} not found")))?;
        state.networks.retain(|n| n.id != network.id);
        state.ops.push(format!("remove_network {}", network.name));
        Ok(())
    }

    async fn create_volume(
        &self,
        name: &str,
        labels: &HashMap<String, String>,
    ) -> Result<String, EngineError> {
        let mut state = self.lock();
        state.volumes.insert(name.to_string(), labels.clone());
        state.ops.push(format!("create_volume {name}"));
        Ok(name.to_string())
    }

    async fn remove_volume(&self, name: &str) -> Result<(), EngineError> {
        let mut state = self.lock();
        if state.volumes.remove(name).is_none() {
            return Err(EngineError::NotFound(format!("get {name}: no such volume")));
        }
        state.ops.push(format!("remove_volume {name}"));
        Ok(())
    }
}
