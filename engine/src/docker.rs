use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, InspectContainerOptions,
    ListContainersOptions, LogOutput, NetworkingConfig, RemoveContainerOptions,
    RestartContainerOptions, StartContainerOptions, StopContainerOptions,
    UploadToContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::{CreateImageOptions, ListImagesOptions};
use bollard::models::{
    EndpointSettings as DockerEndpoint, HostConfig, Mount as DockerMount, MountBindOptions,
    MountTypeEnum, PortBinding as DockerPortBinding,
};
use bollard::network::{CreateNetworkOptions, InspectNetworkOptions, ListNetworksOptions};
use bollard::volume::{CreateVolumeOptions, RemoveVolumeOptions};
use bollard::{Docker, API_DEFAULT_VERSION};
use futures::StreamExt;
use log::{debug, info};
use std::collections::HashMap;
use std::time::Duration;

use crate::{
    ContainerDetails, ContainerEngine, ContainerSpec, ContainerState, ContainerSummary,
    CreatedContainer, EndpointSettings, EngineError, ExecCommand, ExecOutput, MountKind,
    NetworkDetails, NetworkSummary,
};

/// Seconds the HTTP client waits for a single engine response
const REQUEST_TIMEOUT_SECS: u64 = 120;

impl From<DockerError> for EngineError {
    fn from(err: DockerError) -> Self {
        match err {
            DockerError::DockerResponseServerError {
                status_code: 404,
                message,
            } => EngineError::NotFound(message),
            DockerError::DockerResponseServerError {
                status_code: 409,
                message,
            } => EngineError::Conflict(message),
            DockerError::DockerResponseServerError {
                status_code,
                message,
            } => EngineError::Api {
                status: status_code,
                message,
            },
            other => EngineError::Transport(other.to_string()),
        }
    }
}

/// 304 means the container already is in the requested state
fn not_modified_is_ok(result: Result<(), DockerError>) -> Result<(), EngineError> {
    match result {
        Err(DockerError::DockerResponseServerError {
            status_code: 304, ..
        }) => Ok(()),
        other => other.map_err(EngineError::from),
    }
}

/// [`ContainerEngine`] backed by a Docker daemon
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connects to the daemon listening on `socket`, or the local defaults.
    pub fn connect(socket: Option<&str>) -> Result<Self, EngineError> {
        let docker = match socket {
            Some(path) => {
                info!("Connecting to Docker at {path}");
                Docker::connect_with_socket(path, REQUEST_TIMEOUT_SECS, API_DEFAULT_VERSION)?
            }
            None => Docker::connect_with_local_defaults()?,
        };
        Ok(Self { docker })
    }

    pub async fn ping(&self) -> Result<(), EngineError> {
        self.docker
            .ping()
            .await
            .map_err(|e| EngineError::from(e).context("docker daemon is not reachable"))?;
        Ok(())
    }

    fn container_config(spec: &ContainerSpec) -> Config<String> {
        let mut port_bindings: HashMap<String, Option<Vec<DockerPortBinding>>> = HashMap::new();
        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        for binding in &spec.ports {
            port_bindings.insert(
                binding.key(),
                Some(vec![DockerPortBinding {
                    host_ip: Some(binding.host_ip.clone()),
                    host_port: Some(binding.host_port.to_string()),
                }]),
            );
            exposed_ports.insert(binding.key(), HashMap::new());
        }

        let mounts = spec
            .mounts
            .iter()
            .map(|mount| DockerMount {
                target: Some(mount.target.clone()),
                source: Some(mount.source.clone()),
                typ: Some(match mount.kind {
                    MountKind::Bind => MountTypeEnum::BIND,
                    MountKind::Volume => MountTypeEnum::VOLUME,
                }),
                read_only: Some(mount.read_only),
                bind_options: (mount.kind == MountKind::Bind && mount.create_mountpoint).then(
                    || MountBindOptions {
                        create_mountpoint: Some(true),
                        ..Default::default()
                    },
                ),
                ..Default::default()
            })
            .collect();

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            mounts: Some(mounts),
            cpu_shares: spec.resources.cpu_shares,
            memory: spec.resources.memory,
            network_mode: spec.network.clone(),
            auto_remove: Some(false),
            ..Default::default()
        };

        let networking_config = spec.network.as_ref().map(|network| NetworkingConfig {
            endpoints_config: HashMap::from([(network.clone(), DockerEndpoint::default())]),
        });

        Config {
            image: Some(spec.image.clone()),
            env: Some(spec.env.clone()),
            cmd: spec.cmd.clone(),
            entrypoint: spec.entrypoint.clone(),
            user: spec.user.clone(),
            labels: Some(spec.labels.clone()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            networking_config,
            ..Default::default()
        }
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    fn name(&self) -> &str {
        "docker"
    }

    async fn list_containers(
        &self,
        name_filter: &str,
    ) -> Result<Vec<ContainerSummary>, EngineError> {
        let options = ListContainersOptions::<String> {
            all: true,
            filters: HashMap::from([("name".to_string(), vec![name_filter.to_string()])]),
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(options)).await?;

        Ok(containers
            .into_iter()
            .map(|summary| ContainerSummary {
                id: summary.id.unwrap_or_default(),
                names: summary.names.unwrap_or_default(),
                state: ContainerState::from_status(summary.state.as_deref().unwrap_or_default()),
                image: summary.image.unwrap_or_default(),
            })
            .collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails, EngineError> {
        let response = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await?;

        let state = response
            .state
            .as_ref()
            .and_then(|state| state.status.as_ref())
            .map(|status| ContainerState::from_status(&status.to_string()))
            .unwrap_or(ContainerState::Other(String::new()));
        let (image, env) = response
            .config
            .map(|config| (config.image.unwrap_or_default(), config.env.unwrap_or_default()))
            .unwrap_or_default();
        let networks = response
            .network_settings
            .and_then(|settings| settings.networks)
            .unwrap_or_default()
            .into_iter()
            .map(|(name, endpoint)| {
                (
                    name,
                    EndpointSettings {
                        network_id: endpoint.network_id,
                        gateway: endpoint.gateway,
                        ip_address: endpoint.ip_address,
                    },
                )
            })
            .collect();

        Ok(ContainerDetails {
            id: response.id.unwrap_or_else(|| id.to_string()),
            name: response
                .name
                .unwrap_or_default()
                .trim_start_matches('/')
                .to_string(),
            state,
            image,
            env,
            networks,
        })
    }

    async fn create_container(
        &self,
        spec: &ContainerSpec,
    ) -> Result<CreatedContainer, EngineError> {
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };
        debug!("Creating container {} from {}", spec.name, spec.image);
        match self
            .docker
            .create_container(Some(options), Self::container_config(spec))
            .await
        {
            Ok(response) => Ok(CreatedContainer {
                id: response.id,
                warnings: response.warnings,
            }),
            Err(DockerError::DockerResponseServerError {
                status_code: 409, ..
            }) => Err(EngineError::DuplicateContainerName(spec.name.clone())),
            Err(e) => Err(e.into()),
        }
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        not_modified_is_ok(
            self.docker
                .start_container(id, None::<StartContainerOptions<String>>)
                .await,
        )
    }

    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<(), EngineError> {
        let options = StopContainerOptions {
            t: timeout.as_secs() as i64,
        };
        not_modified_is_ok(self.docker.stop_container(id, Some(options)).await)
    }

    async fn restart_container(&self, id: &str, timeout: Duration) -> Result<(), EngineError> {
        let options = RestartContainerOptions {
            t: timeout.as_secs() as isize,
        };
        self.docker.restart_container(id, Some(options)).await?;
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), EngineError> {
        let options = RemoveContainerOptions {
            force: false,
            ..Default::default()
        };
        self.docker.remove_container(id, Some(options)).await?;
        Ok(())
    }

    async fn image_exists(&self, reference: &str) -> Result<bool, EngineError> {
        let options = ListImagesOptions::<String> {
            filters: HashMap::from([("reference".to_string(), vec![reference.to_string()])]),
            ..Default::default()
        };
        let images = self.docker.list_images(Some(options)).await?;
        Ok(!images.is_empty())
    }

    async fn pull_image(&self, reference: &str) -> Result<(), EngineError> {
        let options = CreateImageOptions {
            from_image: reference.to_string(),
            ..Default::default()
        };
        let mut progress = self.docker.create_image(Some(options), None, None);
        while let Some(update) = progress.next().await {
            let update = update?;
            if let Some(status) = update.status {
                debug!("pull {reference}: {status}");
            }
        }
        Ok(())
    }

    async fn exec(&self, id: &str, command: &ExecCommand) -> Result<ExecOutput, EngineError> {
        let options = CreateExecOptions::<String> {
            cmd: Some(command.cmd.clone()),
            user: command.user.clone(),
            working_dir: command.working_dir.clone(),
            env: (!command.env.is_empty()).then(|| command.env.clone()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };
        let exec = self.docker.create_exec(id, options).await?;

        let mut stdout = String::new();
        let mut stderr = String::new();
        if let StartExecResults::Attached { mut output, .. } =
            self.docker.start_exec(&exec.id, None).await?
        {
            while let Some(chunk) = output.next().await {
                match chunk? {
                    LogOutput::StdOut { message } => {
                        stdout.push_str(&String::from_utf8_lossy(&message))
                    }
                    LogOutput::StdErr { message } => {
                        stderr.push_str(&String::from_utf8_lossy(&message))
                    }
                    _ => {}
                }
            }
        }

        let inspected = self.docker.inspect_exec(&exec.id).await?;
        Ok(ExecOutput {
            exit_code: inspected.exit_code,
            stdout,
            stderr,
        })
    }

    async fn upload_archive(
        &self,
        id: &str,
        path: &str,
        archive: Vec<u8>,
    ) -> Result<(), EngineError> {
        let options = UploadToContainerOptions {
            path: path.to_string(),
            ..Default::default()
        };
        self.docker
            .upload_to_container(id, Some(options), archive.into())
            .await?;
        Ok(())
    }

    async fn download_archive(&self, id: &str, path: &str) -> Result<Vec<u8>, EngineError> {
        let options = DownloadFromContainerOptions {
            path: path.to_string(),
        };
        let mut stream = self.docker.download_from_container(id, Some(options));
        let mut archive = Vec::new();
        while let Some(chunk) = stream.next().await {
            archive.extend_from_slice(&chunk?);
        }
        Ok(archive)
    }

    async fn create_network(&self, name: &str) -> Result<String, EngineError> {
        let options = CreateNetworkOptions {
            name: name.to_string(),
            check_duplicate: true,
            driver: "bridge".to_string(),
            ..Default::default()
        };
        self.docker.create_network(options).await?;
        Ok(self.inspect_network(name).await?.id)
    }

    async fn list_networks(&self, name_filter: &str) -> Result<Vec<NetworkSummary>, EngineError> {
        let options = ListNetworksOptions::<String> {
            filters: HashMap::from([("name".to_string(), vec![name_filter.to_string()])]),
        };
        let networks = self.docker.list_networks(Some(options)).await?;
        Ok(networks
            .into_iter()
            .map(|network| NetworkSummary {
                id: network.id.unwrap_or_default(),
                name: network.name.unwrap_or_default(),
            })
            .collect())
    }

    async fn inspect_network(&self, id_or_name: &str) -> Result<NetworkDetails, EngineError> {
        let network = self
            .docker
            .inspect_network(id_or_name, None::<InspectNetworkOptions<String>>)
            .await?;
        let gateway = network
            .ipam
            .and_then(|ipam| ipam.config)
            .unwrap_or_default()
            .into_iter()
            .find_map(|config| config.gateway);

        Ok(NetworkDetails {
            id: network.id.unwrap_or_default(),
            name: network.name.unwrap_or_else(|| id_or_name.to_string()),
            gateway,
        })
    }

    async fn remove_network(&self, id: &str) -> Result<(), EngineError> {
        self.docker.remove_network(id).await?;
        Ok(())
    }

    async fn create_volume(
        &self,
        name: &str,
        labels: &HashMap<String, String>,
    ) -> Result<String, EngineError> {
        let options = CreateVolumeOptions {
            name: name.to_string(),
            driver: "local".to_string(),
            labels: labels.clone(),
            ..Default::default()
        };
        self.docker.create_volume(options).await?;
        Ok(name.to_string())
    }

    async fn remove_volume(&self, name: &str) -> Result<(), EngineError> {
        self.docker
            .remove_volume(name, None::<RemoveVolumeOptions>)
            .await?;
        Ok(())
    }
}
