//! Container orchestration facade.
//!
//! The session lifecycle core only ever talks to the container runtime
//! through the [`ContainerRuntime`] trait, so the daemons can be exercised
//! against a mock in tests. The production implementation wraps the Docker
//! Engine API reachable over the local socket.

pub mod build;

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{Config, CreateContainerOptions, NetworkingConfig, StopContainerOptions};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{EndpointSettings, HostConfig, PortBinding};
use bollard::network::CreateNetworkOptions;
use bollard::Docker;
use futures_util::StreamExt;

use crate::error::RuntimeError;

/// Everything needed to create and start one container.
///
/// The initial network attachment is mandatory for session containers:
/// omitting it would silently attach the container to the default bridge
/// network, connecting containers that must stay isolated from one another.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Container name, also used as its internal hostname.
    pub name: String,
    /// Image the container is created from.
    pub image: String,
    /// Remove the container automatically once it stops (`--rm`).
    pub auto_remove: bool,
    /// Allocate a pseudo-terminal.
    pub tty: bool,
    /// Attach stdin so the container can be interacted with.
    pub attach_stdin: bool,
    /// Ports exposed by the container, e.g. `"2222/tcp"`.
    pub exposed_ports: Vec<String>,
    /// Host bindings as `(container_port, host_ip, host_port)`.
    pub port_bindings: Vec<(String, String, String)>,
    /// Bind mounts as `"host_path:container_path"`.
    pub binds: Vec<String>,
    /// Network the container is attached to at creation time.
    pub network_id: String,
}

impl ContainerSpec {
    /// Spec for an upstream session container: interactive, auto-removed on
    /// stop, hostname equal to its name, attached to `network_id` at birth.
    pub fn upstream(name: &str, image: &str, network_id: &str) -> Self {
        Self {
            name: name.to_string(),
            image: image.to_string(),
            auto_remove: true,
            tty: true,
            attach_stdin: true,
            exposed_ports: Vec::new(),
            port_bindings: Vec::new(),
            binds: Vec::new(),
            network_id: network_id.to_string(),
        }
    }
}

/// Abstract surface of the container runtime consumed by the core.
///
/// Operations are idempotent in intent but not in effect; callers must not
/// assume cleanup on partial failure.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create a bridge-driver virtual network and return its id.
    async fn create_network(&self, name: &str) -> Result<String, RuntimeError>;

    /// Create and start a container, returning its id.
    async fn run_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    /// Run a command inside a running container and wait for it to finish.
    /// Output streams are captured for diagnostics but not returned.
    async fn exec(
        &self,
        container_id: &str,
        argv: Vec<String>,
        timeout: Option<Duration>,
    ) -> Result<(), RuntimeError>;

    /// Stop a running container. `None` uses the runtime default grace
    /// period.
    async fn stop_container(
        &self,
        container_id: &str,
        grace: Option<Duration>,
    ) -> Result<(), RuntimeError>;

    /// Remove a network by id.
    async fn remove_network(&self, network_id: &str) -> Result<(), RuntimeError>;

    /// Build an image from the Dockerfile in `src_dir` and tag it.
    async fn build_image(&self, src_dir: &Path, tag: &str) -> Result<(), RuntimeError>;
}

/// Production [`ContainerRuntime`] backed by the local Docker daemon.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to the Docker daemon over the platform-default local socket.
    pub fn connect() -> Result<Self, RuntimeError> {
        let docker =
            Docker::connect_with_local_defaults().map_err(|e| RuntimeError::Connect {
                reason: e.to_string(),
            })?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create_network(&self, name: &str) -> Result<String, RuntimeError> {
        let options = CreateNetworkOptions {
            name: name.to_string(),
            // Bridge driver: virtual networks between containers on a single
            // host.
            driver: "bridge".to_string(),
            check_duplicate: true,
            ..Default::default()
        };

        let response = self
            .docker
            .create_network(options)
            .await
            .map_err(|e| RuntimeError::NetworkCreate {
                name: name.to_string(),
                reason: e.to_string(),
            })?;

        if let Some(warning) = response.warning.as_deref().filter(|w| !w.is_empty()) {
            tracing::warn!(network = name, warning = %warning, "network created with warning");
        }

        Ok(response.id.unwrap_or_default())
    }

    async fn run_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let mut endpoints = HashMap::new();
        endpoints.insert(
            spec.network_id.clone(),
            EndpointSettings {
                network_id: Some(spec.network_id.clone()),
                ..Default::default()
            },
        );

        let exposed_ports = if spec.exposed_ports.is_empty() {
            None
        } else {
            Some(
                spec.exposed_ports
                    .iter()
                    .map(|port| (port.clone(), HashMap::new()))
                    .collect(),
            )
        };

        let port_bindings = if spec.port_bindings.is_empty() {
            None
        } else {
            Some(
                spec.port_bindings
                    .iter()
                    .map(|(port, host_ip, host_port)| {
                        (
                            port.clone(),
                            Some(vec![PortBinding {
                                host_ip: Some(host_ip.clone()),
                                host_port: Some(host_port.clone()),
                            }]),
                        )
                    })
                    .collect(),
            )
        };

        let host_config = HostConfig {
            auto_remove: Some(spec.auto_remove),
            binds: if spec.binds.is_empty() {
                None
            } else {
                Some(spec.binds.clone())
            },
            port_bindings,
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            hostname: Some(spec.name.clone()),
            tty: Some(spec.tty),
            attach_stdin: Some(spec.attach_stdin),
            exposed_ports,
            host_config: Some(host_config),
            networking_config: Some(NetworkingConfig {
                endpoints_config: endpoints,
            }),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| RuntimeError::Run {
                name: spec.name.clone(),
                reason: e.to_string(),
            })?;

        self.docker
            .start_container::<String>(&response.id, None)
            .await
            .map_err(|e| RuntimeError::Run {
                name: spec.name.clone(),
                reason: format!("failed to start container: {e}"),
            })?;

        Ok(response.id)
    }

    async fn exec(
        &self,
        container_id: &str,
        argv: Vec<String>,
        timeout: Option<Duration>,
    ) -> Result<(), RuntimeError> {
        let exec = self
            .docker
            .create_exec(
                container_id,
                CreateExecOptions {
                    // Attach output streams so diagnostic messages from the
                    // container can be logged.
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    cmd: Some(argv),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| RuntimeError::Exec {
                container_id: container_id.to_string(),
                reason: e.to_string(),
            })?;

        let run = async {
            match self.docker.start_exec(&exec.id, None).await? {
                StartExecResults::Attached { mut output, .. } => {
                    while let Some(chunk) = output.next().await {
                        let log = chunk?;
                        tracing::debug!(container = container_id, output = %log, "exec output");
                    }
                }
                StartExecResults::Detached => {}
            }
            Ok::<(), bollard::errors::Error>(())
        };

        let result = match timeout {
            Some(limit) => tokio::time::timeout(limit, run).await.map_err(|_| {
                RuntimeError::ExecTimeout {
                    container_id: container_id.to_string(),
                    timeout: limit,
                }
            })?,
            None => run.await,
        };

        result.map_err(|e| RuntimeError::Exec {
            container_id: container_id.to_string(),
            reason: e.to_string(),
        })
    }

    async fn stop_container(
        &self,
        container_id: &str,
        grace: Option<Duration>,
    ) -> Result<(), RuntimeError> {
        let options = grace.map(|g| StopContainerOptions {
            t: g.as_secs() as i64,
        });

        self.docker
            .stop_container(container_id, options)
            .await
            .map_err(|e| RuntimeError::Stop {
                container_id: container_id.to_string(),
                reason: e.to_string(),
            })
    }

    async fn remove_network(&self, network_id: &str) -> Result<(), RuntimeError> {
        self.docker
            .remove_network(network_id)
            .await
            .map_err(|e| RuntimeError::NetworkRemove {
                network_id: network_id.to_string(),
                reason: e.to_string(),
            })
    }

    async fn build_image(&self, src_dir: &Path, tag: &str) -> Result<(), RuntimeError> {
        build::build_image(&self.docker, src_dir, tag).await
    }
}

/// Stop every container belonging to a session, logging and continuing on
/// error. Used at reap and drain time where a failed stop must not abort the
/// sweep.
pub async fn stop_session_containers(
    runtime: &dyn ContainerRuntime,
    name: &str,
    container_ids: &[String],
) -> Result<(), RuntimeError> {
    for container_id in container_ids {
        runtime.stop_container(container_id, None).await?;
        tracing::debug!(session = name, container = %container_id, "stopped session container");
    }
    Ok(())
}
