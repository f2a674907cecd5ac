//! Docker-backed runtime client

use crate::config::{PullPolicy, RuntimeConfig};
use crate::runtime::{RuntimeClient, RuntimeError, WorkloadInfo, WorkloadSpec};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{
    EndpointSettings, HostConfig, Mount, MountTypeEnum, RestartPolicy, RestartPolicyNameEnum,
};
use bollard::network::{CreateNetworkOptions, ListNetworksOptions};
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

/// Runs tenant workloads as Docker containers
pub struct DockerRuntime {
    client: Docker,
    pull_policy: PullPolicy,
    stop_timeout: Duration,
}

impl DockerRuntime {
    /// Connect to the Docker daemon and verify it answers.
    ///
    /// Connection priority:
    /// 1. Explicit `docker_host` from the configuration
    /// 2. DOCKER_HOST environment variable
    /// 3. Common socket paths (platform-specific)
    pub async fn connect(config: &RuntimeConfig) -> Result<Self, RuntimeError> {
        let client = if let Some(host) = config.docker_host.as_deref() {
            connect_to_host(host)?
        } else if let Ok(host) = std::env::var("DOCKER_HOST") {
            connect_to_host(&host)?
        } else {
            connect_with_defaults().await?
        };

        client.ping().await.map_err(|e| {
            RuntimeError::Unavailable(format!(
                "Docker daemon is not responding: {}. Ensure dockerd is running.",
                e
            ))
        })?;

        debug!("Connected to Docker daemon");
        Ok(Self {
            client,
            pull_policy: config.pull_policy.clone(),
            stop_timeout: config.stop_timeout(),
        })
    }

    /// Pull an image if the pull policy asks for it
    async fn pull_image_if_needed(&self, image: &str) -> Result<(), RuntimeError> {
        let should_pull = match self.pull_policy {
            PullPolicy::Always => true,
            PullPolicy::Never => {
                if self.client.inspect_image(image).await.is_err() {
                    return Err(RuntimeError::operation(
                        "pull",
                        image,
                        "image not present locally and pull_policy is 'never'",
                    ));
                }
                false
            }
            PullPolicy::IfNotPresent => self.client.inspect_image(image).await.is_err(),
        };

        if !should_pull {
            debug!(image, "Image exists locally, skipping pull");
            return Ok(());
        }

        info!(image, "Pulling image");
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let mut stream = self.client.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            let progress = result.map_err(|e| RuntimeError::operation("pull", image, e))?;
            if let Some(error) = progress.error {
                return Err(RuntimeError::operation("pull", image, error));
            }
            if let Some(status) = progress.status {
                debug!(image, status = %status, "Pull progress");
            }
        }
        info!(image, "Image pulled");
        Ok(())
    }
}

fn connect_to_host(host: &str) -> Result<Docker, RuntimeError> {
    let client = if let Some(socket_path) = host.strip_prefix("unix://") {
        Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
    } else if host.starts_with("tcp://") || host.starts_with("http://") {
        Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
    } else {
        return Err(RuntimeError::Unavailable(format!(
            "invalid docker_host '{}', expected 'unix:///path/to/socket' or 'tcp://host:port'",
            host
        )));
    };
    client.map_err(|e| RuntimeError::Unavailable(format!("cannot connect to '{}': {}", host, e)))
}

async fn connect_with_defaults() -> Result<Docker, RuntimeError> {
    let home = std::env::var("HOME").unwrap_or_default();
    let xdg_runtime = std::env::var("XDG_RUNTIME_DIR").unwrap_or_default();

    let socket_paths = [
        "/var/run/docker.sock".to_string(),
        format!("{}/.docker/run/docker.sock", home),
        format!("{}/podman/podman.sock", xdg_runtime),
    ];

    for path in &socket_paths {
        // Skip paths built from empty env vars
        if path.starts_with('/') && !path.starts_with("//") && std::path::Path::new(path).exists() {
            debug!(path = %path, "Found Docker socket");
            if let Ok(client) = Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION) {
                if client.ping().await.is_ok() {
                    return Ok(client);
                }
            }
        }
    }

    Docker::connect_with_socket_defaults().map_err(|e| {
        RuntimeError::Unavailable(format!(
            "no Docker socket found; set DOCKER_HOST or runtime.docker_host ({})",
            e
        ))
    })
}

fn addresses_of(networks: Option<HashMap<String, EndpointSettings>>) -> HashMap<String, String> {
    networks
        .unwrap_or_default()
        .into_iter()
        .filter_map(|(name, endpoint)| {
            endpoint
                .ip_address
                .filter(|ip| !ip.is_empty())
                .map(|ip| (name, ip))
        })
        .collect()
}

fn docker_mounts(spec: &WorkloadSpec) -> Vec<Mount> {
    spec.mounts
        .iter()
        .map(|m| Mount {
            typ: Some(MountTypeEnum::BIND),
            source: Some(m.source.clone()),
            target: Some(m.target.clone()),
            read_only: Some(m.read_only),
            ..Default::default()
        })
        .collect()
}

fn is_status(err: &bollard::errors::Error, code: u16) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError { status_code, .. } if *status_code == code
    )
}

#[async_trait]
impl RuntimeClient for DockerRuntime {
    async fn list_workloads(&self, prefix: &str) -> Result<Vec<WorkloadInfo>, RuntimeError> {
        let options = ListContainersOptions::<String> {
            all: true,
            filters: HashMap::from([("name".to_string(), vec![prefix.to_string()])]),
            ..Default::default()
        };
        let containers = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(|e| RuntimeError::operation("list", prefix, e))?;

        // The name filter is a substring match; keep true prefix matches only
        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let name = c
                    .names?
                    .into_iter()
                    .map(|n| n.trim_start_matches('/').to_string())
                    .find(|n| n.starts_with(prefix))?;
                Some(WorkloadInfo {
                    id: c.id?,
                    name,
                    running: c.state.as_deref() == Some("running"),
                    addresses: addresses_of(c.network_settings.and_then(|n| n.networks)),
                })
            })
            .collect())
    }

    async fn inspect_workload(&self, id: &str) -> Result<WorkloadInfo, RuntimeError> {
        let info = self
            .client
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| RuntimeError::operation("inspect", id, e))?;

        Ok(WorkloadInfo {
            id: info.id.unwrap_or_else(|| id.to_string()),
            name: info
                .name
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_default(),
            running: info.state.and_then(|s| s.running).unwrap_or(false),
            addresses: addresses_of(info.network_settings.and_then(|n| n.networks)),
        })
    }

    async fn create_and_start(&self, spec: &WorkloadSpec) -> Result<String, RuntimeError> {
        self.pull_image_if_needed(&spec.image).await?;

        let host_config = HostConfig {
            mounts: Some(docker_mounts(spec)),
            network_mode: spec.network.clone(),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::ALWAYS),
                maximum_retry_count: None,
            }),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(spec.env.clone()),
            hostname: Some(spec.hostname.clone()),
            labels: Some(spec.labels.clone()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self
            .client
            .create_container(Some(options), config)
            .await
            .map_err(|e| RuntimeError::operation("create", &spec.name, e))?;
        let container_id = response.id;
        info!(container_id = %container_id, name = %spec.name, image = %spec.image, "Created container");

        self.client
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| RuntimeError::operation("start", &spec.name, e))?;
        info!(container_id = %container_id, "Started container");

        Ok(container_id)
    }

    async fn stop(&self, id: &str) -> Result<(), RuntimeError> {
        let options = StopContainerOptions {
            t: self.stop_timeout.as_secs() as i64,
        };
        match self.client.stop_container(id, Some(options)).await {
            Ok(_) => {
                info!(container_id = id, "Stopped container");
                Ok(())
            }
            Err(e) if is_status(&e, 304) => {
                debug!(container_id = id, "Container was already stopped");
                Ok(())
            }
            Err(e) if is_status(&e, 404) => {
                debug!(container_id = id, "Container not found");
                Ok(())
            }
            Err(e) => Err(RuntimeError::operation("stop", id, e)),
        }
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.client.remove_container(id, Some(options)).await {
            Ok(_) => {
                debug!(container_id = id, "Removed container");
                Ok(())
            }
            Err(e) if is_status(&e, 404) => {
                debug!(container_id = id, "Container not found");
                Ok(())
            }
            Err(e) => Err(RuntimeError::operation("remove", id, e)),
        }
    }

    async fn ensure_network(&self, name: &str) -> Result<(), RuntimeError> {
        let options = ListNetworksOptions::<String> {
            filters: HashMap::from([("name".to_string(), vec![name.to_string()])]),
        };
        let networks = self
            .client
            .list_networks(Some(options))
            .await
            .map_err(|e| RuntimeError::operation("list networks", name, e))?;

        if networks.iter().any(|n| n.name.as_deref() == Some(name)) {
            debug!(network = name, "Network exists");
            return Ok(());
        }

        let options = CreateNetworkOptions::<String> {
            name: name.to_string(),
            driver: "bridge".to_string(),
            check_duplicate: true,
            ..Default::default()
        };
        self.client
            .create_network(options)
            .await
            .map_err(|e| RuntimeError::operation("create network", name, e))?;
        info!(network = name, "Created network");
        Ok(())
    }
}
