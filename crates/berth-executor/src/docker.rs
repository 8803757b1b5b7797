//! Docker Engine runtime over the remote TCP API.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bollard::{
    API_DEFAULT_VERSION, Docker,
    container::{
        Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
        RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
    },
    errors::Error as DockerError,
    image::CreateImageOptions,
    models::HostConfig,
};
use futures_util::stream::StreamExt;
use tracing::{debug, info};

use crate::client::RuntimeConnector;
use crate::error::{RuntimeError, RuntimeResult};
use crate::runtime::{ContainerInfo, ContainerRuntime, ContainerSpec, ContainerSummary};

/// Split `image` into repository and tag, defaulting the tag to `latest`.
///
/// A colon before the last `/` belongs to a registry port, not a tag.
/// Digest references are passed through whole with no tag.
pub fn split_image(image: &str) -> (&str, &str) {
    if image.contains('@') {
        return (image, "");
    }
    match image.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => (repo, tag),
        _ => (image, "latest"),
    }
}

fn status_code(err: &DockerError) -> Option<u16> {
    match err {
        DockerError::DockerResponseServerError { status_code, .. } => Some(*status_code),
        _ => None,
    }
}

/// One machine's Docker engine.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    /// Connect to `tcp://{host}:{port}`. The HTTP client's own timeout is a
    /// backstop; attempts are bounded by the retry policy.
    pub fn connect(host: &str, port: u16, timeout: Duration) -> RuntimeResult<Self> {
        let addr = format!("tcp://{host}:{port}");
        let docker = Docker::connect_with_http(&addr, timeout.as_secs().max(1), API_DEFAULT_VERSION)?;
        Ok(Self::new(docker))
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn inspect(&self, name: &str) -> RuntimeResult<ContainerInfo> {
        let resp = match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(resp) => resp,
            Err(e) if status_code(&e) == Some(404) => {
                return Err(RuntimeError::NotFound(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let state = resp.state.unwrap_or_default();
        let running = state.running.unwrap_or(false);
        let pid = if running {
            state.pid.and_then(|p| u32::try_from(p).ok()).unwrap_or(0)
        } else {
            0
        };

        Ok(ContainerInfo {
            id: resp.id.unwrap_or_default(),
            name: resp
                .name
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_else(|| name.to_string()),
            image: resp.config.and_then(|c| c.image),
            pid,
            running,
        })
    }

    async fn pull(&self, image: &str) -> RuntimeResult<()> {
        let (repo, tag) = split_image(image);
        let options = CreateImageOptions {
            from_image: repo.to_string(),
            tag: tag.to_string(),
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(msg) = stream.next().await {
            let info = msg?;
            if let Some(status) = info.status {
                debug!(image, status = %status, "pull progress");
            }
        }
        info!(image, "image pulled");
        Ok(())
    }

    async fn list(&self) -> RuntimeResult<Vec<ContainerSummary>> {
        let options = ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(options)).await?;

        Ok(containers
            .into_iter()
            .map(|c| ContainerSummary {
                id: c.id.unwrap_or_default(),
                names: c
                    .names
                    .unwrap_or_default()
                    .into_iter()
                    .map(|n| n.trim_start_matches('/').to_string())
                    .collect(),
                image: c.image,
                state: c.state,
            })
            .collect())
    }

    async fn start(&self, spec: &ContainerSpec) -> RuntimeResult<String> {
        let host_config = HostConfig {
            nano_cpus: Some((spec.cpus * 1_000_000_000.0) as i64),
            memory: Some((spec.memory_mb * 1024.0 * 1024.0) as i64),
            ..Default::default()
        };
        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(spec.env.clone()),
            labels: Some(spec.labels.clone()),
            host_config: Some(host_config),
            ..Default::default()
        };
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };

        // A previous attempt may have created the container before timing out.
        let id = match self.docker.create_container(Some(options), config).await {
            Ok(resp) => resp.id,
            Err(e) if status_code(&e) == Some(409) => {
                debug!(name = %spec.name, "container already exists, reusing");
                self.inspect(&spec.name).await?.id
            }
            Err(e) => return Err(e.into()),
        };

        match self
            .docker
            .start_container(&id, None::<StartContainerOptions<String>>)
            .await
        {
            // 304: already running.
            Ok(()) => {}
            Err(e) if status_code(&e) == Some(304) => {}
            Err(e) => return Err(e.into()),
        }
        info!(name = %spec.name, container_id = %id, "container started");
        Ok(id)
    }

    async fn stop(&self, id: &str, grace: Duration) -> RuntimeResult<()> {
        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };
        match self.docker.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if status_code(&e) == Some(304) => Ok(()),
            Err(e) if status_code(&e) == Some(404) => Err(RuntimeError::NotFound(id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, id: &str, remove_volumes: bool) -> RuntimeResult<()> {
        let options = RemoveContainerOptions {
            v: remove_volumes,
            force: true,
            ..Default::default()
        };
        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            // Gone already, possibly removed by an earlier attempt.
            Err(e) if status_code(&e) == Some(404) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Opens a [`DockerRuntime`] on each machine's configured engine port.
#[derive(Debug, Clone)]
pub struct DockerConnector {
    port: u16,
    timeout: Duration,
}

impl DockerConnector {
    pub fn new(port: u16, timeout: Duration) -> Self {
        Self { port, timeout }
    }
}

impl RuntimeConnector for DockerConnector {
    fn connect(&self, host: &str) -> RuntimeResult<Arc<dyn ContainerRuntime>> {
        let runtime = DockerRuntime::connect(host, self.port, self.timeout)?;
        Ok(Arc::new(runtime))
    }
}
