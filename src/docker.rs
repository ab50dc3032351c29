//! Docker-backed container teardown

use crate::gateway::ContainerGateway;
use async_trait::async_trait;
use bollard::Docker;
use tracing::{debug, info};

/// Thin wrapper over a connected Docker client
pub struct DockerManager {
    client: Docker,
}

impl DockerManager {
    /// Connect to the Docker daemon
    ///
    /// Connection priority:
    /// 1. Explicit docker_host parameter
    /// 2. DOCKER_HOST environment variable
    /// 3. Common socket paths (platform-specific)
    pub async fn new(docker_host: Option<&str>) -> anyhow::Result<Self> {
        let client = if let Some(host) = docker_host {
            connect_to_host(host).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to connect to Docker at '{}': {}. \
                     Ensure Docker is running and the socket path is correct.",
                    host, e
                )
            })?
        } else if let Ok(host) = std::env::var("DOCKER_HOST") {
            connect_to_host(&host).map_err(|e| {
                anyhow::anyhow!("Failed to connect to Docker via DOCKER_HOST='{}': {}", host, e)
            })?
        } else {
            connect_with_defaults().await?
        };

        client
            .ping()
            .await
            .map_err(|e| anyhow::anyhow!("Docker daemon is not responding: {}", e))?;

        debug!("Connected to Docker daemon");
        Ok(Self { client })
    }

    /// Force kill a container
    pub async fn kill_container(&self, container_id: &str) -> anyhow::Result<()> {
        match self.client.kill_container::<String>(container_id, None).await {
            Ok(_) => {
                info!(container_id, "Killed Docker container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(container_id, "Container not found");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 409, ..
            }) => {
                // Container not running
                debug!(container_id, "Container not running");
                Ok(())
            }
            Err(e) => Err(anyhow::anyhow!("Failed to kill container: {}", e)),
        }
    }
}

fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
    if let Some(socket_path) = host.strip_prefix("unix://") {
        Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
            .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
    } else if host.starts_with("tcp://") || host.starts_with("http://") {
        Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
            .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
    } else {
        anyhow::bail!(
            "Invalid docker host format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
            host
        )
    }
}

async fn connect_with_defaults() -> anyhow::Result<Docker> {
    let home = std::env::var("HOME").unwrap_or_default();
    let xdg_runtime = std::env::var("XDG_RUNTIME_DIR").unwrap_or_default();

    let socket_paths: Vec<(&str, String)> = vec![
        ("Linux default", "/var/run/docker.sock".to_string()),
        ("Docker Desktop (macOS)", format!("{}/.docker/run/docker.sock", home)),
        ("Colima (macOS)", format!("{}/.colima/default/docker.sock", home)),
        ("Podman (Linux)", format!("{}/podman/podman.sock", xdg_runtime)),
    ];

    for (name, path) in &socket_paths {
        // Skip paths built from empty env vars
        if path.is_empty() || path.contains("//") {
            continue;
        }

        if std::path::Path::new(path).exists() {
            debug!(path, name, "Found Docker socket");
            if let Ok(client) = Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION) {
                if client.ping().await.is_ok() {
                    return Ok(client);
                }
            }
        }
    }

    Docker::connect_with_socket_defaults()
        .map_err(|e| anyhow::anyhow!("Cannot connect to Docker daemon: {}", e))
}

/// Gateway that connects to Docker on first use.
///
/// A daemon that is down at startup must not keep the proxy from serving
/// routes; the connection is retried on the next teardown.
pub struct DockerGateway {
    docker_host: Option<String>,
    manager: tokio::sync::OnceCell<DockerManager>,
}

impl DockerGateway {
    pub fn new(docker_host: Option<String>) -> Self {
        Self {
            docker_host,
            manager: tokio::sync::OnceCell::new(),
        }
    }

    async fn manager(&self) -> anyhow::Result<&DockerManager> {
        self.manager
            .get_or_try_init(|| DockerManager::new(self.docker_host.as_deref()))
            .await
    }
}

#[async_trait]
impl ContainerGateway for DockerGateway {
    async fn kill(&self, container_id: &str) -> anyhow::Result<()> {
        self.manager().await?.kill_container(container_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_to_host_rejects_unknown_scheme() {
        let err = connect_to_host("ftp://docker.local").unwrap_err();
        assert!(err.to_string().contains("Invalid docker host format"));
    }

    #[tokio::test]
    async fn test_gateway_reports_unreachable_daemon() {
        let gateway = DockerGateway::new(Some("tcp://127.0.0.1:1".to_string()));
        assert!(gateway.kill("deadbeef").await.is_err());
        // Still not connected, so the next call retries
        assert!(gateway.manager.get().is_none());
    }
}
