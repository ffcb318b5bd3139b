//! Docker-backed container runtime for discovery

use crate::config::DiscoveryConfig;
use crate::discovery::{
    ContainerAction, ContainerEvent, ContainerInfo, ContainerRuntime, PublishedPort, RuntimeError,
};
use async_trait::async_trait;
use bollard::container::{InspectContainerOptions, ListContainersOptions};
use bollard::models::{ContainerInspectResponse, ContainerSummary, EventMessage, PortTypeEnum};
use bollard::system::EventsOptions;
use bollard::Docker;
use futures::future;
use futures::stream::{BoxStream, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Talks to the Docker daemon through bollard
pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    /// Create a client for the Docker daemon. No request is made yet; the
    /// watcher pings before it starts and retries while the daemon is down.
    ///
    /// Connection priority:
    /// 1. Explicit docker_host setting
    /// 2. DOCKER_HOST environment variable
    /// 3. Common socket paths (platform-specific)
    pub fn connect(docker_host: Option<&str>) -> Result<Self, RuntimeError> {
        let client = if let Some(host) = docker_host {
            Self::connect_to_host(host)?
        } else if let Ok(host) = std::env::var("DOCKER_HOST") {
            Self::connect_to_host(&host)?
        } else {
            Self::connect_with_defaults()?
        };

        Ok(Self { client })
    }

    /// Runtime factory for the reconciler
    pub fn from_config(config: &DiscoveryConfig) -> Result<Arc<dyn ContainerRuntime>, RuntimeError> {
        Ok(Arc::new(Self::connect(config.docker_host.as_deref())?))
    }

    fn connect_to_host(host: &str) -> Result<Docker, RuntimeError> {
        if let Some(socket_path) = host.strip_prefix("unix://") {
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION).map_err(|e| {
                RuntimeError::Unavailable(format!("cannot use Unix socket '{}': {}", socket_path, e))
            })
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION).map_err(|e| {
                RuntimeError::Unavailable(format!("cannot use TCP endpoint '{}': {}", host, e))
            })
        } else {
            Err(RuntimeError::Unavailable(format!(
                "invalid docker_host '{}', expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )))
        }
    }

    fn connect_with_defaults() -> Result<Docker, RuntimeError> {
        let home = std::env::var("HOME").unwrap_or_default();
        let xdg_runtime = std::env::var("XDG_RUNTIME_DIR").unwrap_or_default();

        let socket_paths: Vec<(&str, String)> = vec![
            ("Linux default", "/var/run/docker.sock".to_string()),
            ("Docker Desktop (macOS)", format!("{}/.docker/run/docker.sock", home)),
            ("Colima (macOS)", format!("{}/.colima/default/docker.sock", home)),
            ("Rancher Desktop", format!("{}/.rd/docker.sock", home)),
            ("Podman (Linux)", format!("{}/podman/podman.sock", xdg_runtime)),
        ];

        for (name, path) in &socket_paths {
            // Skip paths built from unset env vars
            if path.starts_with("/.") || path.starts_with("/podman") {
                continue;
            }
            if std::path::Path::new(path).exists() {
                debug!(path, name, "Found Docker socket");
                if let Ok(client) =
                    Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION)
                {
                    return Ok(client);
                }
            }
        }

        Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::Unavailable(format!("no Docker socket found: {}", e)))
    }
}

fn trim_name(name: &str) -> String {
    name.trim_start_matches('/').to_string()
}

fn is_tcp(typ: Option<&PortTypeEnum>) -> bool {
    matches!(typ, None | Some(PortTypeEnum::TCP) | Some(PortTypeEnum::EMPTY))
}

fn from_summary(summary: ContainerSummary) -> Option<ContainerInfo> {
    let id = summary.id?;
    let name = summary
        .names
        .as_ref()
        .and_then(|n| n.first())
        .map(|n| trim_name(n))
        .unwrap_or_default();

    let published_ports = summary
        .ports
        .unwrap_or_default()
        .into_iter()
        .filter(|p| is_tcp(p.typ.as_ref()))
        .filter_map(|p| {
            Some(PublishedPort {
                private_port: p.private_port,
                host_ip: p.ip,
                host_port: p.public_port?,
            })
        })
        .collect();

    Some(ContainerInfo {
        id,
        name,
        labels: summary.labels.unwrap_or_default(),
        published_ports,
        running: summary.state.as_deref() == Some("running"),
    })
}

fn from_inspect(id: &str, detail: ContainerInspectResponse) -> ContainerInfo {
    let running = detail
        .state
        .as_ref()
        .map(|s| s.running.unwrap_or(false) && !s.paused.unwrap_or(false))
        .unwrap_or(false);

    let mut published_ports = Vec::new();
    let ports = detail.network_settings.and_then(|n| n.ports).unwrap_or_default();
    for (key, bindings) in ports {
        // Keys look like "8080/tcp"
        let Some((port, proto)) = key.split_once('/') else {
            continue;
        };
        let Ok(private_port) = port.parse::<u16>() else {
            continue;
        };
        if proto != "tcp" {
            continue;
        }
        for binding in bindings.unwrap_or_default() {
            let host_port = binding.host_port.as_deref().and_then(|p| p.parse::<u16>().ok());
            if let Some(host_port) = host_port {
                published_ports.push(PublishedPort {
                    private_port,
                    host_ip: binding.host_ip,
                    host_port,
                });
            }
        }
    }

    ContainerInfo {
        id: detail.id.unwrap_or_else(|| id.to_string()),
        name: detail.name.as_deref().map(trim_name).unwrap_or_default(),
        labels: detail.config.and_then(|c| c.labels).unwrap_or_default(),
        published_ports,
        running,
    }
}

fn to_event(message: EventMessage) -> Option<ContainerEvent> {
    let action = ContainerAction::parse(message.action.as_deref()?)?;
    let container_id = message.actor.and_then(|a| a.id).filter(|id| !id.is_empty())?;
    Some(ContainerEvent {
        action,
        container_id,
    })
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        self.client
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))
    }

    async fn list_running(&self) -> Result<Vec<ContainerInfo>, RuntimeError> {
        let opts = ListContainersOptions::<String> {
            all: false,
            ..Default::default()
        };
        let containers = self
            .client
            .list_containers(Some(opts))
            .await
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;

        Ok(containers.into_iter().filter_map(from_summary).collect())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerInfo, RuntimeError> {
        match self
            .client
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
        {
            Ok(detail) => Ok(from_inspect(id, detail)),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Err(RuntimeError::NotFound(id.to_string())),
            Err(e) => Err(RuntimeError::Api(e.to_string())),
        }
    }

    fn events(&self) -> BoxStream<'static, Result<ContainerEvent, RuntimeError>> {
        let actions = ContainerAction::all()
            .iter()
            .map(|a| a.as_str().to_string())
            .collect();
        let filters = HashMap::from([
            ("type".to_string(), vec!["container".to_string()]),
            ("event".to_string(), actions),
        ]);

        self.client
            .events(Some(EventsOptions::<String> {
                filters,
                ..Default::default()
            }))
            .filter_map(|item| {
                future::ready(match item {
                    Ok(message) => to_event(message).map(Ok),
                    Err(e) => Some(Err(RuntimeError::Unavailable(e.to_string()))),
                })
            })
            .boxed()
    }
}
