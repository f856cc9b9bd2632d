//! Automatic service discovery via the Docker socket.
//!
//! The watcher subscribes to the Docker event stream and translates
//! container lifecycle events into registry mutations. When a container
//! with the right labels starts, it is registered as a service; when it
//! stops, it is removed.
//!
//! Label reference (add to any docker-compose.yml service):
//!
//! ```yaml
//! envoyage.enable: "true"            # required - opt this container in
//! envoyage.domain: "app.example.com" # required - virtual host domain
//! envoyage.port:   "8080"            # required - port the app listens on
//! envoyage.name:   "myapp"           # optional - override service name
//! ```
//!
//! If `envoyage.name` is not set, the name is derived from the Compose
//! service label (`com.docker.compose.service`) or the container name.

use std::collections::HashMap;
use std::sync::Arc;

use bollard::container::ListContainersOptions;
use bollard::models::{ContainerInspectResponse, EndpointSettings, EventMessage};
use bollard::system::EventsOptions;
use bollard::Docker;
use tracing::{debug, info, warn};

use envoyage_core::{EnvoyageError, Result};
use envoyage_registry::{Service, ServiceRegistry};

const LABEL_ENABLE: &str = "envoyage.enable";
const LABEL_DOMAIN: &str = "envoyage.domain";
const LABEL_PORT: &str = "envoyage.port";
const LABEL_NAME: &str = "envoyage.name";

// Docker Compose sets this automatically on every container it manages;
// it is the fallback service name when envoyage.name is not set.
const LABEL_COMPOSE_SVC: &str = "com.docker.compose.service";

/// Watches the Docker socket and keeps the registry in sync with running
/// containers carrying the envoyage labels.
#[derive(Debug)]
pub struct DockerWatcher {
    docker: Docker,
    registry: Arc<ServiceRegistry>,
}

impl DockerWatcher {
    /// Connect to the local Docker daemon, honouring `DOCKER_HOST` and
    /// related environment variables.
    pub fn connect(registry: Arc<ServiceRegistry>) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| EnvoyageError::transport("connecting to Docker daemon", e))?;
        Ok(Self { docker, registry })
    }

    /// Run the watcher: sync already-running containers, then follow the
    /// event stream until it ends.
    ///
    /// Call this in a task alongside the xDS and HTTP servers.
    pub async fn run(&self) -> Result<()> {
        info!("docker watcher starting");

        // Containers already running when the control plane starts are
        // re-registered without waiting for a start event.
        if let Err(e) = self.sync_existing().await {
            warn!(error = %e, "initial container sync failed");
        }

        let mut filters = HashMap::new();
        filters.insert("type".to_string(), vec!["container".to_string()]);
        let mut events = std::pin::pin!(self.docker.events(Some(EventsOptions::<String> {
            filters,
            ..Default::default()
        })));

        while let Some(event) = tokio_stream::StreamExt::next(&mut events).await {
            match event {
                Ok(event) => self.handle_event(event).await,
                Err(e) => {
                    return Err(EnvoyageError::transport("docker event stream", e));
                }
            }
        }

        info!("docker watcher stopped");
        Ok(())
    }

    /// Register all currently running containers with envoyage labels.
    async fn sync_existing(&self) -> Result<()> {
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String>::default()))
            .await
            .map_err(|e| EnvoyageError::transport("listing containers", e))?;

        let mut registered = 0usize;
        let scanned = containers.len();
        for container in containers {
            let enabled = container
                .labels
                .as_ref()
                .and_then(|l| l.get(LABEL_ENABLE))
                .is_some_and(|v| v == "true");
            if !enabled {
                continue;
            }
            let Some(id) = container.id else { continue };
            match self.register_by_id(&id).await {
                Ok(()) => registered += 1,
                Err(e) => {
                    warn!(id = %short_id(&id), error = %e, "skipping container during sync");
                }
            }
        }

        info!(scanned, registered, "initial sync complete");
        Ok(())
    }

    /// Process a single Docker container event.
    async fn handle_event(&self, event: EventMessage) {
        let action = event.action.as_deref().unwrap_or_default();
        let Some(actor) = event.actor else { return };

        match action {
            "start" => {
                let Some(id) = actor.id else { return };
                if let Err(e) = self.register_by_id(&id).await {
                    warn!(id = %short_id(&id), error = %e, "failed to register container on start");
                }
            }
            "stop" | "die" | "kill" => {
                // The container may already be gone by now, so use the
                // event actor attributes (captured at event time) instead
                // of inspecting it.
                let attrs = actor.attributes.unwrap_or_default();
                if attrs.get(LABEL_ENABLE).map(String::as_str) != Some("true") {
                    return;
                }
                let Some(name) = service_name(&attrs) else {
                    return;
                };
                match self.registry.remove(&name) {
                    Ok(()) => info!(name = %name, action, "docker: service removed"),
                    // Expected if the container was never registered.
                    Err(_) => debug!(name = %name, "container not in registry on stop"),
                }
            }
            _ => {}
        }
    }

    /// Inspect a container, validate its labels, resolve its IP, and
    /// upsert it into the registry.
    async fn register_by_id(&self, id: &str) -> Result<()> {
        let info = self
            .docker
            .inspect_container(id, None)
            .await
            .map_err(|e| EnvoyageError::transport(format!("inspecting {}", short_id(id)), e))?;

        let labels = info
            .config
            .as_ref()
            .and_then(|c| c.labels.clone())
            .unwrap_or_default();

        if labels.get(LABEL_ENABLE).map(String::as_str) != Some("true") {
            return Ok(()); // not opted in
        }

        let fallback = container_name(&info);
        let svc = service_from_labels(&labels, &info, &fallback)?;

        // Upsert: try add, fall back to update on conflict. Keeps
        // registration idempotent across the initial sync and the
        // event-driven path.
        match self.registry.add(svc.clone()) {
            Ok(()) => {
                info!(name = %svc.name, domain = %svc.domain, upstream = %svc.upstream, "docker: service registered");
            }
            Err(EnvoyageError::ServiceExists { .. }) => {
                self.registry.update(svc.clone())?;
                info!(name = %svc.name, domain = %svc.domain, upstream = %svc.upstream, "docker: service updated");
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }
}

/// Build a [`Service`] from container labels and network settings.
fn service_from_labels(
    labels: &HashMap<String, String>,
    info: &ContainerInspectResponse,
    fallback_name: &str,
) -> Result<Service> {
    let domain = labels
        .get(LABEL_DOMAIN)
        .filter(|d| !d.is_empty())
        .ok_or_else(|| EnvoyageError::InvalidService {
            name: fallback_name.to_string(),
            reason: format!("missing required label {LABEL_DOMAIN:?}"),
        })?;

    let port_str =
        labels
            .get(LABEL_PORT)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| EnvoyageError::InvalidService {
                name: fallback_name.to_string(),
                reason: format!("missing required label {LABEL_PORT:?}"),
            })?;
    let port: u32 = port_str
        .parse()
        .map_err(|_| EnvoyageError::InvalidService {
            name: fallback_name.to_string(),
            reason: format!("invalid label {LABEL_PORT:?}={port_str:?}"),
        })?;

    // The actual IP rather than the Docker DNS name: the home Envoy may
    // not share the container's compose network, and IPs stay unambiguous
    // across projects with identical service names.
    let networks = info
        .network_settings
        .as_ref()
        .and_then(|n| n.networks.clone())
        .unwrap_or_default();
    let ip = container_ip(&networks).ok_or_else(|| EnvoyageError::InvalidService {
        name: fallback_name.to_string(),
        reason: "no IP address found in any attached network".to_string(),
    })?;

    let name = service_name(labels).unwrap_or_else(|| fallback_name.to_string());
    if name.is_empty() {
        return Err(EnvoyageError::InvalidService {
            name,
            reason: "cannot derive a service name".to_string(),
        });
    }

    Ok(Service::new(name, domain, format!("{ip}:{port}")))
}

/// Container IP, choosing the best attached network.
///
/// Selection order:
/// 1. any network whose name contains `envoyage` (the dedicated mesh)
/// 2. the first network with a non-empty IP address
fn container_ip(networks: &HashMap<String, EndpointSettings>) -> Option<String> {
    let mesh = networks.iter().find_map(|(name, net)| {
        let ip = net.ip_address.as_deref().unwrap_or_default();
        (name.to_lowercase().contains("envoyage") && !ip.is_empty()).then(|| ip.to_string())
    });
    mesh.or_else(|| {
        networks.values().find_map(|net| {
            let ip = net.ip_address.as_deref().unwrap_or_default();
            (!ip.is_empty()).then(|| ip.to_string())
        })
    })
}

/// Derive a stable service name from a label map.
///
/// 1. `envoyage.name` (explicit override)
/// 2. `com.docker.compose.service` (auto-set by Compose)
/// 3. `None` - caller falls back to the container name
fn service_name(labels: &HashMap<String, String>) -> Option<String> {
    labels
        .get(LABEL_NAME)
        .filter(|v| !v.is_empty())
        .or_else(|| labels.get(LABEL_COMPOSE_SVC).filter(|v| !v.is_empty()))
        .cloned()
}

/// Container name without the leading slash Docker prepends.
fn container_name(info: &ContainerInspectResponse) -> String {
    info.name
        .as_deref()
        .unwrap_or_default()
        .trim_start_matches('/')
        .to_string()
}

/// First 12 characters of a container ID, matching `docker ps` output.
fn short_id(id: &str) -> &str {
    if id.len() > 12 {
        &id[..12]
    } else {
        id
    }
}
