//! The xDS control plane server.
//!
//! Wires the three subsystems together: subscribes to the registry's change
//! hook, rebuilds per-node snapshots into the cache, and serves the cache
//! over gRPC.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::oneshot;
use tonic::transport::Server;
use tracing::{error, info};

use envoyage_cache::{Cache, SnapshotCache};
use envoyage_core::Result;
use envoyage_registry::ServiceRegistry;

use crate::builder::SnapshotBuilder;
use crate::services::create_services;

/// The xDS control plane server.
///
/// Owns the snapshot cache and the builder; holds the registry only to
/// read consistent `(services, version)` snapshots on rebuild.
#[derive(Debug)]
pub struct XdsServer {
    registry: Arc<ServiceRegistry>,
    cache: Arc<SnapshotCache>,
    builder: SnapshotBuilder,
    node_ids: Vec<String>,
    /// Serialises rebuilds. The change hook runs on whichever thread
    /// mutated the registry; without this, two concurrent rebuilds could
    /// install snapshots out of version order and leave the cache behind
    /// the registry.
    rebuild_lock: std::sync::Mutex<()>,
}

impl XdsServer {
    /// Create the server and install the registry change hook.
    ///
    /// The hook body is rebuild-all: every accepted registry mutation
    /// rebuilds and installs a snapshot for each managed node. The hook
    /// holds only a weak reference, so dropping the server detaches it.
    pub fn new(registry: Arc<ServiceRegistry>, builder: SnapshotBuilder) -> Arc<Self> {
        let node_ids = vec![
            builder.home_node_id().to_string(),
            builder.edge_node_id().to_string(),
        ];

        let server = Arc::new(Self {
            registry: Arc::clone(&registry),
            cache: Arc::new(SnapshotCache::new()),
            builder,
            node_ids,
            rebuild_lock: std::sync::Mutex::new(()),
        });

        let weak = Arc::downgrade(&server);
        registry.on_change(move || {
            if let Some(server) = weak.upgrade() {
                // Per-node failures are logged inside; the previous
                // snapshot for a failed node stays authoritative.
                let _ = server.rebuild_all();
            }
        });

        server
    }

    /// The snapshot cache serving the gRPC streams.
    #[inline]
    pub fn cache(&self) -> &Arc<SnapshotCache> {
        &self.cache
    }

    /// The node IDs this control plane manages.
    #[inline]
    pub fn node_ids(&self) -> &[String] {
        &self.node_ids
    }

    /// Build and install snapshots for every managed node once,
    /// synchronously, before serving.
    ///
    /// Without the seed a connecting data plane could stall indefinitely
    /// waiting for initial resources. A failure here is startup-fatal.
    pub fn seed(&self) -> Result<()> {
        self.rebuild_all()
    }

    /// Read one consistent registry snapshot and install a freshly built
    /// snapshot for each managed node.
    ///
    /// A build or install failure for one node is logged and does not stop
    /// the others; the first error is returned so `seed` can abort startup.
    fn rebuild_all(&self) -> Result<()> {
        // Read the registry under the rebuild lock: the rebuild that runs
        // last observes the newest version, so the installed snapshots
        // converge on the final registry state.
        let _guard = self.rebuild_lock.lock().expect("rebuild lock poisoned");
        let (services, version) = self.registry.snapshot();

        let mut first_error = None;
        for node_id in &self.node_ids {
            match self.builder.build(node_id, &services, version) {
                Ok(snapshot) => self.cache.set_snapshot(node_id, snapshot),
                Err(e) => {
                    error!(
                        node = %node_id,
                        version,
                        error = %e,
                        "failed to build snapshot, previous snapshot stays authoritative"
                    );
                    first_error.get_or_insert(e);
                }
            }
        }

        if first_error.is_none() {
            info!(
                version,
                services = services.len(),
                nodes = self.node_ids.len(),
                home_envoy_ingress = %self.builder.home_ingress(),
                "pushed xDS snapshots"
            );
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Bind `addr` and serve the six discovery services until `shutdown`
    /// fires, then stop gracefully, letting active streams drain.
    pub async fn serve(
        &self,
        addr: SocketAddr,
        shutdown: oneshot::Receiver<()>,
    ) -> std::result::Result<(), tonic::transport::Error> {
        let (ads, cds, eds, lds, rds, sds) = create_services(Arc::clone(&self.cache));

        info!(addr = %addr, "xDS server listening");

        Server::builder()
            .add_service(ads.into_service())
            .add_service(cds.into_service())
            .add_service(eds.into_service())
            .add_service(lds.into_service())
            .add_service(rds.into_service())
            .add_service(sds.into_service())
            .serve_with_shutdown(addr, async move {
                let _ = shutdown.await;
                info!("shutting down xDS server");
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    use data_plane_api::envoy::config::cluster::v3::Cluster;
    use data_plane_api::envoy::config::core::v3::{address, socket_address};
    use data_plane_api::envoy::config::endpoint::v3::lb_endpoint;
    use data_plane_api::envoy::config::route::v3::RouteConfiguration;

    use envoyage_core::TypeUrl;
    use envoyage_registry::Service;

    const HOME: &str = "envoyage-envoy-home";
    const EDGE: &str = "envoyage-envoy-vps";

    fn setup() -> (Arc<ServiceRegistry>, Arc<XdsServer>) {
        let registry = Arc::new(ServiceRegistry::new());
        let builder = SnapshotBuilder::new(HOME, EDGE, "envoy-home:10000");
        let server = XdsServer::new(Arc::clone(&registry), builder);
        server.seed().unwrap();
        (registry, server)
    }

    fn cluster_upstream(server: &XdsServer, node: &str, cluster: &str) -> (String, u32) {
        let snapshot = server.cache().get_snapshot(node).unwrap();
        let set = snapshot.get_resources(&TypeUrl::CLUSTER.into()).unwrap();
        let cluster = Cluster::decode(set.get(cluster).unwrap().value.as_slice()).unwrap();

        let lb = &cluster.load_assignment.as_ref().unwrap().endpoints[0].lb_endpoints[0];
        let Some(lb_endpoint::HostIdentifier::Endpoint(endpoint)) = &lb.host_identifier else {
            panic!("endpoint expected");
        };
        let Some(address::Address::SocketAddress(socket)) =
            &endpoint.address.as_ref().unwrap().address
        else {
            panic!("socket address expected");
        };
        let Some(socket_address::PortSpecifier::PortValue(port)) = socket.port_specifier else {
            panic!("port expected");
        };
        (socket.address.clone(), port)
    }

    #[test]
    fn empty_seed_installs_listener_and_empty_routes_for_all_nodes() {
        let (_registry, server) = setup();

        for node in [HOME, EDGE] {
            let snapshot = server.cache().get_snapshot(node).unwrap();
            assert_eq!(snapshot.version(), "v0");

            let listeners = snapshot.get_resources(&TypeUrl::LISTENER.into()).unwrap();
            assert!(listeners.get("listener_http").is_some());

            let routes = snapshot.get_resources(&TypeUrl::ROUTE.into()).unwrap();
            let config =
                RouteConfiguration::decode(routes.get("local_routes").unwrap().value.as_slice())
                    .unwrap();
            assert!(config.virtual_hosts.is_empty());

            assert!(snapshot
                .get_resources(&TypeUrl::CLUSTER.into())
                .unwrap()
                .is_empty());
        }
    }

    #[test]
    fn add_routes_both_nodes_with_split_horizon() {
        let (registry, server) = setup();

        registry
            .add(Service::new("web", "web.example.com", "web-a:5678"))
            .unwrap();

        for node in [HOME, EDGE] {
            let snapshot = server.cache().get_snapshot(node).unwrap();
            assert_eq!(snapshot.version(), "v1");

            let routes = snapshot.get_resources(&TypeUrl::ROUTE.into()).unwrap();
            let config =
                RouteConfiguration::decode(routes.get("local_routes").unwrap().value.as_slice())
                    .unwrap();
            assert_eq!(config.virtual_hosts.len(), 1);
            assert_eq!(config.virtual_hosts[0].domains, vec!["web.example.com"]);
        }

        let (host, port) = cluster_upstream(&server, HOME, "cluster_web");
        assert_eq!((host.as_str(), port), ("web-a", 5678));

        let (host, port) = cluster_upstream(&server, EDGE, "cluster_web");
        assert_eq!((host.as_str(), port), ("envoy-home", 10000));
    }

    #[test]
    fn hot_swap_replaces_the_upstream() {
        let (registry, server) = setup();

        registry
            .add(Service::new("web", "web.example.com", "web-a:5678"))
            .unwrap();
        registry.remove("web").unwrap();
        registry
            .add(Service::new("web", "web.example.com", "web-b:5678"))
            .unwrap();

        let (host, _) = cluster_upstream(&server, HOME, "cluster_web");
        assert_eq!(host, "web-b");

        let snapshot = server.cache().get_snapshot(HOME).unwrap();
        assert_eq!(snapshot.version(), "v3");
    }

    #[test]
    fn duplicate_add_leaves_snapshots_untouched() {
        let (registry, server) = setup();
        registry
            .add(Service::new("web", "web.example.com", "web-a:5678"))
            .unwrap();

        let before = server.cache().get_snapshot(HOME).unwrap();
        assert!(registry
            .add(Service::new("web", "other.example.com", "x:1"))
            .is_err());

        let after = server.cache().get_snapshot(HOME).unwrap();
        assert_eq!(before.version(), after.version());
    }

    #[test]
    fn burst_of_mutations_converges_on_final_version() {
        let (registry, server) = setup();

        for i in 0..20 {
            registry
                .add(Service::new(
                    format!("svc-{i}"),
                    format!("svc-{i}.example.com"),
                    format!("svc-{i}:80"),
                ))
                .unwrap();
        }
        for i in 0..10 {
            registry.remove(&format!("svc-{i}")).unwrap();
        }

        let (_, version) = registry.snapshot();
        assert_eq!(version, 30);

        for node in [HOME, EDGE] {
            let snapshot = server.cache().get_snapshot(node).unwrap();
            assert_eq!(snapshot.version(), "v30");
            assert_eq!(
                snapshot
                    .get_resources(&TypeUrl::CLUSTER.into())
                    .unwrap()
                    .len(),
                10
            );
        }
    }

    #[test]
    fn listener_version_is_carried_forward_when_unchanged() {
        let (registry, server) = setup();

        registry
            .add(Service::new("web", "web.example.com", "web-a:5678"))
            .unwrap();

        let snapshot = server.cache().get_snapshot(HOME).unwrap();
        assert_eq!(snapshot.version(), "v1");
        // The listener never varies with the service set, so its per-type
        // version stays at the seed value and is not resent.
        assert_eq!(
            snapshot.get_version(&TypeUrl::LISTENER.into()),
            Some("v0")
        );
        assert_eq!(snapshot.get_version(&TypeUrl::CLUSTER.into()), Some("v1"));
    }

    #[test]
    fn concurrent_writers_converge_installed_snapshots() {
        use std::thread;

        const WRITERS: usize = 4;
        const CYCLES: u64 = 10;

        let (registry, server) = setup();

        let mut handles = Vec::new();
        for w in 0..WRITERS {
            let reg = Arc::clone(&registry);
            handles.push(thread::spawn(move || {
                for c in 0..CYCLES {
                    let name = format!("writer{w}-svc{c}");
                    reg.add(Service::new(
                        name.clone(),
                        format!("{name}.example.com"),
                        format!("{name}:80"),
                    ))
                    .unwrap();
                    reg.remove(&name).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let expected = (WRITERS as u64) * CYCLES * 2;
        let (services, version) = registry.snapshot();
        assert!(services.is_empty());
        assert_eq!(version, expected);

        // Once mutations cease, every managed node's installed snapshot
        // carries the final registry version.
        for node in [HOME, EDGE] {
            let snapshot = server.cache().get_snapshot(node).unwrap();
            assert_eq!(snapshot.version(), format!("v{expected}"));
        }
    }

    #[test]
    fn dropping_the_server_detaches_the_hook() {
        let (registry, server) = setup();
        drop(server);
        // The weak hook no-ops instead of panicking or leaking.
        registry
            .add(Service::new("web", "web.example.com", "web-a:5678"))
            .unwrap();
    }
}
