//! Translation from the service registry into Envoy xDS snapshots.
//!
//! Envoy's configuration model has layered resource types:
//!
//! ```text
//! Listener (LDS)  - what ports/addresses does Envoy listen on?
//!     │
//! Route (RDS)     - based on the Host header, where should traffic go?
//!     │
//! Cluster (CDS)   - what does the target look like? (timeouts, LB policy)
//!     │
//! Endpoint (EDS)  - the actual ip:port addresses of the target
//! ```
//!
//! The builder takes the registered services and produces one resource
//! bundle per managed node. The bundles differ only in cluster upstream
//! addresses: the home node gets each service's real upstream, the edge
//! node gets the home Envoy's ingress for every cluster (split horizon).
//! Virtual hosts are byte-identical on both nodes, so a request forwarded
//! by the edge arrives at the home Envoy with its original `Host:` header
//! and is routed there without any edge-side knowledge of internal
//! addresses.

use prost::Message;

use data_plane_api::envoy::config::cluster::v3::{cluster, Cluster};
use data_plane_api::envoy::config::core::v3::{
    address, config_source, socket_address, Address, AggregatedConfigSource, ApiVersion,
    ConfigSource, SocketAddress,
};
use data_plane_api::envoy::config::endpoint::v3::{
    lb_endpoint, ClusterLoadAssignment, Endpoint, LbEndpoint, LocalityLbEndpoints,
};
use data_plane_api::envoy::config::listener::v3::{filter, Filter, FilterChain, Listener};
use data_plane_api::envoy::config::route::v3::{
    route, route_action, route_match, Route, RouteAction, RouteConfiguration, RouteMatch,
    VirtualHost,
};
use data_plane_api::envoy::extensions::filters::http::router::v3::Router;
use data_plane_api::envoy::extensions::filters::network::http_connection_manager::v3::{
    http_connection_manager, http_filter, HttpConnectionManager, HttpFilter, Rds,
};
use data_plane_api::google::protobuf as pb;

use envoyage_cache::Snapshot;
use envoyage_core::{EnvoyageError, Result, TypeUrl};
use envoyage_registry::Service;

/// Name of the route configuration shared by all listeners.
pub const ROUTE_CONFIG_NAME: &str = "local_routes";

/// Name of the single HTTP ingress listener.
pub const LISTENER_NAME: &str = "listener_http";

/// Port the ingress listener binds on every data plane.
pub const LISTENER_PORT: u32 = 10000;

/// Upstream connect timeout applied to every cluster.
const CONNECT_TIMEOUT_SECS: i64 = 5;

const HCM_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.network.http_connection_manager.v3.HttpConnectionManager";
const ROUTER_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.http.router.v3.Router";

const HCM_FILTER_NAME: &str = "envoy.filters.network.http_connection_manager";
const ROUTER_FILTER_NAME: &str = "envoy.filters.http.router";

/// Builds per-node xDS snapshots from the current service set.
///
/// The builder is a pure function of its inputs: the same
/// `(node_id, services, version)` always produces structurally identical
/// resources.
#[derive(Debug, Clone)]
pub struct SnapshotBuilder {
    home_node_id: String,
    edge_node_id: String,
    /// `host:port` the edge Envoy uses to reach the home Envoy's listener.
    home_ingress: String,
}

impl SnapshotBuilder {
    /// Create a builder for the given pair of managed nodes.
    pub fn new(
        home_node_id: impl Into<String>,
        edge_node_id: impl Into<String>,
        home_ingress: impl Into<String>,
    ) -> Self {
        Self {
            home_node_id: home_node_id.into(),
            edge_node_id: edge_node_id.into(),
            home_ingress: home_ingress.into(),
        }
    }

    /// The node ID of the home Envoy.
    pub fn home_node_id(&self) -> &str {
        &self.home_node_id
    }

    /// The node ID of the edge Envoy.
    pub fn edge_node_id(&self) -> &str {
        &self.edge_node_id
    }

    /// The ingress address the edge forwards to.
    pub fn home_ingress(&self) -> &str {
        &self.home_ingress
    }

    /// Build a complete snapshot for one node at the given registry version.
    ///
    /// The snapshot's global version label is `v<version>`. Fails if a
    /// route would reference a cluster the snapshot does not define.
    pub fn build(&self, node_id: &str, services: &[Service], version: u64) -> Result<Snapshot> {
        let version_str = format!("v{version}");

        let mut clusters = Vec::with_capacity(services.len());
        let mut virtual_hosts = Vec::with_capacity(services.len());

        for svc in services {
            let cluster_name = format!("cluster_{}", svc.name);

            // Split horizon: the home node connects to the real app, the
            // edge node tunnels everything to the home Envoy's ingress.
            let upstream = if node_id == self.home_node_id {
                svc.upstream.as_str()
            } else {
                self.home_ingress.as_str()
            };

            clusters.push(make_cluster(&cluster_name, upstream));
            virtual_hosts.push(make_virtual_host(&svc.name, &svc.domain, &cluster_name));
        }

        let route_config = make_route_config(ROUTE_CONFIG_NAME, virtual_hosts);
        ensure_consistent(node_id, version, &clusters, &route_config)?;

        let listener = make_http_listener(LISTENER_NAME, LISTENER_PORT, ROUTE_CONFIG_NAME);

        let snapshot = Snapshot::new(version_str)
            .with_resources(
                TypeUrl::CLUSTER.into(),
                clusters
                    .iter()
                    .map(|c| (c.name.clone(), to_any(TypeUrl::CLUSTER, c))),
            )
            .with_resources(
                TypeUrl::ROUTE.into(),
                [(
                    route_config.name.clone(),
                    to_any(TypeUrl::ROUTE, &route_config),
                )],
            )
            .with_resources(
                TypeUrl::LISTENER.into(),
                [(listener.name.clone(), to_any(TypeUrl::LISTENER, &listener))],
            );

        Ok(snapshot)
    }
}

/// Encode a resource into the `Any` representation snapshots carry.
fn to_any<M: Message>(type_url: &str, msg: &M) -> prost_types::Any {
    prost_types::Any {
        type_url: type_url.to_string(),
        value: msg.encode_to_vec(),
    }
}

/// Encode a message into the wire `Any` for embedding in typed configs.
fn embed_any<M: Message>(type_url: &str, msg: &M) -> pb::Any {
    pb::Any {
        type_url: type_url.to_string(),
        value: msg.encode_to_vec(),
    }
}

/// Reject the bundle unless every route references a cluster it defines.
fn ensure_consistent(
    node_id: &str,
    version: u64,
    clusters: &[Cluster],
    route_config: &RouteConfiguration,
) -> Result<()> {
    for vhost in &route_config.virtual_hosts {
        for r in &vhost.routes {
            let Some(route::Action::Route(action)) = &r.action else {
                continue;
            };
            let Some(route_action::ClusterSpecifier::Cluster(target)) = &action.cluster_specifier
            else {
                continue;
            };
            if !clusters.iter().any(|c| &c.name == target) {
                return Err(EnvoyageError::SnapshotInconsistent {
                    node_id: node_id.to_string(),
                    version,
                    cluster: target.clone(),
                });
            }
        }
    }
    Ok(())
}

/// STRICT_DNS cluster with a single inline endpoint.
///
/// Envoy resolves the hostname and routes to all returned addresses, which
/// works with Docker's embedded DNS for compose service names. The address
/// is set inline in the load assignment, so no separate EDS is needed.
fn make_cluster(name: &str, upstream: &str) -> Cluster {
    let (host, port) = split_host_port(upstream);

    Cluster {
        name: name.to_string(),
        cluster_discovery_type: Some(cluster::ClusterDiscoveryType::Type(
            cluster::DiscoveryType::StrictDns as i32,
        )),
        connect_timeout: Some(pb::Duration {
            seconds: CONNECT_TIMEOUT_SECS,
            nanos: 0,
        }),
        load_assignment: Some(ClusterLoadAssignment {
            cluster_name: name.to_string(),
            endpoints: vec![LocalityLbEndpoints {
                lb_endpoints: vec![LbEndpoint {
                    host_identifier: Some(lb_endpoint::HostIdentifier::Endpoint(Endpoint {
                        address: Some(make_address(&host, port)),
                        ..Default::default()
                    })),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Virtual host matching one domain, forwarding everything to one cluster.
fn make_virtual_host(name: &str, domain: &str, cluster_name: &str) -> VirtualHost {
    VirtualHost {
        name: name.to_string(),
        domains: vec![domain.to_string()],
        routes: vec![Route {
            r#match: Some(RouteMatch {
                path_specifier: Some(route_match::PathSpecifier::Prefix("/".to_string())),
                ..Default::default()
            }),
            action: Some(route::Action::Route(RouteAction {
                cluster_specifier: Some(route_action::ClusterSpecifier::Cluster(
                    cluster_name.to_string(),
                )),
                ..Default::default()
            })),
            ..Default::default()
        }],
        ..Default::default()
    }
}

fn make_route_config(name: &str, virtual_hosts: Vec<VirtualHost>) -> RouteConfiguration {
    RouteConfiguration {
        name: name.to_string(),
        virtual_hosts,
        ..Default::default()
    }
}

/// Listener with a single HTTP connection manager network filter.
///
/// The chain: Listener → FilterChain → HCM network filter → router HTTP
/// filter. The HCM obtains its route table via ADS under
/// `route_config_name`. The router filter carries an explicit typed config;
/// without it Envoy cannot find the registered implementation and NACKs
/// the listener.
fn make_http_listener(name: &str, port: u32, route_config_name: &str) -> Listener {
    let router = embed_any(ROUTER_TYPE_URL, &Router::default());

    let hcm = HttpConnectionManager {
        stat_prefix: "ingress_http".to_string(),
        route_specifier: Some(http_connection_manager::RouteSpecifier::Rds(Rds {
            config_source: Some(ConfigSource {
                config_source_specifier: Some(config_source::ConfigSourceSpecifier::Ads(
                    AggregatedConfigSource::default(),
                )),
                resource_api_version: ApiVersion::V3 as i32,
                ..Default::default()
            }),
            route_config_name: route_config_name.to_string(),
        })),
        http_filters: vec![HttpFilter {
            name: ROUTER_FILTER_NAME.to_string(),
            config_type: Some(http_filter::ConfigType::TypedConfig(router)),
            ..Default::default()
        }],
        ..Default::default()
    };

    Listener {
        name: name.to_string(),
        address: Some(make_address("0.0.0.0", port)),
        filter_chains: vec![FilterChain {
            filters: vec![Filter {
                name: HCM_FILTER_NAME.to_string(),
                config_type: Some(filter::ConfigType::TypedConfig(embed_any(
                    HCM_TYPE_URL,
                    &hcm,
                ))),
                ..Default::default()
            }],
            ..Default::default()
        }],
        ..Default::default()
    }
}

fn make_address(host: &str, port: u32) -> Address {
    Address {
        address: Some(address::Address::SocketAddress(SocketAddress {
            protocol: socket_address::Protocol::Tcp as i32,
            address: host.to_string(),
            port_specifier: Some(socket_address::PortSpecifier::PortValue(port)),
            ..Default::default()
        })),
    }
}

/// Split `host:port` on the rightmost colon.
///
/// Returns port 0 when no port is present or the suffix is not a decimal
/// number. Envoy may still connect if the resolver supplies a port, but
/// normal usage always carries one.
fn split_host_port(upstream: &str) -> (String, u32) {
    match upstream.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.parse().unwrap_or(0)),
        None => (upstream.to_string(), 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use envoyage_cache::Snapshot;

    const HOME: &str = "envoyage-envoy-home";
    const EDGE: &str = "envoyage-envoy-vps";

    fn builder() -> SnapshotBuilder {
        SnapshotBuilder::new(HOME, EDGE, "envoy-home:10000")
    }

    fn services() -> Vec<Service> {
        vec![
            Service::new("web", "web.example.com", "web-a:5678"),
            Service::new("blog", "blog.example.com", "blog:8080"),
        ]
    }

    fn decode_cluster(snapshot: &Snapshot, name: &str) -> Cluster {
        let set = snapshot.get_resources(&TypeUrl::CLUSTER.into()).unwrap();
        let any = set.get(name).expect("cluster present");
        Cluster::decode(any.value.as_slice()).unwrap()
    }

    fn decode_routes(snapshot: &Snapshot) -> RouteConfiguration {
        let set = snapshot.get_resources(&TypeUrl::ROUTE.into()).unwrap();
        let any = set.get(ROUTE_CONFIG_NAME).expect("route config present");
        RouteConfiguration::decode(any.value.as_slice()).unwrap()
    }

    fn decode_listener(snapshot: &Snapshot) -> Listener {
        let set = snapshot.get_resources(&TypeUrl::LISTENER.into()).unwrap();
        let any = set.get(LISTENER_NAME).expect("listener present");
        Listener::decode(any.value.as_slice()).unwrap()
    }

    fn cluster_endpoint(cluster: &Cluster) -> (String, u32) {
        let assignment = cluster.load_assignment.as_ref().unwrap();
        let lb = &assignment.endpoints[0].lb_endpoints[0];
        let Some(lb_endpoint::HostIdentifier::Endpoint(endpoint)) = &lb.host_identifier else {
            panic!("endpoint host identifier expected");
        };
        let Some(address::Address::SocketAddress(socket)) =
            &endpoint.address.as_ref().unwrap().address
        else {
            panic!("socket address expected");
        };
        let Some(socket_address::PortSpecifier::PortValue(port)) = socket.port_specifier else {
            panic!("port value expected");
        };
        (socket.address.clone(), port)
    }

    #[test]
    fn empty_registry_builds_listener_and_empty_routes() {
        let snapshot = builder().build(HOME, &[], 0).unwrap();

        assert_eq!(snapshot.version(), "v0");
        assert!(snapshot
            .get_resources(&TypeUrl::CLUSTER.into())
            .unwrap()
            .is_empty());

        let routes = decode_routes(&snapshot);
        assert_eq!(routes.name, ROUTE_CONFIG_NAME);
        assert!(routes.virtual_hosts.is_empty());

        let listener = decode_listener(&snapshot);
        assert_eq!(listener.name, LISTENER_NAME);
    }

    #[test]
    fn split_horizon_rewrites_edge_upstreams_only() {
        let b = builder();
        let svcs = services();

        let home = b.build(HOME, &svcs, 3).unwrap();
        let edge = b.build(EDGE, &svcs, 3).unwrap();

        let (host, port) = cluster_endpoint(&decode_cluster(&home, "cluster_web"));
        assert_eq!((host.as_str(), port), ("web-a", 5678));

        let (host, port) = cluster_endpoint(&decode_cluster(&edge, "cluster_web"));
        assert_eq!((host.as_str(), port), ("envoy-home", 10000));

        // Every cluster on the edge points at the tunnel.
        let (host, port) = cluster_endpoint(&decode_cluster(&edge, "cluster_blog"));
        assert_eq!((host.as_str(), port), ("envoy-home", 10000));
    }

    #[test]
    fn virtual_hosts_are_identical_across_nodes() {
        let b = builder();
        let svcs = services();

        let home = decode_routes(&b.build(HOME, &svcs, 1).unwrap());
        let edge = decode_routes(&b.build(EDGE, &svcs, 1).unwrap());
        assert_eq!(home, edge);
    }

    #[test]
    fn virtual_host_maps_domain_to_cluster() {
        let snapshot = builder().build(HOME, &services(), 1).unwrap();
        let routes = decode_routes(&snapshot);

        let vhost = routes
            .virtual_hosts
            .iter()
            .find(|v| v.name == "web")
            .unwrap();
        assert_eq!(vhost.domains, vec!["web.example.com"]);

        let r = &vhost.routes[0];
        assert_eq!(
            r.r#match.as_ref().unwrap().path_specifier,
            Some(route_match::PathSpecifier::Prefix("/".to_string()))
        );
        let Some(route::Action::Route(action)) = &r.action else {
            panic!("route action expected");
        };
        assert_eq!(
            action.cluster_specifier,
            Some(route_action::ClusterSpecifier::Cluster(
                "cluster_web".to_string()
            ))
        );
    }

    #[test]
    fn cluster_uses_strict_dns_and_five_second_timeout() {
        let snapshot = builder().build(HOME, &services(), 1).unwrap();
        let cluster = decode_cluster(&snapshot, "cluster_web");

        assert_eq!(
            cluster.cluster_discovery_type,
            Some(cluster::ClusterDiscoveryType::Type(
                cluster::DiscoveryType::StrictDns as i32
            ))
        );
        assert_eq!(cluster.connect_timeout.as_ref().unwrap().seconds, 5);
    }

    #[test]
    fn listener_binds_wildcard_port_10000_with_router_filter() {
        let snapshot = builder().build(EDGE, &services(), 1).unwrap();
        let listener = decode_listener(&snapshot);

        let Some(address::Address::SocketAddress(socket)) =
            &listener.address.as_ref().unwrap().address
        else {
            panic!("socket address expected");
        };
        assert_eq!(socket.address, "0.0.0.0");
        assert_eq!(
            socket.port_specifier,
            Some(socket_address::PortSpecifier::PortValue(10000))
        );

        let filter = &listener.filter_chains[0].filters[0];
        assert_eq!(filter.name, HCM_FILTER_NAME);
        let Some(filter::ConfigType::TypedConfig(hcm_any)) = &filter.config_type else {
            panic!("typed config expected");
        };
        let hcm = HttpConnectionManager::decode(hcm_any.value.as_slice()).unwrap();
        assert_eq!(hcm.stat_prefix, "ingress_http");

        let Some(http_connection_manager::RouteSpecifier::Rds(rds)) = &hcm.route_specifier else {
            panic!("RDS route specifier expected");
        };
        assert_eq!(rds.route_config_name, ROUTE_CONFIG_NAME);
        let source = rds.config_source.as_ref().unwrap();
        assert_eq!(source.resource_api_version, ApiVersion::V3 as i32);
        assert!(matches!(
            source.config_source_specifier,
            Some(config_source::ConfigSourceSpecifier::Ads(_))
        ));

        // The router filter must carry an explicit typed config.
        assert_eq!(hcm.http_filters.len(), 1);
        let router = &hcm.http_filters[0];
        assert_eq!(router.name, ROUTER_FILTER_NAME);
        let Some(http_filter::ConfigType::TypedConfig(router_any)) = &router.config_type else {
            panic!("router typed config expected");
        };
        assert_eq!(router_any.type_url, ROUTER_TYPE_URL);
    }

    #[test]
    fn build_is_deterministic() {
        let b = builder();
        let svcs = services();

        let first = b.build(HOME, &svcs, 7).unwrap();
        let second = b.build(HOME, &svcs, 7).unwrap();

        assert_eq!(first.version(), second.version());
        for type_url in [TypeUrl::CLUSTER, TypeUrl::ROUTE, TypeUrl::LISTENER] {
            let a = first.get_resources(&type_url.into()).unwrap();
            let b = second.get_resources(&type_url.into()).unwrap();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn version_label_follows_registry_version() {
        let snapshot = builder().build(HOME, &[], 42).unwrap();
        assert_eq!(snapshot.version(), "v42");
    }

    #[test]
    fn split_host_port_edge_cases() {
        assert_eq!(split_host_port("web-a:5678"), ("web-a".to_string(), 5678));
        assert_eq!(split_host_port("10.0.0.4:80"), ("10.0.0.4".to_string(), 80));
        assert_eq!(split_host_port("no-port"), ("no-port".to_string(), 0));
        assert_eq!(split_host_port("bad:port"), ("bad".to_string(), 0));
        // Rightmost colon wins.
        assert_eq!(split_host_port("a:b:90"), ("a:b".to_string(), 90));
    }

    #[test]
    fn consistency_check_rejects_dangling_cluster_reference() {
        let clusters = vec![make_cluster("cluster_web", "web-a:5678")];
        let routes = make_route_config(
            ROUTE_CONFIG_NAME,
            vec![make_virtual_host("ghost", "ghost.example.com", "cluster_ghost")],
        );

        let err = ensure_consistent("node", 1, &clusters, &routes).unwrap_err();
        assert!(matches!(
            err,
            EnvoyageError::SnapshotInconsistent { ref cluster, .. } if cluster == "cluster_ghost"
        ));
    }

    #[test]
    fn built_snapshots_are_referentially_closed() {
        let snapshot = builder().build(HOME, &services(), 1).unwrap();
        let routes = decode_routes(&snapshot);
        let clusters = snapshot.get_resources(&TypeUrl::CLUSTER.into()).unwrap();

        for vhost in &routes.virtual_hosts {
            for r in &vhost.routes {
                let Some(route::Action::Route(action)) = &r.action else {
                    continue;
                };
                let Some(route_action::ClusterSpecifier::Cluster(target)) =
                    &action.cluster_specifier
                else {
                    continue;
                };
                assert!(clusters.get(target).is_some(), "dangling cluster {target}");
            }
        }
    }
}
