//! Runtime configuration from environment variables.
//!
//! All settings have defaults so the binary works out of the box for local
//! Docker Compose development without any .env file. In production, copy
//! .env.example to .env and compose picks it up automatically.

use std::net::SocketAddr;

use envoyage_core::{EnvoyageError, Result};

/// Runtime configuration for the control plane.
///
/// Loaded once at startup via [`Config::load`] and treated as immutable.
#[derive(Debug, Clone)]
pub struct Config {
    /// gRPC listen address for the xDS server. Envoy connects here to
    /// receive dynamic configuration.
    pub xds_addr: String,

    /// HTTP listen address for the management API.
    pub api_addr: String,

    /// xDS node ID of the home Envoy instance. Must match `node.id` in
    /// envoy/bootstrap-home.yaml.
    pub home_node_id: String,

    /// xDS node ID of the VPS/edge Envoy instance. Must match `node.id` in
    /// envoy/bootstrap-vps.yaml.
    pub vps_node_id: String,

    /// WireGuard interface IP of the home node. The VPS Envoy uses this as
    /// the upstream for all clusters, routing everything through the tunnel
    /// to the home Envoy. In Compose simulation mode (no real WireGuard),
    /// set it to the Docker service name of the home Envoy.
    pub home_wg_ip: String,

    /// Port the home Envoy listens on for proxied traffic. The VPS Envoy
    /// forwards to `home_wg_ip:home_envoy_port`.
    pub home_envoy_port: String,
}

impl Config {
    /// Read configuration from environment variables, falling back to
    /// defaults suitable for local Docker Compose development.
    pub fn load() -> Self {
        Self {
            xds_addr: env_or("ENVOYAGE_XDS_ADDR", ":9090"),
            api_addr: env_or("ENVOYAGE_API_ADDR", ":8080"),
            home_node_id: env_or("ENVOYAGE_HOME_NODE_ID", "envoyage-envoy-home"),
            vps_node_id: env_or("ENVOYAGE_VPS_NODE_ID", "envoyage-envoy-vps"),
            home_wg_ip: env_or("ENVOYAGE_HOME_WG_IP", "envoy-home"),
            home_envoy_port: env_or("ENVOYAGE_HOME_ENVOY_PORT", "10000"),
        }
    }

    /// The full upstream address the VPS Envoy uses to reach the home
    /// Envoy.
    pub fn home_envoy_ingress(&self) -> String {
        format!("{}:{}", self.home_wg_ip, self.home_envoy_port)
    }

    /// All managed Envoy node IDs.
    pub fn node_ids(&self) -> Vec<String> {
        vec![self.home_node_id.clone(), self.vps_node_id.clone()]
    }
}

fn env_or(key: &str, fallback: &str) -> String {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v,
        _ => fallback.to_string(),
    }
}

/// Parse a listen address, accepting the `:port` shorthand for
/// all-interfaces binds.
pub fn parse_listen_addr(addr: &str) -> Result<SocketAddr> {
    let full = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    };
    full.parse()
        .map_err(|_| EnvoyageError::Configuration(format!("invalid listen address {addr:?}")))
}
