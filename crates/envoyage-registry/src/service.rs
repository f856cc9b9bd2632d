//! The service model.

use serde::{Deserialize, Serialize};

/// A single routable application.
///
/// This is the control plane's internal model; the xDS layer translates it
/// into Envoy resources.
///
/// `upstream` is stored as `host:port` from the registrant's perspective,
/// i.e. as the home node reaches it. The snapshot builder rewrites the
/// target for edge nodes transparently, so callers never need to know about
/// split-horizon routing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    /// Unique identifier, e.g. `nextcloud`. Stable registry key.
    pub name: String,
    /// FQDN for virtual-host matching, e.g. `cloud.example.com`.
    pub domain: String,
    /// `host:port` of the actual app, e.g. `web-a:5678`.
    pub upstream: String,
}

impl Service {
    /// Create a new service.
    pub fn new(
        name: impl Into<String>,
        domain: impl Into<String>,
        upstream: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            domain: domain.into(),
            upstream: upstream.into(),
        }
    }
}
