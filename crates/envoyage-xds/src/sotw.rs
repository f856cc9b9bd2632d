//! State-of-the-World request processing.
//!
//! SotW is the xDS variant where the full resource set of a type is sent on
//! each update. This handler is shared by the ADS stream and the per-type
//! discovery services; it owns no per-stream state, only the cache lookup
//! and version comparison.

use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use envoyage_cache::{Cache, Snapshot, SnapshotCache};
use envoyage_core::{Result, TypeUrl};

use crate::stream::StreamContext;
use crate::utils::generate_nonce;

/// Handler turning discovery requests into responses from the cache.
#[derive(Debug)]
pub struct SotwHandler {
    cache: Arc<SnapshotCache>,
}

impl SotwHandler {
    /// Create a new handler over the shared cache.
    pub fn new(cache: Arc<SnapshotCache>) -> Self {
        Self { cache }
    }

    /// Get a reference to the cache.
    #[inline]
    pub fn cache(&self) -> &Arc<SnapshotCache> {
        &self.cache
    }

    /// Process an incoming discovery request.
    ///
    /// Returns `None` when the node has no snapshot, the snapshot has no
    /// resources of this type, or the client already holds the current
    /// version.
    pub fn process_request(
        &self,
        ctx: &StreamContext,
        type_url: &TypeUrl,
        version_info: &str,
        resource_names: &[String],
        node_id: &str,
    ) -> Result<Option<SotwResponse>> {
        ctx.record_request();

        trace!(
            stream = %ctx.id(),
            type_url = %type_url,
            version = %version_info,
            resources = ?resource_names,
            "processing SotW request"
        );

        let Some(snapshot) = self.cache.get_snapshot(node_id) else {
            debug!(stream = %ctx.id(), node = %node_id, "no snapshot available for node");
            return Ok(None);
        };

        let response = self.response_from(ctx, &snapshot, type_url, version_info, resource_names);
        if let Some(ref response) = response {
            info!(
                stream = %ctx.id(),
                type_url = %response.type_url,
                version = %response.version_info,
                count = response.resources.len(),
                "sending SotW response"
            );
            ctx.record_response();
        }
        Ok(response)
    }

    /// Build a response for one type from a specific snapshot, or `None`
    /// when `version_info` already matches the type's version.
    pub fn response_from(
        &self,
        ctx: &StreamContext,
        snapshot: &Snapshot,
        type_url: &TypeUrl,
        version_info: &str,
        resource_names: &[String],
    ) -> Option<SotwResponse> {
        let resources = match snapshot.get_resources(type_url) {
            Some(r) => r,
            None => {
                debug!(stream = %ctx.id(), type_url = %type_url, "no resources of type in snapshot");
                return None;
            }
        };

        if !version_info.is_empty() && version_info == resources.version() {
            trace!(stream = %ctx.id(), version = %version_info, "client already has latest version");
            return None;
        }

        let payload = if resource_names.is_empty() {
            // Wildcard subscription: the whole set.
            resources.to_vec()
        } else {
            resource_names
                .iter()
                .filter_map(|name| resources.get(name).cloned())
                .collect()
        };

        Some(SotwResponse {
            version_info: resources.version().to_string(),
            resources: payload,
            type_url: type_url.clone(),
            nonce: generate_nonce(),
        })
    }

    /// Handle an ACK from the client (empty `error_detail`).
    pub fn handle_ack(&self, ctx: &StreamContext, type_url: &TypeUrl, version: &str, nonce: &str) {
        debug!(
            stream = %ctx.id(),
            type_url = %type_url,
            version = %version,
            nonce = %nonce,
            "received ACK"
        );
    }

    /// Handle a NACK from the client (populated `error_detail`).
    ///
    /// The server keeps the previously accepted version authoritative for
    /// this client; nothing is resent until a newer snapshot is installed.
    pub fn handle_nack(
        &self,
        ctx: &StreamContext,
        type_url: &TypeUrl,
        version: &str,
        nonce: &str,
        error: &str,
    ) {
        warn!(
            stream = %ctx.id(),
            node = ctx.node_id().unwrap_or("<unknown>"),
            type_url = %type_url,
            version = %version,
            nonce = %nonce,
            error = %error,
            "received NACK, previous accepted version stays authoritative"
        );
    }
}

/// A response produced by the SotW handler, not yet in wire form.
#[derive(Debug, Clone)]
pub struct SotwResponse {
    /// Version of this response.
    pub version_info: String,
    /// Encoded resources to send.
    pub resources: Vec<prost_types::Any>,
    /// Type URL of the resources.
    pub type_url: TypeUrl,
    /// Unique nonce for this response.
    pub nonce: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn any(name: &str) -> (String, prost_types::Any) {
        (
            name.to_string(),
            prost_types::Any {
                type_url: TypeUrl::CLUSTER.to_string(),
                value: name.as_bytes().to_vec(),
            },
        )
    }

    fn setup() -> (SotwHandler, &'static str) {
        let cache = Arc::new(SnapshotCache::new());
        let node = "envoyage-envoy-home";
        let snapshot = Snapshot::new("v1").with_resources(
            TypeUrl::CLUSTER.into(),
            vec![any("cluster_web"), any("cluster_blog")],
        );
        cache.set_snapshot(node, snapshot);
        (SotwHandler::new(cache), node)
    }

    #[test]
    fn no_snapshot_yields_no_response() {
        let handler = SotwHandler::new(Arc::new(SnapshotCache::new()));
        let ctx = StreamContext::new();

        let result = handler
            .process_request(&ctx, &TypeUrl::CLUSTER.into(), "", &[], "unknown-node")
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn initial_request_receives_full_set() {
        let (handler, node) = setup();
        let ctx = StreamContext::new();

        let response = handler
            .process_request(&ctx, &TypeUrl::CLUSTER.into(), "", &[], node)
            .unwrap()
            .expect("initial request should receive a response");

        assert_eq!(response.version_info, "v1");
        assert_eq!(response.resources.len(), 2);
        assert_eq!(ctx.response_count(), 1);
    }

    #[test]
    fn current_version_is_suppressed() {
        let (handler, node) = setup();
        let ctx = StreamContext::new();

        let result = handler
            .process_request(&ctx, &TypeUrl::CLUSTER.into(), "v1", &[], node)
            .unwrap();
        assert!(result.is_none());
        assert_eq!(ctx.response_count(), 0);
    }

    #[test]
    fn stale_version_receives_response() {
        let (handler, node) = setup();
        let ctx = StreamContext::new();

        let response = handler
            .process_request(&ctx, &TypeUrl::CLUSTER.into(), "v0", &[], node)
            .unwrap();
        assert!(response.is_some());
    }

    #[test]
    fn explicit_names_filter_the_set() {
        let (handler, node) = setup();
        let ctx = StreamContext::new();

        let response = handler
            .process_request(
                &ctx,
                &TypeUrl::CLUSTER.into(),
                "",
                &["cluster_web".to_string()],
                node,
            )
            .unwrap()
            .unwrap();
        assert_eq!(response.resources.len(), 1);
    }

    #[test]
    fn unknown_type_yields_no_response() {
        let (handler, node) = setup();
        let ctx = StreamContext::new();

        let result = handler
            .process_request(&ctx, &TypeUrl::SECRET.into(), "", &[], node)
            .unwrap();
        assert!(result.is_none());
    }
}
