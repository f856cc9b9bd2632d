//! Shared streaming logic for the discovery services.
//!
//! Every discovery endpoint - ADS and the five per-type services - runs the
//! same loop: consume `DiscoveryRequest`s (tracking ACK/NACK per type),
//! answer version differences from the cache, and push fresh responses when
//! the node's snapshot is replaced. The ADS variant multiplexes all types
//! over one stream; a per-type service pins `allowed_type`.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tonic::{Response, Status, Streaming};
use tracing::{debug, error, info, warn};

use data_plane_api::envoy::service::discovery::v3::{DiscoveryRequest, DiscoveryResponse};
use data_plane_api::google::protobuf as pb;

use envoyage_cache::{Cache, Snapshot, Watch};
use envoyage_core::TypeUrl;

use crate::sotw::{SotwHandler, SotwResponse};
use crate::stream::StreamContext;

/// Per-(stream, type URL) protocol state.
#[derive(Debug, Default)]
struct TypeState {
    /// Names the client subscribed to; empty means wildcard.
    resource_names: Vec<String>,
    /// Version of the last response sent on this stream.
    last_sent_version: String,
    /// Nonce of the last response sent on this stream.
    last_nonce: String,
    /// Version the client last ACKed.
    acked_version: String,
}

/// Delivery order for pushed updates: upstream definitions before the
/// resources that reference them (the make-before-break ordering ADS
/// exists to provide).
fn type_priority(type_url: &TypeUrl) -> usize {
    match type_url.as_str() {
        TypeUrl::CLUSTER => 0,
        TypeUrl::ENDPOINT => 1,
        TypeUrl::LISTENER => 2,
        TypeUrl::ROUTE => 3,
        _ => 4,
    }
}

/// Convert a handler response into the wire form.
pub(crate) fn into_discovery_response(response: SotwResponse) -> DiscoveryResponse {
    DiscoveryResponse {
        version_info: response.version_info,
        resources: response
            .resources
            .into_iter()
            .map(|any| pb::Any {
                type_url: any.type_url,
                value: any.value,
            })
            .collect(),
        type_url: response.type_url.into(),
        nonce: response.nonce,
        ..Default::default()
    }
}

/// Unary fetch shared by the per-type services.
pub(crate) fn fetch(
    handler: &SotwHandler,
    request: DiscoveryRequest,
    type_url: &'static str,
) -> Result<Response<DiscoveryResponse>, Status> {
    let ctx = StreamContext::new();
    let node_id = request
        .node
        .as_ref()
        .map(|n| n.id.clone())
        .ok_or_else(|| Status::invalid_argument("node is required"))?;

    let response = handler
        .process_request(
            &ctx,
            &type_url.into(),
            &request.version_info,
            &request.resource_names,
            &node_id,
        )
        .map_err(|e| Status::internal(e.to_string()))?
        .ok_or_else(|| Status::not_found("no resources available"))?;

    Ok(Response::new(into_discovery_response(response)))
}

/// Wait for the next snapshot update, or forever when no watch exists yet.
async fn next_update(watch: &mut Option<Watch>) -> Option<Arc<Snapshot>> {
    match watch.as_mut() {
        Some(w) => w.changed().await,
        None => std::future::pending().await,
    }
}

/// Drive one discovery stream until the client disconnects.
///
/// `allowed_type` pins the stream to a single resource type (the per-type
/// services); `None` multiplexes all types (ADS).
pub(crate) async fn run_discovery_stream(
    handler: Arc<SotwHandler>,
    mut requests: Streaming<DiscoveryRequest>,
    tx: mpsc::Sender<Result<DiscoveryResponse, Status>>,
    service: &'static str,
    allowed_type: Option<&'static str>,
) {
    let mut ctx = StreamContext::new();
    let mut watch: Option<Watch> = None;
    let mut subscriptions: HashMap<TypeUrl, TypeState> = HashMap::new();

    info!(stream = %ctx.id(), service, "{service} stream started");

    'stream: loop {
        tokio::select! {
            request = tokio_stream::StreamExt::next(&mut requests) => {
                let Some(result) = request else { break };
                let request = match result {
                    Ok(request) => request,
                    Err(e) => {
                        error!(stream = %ctx.id(), error = %e, "stream error");
                        break;
                    }
                };

                // Resolve and validate the type URL.
                let type_url: TypeUrl = if request.type_url.is_empty() {
                    match allowed_type {
                        Some(t) => t.into(),
                        None => {
                            warn!(stream = %ctx.id(), "request without type URL on aggregated stream");
                            continue;
                        }
                    }
                } else {
                    request.type_url.as_str().into()
                };
                if let Some(allowed) = allowed_type {
                    if type_url.as_str() != allowed {
                        error!(
                            stream = %ctx.id(),
                            expected = allowed,
                            got = %type_url,
                            "invalid type URL for {service}"
                        );
                        continue;
                    }
                }

                // The first request must identify the node; the cache and
                // the watch are keyed by it.
                if ctx.node_id().is_none() {
                    match request.node.as_ref() {
                        Some(node) => {
                            debug!(stream = %ctx.id(), node_id = %node.id, "node identified");
                            watch = Some(handler.cache().create_watch(&node.id));
                            ctx.set_node(node.id.clone());
                        }
                        None => {
                            let _ = tx
                                .send(Err(Status::invalid_argument(
                                    "first request must include node information",
                                )))
                                .await;
                            break;
                        }
                    }
                }
                let node_id = ctx.node_id().unwrap_or_default().to_string();

                let state = subscriptions.entry(type_url.clone()).or_default();
                let nacked = request.error_detail.is_some();

                // A nonce ties this request to a previous response: ACK or
                // NACK. A nonce from an older response is stale and the
                // request is ignored; the client will re-request against
                // the latest one.
                if !request.response_nonce.is_empty() && request.response_nonce != state.last_nonce
                {
                    debug!(
                        stream = %ctx.id(),
                        type_url = %type_url,
                        nonce = %request.response_nonce,
                        "stale nonce, ignoring request"
                    );
                    continue;
                }
                if !request.response_nonce.is_empty() {
                    if let Some(detail) = &request.error_detail {
                        handler.handle_nack(
                            &ctx,
                            &type_url,
                            &request.version_info,
                            &request.response_nonce,
                            &detail.message,
                        );
                    } else {
                        handler.handle_ack(
                            &ctx,
                            &type_url,
                            &request.version_info,
                            &request.response_nonce,
                        );
                        state.acked_version = request.version_info.clone();
                    }
                }

                let names_changed = state.resource_names != request.resource_names;
                state.resource_names = request.resource_names.clone();

                // After a NACK the rejected version must not be offered
                // again; compare against what was last sent so only a newer
                // snapshot triggers a response.
                let effective_version = if nacked {
                    state.last_sent_version.clone()
                } else {
                    request.version_info.clone()
                };

                let mut response = match handler.process_request(
                    &ctx,
                    &type_url,
                    &effective_version,
                    &state.resource_names,
                    &node_id,
                ) {
                    Ok(response) => response,
                    Err(e) => {
                        error!(stream = %ctx.id(), error = %e, "{service} request failed");
                        break;
                    }
                };

                // A subscription change at an unchanged version still needs
                // an answer carrying the newly requested resources.
                if response.is_none() && names_changed && !nacked {
                    if let Some(snapshot) = handler.cache().get_snapshot(&node_id) {
                        response = handler.response_from(
                            &ctx,
                            &snapshot,
                            &type_url,
                            "",
                            &state.resource_names,
                        );
                    }
                }

                if let Some(response) = response {
                    state.last_sent_version = response.version_info.clone();
                    state.last_nonce = response.nonce.clone();
                    if tx.send(Ok(into_discovery_response(response))).await.is_err() {
                        debug!(stream = %ctx.id(), "client disconnected");
                        break;
                    }
                }
            }

            update = next_update(&mut watch) => {
                let Some(snapshot) = update else {
                    // Cache dropped; no further pushes, requests still served.
                    watch = None;
                    continue;
                };

                let mut types: Vec<TypeUrl> = subscriptions.keys().cloned().collect();
                types.sort_by_key(type_priority);

                for type_url in types {
                    let Some(state) = subscriptions.get_mut(&type_url) else {
                        continue;
                    };
                    let response = handler.response_from(
                        &ctx,
                        &snapshot,
                        &type_url,
                        &state.last_sent_version,
                        &state.resource_names,
                    );
                    if let Some(response) = response {
                        ctx.record_response();
                        state.last_sent_version = response.version_info.clone();
                        state.last_nonce = response.nonce.clone();
                        debug!(
                            stream = %ctx.id(),
                            type_url = %type_url,
                            version = %state.last_sent_version,
                            acked = %state.acked_version,
                            "pushing snapshot update"
                        );
                        if tx.send(Ok(into_discovery_response(response))).await.is_err() {
                            debug!(stream = %ctx.id(), "client disconnected");
                            break 'stream;
                        }
                    }
                }
            }
        }
    }

    info!(
        stream = %ctx.id(),
        service,
        duration = ?ctx.duration(),
        requests = ctx.request_count(),
        responses = ctx.response_count(),
        "{service} stream ended"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_order_is_make_before_break() {
        let mut types: Vec<TypeUrl> = vec![
            TypeUrl::ROUTE.into(),
            TypeUrl::LISTENER.into(),
            TypeUrl::CLUSTER.into(),
        ];
        types.sort_by_key(type_priority);

        let order: Vec<&str> = types.iter().map(|t| t.short_name()).collect();
        assert_eq!(order, vec!["Cluster", "Listener", "RouteConfiguration"]);
    }

    #[test]
    fn wire_conversion_preserves_payloads() {
        let response = SotwResponse {
            version_info: "v3".to_string(),
            resources: vec![prost_types::Any {
                type_url: TypeUrl::CLUSTER.to_string(),
                value: vec![1, 2, 3],
            }],
            type_url: TypeUrl::CLUSTER.into(),
            nonce: "n-1".to_string(),
        };

        let wire = into_discovery_response(response);
        assert_eq!(wire.version_info, "v3");
        assert_eq!(wire.type_url, TypeUrl::CLUSTER);
        assert_eq!(wire.nonce, "n-1");
        assert_eq!(wire.resources[0].value, vec![1, 2, 3]);
    }
}
