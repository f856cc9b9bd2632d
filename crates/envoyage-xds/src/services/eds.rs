//! Endpoint Discovery Service (EDS).
//!
//! Clusters carry their endpoints inline (STRICT_DNS), so snapshots hold no
//! separate endpoint resources; this service exists so a data plane
//! configured for EDS gets an empty answer rather than an unknown-service
//! error.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};

use data_plane_api::envoy::service::discovery::v3::{
    DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
};
use data_plane_api::envoy::service::endpoint::v3::endpoint_discovery_service_server::{
    EndpointDiscoveryService, EndpointDiscoveryServiceServer,
};

use envoyage_core::TypeUrl;

use crate::services::RESPONSE_BUFFER;
use crate::sotw::SotwHandler;
use crate::streaming::{fetch, run_discovery_stream};

/// Endpoint Discovery Service over the shared snapshot cache.
#[derive(Debug, Clone)]
pub struct EdsService {
    handler: Arc<SotwHandler>,
}

impl EdsService {
    /// Create a new EDS service.
    pub fn new(handler: Arc<SotwHandler>) -> Self {
        Self { handler }
    }

    /// Wrap into the generated tonic server for registration.
    pub fn into_service(self) -> EndpointDiscoveryServiceServer<Self> {
        EndpointDiscoveryServiceServer::new(self)
    }
}

#[async_trait]
impl EndpointDiscoveryService for EdsService {
    type StreamEndpointsStream = ReceiverStream<Result<DiscoveryResponse, Status>>;

    async fn stream_endpoints(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamEndpointsStream>, Status> {
        let (tx, rx) = mpsc::channel(RESPONSE_BUFFER);
        tokio::spawn(run_discovery_stream(
            Arc::clone(&self.handler),
            request.into_inner(),
            tx,
            "EDS",
            Some(TypeUrl::ENDPOINT),
        ));
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    type DeltaEndpointsStream = ReceiverStream<Result<DeltaDiscoveryResponse, Status>>;

    async fn delta_endpoints(
        &self,
        _request: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> Result<Response<Self::DeltaEndpointsStream>, Status> {
        Err(Status::unimplemented("delta xDS is not supported"))
    }

    async fn fetch_endpoints(
        &self,
        request: Request<DiscoveryRequest>,
    ) -> Result<Response<DiscoveryResponse>, Status> {
        fetch(&self.handler, request.into_inner(), TypeUrl::ENDPOINT)
    }
}
