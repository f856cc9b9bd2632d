//! Route Discovery Service (RDS).

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};

use data_plane_api::envoy::service::discovery::v3::{
    DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
};
use data_plane_api::envoy::service::route::v3::route_discovery_service_server::{
    RouteDiscoveryService, RouteDiscoveryServiceServer,
};

use envoyage_core::TypeUrl;

use crate::services::RESPONSE_BUFFER;
use crate::sotw::SotwHandler;
use crate::streaming::{fetch, run_discovery_stream};

/// Route Discovery Service over the shared snapshot cache.
#[derive(Debug, Clone)]
pub struct RdsService {
    handler: Arc<SotwHandler>,
}

impl RdsService {
    /// Create a new RDS service.
    pub fn new(handler: Arc<SotwHandler>) -> Self {
        Self { handler }
    }

    /// Wrap into the generated tonic server for registration.
    pub fn into_service(self) -> RouteDiscoveryServiceServer<Self> {
        RouteDiscoveryServiceServer::new(self)
    }
}

#[async_trait]
impl RouteDiscoveryService for RdsService {
    type StreamRoutesStream = ReceiverStream<Result<DiscoveryResponse, Status>>;

    async fn stream_routes(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamRoutesStream>, Status> {
        let (tx, rx) = mpsc::channel(RESPONSE_BUFFER);
        tokio::spawn(run_discovery_stream(
            Arc::clone(&self.handler),
            request.into_inner(),
            tx,
            "RDS",
            Some(TypeUrl::ROUTE),
        ));
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    type DeltaRoutesStream = ReceiverStream<Result<DeltaDiscoveryResponse, Status>>;

    async fn delta_routes(
        &self,
        _request: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> Result<Response<Self::DeltaRoutesStream>, Status> {
        Err(Status::unimplemented("delta xDS is not supported"))
    }

    async fn fetch_routes(
        &self,
        request: Request<DiscoveryRequest>,
    ) -> Result<Response<DiscoveryResponse>, Status> {
        fetch(&self.handler, request.into_inner(), TypeUrl::ROUTE)
    }
}
