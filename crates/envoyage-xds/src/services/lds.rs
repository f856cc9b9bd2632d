//! Listener Discovery Service (LDS).

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};

use data_plane_api::envoy::service::discovery::v3::{
    DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
};
use data_plane_api::envoy::service::listener::v3::listener_discovery_service_server::{
    ListenerDiscoveryService, ListenerDiscoveryServiceServer,
};

use envoyage_core::TypeUrl;

use crate::services::RESPONSE_BUFFER;
use crate::sotw::SotwHandler;
use crate::streaming::{fetch, run_discovery_stream};

/// Listener Discovery Service over the shared snapshot cache.
#[derive(Debug, Clone)]
pub struct LdsService {
    handler: Arc<SotwHandler>,
}

impl LdsService {
    /// Create a new LDS service.
    pub fn new(handler: Arc<SotwHandler>) -> Self {
        Self { handler }
    }

    /// Wrap into the generated tonic server for registration.
    pub fn into_service(self) -> ListenerDiscoveryServiceServer<Self> {
        ListenerDiscoveryServiceServer::new(self)
    }
}

#[async_trait]
impl ListenerDiscoveryService for LdsService {
    type StreamListenersStream = ReceiverStream<Result<DiscoveryResponse, Status>>;

    async fn stream_listeners(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamListenersStream>, Status> {
        let (tx, rx) = mpsc::channel(RESPONSE_BUFFER);
        tokio::spawn(run_discovery_stream(
            Arc::clone(&self.handler),
            request.into_inner(),
            tx,
            "LDS",
            Some(TypeUrl::LISTENER),
        ));
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    type DeltaListenersStream = ReceiverStream<Result<DeltaDiscoveryResponse, Status>>;

    async fn delta_listeners(
        &self,
        _request: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> Result<Response<Self::DeltaListenersStream>, Status> {
        Err(Status::unimplemented("delta xDS is not supported"))
    }

    async fn fetch_listeners(
        &self,
        request: Request<DiscoveryRequest>,
    ) -> Result<Response<DiscoveryResponse>, Status> {
        fetch(&self.handler, request.into_inner(), TypeUrl::LISTENER)
    }
}
