//! Cluster Discovery Service (CDS).

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};

use data_plane_api::envoy::service::cluster::v3::cluster_discovery_service_server::{
    ClusterDiscoveryService, ClusterDiscoveryServiceServer,
};
use data_plane_api::envoy::service::discovery::v3::{
    DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
};

use envoyage_core::TypeUrl;

use crate::services::RESPONSE_BUFFER;
use crate::sotw::SotwHandler;
use crate::streaming::{fetch, run_discovery_stream};

/// Cluster Discovery Service over the shared snapshot cache.
#[derive(Debug, Clone)]
pub struct CdsService {
    handler: Arc<SotwHandler>,
}

impl CdsService {
    /// Create a new CDS service.
    pub fn new(handler: Arc<SotwHandler>) -> Self {
        Self { handler }
    }

    /// Wrap into the generated tonic server for registration.
    pub fn into_service(self) -> ClusterDiscoveryServiceServer<Self> {
        ClusterDiscoveryServiceServer::new(self)
    }
}

#[async_trait]
impl ClusterDiscoveryService for CdsService {
    type StreamClustersStream = ReceiverStream<Result<DiscoveryResponse, Status>>;

    async fn stream_clusters(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamClustersStream>, Status> {
        let (tx, rx) = mpsc::channel(RESPONSE_BUFFER);
        tokio::spawn(run_discovery_stream(
            Arc::clone(&self.handler),
            request.into_inner(),
            tx,
            "CDS",
            Some(TypeUrl::CLUSTER),
        ));
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    type DeltaClustersStream = ReceiverStream<Result<DeltaDiscoveryResponse, Status>>;

    async fn delta_clusters(
        &self,
        _request: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> Result<Response<Self::DeltaClustersStream>, Status> {
        Err(Status::unimplemented("delta xDS is not supported"))
    }

    async fn fetch_clusters(
        &self,
        request: Request<DiscoveryRequest>,
    ) -> Result<Response<DiscoveryResponse>, Status> {
        fetch(&self.handler, request.into_inner(), TypeUrl::CLUSTER)
    }
}
