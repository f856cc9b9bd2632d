//! Secret Discovery Service (SDS).
//!
//! Snapshots carry no secrets in this revision; the service is registered
//! so TLS-enabled bootstrap configs can connect without errors.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};

use data_plane_api::envoy::service::discovery::v3::{
    DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
};
use data_plane_api::envoy::service::secret::v3::secret_discovery_service_server::{
    SecretDiscoveryService, SecretDiscoveryServiceServer,
};

use envoyage_core::TypeUrl;

use crate::services::RESPONSE_BUFFER;
use crate::sotw::SotwHandler;
use crate::streaming::{fetch, run_discovery_stream};

/// Secret Discovery Service over the shared snapshot cache.
#[derive(Debug, Clone)]
pub struct SdsService {
    handler: Arc<SotwHandler>,
}

impl SdsService {
    /// Create a new SDS service.
    pub fn new(handler: Arc<SotwHandler>) -> Self {
        Self { handler }
    }

    /// Wrap into the generated tonic server for registration.
    pub fn into_service(self) -> SecretDiscoveryServiceServer<Self> {
        SecretDiscoveryServiceServer::new(self)
    }
}

#[async_trait]
impl SecretDiscoveryService for SdsService {
    type StreamSecretsStream = ReceiverStream<Result<DiscoveryResponse, Status>>;

    async fn stream_secrets(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamSecretsStream>, Status> {
        let (tx, rx) = mpsc::channel(RESPONSE_BUFFER);
        tokio::spawn(run_discovery_stream(
            Arc::clone(&self.handler),
            request.into_inner(),
            tx,
            "SDS",
            Some(TypeUrl::SECRET),
        ));
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    type DeltaSecretsStream = ReceiverStream<Result<DeltaDiscoveryResponse, Status>>;

    async fn delta_secrets(
        &self,
        _request: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> Result<Response<Self::DeltaSecretsStream>, Status> {
        Err(Status::unimplemented("delta xDS is not supported"))
    }

    async fn fetch_secrets(
        &self,
        request: Request<DiscoveryRequest>,
    ) -> Result<Response<DiscoveryResponse>, Status> {
        fetch(&self.handler, request.into_inner(), TypeUrl::SECRET)
    }
}
