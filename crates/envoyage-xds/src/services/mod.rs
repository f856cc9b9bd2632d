//! gRPC service implementations for xDS.
//!
//! All six discovery services share one [`SotwHandler`] over the same
//! snapshot cache. ADS is the service the managed Envoys actually use; the
//! per-type services answer the same data on dedicated streams.

pub mod ads;
pub mod cds;
pub mod eds;
pub mod lds;
pub mod rds;
pub mod sds;

pub use ads::AdsService;
pub use cds::CdsService;
pub use eds::EdsService;
pub use lds::LdsService;
pub use rds::RdsService;
pub use sds::SdsService;

use std::sync::Arc;

use envoyage_cache::SnapshotCache;

use crate::sotw::SotwHandler;

/// Buffer size of the per-stream response channel.
pub(crate) const RESPONSE_BUFFER: usize = 16;

/// Construct all six services over one shared handler.
pub(crate) fn create_services(
    cache: Arc<SnapshotCache>,
) -> (
    AdsService,
    CdsService,
    EdsService,
    LdsService,
    RdsService,
    SdsService,
) {
    let handler = Arc::new(SotwHandler::new(cache));
    (
        AdsService::new(Arc::clone(&handler)),
        CdsService::new(Arc::clone(&handler)),
        EdsService::new(Arc::clone(&handler)),
        LdsService::new(Arc::clone(&handler)),
        RdsService::new(Arc::clone(&handler)),
        SdsService::new(handler),
    )
}
