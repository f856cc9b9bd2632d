//! # envoyage-cache
//!
//! The versioned snapshot store that sits between the control side and the
//! transport side of the control plane. The snapshot builder installs
//! per-node bundles here; the gRPC services read and watch them.
//!
//! The cache is keyed directly by the node ID string the data plane
//! presents when it subscribes.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cache;
mod snapshot;
mod watch;

pub use cache::{Cache, SnapshotCache};
pub use snapshot::{ResourceSet, Snapshot};
pub use watch::{Watch, WatchManager};
