//! # envoyage-xds
//!
//! The xDS side of the control plane:
//!
//! - [`SnapshotBuilder`] translates the service registry into per-node
//!   Envoy resource bundles, applying the split-horizon rule
//! - [`XdsServer`] serves the six discovery services (ADS, CDS, EDS, LDS,
//!   RDS, SDS) over a single gRPC listener, driven by the snapshot cache
//!
//! The data planes are expected to subscribe via ADS so that all resource
//! types share one ordered stream; the per-type services are registered for
//! completeness and for ad-hoc inspection with grpcurl.

#![deny(unsafe_code)]

mod builder;
mod server;
pub mod services;
mod sotw;
mod stream;
mod streaming;
mod utils;

pub use builder::{SnapshotBuilder, LISTENER_NAME, LISTENER_PORT, ROUTE_CONFIG_NAME};
pub use server::XdsServer;
pub use sotw::{SotwHandler, SotwResponse};
pub use stream::{StreamContext, StreamId};
