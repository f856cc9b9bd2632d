//! # envoyage-registry
//!
//! The authoritative in-memory model of the services the control plane
//! exposes. The registry is the single source of truth: every event source
//! (management API, Docker watcher) mutates it, and the xDS layer derives
//! per-node snapshots from it.
//!
//! ## Example
//!
//! ```rust
//! use envoyage_registry::{Service, ServiceRegistry};
//!
//! let registry = ServiceRegistry::new();
//! registry.add(Service::new("web", "web.example.com", "web-a:5678")).unwrap();
//!
//! let (services, version) = registry.snapshot();
//! assert_eq!(services.len(), 1);
//! assert_eq!(version, 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod registry;
mod service;

pub use registry::ServiceRegistry;
pub use service::Service;
