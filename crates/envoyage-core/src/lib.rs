//! # envoyage-core
//!
//! Core types and error handling shared across the envoyage control plane:
//!
//! - [`EnvoyageError`] - Error type covering every layer, with gRPC status
//!   code mapping
//! - [`TypeUrl`] - xDS resource type URL handling and constants

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod type_url;

pub use error::EnvoyageError;
pub use type_url::TypeUrl;

/// Result type alias using [`EnvoyageError`].
pub type Result<T> = std::result::Result<T, EnvoyageError>;
