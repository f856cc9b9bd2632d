//! Error types for control plane operations.
//!
//! This module provides [`EnvoyageError`], a single error type that covers
//! registry validation, snapshot building, cache installation, and gRPC
//! transport failures, and converts to [`tonic::Status`] where a gRPC
//! response is the consumer.

/// Error type for all control plane operations.
///
/// The variants fall into the policy classes the control plane
/// distinguishes:
///
/// - **validation** (`ServiceExists`, `ServiceNotFound`, `InvalidService`):
///   reported to the caller, no state change
/// - **build** (`SnapshotInconsistent`): logged, the previous snapshot
///   stays authoritative
/// - **install** (`Cache`): same policy as build
/// - **transport** (`Transport`, `NackReceived`): logged, the previously
///   accepted version stays authoritative
/// - **fatal** (`Configuration`): startup only
#[derive(Debug, thiserror::Error)]
pub enum EnvoyageError {
    /// A service with this name is already registered.
    #[error("service {name:?} already exists")]
    ServiceExists {
        /// The conflicting service name.
        name: String,
    },

    /// No service with this name is registered.
    #[error("service {name:?} not found")]
    ServiceNotFound {
        /// The missing service name.
        name: String,
    },

    /// A service failed validation before reaching the registry.
    #[error("invalid service {name:?}: {reason}")]
    InvalidService {
        /// The offending service name (may be empty).
        name: String,
        /// Reason for rejection.
        reason: String,
    },

    /// A built snapshot references a cluster it does not define.
    #[error("snapshot v{version} for node {node_id:?} is inconsistent: route references undefined cluster {cluster:?}")]
    SnapshotInconsistent {
        /// Node the snapshot was built for.
        node_id: String,
        /// Registry version of the failed build.
        version: u64,
        /// The dangling cluster reference.
        cluster: String,
    },

    /// Snapshot cache operation failed.
    #[error("cache error: {message}")]
    Cache {
        /// Description of the cache error.
        message: String,
    },

    /// gRPC transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Optional underlying error.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A data plane rejected a pushed configuration (NACK).
    #[error("NACK from {node_id} for {type_url}: {error_message}")]
    NackReceived {
        /// The node ID that sent the NACK.
        node_id: String,
        /// The type URL that was rejected.
        type_url: String,
        /// The nonce of the rejected response.
        nonce: String,
        /// Error message from the client.
        error_message: String,
    },

    /// Configuration error (startup-fatal).
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl EnvoyageError {
    /// Create a transport error from any error type.
    pub fn transport<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Transport {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Whether this error class leaves existing snapshots authoritative
    /// rather than aborting the process.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Configuration(_))
    }
}

/// Convert to tonic::Status for gRPC responses.
impl From<EnvoyageError> for tonic::Status {
    fn from(err: EnvoyageError) -> Self {
        match &err {
            EnvoyageError::ServiceExists { .. } => {
                tonic::Status::already_exists(err.to_string())
            }
            EnvoyageError::ServiceNotFound { .. } => tonic::Status::not_found(err.to_string()),
            EnvoyageError::InvalidService { .. } => {
                tonic::Status::invalid_argument(err.to_string())
            }
            EnvoyageError::SnapshotInconsistent { .. } | EnvoyageError::Cache { .. } => {
                tonic::Status::internal(err.to_string())
            }
            EnvoyageError::Transport { .. } => tonic::Status::unavailable(err.to_string()),
            // NACKs are informational for the server, not stream failures
            EnvoyageError::NackReceived { .. } => tonic::Status::ok(err.to_string()),
            EnvoyageError::Configuration(_) => tonic::Status::failed_precondition(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_names_the_service() {
        let err = EnvoyageError::ServiceExists {
            name: "nextcloud".to_string(),
        };
        assert!(err.to_string().contains("nextcloud"));
    }

    #[test]
    fn registry_errors_map_to_grpc_codes() {
        let status: tonic::Status = EnvoyageError::ServiceNotFound {
            name: "web".to_string(),
        }
        .into();
        assert_eq!(status.code(), tonic::Code::NotFound);

        let status: tonic::Status = EnvoyageError::ServiceExists {
            name: "web".to_string(),
        }
        .into();
        assert_eq!(status.code(), tonic::Code::AlreadyExists);
    }

    #[test]
    fn configuration_is_not_recoverable() {
        assert!(!EnvoyageError::Configuration("bad addr".into()).is_recoverable());
        assert!(EnvoyageError::Cache {
            message: "full".into()
        }
        .is_recoverable());
    }
}
