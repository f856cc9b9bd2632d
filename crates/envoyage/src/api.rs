//! Management HTTP API.
//!
//! A thin adapter over the registry for manual service registration and
//! inspection:
//!
//! - `POST /services` - register a service (201, 400 on bad input, 409 on
//!   name conflict)
//! - `DELETE /services/{name}` - unregister (200, 404 if absent)
//! - `GET /services` - list services with the current registry version

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::info;

use envoyage_core::EnvoyageError;
use envoyage_registry::{Service, ServiceRegistry};

/// Build the management API router over the shared registry.
pub fn router(registry: Arc<ServiceRegistry>) -> Router {
    Router::new()
        .route("/services", post(add_service).get(list_services))
        .route("/services/:name", delete(remove_service))
        .with_state(registry)
}

#[derive(Debug, Default, Deserialize)]
struct ServiceRequest {
    #[serde(default)]
    name: String,
    #[serde(default)]
    domain: String,
    #[serde(default)]
    upstream: String,
}

#[derive(Debug, Serialize)]
struct ListResponse {
    version: u64,
    services: Vec<Service>,
}

#[derive(Debug, Serialize)]
struct ApiError {
    error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ApiError {
            error: message.into(),
        }),
    )
        .into_response()
}

async fn add_service(
    State(registry): State<Arc<ServiceRegistry>>,
    Json(req): Json<ServiceRequest>,
) -> Response {
    if req.name.is_empty() || req.domain.is_empty() || req.upstream.is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "name, domain, and upstream are required",
        );
    }

    let svc = Service::new(req.name, req.domain, req.upstream);
    match registry.add(svc.clone()) {
        Ok(()) => {
            info!(name = %svc.name, domain = %svc.domain, upstream = %svc.upstream, "service added via API");
            (StatusCode::CREATED, Json(svc)).into_response()
        }
        Err(e @ EnvoyageError::ServiceExists { .. }) => {
            error_response(StatusCode::CONFLICT, e.to_string())
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn remove_service(
    State(registry): State<Arc<ServiceRegistry>>,
    Path(name): Path<String>,
) -> Response {
    match registry.remove(&name) {
        Ok(()) => {
            info!(name = %name, "service removed via API");
            StatusCode::OK.into_response()
        }
        Err(e @ EnvoyageError::ServiceNotFound { .. }) => {
            error_response(StatusCode::NOT_FOUND, e.to_string())
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn list_services(State(registry): State<Arc<ServiceRegistry>>) -> Json<ListResponse> {
    let (services, version) = registry.snapshot();
    Json(ListResponse { version, services })
}
