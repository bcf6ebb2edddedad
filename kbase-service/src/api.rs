//! HTTP API for the knowledge base service.
//!
//! This module provides the REST API endpoints for:
//! - Health and metrics monitoring
//! - Knowledge base management
//! - Document upload, listing, deletion, re-vectorization and download

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, State},
    http::{StatusCode, header},
    response::IntoResponse,
    routing::{get, post},
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::service::KnowledgeService;

pub mod documents;
pub mod knowledge_bases;
use documents::{
    delete_document_handler, download_document_handler, get_document_handler,
    list_documents_handler, upload_document_handler, vectorize_document_handler,
};
use knowledge_bases::{
    create_knowledge_base_handler, get_knowledge_base_handler, reconcile_knowledge_base_handler,
};

/// Multipart framing and form fields on top of the file itself
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

/// Application state
pub struct AppState {
    pub service: Arc<KnowledgeService>,
    pub start_time: Instant,
    pub prometheus_handle: PrometheusHandle,
}

/// Build the API router
pub fn router(service: Arc<KnowledgeService>, prometheus_handle: PrometheusHandle) -> Router {
    let max_body_size =
        service.config.limits.max_upload_bytes as usize + MULTIPART_OVERHEAD_BYTES;

    let state = Arc::new(AppState {
        service,
        start_time: Instant::now(),
        prometheus_handle,
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        // Knowledge base endpoints
        .route("/knowledge-bases", post(create_knowledge_base_handler))
        .route("/knowledge-bases/{id}", get(get_knowledge_base_handler))
        .route(
            "/knowledge-bases/{id}/reconcile",
            post(reconcile_knowledge_base_handler),
        )
        // Document endpoints - with larger body limit for file uploads
        .route(
            "/documents/upload",
            post(upload_document_handler).layer(DefaultBodyLimit::max(max_body_size)),
        )
        .route("/documents", get(list_documents_handler))
        .route(
            "/documents/{id}",
            get(get_document_handler).delete(delete_document_handler),
        )
        .route("/documents/{id}/vectorize", post(vectorize_document_handler))
        .route("/documents/{id}/download", get(download_document_handler));

    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .nest("/api", api_routes)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}

// === Health & Metrics ===

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let processing_configured = state.service.processing.is_some();

    Json(HealthResponse {
        status: if processing_configured {
            "healthy"
        } else {
            "degraded"
        },
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        processing_configured,
    })
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_seconds: u64,
    processing_configured: bool,
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.prometheus_handle.render(),
    )
}
