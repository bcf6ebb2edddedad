//! Knowledge base API endpoints.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use std::sync::Arc;

use crate::db::KnowledgeBase;
use crate::error::ServiceError;
use crate::service::NewKnowledgeBase;

use super::AppState;

/// Create a knowledge base
pub async fn create_knowledge_base_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<NewKnowledgeBase>,
) -> Result<(StatusCode, Json<KnowledgeBase>), ServiceError> {
    let kb = state.service.create_knowledge_base(request)?;
    Ok((StatusCode::CREATED, Json(kb)))
}

pub async fn get_knowledge_base_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<KnowledgeBase>, ServiceError> {
    Ok(Json(state.service.get_knowledge_base(&id)?))
}

/// Recompute aggregate statistics from live documents
pub async fn reconcile_knowledge_base_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<KnowledgeBase>, ServiceError> {
    Ok(Json(state.service.reconcile_knowledge_base_stats(&id)?))
}
