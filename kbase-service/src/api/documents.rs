//! Document API endpoints.
//!
//! Handlers for upload, listing, retrieval, deletion, re-vectorization and
//! download of knowledge base documents.

use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::db::{DocumentPage, KnowledgeDocument, ParsingStatus};
use crate::error::ServiceError;
use crate::service::UploadRequest;

use super::AppState;

/// List documents query parameters
#[derive(Deserialize)]
pub struct ListDocumentsParams {
    pub knowledge_base_id: String,
    pub status: Option<ParsingStatus>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

/// Response for delete operations
#[derive(Serialize)]
pub struct DeleteResponse {
    pub success: bool,
    pub document_id: String,
}

/// List a knowledge base's documents
pub async fn list_documents_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListDocumentsParams>,
) -> Result<Json<DocumentPage>, ServiceError> {
    let page = state.service.list_documents(
        &params.knowledge_base_id,
        params.status,
        params.page,
        params.page_size,
    )?;
    Ok(Json(page))
}

/// Upload a new document
pub async fn upload_document_handler(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<KnowledgeDocument>), ServiceError> {
    let mut file: Option<(String, Option<String>, u64, Bytes)> = None;
    let mut knowledge_base_id = String::new();
    let mut created_by: Option<i64> = None;

    while let Ok(Some(field)) = multipart.next_field().await {
        let name = field.name().unwrap_or("").to_string();

        match name.as_str() {
            "file" => {
                let filename = field.file_name().unwrap_or("").to_string();
                let content_type = field.content_type().map(str::to_string);
                let declared = field
                    .headers()
                    .get(header::CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok());
                let data = field.bytes().await.map_err(invalid_multipart)?;
                let declared_size = declared.unwrap_or(data.len() as u64);
                file = Some((filename, content_type, declared_size, data));
            }
            "knowledge_base_id" => {
                knowledge_base_id = field.text().await.map_err(invalid_multipart)?;
            }
            "created_by" => {
                let text = field.text().await.map_err(invalid_multipart)?;
                let text = text.trim();
                if !text.is_empty() {
                    created_by = Some(text.parse().map_err(|_| ServiceError::InvalidInput {
                        message: format!("created_by must be an integer, got '{}'", text),
                    })?);
                }
            }
            _ => {}
        }
    }

    let (filename, content_type, declared_size, payload) =
        file.ok_or_else(|| ServiceError::InvalidInput {
            message: "No file provided".to_string(),
        })?;

    let document = state
        .service
        .upload_document(UploadRequest {
            knowledge_base_id: knowledge_base_id.trim().to_string(),
            filename,
            declared_size,
            content_type,
            created_by,
            payload,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(document)))
}

fn invalid_multipart(e: axum::extract::multipart::MultipartError) -> ServiceError {
    ServiceError::InvalidInput {
        message: e.body_text(),
    }
}

/// Get a specific document by ID
pub async fn get_document_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<KnowledgeDocument>, ServiceError> {
    Ok(Json(state.service.get_document(&id)?))
}

/// Delete a document, its vectors and its stored bytes
pub async fn delete_document_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<DeleteResponse>, ServiceError> {
    state.service.delete_document(&id).await?;

    Ok(Json(DeleteResponse {
        success: true,
        document_id: id,
    }))
}

/// Queue a completed document for re-vectorization
pub async fn vectorize_document_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<KnowledgeDocument>), ServiceError> {
    let document = state.service.vectorize_document(&id).await?;
    Ok((StatusCode::ACCEPTED, Json(document)))
}

/// Stream a document's original bytes
pub async fn download_document_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, ServiceError> {
    let download = state.service.download_document(&id).await?;

    let disposition = format!(
        "attachment; filename*=UTF-8''{}",
        urlencoding::encode(&download.filename)
    );

    Ok((
        [
            (header::CONTENT_TYPE, download.content_type),
            (header::CONTENT_LENGTH, download.size.to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        Body::from_stream(download.stream),
    )
        .into_response())
}
