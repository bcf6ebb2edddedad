use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// Main service error type
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Knowledge base not found: {knowledge_base_id}")]
    KnowledgeBaseNotFound { knowledge_base_id: String },

    #[error("Document not found: {document_id}")]
    DocumentNotFound { document_id: String },

    #[error("Invalid state for document {document_id}: {message}")]
    InvalidState {
        document_id: String,
        message: String,
    },

    #[error("External service unavailable: {service}")]
    ExternalServiceUnavailable { service: String },

    #[error("{0}")]
    ExternalCall(#[from] ExternalCallError),

    #[error("{0}")]
    Storage(#[from] StorageError),

    #[error("Database error")]
    Database(#[from] DatabaseError),

    #[error("{0}")]
    Queue(#[from] QueueError),

    #[error("Configuration error: {message}")]
    Config { message: String },
}

/// Database errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database connection failed")]
    Connection(#[source] rusqlite::Error),

    #[error("Query failed")]
    Query(#[source] rusqlite::Error),

    #[error("Migration failed: {message}")]
    Migration { message: String },

    #[error("Database lock poisoned")]
    Poisoned,
}

/// Blob store errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Object not found: {key}")]
    NotFound { key: String },

    #[error("Invalid object key: {key}")]
    InvalidKey { key: String },

    #[error("Object already exists: {key}")]
    AlreadyExists { key: String },

    #[error("Blob storage I/O failed for {key}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
}

/// Failures talking to the external parse/vectorize service.
///
/// `Transport` covers anything that prevented a well-formed answer; `Rejected`
/// is an explicit `success = false` from the remote side.
#[derive(Error, Debug)]
pub enum ExternalCallError {
    #[error("{operation} call to {url} failed")]
    Transport {
        operation: &'static str,
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{operation} call returned status {status}: {message}")]
    Status {
        operation: &'static str,
        status: u16,
        message: String,
    },

    #[error("{operation} rejected: {message}")]
    Rejected {
        operation: &'static str,
        message: String,
    },
}

impl ExternalCallError {
    /// True when the remote side never made a decision and asking again may
    /// succeed: connection failures and 5xx or 429 answers.
    pub fn is_transient(&self) -> bool {
        match self {
            ExternalCallError::Transport { .. } => true,
            ExternalCallError::Status { status, .. } => *status >= 500 || *status == 429,
            ExternalCallError::Rejected { .. } => false,
        }
    }
}

/// Task queue producer errors
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Task queue for topic {topic} is closed")]
    Closed { topic: String },

    #[error("Invalid task payload")]
    Payload(#[source] serde_json::Error),
}

/// Why a pipeline run failed. Rendered with [`format_error_chain_ref`] into the
/// document's `error_message`; never returned to an API caller.
#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error("Processing service unavailable")]
    Unavailable,

    #[error("Failed to fetch document from storage")]
    Fetch(#[source] StorageError),

    #[error("Parse call failed")]
    ParseCall(#[source] ExternalCallError),

    #[error("Parse returned empty content")]
    EmptyContent,

    #[error("Knowledge base {knowledge_base_id} not found")]
    KnowledgeBaseMissing { knowledge_base_id: String },

    #[error("Knowledge base {knowledge_base_id} has no collection name")]
    MissingCollection { knowledge_base_id: String },

    #[error("Vectorize call failed")]
    VectorizeCall(#[source] ExternalCallError),

    #[error("Vectorize returned no chunks")]
    NoChunks,

    /// Explicit `success = false` from the processing service
    #[error("{0}")]
    Rejected(ExternalCallError),

    #[error("Metadata lookup failed")]
    Metadata(#[source] Box<ServiceError>),
}

impl ProcessingError {
    /// Failures worth another attempt within the same run
    pub fn is_transient(&self) -> bool {
        match self {
            ProcessingError::Fetch(StorageError::Io { .. }) => true,
            ProcessingError::ParseCall(e) | ProcessingError::VectorizeCall(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// API error response
#[derive(Serialize)]
pub struct ErrorResponse {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ServiceError {
    fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::KnowledgeBaseNotFound { .. }
            | ServiceError::DocumentNotFound { .. }
            | ServiceError::Storage(StorageError::NotFound { .. }) => StatusCode::NOT_FOUND,
            ServiceError::InvalidInput { .. } | ServiceError::Storage(StorageError::InvalidKey { .. }) => {
                StatusCode::BAD_REQUEST
            }
            ServiceError::InvalidState { .. }
            | ServiceError::Storage(StorageError::AlreadyExists { .. }) => StatusCode::CONFLICT,
            ServiceError::ExternalServiceUnavailable { .. } | ServiceError::Queue(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ServiceError::ExternalCall(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            ServiceError::InvalidInput { .. } => "invalid_input",
            ServiceError::KnowledgeBaseNotFound { .. } => "knowledge_base_not_found",
            ServiceError::DocumentNotFound { .. } => "document_not_found",
            ServiceError::InvalidState { .. } => "invalid_state",
            ServiceError::ExternalServiceUnavailable { .. } => "external_service_unavailable",
            ServiceError::ExternalCall(_) => "external_call_failed",
            ServiceError::Storage(StorageError::NotFound { .. }) => "object_not_found",
            ServiceError::Storage(StorageError::AlreadyExists { .. }) => "object_exists",
            ServiceError::Storage(_) => "storage_failure",
            ServiceError::Database(_) => "storage_failure",
            ServiceError::Queue(_) => "queue_unavailable",
            ServiceError::Config { .. } => "config_error",
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code().to_string();

        if status.is_server_error() {
            tracing::error!(error = %format_error_chain_ref(&self), code = %code, "Request failed");
        }

        let response = ErrorResponse {
            message: self.to_string(),
            code: Some(code),
        };

        (status, Json(response)).into_response()
    }
}

/// Result type alias for service operations
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Render an error and its `source()` chain as a single line.
pub fn format_error_chain_ref(error: &(dyn std::error::Error + 'static)) -> String {
    let mut message = error.to_string();
    let mut current = error.source();
    while let Some(source) = current {
        let text = source.to_string();
        if !message.ends_with(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        current = source.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_chain_includes_sources() {
        let err = ServiceError::Storage(StorageError::Io {
            key: "documents/kb/a.txt".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        });

        let rendered = format_error_chain_ref(&err);
        assert_eq!(
            rendered,
            "Blob storage I/O failed for documents/kb/a.txt: denied"
        );
    }

    #[test]
    fn test_status_codes() {
        let not_found = ServiceError::DocumentNotFound {
            document_id: "x".to_string(),
        };
        assert_eq!(not_found.status_code(), StatusCode::NOT_FOUND);

        let invalid_state = ServiceError::InvalidState {
            document_id: "x".to_string(),
            message: "not completed".to_string(),
        };
        assert_eq!(invalid_state.status_code(), StatusCode::CONFLICT);
        assert_eq!(invalid_state.error_code(), "invalid_state");

        let unavailable = ServiceError::ExternalServiceUnavailable {
            service: "processing".to_string(),
        };
        assert_eq!(unavailable.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_transient_external_failures() {
        let rejected = ExternalCallError::Rejected {
            operation: "parse",
            message: "bad file".to_string(),
        };
        assert!(!rejected.is_transient());

        let bad_gateway = ExternalCallError::Status {
            operation: "parse",
            status: 502,
            message: "bad gateway".to_string(),
        };
        assert!(bad_gateway.is_transient());

        let bad_request = ExternalCallError::Status {
            operation: "vectorize",
            status: 400,
            message: "malformed".to_string(),
        };
        assert!(!bad_request.is_transient());

        assert!(ProcessingError::ParseCall(bad_gateway).is_transient());
        assert!(!ProcessingError::VectorizeCall(bad_request).is_transient());
        assert!(!ProcessingError::EmptyContent.is_transient());
        assert!(
            !ProcessingError::Fetch(StorageError::NotFound {
                key: "documents/kb/a.txt".to_string()
            })
            .is_transient()
        );
    }
}
