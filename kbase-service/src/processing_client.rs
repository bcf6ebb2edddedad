//! Client for the external parse/vectorize service.
//!
//! Every call distinguishes a transport failure (`Err`) from an explicit
//! `success = false` answer (`Ok` with the flag cleared), so callers can
//! report the two differently.

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::ProcessingConfig;
use crate::error::{ExternalCallError, ServiceError, ServiceResult};

/// Parse request
#[derive(Debug, Clone)]
pub struct ParseRequest {
    pub document_id: String,
    pub object_key: String,
    pub content: Bytes,
    pub mime_type: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ParseResponse {
    pub success: bool,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub error_message: String,
}

/// Vectorize request
#[derive(Debug, Clone, Serialize)]
pub struct VectorizeRequest {
    pub document_id: String,
    pub content: String,
    pub knowledge_base_id: String,
    pub collection_name: String,
    pub title: String,
    pub object_key: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VectorizeResponse {
    pub success: bool,
    #[serde(default)]
    pub chunk_count: i64,
    #[serde(default)]
    pub error_message: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeleteVectorsResponse {
    pub success: bool,
    #[serde(default)]
    pub deleted_count: i64,
    #[serde(default)]
    pub error_message: String,
}

/// Parse/vectorize service client
#[async_trait]
pub trait ProcessingClient: Send + Sync {
    async fn parse(&self, request: ParseRequest) -> Result<ParseResponse, ExternalCallError>;

    async fn vectorize(
        &self,
        request: VectorizeRequest,
    ) -> Result<VectorizeResponse, ExternalCallError>;

    async fn delete_vectors(
        &self,
        collection_name: &str,
        document_ids: &[String],
    ) -> Result<DeleteVectorsResponse, ExternalCallError>;
}

#[derive(Serialize)]
struct ParseBody<'a> {
    document_id: &'a str,
    object_key: &'a str,
    /// Base64 of the raw file bytes
    file_content: String,
    mime_type: &'a str,
}

#[derive(Serialize)]
struct DeleteVectorsBody<'a> {
    collection_name: &'a str,
    document_ids: &'a [String],
}

/// JSON-over-HTTP implementation
pub struct HttpProcessingClient {
    client: Client,
    base_url: String,
}

impl HttpProcessingClient {
    /// Create a new client. Returns `None` when no base URL is configured.
    pub fn from_config(config: &ProcessingConfig) -> ServiceResult<Option<Self>> {
        let base_url = config.base_url.trim().trim_end_matches('/');
        if base_url.is_empty() {
            return Ok(None);
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ServiceError::Config {
                message: format!("Failed to build processing client: {}", e),
            })?;

        Ok(Some(Self {
            client,
            base_url: base_url.to_string(),
        }))
    }

    async fn post<B, R>(&self, operation: &'static str, path: &str, body: &B) -> Result<R, ExternalCallError>
    where
        B: Serialize + ?Sized + Sync,
        R: serde::de::DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        debug!(operation, url = %url, "Calling processing service");

        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| ExternalCallError::Transport {
                operation,
                url: url.clone(),
                source: e,
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            warn!(operation, status = status.as_u16(), "Processing service returned an error status");
            return Err(ExternalCallError::Status {
                operation,
                status: status.as_u16(),
                message,
            });
        }

        response
            .json::<R>()
            .await
            .map_err(|e| ExternalCallError::Transport {
                operation,
                url,
                source: e,
            })
    }
}

#[async_trait]
impl ProcessingClient for HttpProcessingClient {
    async fn parse(&self, request: ParseRequest) -> Result<ParseResponse, ExternalCallError> {
        let body = ParseBody {
            document_id: &request.document_id,
            object_key: &request.object_key,
            file_content: base64::engine::general_purpose::STANDARD.encode(&request.content),
            mime_type: &request.mime_type,
        };
        self.post("parse", "/v1/documents/parse", &body).await
    }

    async fn vectorize(
        &self,
        request: VectorizeRequest,
    ) -> Result<VectorizeResponse, ExternalCallError> {
        self.post("vectorize", "/v1/documents/vectorize", &request)
            .await
    }

    async fn delete_vectors(
        &self,
        collection_name: &str,
        document_ids: &[String],
    ) -> Result<DeleteVectorsResponse, ExternalCallError> {
        let body = DeleteVectorsBody {
            collection_name,
            document_ids,
        };
        self.post("delete_vectors", "/v1/vectors/delete", &body)
            .await
    }
}
