//! Document upload with per-knowledge-base checksum deduplication.

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::db::{DocumentTask, InsertOutcome, KnowledgeDocument, ParsingStatus, TaskType, Workflow};
use crate::error::{ServiceError, ServiceResult, StorageError, format_error_chain_ref};
use crate::hash::compute_content_hash;
use crate::service::KnowledgeService;
use crate::storage::object_key;

/// File extensions accepted for upload, compared case-insensitively
pub const ALLOWED_EXTENSIONS: &[&str] = &[
    "txt", "md", "pdf", "docx", "xlsx", "pptx", "html", "htm", "csv", "json", "xml", "rtf",
];

/// A file handed to [`KnowledgeService::upload_document`]
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub knowledge_base_id: String,
    /// Original filename as sent by the client
    pub filename: String,
    /// Size reported by the client, checked before the payload is touched
    pub declared_size: u64,
    pub content_type: Option<String>,
    pub created_by: Option<i64>,
    pub payload: Bytes,
}

/// Keys tried for one upload before giving up on a crowded millisecond
const MAX_KEY_ATTEMPTS: i64 = 16;

/// Final path component of a client-supplied filename
fn base_filename(filename: &str) -> Option<&str> {
    Path::new(filename)
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::trim)
        .filter(|n| !n.is_empty())
}

fn validate_extension(filename: &str) -> ServiceResult<()> {
    let extension = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();

    if ALLOWED_EXTENSIONS.contains(&extension.as_str()) {
        Ok(())
    } else {
        Err(ServiceError::InvalidInput {
            message: format!(
                "Unsupported file type '{}'; allowed: {}",
                extension,
                ALLOWED_EXTENSIONS.join(", ")
            ),
        })
    }
}

fn check_size(size: u64, max: u64) -> ServiceResult<()> {
    if size > max {
        return Err(ServiceError::InvalidInput {
            message: format!("File too large: {} bytes (max {} bytes)", size, max),
        });
    }
    Ok(())
}

impl KnowledgeService {
    /// Upload a document and hand it to the processing pipeline
    ///
    /// Identical content already present in the knowledge base is returned as-is.
    /// Otherwise the bytes are stored, the document is recorded with status
    /// `processing` and a ledger task is dispatched to the worker pool. The call
    /// never waits for parsing or vectorization.
    pub async fn upload_document(&self, request: UploadRequest) -> ServiceResult<KnowledgeDocument> {
        let kb_id = request.knowledge_base_id.trim();
        if kb_id.is_empty() {
            return Err(ServiceError::InvalidInput {
                message: "knowledge_base_id is required".to_string(),
            });
        }

        if self.db.get_knowledge_base(kb_id)?.is_none() {
            return Err(ServiceError::KnowledgeBaseNotFound {
                knowledge_base_id: kb_id.to_string(),
            });
        }

        let filename = base_filename(&request.filename).ok_or_else(|| ServiceError::InvalidInput {
            message: "filename is required".to_string(),
        })?;

        let max_size = self.config.limits.max_upload_bytes;
        check_size(request.declared_size, max_size)?;
        validate_extension(filename)?;
        check_size(request.payload.len() as u64, max_size)?;

        let checksum = compute_content_hash(&request.payload);

        if let Some(existing) = self.db.get_document_by_checksum(kb_id, &checksum)? {
            info!(
                doc_id = %existing.id,
                kb_id = %kb_id,
                "Identical content already uploaded, returning existing document"
            );
            metrics::counter!("kbase_uploads_total", "outcome" => "duplicate").increment(1);
            return Ok(existing);
        }

        let content_type = request
            .content_type
            .as_deref()
            .map(str::trim)
            .filter(|ct| !ct.is_empty())
            .unwrap_or(mime::APPLICATION_OCTET_STREAM.as_ref())
            .to_string();

        let now = Utc::now();
        let key = self
            .store_new_blob(kb_id, now, filename, &request.payload, &content_type)
            .await?;

        let mut document = KnowledgeDocument {
            id: uuid::Uuid::new_v4().to_string(),
            knowledge_base_id: kb_id.to_string(),
            title: filename.to_string(),
            object_key: key,
            size: request.payload.len() as i64,
            mime: content_type,
            checksum,
            parsing_status: ParsingStatus::Processing,
            workflow: Workflow::Ingest,
            chunk_count: 0,
            error_message: None,
            created_by: request.created_by,
            created_at: now,
            updated_at: now,
        };

        let task = self.processing.is_some().then(|| {
            DocumentTask::new(
                &document,
                TaskType::Process,
                self.config.orchestration.max_retries,
            )
        });

        match self.db.insert_document(&document, task.as_ref()) {
            Ok(InsertOutcome::Inserted) => {}
            Ok(InsertOutcome::Existing(existing)) => {
                debug!(doc_id = %existing.id, "Concurrent upload of identical content won the insert");
                if existing.object_key != document.object_key {
                    self.remove_orphaned_blob(&document.object_key).await;
                }
                metrics::counter!("kbase_uploads_total", "outcome" => "duplicate").increment(1);
                return Ok(existing);
            }
            Err(e) => {
                self.remove_orphaned_blob(&document.object_key).await;
                return Err(e);
            }
        }

        info!(
            doc_id = %document.id,
            kb_id = %kb_id,
            title = %document.title,
            size = document.size,
            "Document uploaded"
        );

        let Some(task) = task else {
            let message = "Processing service unavailable; document stored but not processed";
            self.fail_new_upload(&mut document, message)?;
            metrics::counter!("kbase_uploads_total", "outcome" => "unprocessed").increment(1);
            return Ok(document);
        };

        if let Err(e) = self.dispatch_task(&task, &document.object_key).await {
            let message = format!("Failed to dispatch processing task: {}", format_error_chain_ref(&e));
            warn!(doc_id = %document.id, error = %message, "Could not queue document for processing");
            self.db
                .finish_task(&task.id, crate::db::TaskStatus::Failed, Some(&message))?;
            self.fail_new_upload(&mut document, &message)?;
            metrics::counter!("kbase_uploads_total", "outcome" => "unprocessed").increment(1);
            return Ok(document);
        }

        metrics::counter!("kbase_uploads_total", "outcome" => "accepted").increment(1);
        Ok(document)
    }

    /// Store the payload under a key no other object holds
    ///
    /// Uploads of the same filename within one millisecond share a key, so a
    /// taken key is retried with the timestamp moved forward.
    async fn store_new_blob(
        &self,
        kb_id: &str,
        uploaded_at: DateTime<Utc>,
        filename: &str,
        payload: &Bytes,
        content_type: &str,
    ) -> ServiceResult<String> {
        let mut attempt = 0;
        loop {
            let key = object_key(kb_id, uploaded_at + Duration::milliseconds(attempt), filename);
            match self.blobs.put(&key, payload.clone(), content_type).await {
                Ok(()) => return Ok(key),
                Err(StorageError::AlreadyExists { .. }) if attempt + 1 < MAX_KEY_ATTEMPTS => {
                    debug!(key = %key, "Object key taken, trying the next one");
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn fail_new_upload(&self, document: &mut KnowledgeDocument, message: &str) -> ServiceResult<()> {
        self.db
            .mark_document_failed(&document.id, Workflow::Ingest, message)?;
        document.parsing_status = ParsingStatus::Failed;
        document.error_message = Some(message.to_string());
        document.updated_at = Utc::now();
        Ok(())
    }

    async fn remove_orphaned_blob(&self, key: &str) {
        if let Err(e) = self.blobs.delete(key).await {
            warn!(key = %key, error = %format_error_chain_ref(&e), "Failed to remove orphaned blob");
            metrics::counter!("kbase_cleanup_failures_total", "kind" => "orphaned_blob").increment(1);
        }
    }
}
