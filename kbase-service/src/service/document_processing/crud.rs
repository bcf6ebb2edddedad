//! Document reads, deletion, re-vectorization and download.

use tracing::{debug, info, warn};

use crate::db::{DocumentPage, DocumentTask, KnowledgeDocument, ParsingStatus, TaskStatus, TaskType};
use crate::error::{ServiceError, ServiceResult, format_error_chain_ref};
use crate::service::KnowledgeService;
use crate::storage::BlobStream;

const DEFAULT_PAGE_SIZE: u32 = 20;
const MAX_PAGE_SIZE: u32 = 100;

/// A document's bytes, ready to stream to a client
pub struct Download {
    pub filename: String,
    pub content_type: String,
    pub size: i64,
    pub stream: BlobStream,
}

impl KnowledgeService {
    /// Get a document by ID
    pub fn get_document(&self, document_id: &str) -> ServiceResult<KnowledgeDocument> {
        self.db
            .get_document(document_id)?
            .ok_or_else(|| ServiceError::DocumentNotFound {
                document_id: document_id.to_string(),
            })
    }

    /// List a knowledge base's documents, newest first
    ///
    /// `page` starts at 1; `page_size` defaults to 20 and is clamped to 1..=100.
    pub fn list_documents(
        &self,
        kb_id: &str,
        status: Option<ParsingStatus>,
        page: Option<u32>,
        page_size: Option<u32>,
    ) -> ServiceResult<DocumentPage> {
        if self.db.get_knowledge_base(kb_id)?.is_none() {
            return Err(ServiceError::KnowledgeBaseNotFound {
                knowledge_base_id: kb_id.to_string(),
            });
        }

        let page = page.unwrap_or(1).max(1);
        let page_size = page_size
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE);

        self.db.list_documents(kb_id, status, page, page_size)
    }

    /// Delete a document
    ///
    /// In-flight processing is cancelled first. Vector and blob removal are
    /// best-effort: failures are logged and counted but do not stop the
    /// delete. The metadata soft delete, together with the inverse aggregate
    /// adjustment, must succeed.
    pub async fn delete_document(&self, document_id: &str) -> ServiceResult<()> {
        let document = self.get_document(document_id)?;

        if self.cancel_document_processing(document_id) {
            info!(doc_id = %document_id, "Cancelled in-progress processing for deleted document");
        }

        if document.has_vectors() {
            self.delete_document_vectors(&document).await;
        }

        if let Err(e) = self.blobs.delete(&document.object_key).await {
            warn!(
                doc_id = %document_id,
                key = %document.object_key,
                error = %format_error_chain_ref(&e),
                "Failed to delete document blob"
            );
            metrics::counter!("kbase_cleanup_failures_total", "kind" => "blob").increment(1);
        }

        if !self.db.soft_delete_document(&document)? {
            return Err(ServiceError::DocumentNotFound {
                document_id: document_id.to_string(),
            });
        }

        info!(
            doc_id = %document_id,
            kb_id = %document.knowledge_base_id,
            size = document.size,
            "Document deleted"
        );
        Ok(())
    }

    async fn delete_document_vectors(&self, document: &KnowledgeDocument) {
        let doc_id = &document.id;

        let collection_name = match self.db.get_knowledge_base(&document.knowledge_base_id) {
            Ok(Some(kb)) => match kb.collection_name() {
                Some(name) => name.to_string(),
                None => {
                    debug!(doc_id = %doc_id, "Knowledge base has no collection, no vectors to delete");
                    return;
                }
            },
            Ok(None) => return,
            Err(e) => {
                warn!(doc_id = %doc_id, error = %format_error_chain_ref(&e), "Failed to look up collection for vector cleanup");
                metrics::counter!("kbase_cleanup_failures_total", "kind" => "vectors").increment(1);
                return;
            }
        };

        let Some(client) = &self.processing else {
            warn!(doc_id = %doc_id, "Processing service unavailable, vectors left in place");
            metrics::counter!("kbase_cleanup_failures_total", "kind" => "vectors").increment(1);
            return;
        };

        match client
            .delete_vectors(&collection_name, std::slice::from_ref(doc_id))
            .await
        {
            Ok(response) if response.success => {
                debug!(
                    doc_id = %doc_id,
                    collection = %collection_name,
                    deleted = response.deleted_count,
                    "Deleted document vectors"
                );
            }
            Ok(response) => {
                warn!(
                    doc_id = %doc_id,
                    collection = %collection_name,
                    error = %response.error_message,
                    "Vector deletion rejected"
                );
                metrics::counter!("kbase_cleanup_failures_total", "kind" => "vectors").increment(1);
            }
            Err(e) => {
                warn!(
                    doc_id = %doc_id,
                    collection = %collection_name,
                    error = %format_error_chain_ref(&e),
                    "Vector deletion failed"
                );
                metrics::counter!("kbase_cleanup_failures_total", "kind" => "vectors").increment(1);
            }
        }
    }

    /// Queue a `completed` document for re-vectorization
    ///
    /// The document moves to `vectorizing` and the run happens on the worker
    /// pool. Any other status is refused with `InvalidState` and nothing is sent.
    pub async fn vectorize_document(&self, document_id: &str) -> ServiceResult<KnowledgeDocument> {
        let document = self.get_document(document_id)?;

        if document.parsing_status != ParsingStatus::Completed {
            return Err(ServiceError::InvalidState {
                document_id: document_id.to_string(),
                message: format!(
                    "re-vectorization requires status completed, found {}",
                    document.parsing_status
                ),
            });
        }

        if self.processing.is_none() {
            return Err(ServiceError::ExternalServiceUnavailable {
                service: "processing".to_string(),
            });
        }

        let task = DocumentTask::new(
            &document,
            TaskType::Vectorize,
            self.config.orchestration.max_retries,
        );
        if !self.db.begin_revectorize(document_id, &task)? {
            return Err(ServiceError::InvalidState {
                document_id: document_id.to_string(),
                message: "document changed before re-vectorization could start".to_string(),
            });
        }

        if let Err(e) = self.dispatch_task(&task, &document.object_key).await {
            warn!(doc_id = %document_id, error = %format_error_chain_ref(&e), "Failed to queue re-vectorization");
            self.db.abort_revectorize(document_id)?;
            self.db.finish_task(
                &task.id,
                TaskStatus::Failed,
                Some("Failed to dispatch re-vectorization task"),
            )?;
            return Err(e);
        }

        info!(doc_id = %document_id, task_id = %task.id, "Document queued for re-vectorization");
        self.get_document(document_id)
    }

    /// Open a document's bytes for streaming
    pub async fn download_document(&self, document_id: &str) -> ServiceResult<Download> {
        let document = self.get_document(document_id)?;
        let stream = self.blobs.get_stream(&document.object_key).await?;

        Ok(Download {
            filename: document.title,
            content_type: document.mime,
            size: document.size,
            stream,
        })
    }
}
