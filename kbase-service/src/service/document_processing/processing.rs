//! Main document processing pipeline.
//!
//! A run is driven by one ledger task: fetch the bytes, parse them, check the
//! knowledge base has a collection, vectorize, then finalize. The whole run is
//! bounded by `orchestration.deadline_secs` and can be cancelled by a delete.
//! Every run that starts ends with the document in exactly one terminal status.

use std::time::Instant;

use strum::Display;
use tracing::{debug, error, info, warn};

use crate::db::{KnowledgeDocument, TaskStatus, Workflow};
use crate::error::{ExternalCallError, ProcessingError, format_error_chain_ref};
use crate::processing_client::{ParseRequest, VectorizeRequest};
use crate::queue::TaskMessage;
use crate::service::KnowledgeService;

/// Pipeline stage, tracked so a timeout can name the outstanding call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
enum Stage {
    Fetch,
    Parse,
    Vectorize,
}

enum RunOutcome {
    Completed(i64),
    Failed(String),
    Cancelled,
    /// Stopped by shutdown; the task goes back to `pending`
    Interrupted,
}

/// How one attempt of the pipeline ended
enum Attempt {
    Finished(Result<i64, ProcessingError>),
    TimedOut(Stage),
    Cancelled,
    Interrupted,
}

fn rejected(operation: &'static str, message: String) -> ProcessingError {
    let message = if message.trim().is_empty() {
        "no reason given".to_string()
    } else {
        message
    };
    ProcessingError::Rejected(ExternalCallError::Rejected { operation, message })
}

impl KnowledgeService {
    /// Run one task from the queue (called by the worker pool)
    ///
    /// Messages for tasks that are no longer pending are ignored, so a
    /// redelivered message never starts a second run. Transient failures are
    /// retried within the run up to the task's `max_retries`.
    pub(crate) async fn process_task(&self, message: &TaskMessage) {
        let doc_id = &message.document_id;
        let task_id = &message.task_id;
        let workflow = message.task_type.workflow();

        let task = match self.db.claim_task(task_id) {
            Ok(Some(task)) => task,
            Ok(None) => {
                debug!(task_id = %task_id, doc_id = %doc_id, "Task already claimed or closed, skipping");
                return;
            }
            Err(e) => {
                error!(task_id = %task_id, error = %format_error_chain_ref(&e), "Failed to claim task");
                return;
            }
        };

        let document = match self.db.get_document(doc_id) {
            Ok(Some(doc)) if doc.parsing_status == workflow.running_status() => doc,
            Ok(Some(doc)) => {
                warn!(
                    doc_id = %doc_id,
                    status = %doc.parsing_status,
                    workflow = %workflow,
                    "Document is not awaiting this run"
                );
                self.close_task(task_id, TaskStatus::Failed, Some("Document no longer awaiting this task"));
                return;
            }
            Ok(None) => {
                debug!(doc_id = %doc_id, "Document deleted before its run started");
                self.close_task(task_id, TaskStatus::Failed, Some("Document deleted"));
                return;
            }
            Err(e) => {
                let message = format_error_chain_ref(&e);
                error!(doc_id = %doc_id, error = %message, "Failed to load document for processing");
                self.close_task(task_id, TaskStatus::Failed, Some(&message));
                return;
            }
        };

        let cancel_token = self.register_processing_token(doc_id, task_id);
        let deadline = self.config.orchestration.deadline();
        let started = Instant::now();
        let mut retries = task.retry_count;

        info!(doc_id = %doc_id, task_id = %task_id, workflow = %workflow, "Starting document processing");

        let outcome = loop {
            let mut stage = Stage::Fetch;
            let attempt = tokio::select! {
                _ = cancel_token.cancelled() => Attempt::Cancelled,
                _ = self.shutdown.cancelled() => Attempt::Interrupted,
                result = tokio::time::timeout(deadline, self.run_pipeline(&document, &mut stage)) => match result {
                    Ok(result) => Attempt::Finished(result),
                    Err(_) => Attempt::TimedOut(stage),
                },
            };

            match attempt {
                Attempt::Finished(Ok(chunk_count)) => break RunOutcome::Completed(chunk_count),
                Attempt::Finished(Err(e)) if e.is_transient() && retries < task.max_retries => {
                    retries += 1;
                    let message = format_error_chain_ref(&e);
                    warn!(
                        doc_id = %doc_id,
                        attempt = retries,
                        max_retries = task.max_retries,
                        error = %message,
                        "Transient processing failure, retrying"
                    );
                    if let Err(e) = self.db.record_task_retry(task_id, &message) {
                        warn!(task_id = %task_id, error = %format_error_chain_ref(&e), "Failed to record retry");
                    }

                    let backoff = self.config.orchestration.retry_backoff(retries);
                    tokio::select! {
                        _ = cancel_token.cancelled() => break RunOutcome::Cancelled,
                        _ = self.shutdown.cancelled() => break RunOutcome::Interrupted,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
                Attempt::Finished(Err(e)) => break RunOutcome::Failed(format_error_chain_ref(&e)),
                Attempt::TimedOut(stage) => {
                    break RunOutcome::Failed(format!(
                        "Timed out after {}s waiting for {}",
                        deadline.as_secs(),
                        stage
                    ));
                }
                Attempt::Cancelled => break RunOutcome::Cancelled,
                Attempt::Interrupted => break RunOutcome::Interrupted,
            }
        };

        let label = match outcome {
            RunOutcome::Completed(chunk_count) => {
                match self
                    .db
                    .mark_document_completed(doc_id, workflow, chunk_count)
                {
                    Ok(true) => {
                        info!(doc_id = %doc_id, chunks = chunk_count, workflow = %workflow, "Document processing complete");
                        self.close_task(task_id, TaskStatus::Completed, None);
                        "completed"
                    }
                    Ok(false) => {
                        warn!(doc_id = %doc_id, "Document changed during processing, result discarded");
                        self.close_task(task_id, TaskStatus::Failed, Some("Document changed during processing"));
                        "discarded"
                    }
                    Err(e) => {
                        let message = format!("Failed to record result: {}", format_error_chain_ref(&e));
                        self.fail_run(task_id, doc_id, workflow, &message);
                        "failed"
                    }
                }
            }
            RunOutcome::Failed(message) => {
                self.fail_run(task_id, doc_id, workflow, &message);
                "failed"
            }
            RunOutcome::Cancelled => {
                info!(doc_id = %doc_id, "Document processing cancelled");
                self.close_task(task_id, TaskStatus::Failed, Some("Processing cancelled"));
                "cancelled"
            }
            RunOutcome::Interrupted => {
                info!(doc_id = %doc_id, task_id = %task_id, "Processing interrupted by shutdown, task returned to the ledger");
                if let Err(e) = self.db.release_task(task_id) {
                    warn!(task_id = %task_id, error = %format_error_chain_ref(&e), "Failed to release task");
                }
                "interrupted"
            }
        };

        self.unregister_processing_token(doc_id, task_id);

        metrics::counter!(
            "kbase_pipeline_runs_total",
            "workflow" => workflow.to_string(),
            "outcome" => label
        )
        .increment(1);
        metrics::histogram!("kbase_pipeline_duration_seconds", "workflow" => workflow.to_string())
            .record(started.elapsed().as_secs_f64());
    }

    async fn run_pipeline(
        &self,
        document: &KnowledgeDocument,
        stage: &mut Stage,
    ) -> Result<i64, ProcessingError> {
        let client = self
            .processing
            .as_ref()
            .ok_or(ProcessingError::Unavailable)?;

        *stage = Stage::Fetch;
        let content = self
            .blobs
            .get(&document.object_key)
            .await
            .map_err(ProcessingError::Fetch)?;
        debug!(doc_id = %document.id, size = content.len(), "Fetched document bytes");

        *stage = Stage::Parse;
        let parsed = client
            .parse(ParseRequest {
                document_id: document.id.clone(),
                object_key: document.object_key.clone(),
                content,
                mime_type: document.mime.clone(),
            })
            .await
            .map_err(ProcessingError::ParseCall)?;

        if !parsed.success {
            return Err(rejected("parse", parsed.error_message));
        }
        if parsed.content.trim().is_empty() {
            return Err(ProcessingError::EmptyContent);
        }
        debug!(doc_id = %document.id, chars = parsed.content.len(), "Document parsed");

        let kb_id = &document.knowledge_base_id;
        let kb = self
            .db
            .get_knowledge_base(kb_id)
            .map_err(|e| ProcessingError::Metadata(Box::new(e)))?
            .ok_or_else(|| ProcessingError::KnowledgeBaseMissing {
                knowledge_base_id: kb_id.clone(),
            })?;
        let collection_name = kb
            .collection_name()
            .ok_or_else(|| ProcessingError::MissingCollection {
                knowledge_base_id: kb_id.clone(),
            })?
            .to_string();

        *stage = Stage::Vectorize;
        let vectorized = client
            .vectorize(VectorizeRequest {
                document_id: document.id.clone(),
                content: parsed.content,
                knowledge_base_id: kb_id.clone(),
                collection_name,
                title: document.title.clone(),
                object_key: document.object_key.clone(),
            })
            .await
            .map_err(ProcessingError::VectorizeCall)?;

        if !vectorized.success {
            return Err(rejected("vectorize", vectorized.error_message));
        }
        if vectorized.chunk_count <= 0 {
            return Err(ProcessingError::NoChunks);
        }

        Ok(vectorized.chunk_count)
    }

    fn fail_run(&self, task_id: &str, doc_id: &str, workflow: Workflow, message: &str) {
        warn!(doc_id = %doc_id, workflow = %workflow, error = %message, "Document processing failed");

        match self.db.mark_document_failed(doc_id, workflow, message) {
            Ok(true) => {}
            Ok(false) => debug!(doc_id = %doc_id, "Document changed during processing, failure not recorded"),
            Err(e) => error!(
                doc_id = %doc_id,
                original_error = %message,
                update_error = %format_error_chain_ref(&e),
                "Failed to mark document as failed"
            ),
        }
        self.close_task(task_id, TaskStatus::Failed, Some(message));
    }

    fn close_task(&self, task_id: &str, status: TaskStatus, error_message: Option<&str>) {
        if let Err(e) = self.db.finish_task(task_id, status, error_message) {
            warn!(task_id = %task_id, error = %format_error_chain_ref(&e), "Failed to update task ledger");
        }
    }
}
