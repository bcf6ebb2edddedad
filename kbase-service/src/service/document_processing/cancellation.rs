//! Cancellation token management for pipeline runs.

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::service::KnowledgeService;

/// Token registered for one pipeline run
#[derive(Clone)]
pub(crate) struct RunToken {
    pub task_id: String,
    pub token: CancellationToken,
}

impl KnowledgeService {
    /// Register a cancellation token for the run of `task_id` on a document.
    pub(crate) fn register_processing_token(&self, document_id: &str, task_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.processing_cancellation_tokens.insert(
            document_id.to_string(),
            RunToken {
                task_id: task_id.to_string(),
                token: token.clone(),
            },
        );
        token
    }

    /// Cancel processing for a document if in progress.
    pub(crate) fn cancel_document_processing(&self, document_id: &str) -> bool {
        if let Some((_, run)) = self.processing_cancellation_tokens.remove(document_id) {
            run.token.cancel();
            info!(doc_id = %document_id, task_id = %run.task_id, "Document processing cancellation triggered");
            true
        } else {
            false
        }
    }

    /// Remove a run's token when it finishes. A token registered by a later
    /// run for the same document is left alone.
    pub(crate) fn unregister_processing_token(&self, document_id: &str, task_id: &str) {
        self.processing_cancellation_tokens
            .remove_if(document_id, |_, run| run.task_id == task_id);
    }
}
