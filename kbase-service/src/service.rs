mod document_processing;
mod knowledge_bases;
#[cfg(test)]
pub(crate) mod testing;

pub use document_processing::{Download, RecoveryReport, UploadRequest};
pub use knowledge_bases::NewKnowledgeBase;

use document_processing::RunToken;

use dashmap::DashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::db::Database;
use crate::processing_client::ProcessingClient;
use crate::queue::TaskProducer;
use crate::storage::BlobStore;

/// Main service coordinator
pub struct KnowledgeService {
    pub config: Arc<AppConfig>,
    pub db: Arc<Database>,
    pub blobs: Arc<dyn BlobStore>,
    pub producer: Arc<dyn TaskProducer>,
    /// `None` when no processing service is configured
    pub processing: Option<Arc<dyn ProcessingClient>>,
    /// Cancellation tokens for in-flight pipeline runs, keyed by document ID
    processing_cancellation_tokens: DashMap<String, RunToken>,
    /// Cancelled once when the process begins shutting down
    shutdown: CancellationToken,
}

impl KnowledgeService {
    pub fn new(
        config: Arc<AppConfig>,
        db: Arc<Database>,
        blobs: Arc<dyn BlobStore>,
        producer: Arc<dyn TaskProducer>,
        processing: Option<Arc<dyn ProcessingClient>>,
    ) -> Self {
        info!("Initializing knowledge base service");

        if processing.is_none() {
            warn!("No processing service configured; new uploads will be marked failed");
        }

        Self {
            config,
            db,
            blobs,
            producer,
            processing,
            processing_cancellation_tokens: DashMap::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Stop taking new tasks and hand in-flight runs back to the ledger
    pub fn begin_shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!("Shutting down task processing");
            self.shutdown.cancel();
        }
    }
}
