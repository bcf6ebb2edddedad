//! Test doubles for the service's collaborators and a harness wiring them up.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Barrier, mpsc};

use crate::config::AppConfig;
use crate::db::{Database, KnowledgeBase, KnowledgeDocument, ParsingStatus};
use crate::error::{ExternalCallError, QueueError, StorageError};
use crate::processing_client::{
    DeleteVectorsResponse, ParseRequest, ParseResponse, ProcessingClient, VectorizeRequest,
    VectorizeResponse,
};
use crate::queue::{self, ChannelTaskProducer, QueuedMessage, TaskMessage, TaskProducer};
use crate::service::{KnowledgeService, UploadRequest};
use crate::storage::BlobStore;

/// How a fake remote call answers
#[derive(Debug, Clone)]
pub(crate) enum CallBehavior<T> {
    /// `success = true` with this value
    Reply(T),
    /// `success = false` with this error message
    Rejected(String),
    /// Transport-level failure
    Unreachable,
    /// Never answers
    Hang,
}

#[derive(Default)]
pub(crate) struct MemoryBlobStore {
    objects: Mutex<HashMap<String, Bytes>>,
    puts: AtomicUsize,
    fail_puts: AtomicBool,
    fail_deletes: AtomicBool,
    /// Successful puts wait here before returning
    put_barrier: Mutex<Option<Arc<Barrier>>>,
}

impl MemoryBlobStore {
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().unwrap().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn remove(&self, key: &str) {
        self.objects.lock().unwrap().remove(key);
    }

    pub fn fail_puts(&self) {
        self.fail_puts.store(true, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self) {
        self.fail_deletes.store(true, Ordering::SeqCst);
    }

    /// Hold each successful put until `n` puts are waiting
    pub fn hold_puts(&self, n: usize) {
        *self.put_barrier.lock().unwrap() = Some(Arc::new(Barrier::new(n)));
    }
}

fn io_failure(key: &str) -> StorageError {
    StorageError::Io {
        key: key.to_string(),
        source: std::io::Error::other("simulated I/O failure"),
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, data: Bytes, _content_type: &str) -> Result<(), StorageError> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(io_failure(key));
        }
        {
            let mut objects = self.objects.lock().unwrap();
            if objects.contains_key(key) {
                return Err(StorageError::AlreadyExists {
                    key: key.to_string(),
                });
            }
            objects.insert(key.to_string(), data);
        }
        self.puts.fetch_add(1, Ordering::SeqCst);

        let barrier = self.put_barrier.lock().unwrap().clone();
        if let Some(barrier) = barrier {
            barrier.wait().await;
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes, StorageError> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                key: key.to_string(),
            })
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(io_failure(key));
        }
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }
}

/// Records every message; optionally forwards to a real channel
#[derive(Default)]
pub(crate) struct RecordingProducer {
    sent: Mutex<Vec<QueuedMessage>>,
    forward: Option<ChannelTaskProducer>,
    fail: AtomicBool,
}

impl RecordingProducer {
    pub fn messages(&self) -> Vec<QueuedMessage> {
        self.sent.lock().unwrap().clone()
    }

    fn take(&self) -> Vec<QueuedMessage> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    pub fn fail_sends(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl TaskProducer for RecordingProducer {
    async fn send(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<(), QueueError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(QueueError::Closed {
                topic: topic.to_string(),
            });
        }

        self.sent.lock().unwrap().push(QueuedMessage {
            topic: topic.to_string(),
            key: key.to_string(),
            payload: payload.clone(),
        });

        if let Some(forward) = &self.forward {
            forward.send(topic, key, payload).await?;
        }
        Ok(())
    }
}

pub(crate) struct FakeProcessingClient {
    parse: Mutex<CallBehavior<String>>,
    vectorize: Mutex<CallBehavior<i64>>,
    delete: Mutex<CallBehavior<i64>>,
    /// Parse calls still to fail with a transport error before `parse` applies
    parse_outages: AtomicUsize,
    parse_calls: AtomicUsize,
    vectorize_requests: Mutex<Vec<VectorizeRequest>>,
    delete_requests: Mutex<Vec<(String, Vec<String>)>>,
}

impl Default for FakeProcessingClient {
    fn default() -> Self {
        Self {
            parse: Mutex::new(CallBehavior::Reply("hello".to_string())),
            vectorize: Mutex::new(CallBehavior::Reply(2)),
            delete: Mutex::new(CallBehavior::Reply(1)),
            parse_outages: AtomicUsize::new(0),
            parse_calls: AtomicUsize::new(0),
            vectorize_requests: Mutex::new(Vec::new()),
            delete_requests: Mutex::new(Vec::new()),
        }
    }
}

impl FakeProcessingClient {
    pub fn set_parse(&self, behavior: CallBehavior<String>) {
        *self.parse.lock().unwrap() = behavior;
    }

    pub fn set_vectorize(&self, behavior: CallBehavior<i64>) {
        *self.vectorize.lock().unwrap() = behavior;
    }

    pub fn set_delete(&self, behavior: CallBehavior<i64>) {
        *self.delete.lock().unwrap() = behavior;
    }

    /// Fail the next `n` parse calls as unreachable
    pub fn fail_next_parses(&self, n: usize) {
        self.parse_outages.store(n, Ordering::SeqCst);
    }

    pub fn parse_calls(&self) -> usize {
        self.parse_calls.load(Ordering::SeqCst)
    }

    pub fn vectorize_calls(&self) -> usize {
        self.vectorize_requests.lock().unwrap().len()
    }

    pub fn vectorize_requests(&self) -> Vec<VectorizeRequest> {
        self.vectorize_requests.lock().unwrap().clone()
    }

    pub fn delete_requests(&self) -> Vec<(String, Vec<String>)> {
        self.delete_requests.lock().unwrap().clone()
    }
}

fn transport_failure(operation: &'static str) -> ExternalCallError {
    ExternalCallError::Status {
        operation,
        status: 503,
        message: "service unavailable".to_string(),
    }
}

#[async_trait]
impl ProcessingClient for FakeProcessingClient {
    async fn parse(&self, _request: ParseRequest) -> Result<ParseResponse, ExternalCallError> {
        self.parse_calls.fetch_add(1, Ordering::SeqCst);
        let outage = self
            .parse_outages
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if outage {
            return Err(transport_failure("parse"));
        }
        let behavior = self.parse.lock().unwrap().clone();
        match behavior {
            CallBehavior::Reply(content) => Ok(ParseResponse {
                success: true,
                content,
                error_message: String::new(),
            }),
            CallBehavior::Rejected(error_message) => Ok(ParseResponse {
                success: false,
                content: String::new(),
                error_message,
            }),
            CallBehavior::Unreachable => Err(transport_failure("parse")),
            CallBehavior::Hang => std::future::pending().await,
        }
    }

    async fn vectorize(
        &self,
        request: VectorizeRequest,
    ) -> Result<VectorizeResponse, ExternalCallError> {
        self.vectorize_requests.lock().unwrap().push(request);
        let behavior = self.vectorize.lock().unwrap().clone();
        match behavior {
            CallBehavior::Reply(chunk_count) => Ok(VectorizeResponse {
                success: true,
                chunk_count,
                error_message: String::new(),
            }),
            CallBehavior::Rejected(error_message) => Ok(VectorizeResponse {
                success: false,
                chunk_count: 0,
                error_message,
            }),
            CallBehavior::Unreachable => Err(transport_failure("vectorize")),
            CallBehavior::Hang => std::future::pending().await,
        }
    }

    async fn delete_vectors(
        &self,
        collection_name: &str,
        document_ids: &[String],
    ) -> Result<DeleteVectorsResponse, ExternalCallError> {
        self.delete_requests
            .lock()
            .unwrap()
            .push((collection_name.to_string(), document_ids.to_vec()));
        let behavior = self.delete.lock().unwrap().clone();
        match behavior {
            CallBehavior::Reply(deleted_count) => Ok(DeleteVectorsResponse {
                success: true,
                deleted_count,
                error_message: String::new(),
            }),
            CallBehavior::Rejected(error_message) => Ok(DeleteVectorsResponse {
                success: false,
                deleted_count: 0,
                error_message,
            }),
            CallBehavior::Unreachable => Err(transport_failure("delete_vectors")),
            CallBehavior::Hang => std::future::pending().await,
        }
    }
}

/// A service over in-memory collaborators with knowledge base `kb-1`
pub(crate) struct TestHarness {
    pub service: Arc<KnowledgeService>,
    pub blobs: Arc<MemoryBlobStore>,
    pub producer: Arc<RecordingProducer>,
    pub processing: Arc<FakeProcessingClient>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::build(AppConfig::default(), "kb1", true, None)
    }

    pub fn with_config(config: AppConfig) -> Self {
        Self::build(config, "kb1", true, None)
    }

    pub fn with_collection(english_name: &str) -> Self {
        Self::build(AppConfig::default(), english_name, true, None)
    }

    pub fn without_processing() -> Self {
        Self::build(AppConfig::default(), "kb1", false, None)
    }

    /// Messages are also forwarded to the returned receiver
    pub fn with_channel() -> (Self, mpsc::UnboundedReceiver<QueuedMessage>) {
        let (producer, receiver) = queue::channel();
        let harness = Self::build(AppConfig::default(), "kb1", true, Some(producer));
        (harness, receiver)
    }

    fn build(
        config: AppConfig,
        english_name: &str,
        with_processing: bool,
        forward: Option<ChannelTaskProducer>,
    ) -> Self {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let now = Utc::now();
        db.insert_knowledge_base(&KnowledgeBase {
            id: "kb-1".to_string(),
            name: "Test knowledge base".to_string(),
            english_name: english_name.to_string(),
            description: String::new(),
            document_count: 0,
            total_size: 0,
            created_at: now,
            updated_at: now,
        })
        .unwrap();

        let blobs = Arc::new(MemoryBlobStore::default());
        let producer = Arc::new(RecordingProducer {
            forward,
            ..Default::default()
        });
        let processing = Arc::new(FakeProcessingClient::default());
        let client = with_processing.then(|| processing.clone() as Arc<dyn ProcessingClient>);

        let service = Arc::new(KnowledgeService::new(
            Arc::new(config),
            db,
            blobs.clone(),
            producer.clone(),
            client,
        ));

        Self {
            service,
            blobs,
            producer,
            processing,
        }
    }

    pub fn request(&self, filename: &str, content: &[u8]) -> UploadRequest {
        UploadRequest {
            knowledge_base_id: "kb-1".to_string(),
            filename: filename.to_string(),
            declared_size: content.len() as u64,
            content_type: Some("text/plain".to_string()),
            created_by: Some(1),
            payload: Bytes::copy_from_slice(content),
        }
    }

    pub fn knowledge_base(&self) -> KnowledgeBase {
        self.service.db.get_knowledge_base("kb-1").unwrap().unwrap()
    }

    /// Remove and decode every message sent so far
    pub fn take_messages(&self) -> Vec<TaskMessage> {
        self.producer
            .take()
            .iter()
            .map(|m| TaskMessage::decode(&m.payload).unwrap())
            .collect()
    }

    /// Run queued tasks inline until the queue is empty; returns how many ran
    pub async fn drain_queue(&self) -> usize {
        let mut handled = 0;
        loop {
            let messages = self.take_messages();
            if messages.is_empty() {
                return handled;
            }
            for message in messages {
                self.service.process_task(&message).await;
                handled += 1;
            }
        }
    }

    pub async fn uploaded_and_processed(&self, filename: &str, content: &[u8]) -> KnowledgeDocument {
        let doc = self
            .service
            .upload_document(self.request(filename, content))
            .await
            .unwrap();
        self.drain_queue().await;
        self.service.db.get_document(&doc.id).unwrap().unwrap()
    }

    pub async fn completed_document(&self, filename: &str, content: &[u8]) -> KnowledgeDocument {
        let doc = self.uploaded_and_processed(filename, content).await;
        assert_eq!(doc.parsing_status, ParsingStatus::Completed);
        doc
    }
}

/// Poll until a document reaches `status`
pub(crate) async fn wait_for_status(
    service: &KnowledgeService,
    document_id: &str,
    status: ParsingStatus,
) -> KnowledgeDocument {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(doc) = service.db.get_document(document_id).unwrap() {
                if doc.parsing_status == status {
                    return doc;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap()
}
