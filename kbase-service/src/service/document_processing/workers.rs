//! Worker pool for pipeline runs and startup recovery of the task ledger.

use std::sync::Arc;

use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::db::{DocumentTask, TaskStatus};
use crate::error::{ServiceResult, format_error_chain_ref};
use crate::queue::{QueuedMessage, TaskMessage};
use crate::service::KnowledgeService;

/// What [`KnowledgeService::recover_tasks`] did
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Pending tasks sent to the queue again
    pub redispatched: usize,
    /// Tasks closed as failed, with their documents
    pub failed: usize,
}

const INTERRUPTED_MESSAGE: &str = "Processing interrupted by a service restart";

impl KnowledgeService {
    /// Send a ledger task to the task queue, keyed by document ID
    pub(crate) async fn dispatch_task(&self, task: &DocumentTask, object_key: &str) -> ServiceResult<()> {
        let payload = TaskMessage::for_task(task, object_key).encode()?;
        self.producer
            .send(&self.config.queue.topic, &task.document_id, payload)
            .await?;

        debug!(
            task_id = %task.id,
            doc_id = %task.document_id,
            task_type = %task.task_type,
            "Task dispatched"
        );
        Ok(())
    }

    /// Start the worker pool
    ///
    /// Messages are consumed from the in-process queue and run with at most
    /// `orchestration.max_concurrent_runs` pipelines in flight. This should be
    /// called once on server startup. After [`KnowledgeService::begin_shutdown`]
    /// the pool stops consuming and the returned handle resolves once every
    /// in-flight run has handed its task back to the ledger.
    pub fn start_task_workers(
        service: Arc<KnowledgeService>,
        mut receiver: mpsc::UnboundedReceiver<QueuedMessage>,
    ) -> JoinHandle<()> {
        let max_runs = service.config.orchestration.max_concurrent_runs.max(1);
        let semaphore = Arc::new(Semaphore::new(max_runs));
        let shutdown = service.shutdown.clone();
        let runs = TaskTracker::new();

        tokio::spawn(async move {
            info!(max_concurrent_runs = max_runs, "Task workers started");

            loop {
                let queued = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    queued = receiver.recv() => match queued {
                        Some(queued) => queued,
                        None => break,
                    },
                };

                if queued.topic != service.config.queue.topic {
                    warn!(topic = %queued.topic, key = %queued.key, "Ignoring message for unknown topic");
                    continue;
                }

                let message = match TaskMessage::decode(&queued.payload) {
                    Ok(message) => message,
                    Err(e) => {
                        error!(key = %queued.key, error = %format_error_chain_ref(&e), "Dropping undecodable task message");
                        continue;
                    }
                };

                let permit = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    permit = semaphore.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };

                let service = service.clone();
                runs.spawn(async move {
                    service.process_task(&message).await;
                    drop(permit);
                });
            }

            runs.close();
            if !runs.is_empty() {
                info!(in_flight = runs.len(), "Waiting for in-flight runs to stop");
            }
            runs.wait().await;

            info!("Task workers stopped");
        })
    }

    /// Bring the task ledger back in line after a restart.
    ///
    /// A graceful shutdown hands in-flight tasks back as `pending`, and those
    /// are sent to the queue again. Tasks still `running` were cut off by a
    /// crash and cannot be resumed mid-pipeline; they and their documents are
    /// marked failed.
    pub async fn recover_tasks(&self) -> ServiceResult<RecoveryReport> {
        let mut report = RecoveryReport::default();

        for task in self.db.list_tasks_by_status(TaskStatus::Running)? {
            warn!(task_id = %task.id, doc_id = %task.document_id, "Failing task orphaned by restart");
            self.fail_task_and_document(&task, INTERRUPTED_MESSAGE)?;
            report.failed += 1;
        }

        for task in self.db.list_tasks_by_status(TaskStatus::Pending)? {
            let workflow = task.task_type.workflow();

            let document = match self.db.get_document(&task.document_id)? {
                Some(doc) if doc.parsing_status == workflow.running_status() => doc,
                _ => {
                    debug!(task_id = %task.id, "Closing pending task for a document that moved on");
                    self.db.finish_task(
                        &task.id,
                        TaskStatus::Failed,
                        Some("Document no longer awaiting this task"),
                    )?;
                    report.failed += 1;
                    continue;
                }
            };

            if self.processing.is_none() {
                self.fail_task_and_document(
                    &task,
                    "Processing service unavailable; document stored but not processed",
                )?;
                report.failed += 1;
                continue;
            }

            match self.dispatch_task(&task, &document.object_key).await {
                Ok(()) => report.redispatched += 1,
                Err(e) => {
                    let message =
                        format!("Failed to dispatch processing task: {}", format_error_chain_ref(&e));
                    self.fail_task_and_document(&task, &message)?;
                    report.failed += 1;
                }
            }
        }

        if report != RecoveryReport::default() {
            info!(
                redispatched = report.redispatched,
                failed = report.failed,
                "Task ledger recovered"
            );
        }

        Ok(report)
    }

    fn fail_task_and_document(&self, task: &DocumentTask, message: &str) -> ServiceResult<()> {
        self.db
            .finish_task(&task.id, TaskStatus::Failed, Some(message))?;
        self.db
            .mark_document_failed(&task.document_id, task.task_type.workflow(), message)?;
        Ok(())
    }
}
