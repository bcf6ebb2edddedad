//! Task queue producer and the in-process transport behind it.
//!
//! Producers are fire-and-forget: a successful `send` only means the message
//! was handed to the transport. Delivery is at-least-once from the consumer's
//! point of view, because the ledger lets a restarted process re-send pending
//! tasks.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::db::{DocumentTask, TaskType};
use crate::error::QueueError;

/// Wire format of a task message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub task_id: String,
    pub document_id: String,
    pub knowledge_base_id: String,
    pub object_key: String,
    pub task_type: TaskType,
}

impl TaskMessage {
    pub fn for_task(task: &DocumentTask, object_key: &str) -> Self {
        Self {
            task_id: task.id.clone(),
            document_id: task.document_id.clone(),
            knowledge_base_id: task.knowledge_base_id.clone(),
            object_key: object_key.to_string(),
            task_type: task.task_type,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, QueueError> {
        serde_json::to_vec(self).map_err(QueueError::Payload)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, QueueError> {
        serde_json::from_slice(payload).map_err(QueueError::Payload)
    }
}

/// Task queue producer
#[async_trait]
pub trait TaskProducer: Send + Sync {
    async fn send(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<(), QueueError>;
}

/// A message as seen by the consumer side of the in-process queue
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub topic: String,
    pub key: String,
    pub payload: Vec<u8>,
}

/// Producer backed by an in-process channel consumed by the worker pool
pub struct ChannelTaskProducer {
    sender: mpsc::UnboundedSender<QueuedMessage>,
}

/// Create a connected producer/receiver pair
pub fn channel() -> (ChannelTaskProducer, mpsc::UnboundedReceiver<QueuedMessage>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (ChannelTaskProducer { sender }, receiver)
}

#[async_trait]
impl TaskProducer for ChannelTaskProducer {
    async fn send(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<(), QueueError> {
        self.sender
            .send(QueuedMessage {
                topic: topic.to_string(),
                key: key.to_string(),
                payload,
            })
            .map_err(|_| QueueError::Closed {
                topic: topic.to_string(),
            })
    }
}
