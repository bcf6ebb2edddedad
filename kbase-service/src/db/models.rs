//! Database model structs.
//!
//! This module contains the data structures for database records.

use chrono::{DateTime, Utc};
use rusqlite::Row;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// Parsing status for documents
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ParsingStatus {
    /// Initial ingest run in progress (fetch, parse, vectorize)
    Processing,
    /// Operator-triggered re-vectorization in progress
    Vectorizing,
    /// Vectors are stored and `chunk_count` is set
    Completed,
    /// The last run failed; `error_message` says why
    Failed,
}

impl ParsingStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ParsingStatus::Completed | ParsingStatus::Failed)
    }
}

/// Which workflow owns a document's current status.
///
/// Both workflows share the terminal states, so the discriminant is what tells
/// a `failed` initial ingest apart from a `failed` re-vectorization of a
/// document that already had vectors.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Workflow {
    #[default]
    Ingest,
    Revectorize,
}

impl Workflow {
    /// Non-terminal status held while a run of this workflow is in flight
    pub fn running_status(self) -> ParsingStatus {
        match self {
            Workflow::Ingest => ParsingStatus::Processing,
            Workflow::Revectorize => ParsingStatus::Vectorizing,
        }
    }

    pub fn task_type(self) -> TaskType {
        match self {
            Workflow::Ingest => TaskType::Process,
            Workflow::Revectorize => TaskType::Vectorize,
        }
    }
}

/// Knowledge document record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeDocument {
    pub id: String,
    pub knowledge_base_id: String,
    pub title: String,
    pub object_key: String,
    pub size: i64,
    pub mime: String,
    pub checksum: String,
    pub parsing_status: ParsingStatus,
    pub workflow: Workflow,
    pub chunk_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl KnowledgeDocument {
    pub(crate) const COLUMNS: &'static str = "id, knowledge_base_id, title, object_key, size, mime, checksum, \
         parsing_status, workflow, chunk_count, error_message, created_by, created_at, updated_at";

    pub(crate) fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        let status_str: String = row.get(7)?;
        let workflow_str: String = row.get(8)?;
        let created_at_str: String = row.get(12)?;
        let updated_at_str: String = row.get(13)?;

        Ok(Self {
            id: row.get(0)?,
            knowledge_base_id: row.get(1)?,
            title: row.get(2)?,
            object_key: row.get(3)?,
            size: row.get(4)?,
            mime: row.get(5)?,
            checksum: row.get(6)?,
            parsing_status: status_str
                .parse()
                .map_err(|e| conversion_error(7, e))?,
            workflow: workflow_str.parse().unwrap_or_default(),
            chunk_count: row.get(9)?,
            error_message: row.get(10)?,
            created_by: row.get(11)?,
            created_at: parse_timestamp(&created_at_str),
            updated_at: parse_timestamp(&updated_at_str),
        })
    }

    /// True if vectors for this document may exist in the external store.
    pub fn has_vectors(&self) -> bool {
        self.parsing_status == ParsingStatus::Completed || self.workflow == Workflow::Revectorize
    }
}

/// Knowledge base record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeBase {
    pub id: String,
    pub name: String,
    /// External vector collection name
    pub english_name: String,
    pub description: String,
    pub document_count: i64,
    pub total_size: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl KnowledgeBase {
    pub(crate) const COLUMNS: &'static str =
        "id, name, english_name, description, document_count, total_size, created_at, updated_at";

    pub(crate) fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        let created_at_str: String = row.get(6)?;
        let updated_at_str: String = row.get(7)?;

        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            english_name: row.get(2)?,
            description: row.get(3)?,
            document_count: row.get(4)?,
            total_size: row.get(5)?,
            created_at: parse_timestamp(&created_at_str),
            updated_at: parse_timestamp(&updated_at_str),
        })
    }

    /// Collection name, if one has been assigned
    pub fn collection_name(&self) -> Option<&str> {
        let name = self.english_name.trim();
        (!name.is_empty()).then_some(name)
    }
}

/// Kind of work recorded in the task ledger
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskType {
    /// Initial fetch, parse, vectorize run
    Process,
    /// Re-vectorization of a completed document
    Vectorize,
}

impl TaskType {
    pub fn workflow(self) -> Workflow {
        match self {
            TaskType::Process => Workflow::Ingest,
            TaskType::Vectorize => Workflow::Revectorize,
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Durable record of one unit of background work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentTask {
    pub id: String,
    pub document_id: String,
    pub knowledge_base_id: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DocumentTask {
    pub(crate) const COLUMNS: &'static str = "id, document_id, knowledge_base_id, task_type, status, \
         retry_count, max_retries, error_message, created_at, updated_at";

    pub fn new(document: &KnowledgeDocument, task_type: TaskType, max_retries: u32) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            document_id: document.id.clone(),
            knowledge_base_id: document.knowledge_base_id.clone(),
            task_type,
            status: TaskStatus::Pending,
            retry_count: 0,
            max_retries,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub(crate) fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        let task_type_str: String = row.get(3)?;
        let status_str: String = row.get(4)?;
        let created_at_str: String = row.get(8)?;
        let updated_at_str: String = row.get(9)?;

        Ok(Self {
            id: row.get(0)?,
            document_id: row.get(1)?,
            knowledge_base_id: row.get(2)?,
            task_type: task_type_str
                .parse()
                .map_err(|e| conversion_error(3, e))?,
            status: status_str.parse().map_err(|e| conversion_error(4, e))?,
            retry_count: row.get(5)?,
            max_retries: row.get(6)?,
            error_message: row.get(7)?,
            created_at: parse_timestamp(&created_at_str),
            updated_at: parse_timestamp(&updated_at_str),
        })
    }
}

/// One page of a knowledge base's documents
#[derive(Debug, Clone, Serialize)]
pub struct DocumentPage {
    pub documents: Vec<KnowledgeDocument>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}

fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn conversion_error(column: usize, error: strum::ParseError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(error))
}
