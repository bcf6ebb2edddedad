//! Knowledge base management and aggregate statistics.

use chrono::Utc;
use serde::Deserialize;
use tracing::info;

use crate::db::KnowledgeBase;
use crate::error::{ServiceError, ServiceResult};
use crate::service::KnowledgeService;

/// Fields for a new knowledge base
#[derive(Debug, Clone, Deserialize)]
pub struct NewKnowledgeBase {
    pub name: String,
    /// Vector collection name; may be filled in later, but documents cannot be
    /// vectorized while it is empty
    #[serde(default)]
    pub english_name: String,
    #[serde(default)]
    pub description: String,
}

impl KnowledgeService {
    /// Create a knowledge base with zeroed aggregates
    pub fn create_knowledge_base(&self, new: NewKnowledgeBase) -> ServiceResult<KnowledgeBase> {
        let name = new.name.trim();
        if name.is_empty() {
            return Err(ServiceError::InvalidInput {
                message: "name is required".to_string(),
            });
        }

        let now = Utc::now();
        let kb = KnowledgeBase {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            english_name: new.english_name.trim().to_string(),
            description: new.description,
            document_count: 0,
            total_size: 0,
            created_at: now,
            updated_at: now,
        };
        self.db.insert_knowledge_base(&kb)?;

        info!(kb_id = %kb.id, name = %kb.name, collection = %kb.english_name, "Knowledge base created");
        Ok(kb)
    }

    pub fn get_knowledge_base(&self, kb_id: &str) -> ServiceResult<KnowledgeBase> {
        self.db
            .get_knowledge_base(kb_id)?
            .ok_or_else(|| ServiceError::KnowledgeBaseNotFound {
                knowledge_base_id: kb_id.to_string(),
            })
    }

    /// Recompute `document_count` and `total_size` from live documents
    pub fn reconcile_knowledge_base_stats(&self, kb_id: &str) -> ServiceResult<KnowledgeBase> {
        let before = self.get_knowledge_base(kb_id)?;
        let after = self
            .db
            .reconcile_knowledge_base_stats(kb_id)?
            .ok_or_else(|| ServiceError::KnowledgeBaseNotFound {
                knowledge_base_id: kb_id.to_string(),
            })?;

        if before.document_count != after.document_count || before.total_size != after.total_size {
            info!(
                kb_id = %kb_id,
                document_count_before = before.document_count,
                document_count = after.document_count,
                total_size_before = before.total_size,
                total_size = after.total_size,
                "Knowledge base statistics reconciled"
            );
        }

        Ok(after)
    }
}
