//! Knowledge base records and their running aggregates.
//!
//! `document_count` and `total_size` are only ever moved by SQL increments,
//! never by writing back a value read earlier.

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};

use super::Database;
use super::models::KnowledgeBase;
use crate::error::{DatabaseError, ServiceResult};

impl Database {
    /// Insert a new knowledge base
    pub fn insert_knowledge_base(&self, kb: &KnowledgeBase) -> ServiceResult<()> {
        let conn = self.lock()?;

        conn.execute(
            "INSERT INTO knowledge_bases (id, name, english_name, description, document_count, total_size, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                kb.id,
                kb.name,
                kb.english_name,
                kb.description,
                kb.document_count,
                kb.total_size,
                kb.created_at.to_rfc3339(),
                kb.updated_at.to_rfc3339(),
            ],
        )
        .map_err(DatabaseError::Query)?;

        Ok(())
    }

    /// Get a knowledge base by ID
    pub fn get_knowledge_base(&self, id: &str) -> ServiceResult<Option<KnowledgeBase>> {
        let conn = self.lock()?;
        get_knowledge_base(&conn, id)
    }

    /// Atomically add `delta` to a knowledge base's document count
    pub fn adjust_document_count(&self, kb_id: &str, delta: i64) -> ServiceResult<bool> {
        let conn = self.lock()?;
        adjust_document_count(&conn, kb_id, delta)
    }

    /// Atomically add `delta` bytes to a knowledge base's total size
    pub fn adjust_total_size(&self, kb_id: &str, delta: i64) -> ServiceResult<bool> {
        let conn = self.lock()?;
        adjust_total_size(&conn, kb_id, delta)
    }

    /// Recompute both aggregates from the live documents of a knowledge base.
    ///
    /// Operator tool for repairing drift; not used on the upload/delete path.
    pub fn reconcile_knowledge_base_stats(&self, kb_id: &str) -> ServiceResult<Option<KnowledgeBase>> {
        let conn = self.lock()?;

        let rows = conn
            .execute(
                "UPDATE knowledge_bases SET \
                 document_count = (SELECT COUNT(*) FROM knowledge_documents WHERE knowledge_base_id = ?1 AND deleted_at IS NULL), \
                 total_size = (SELECT COALESCE(SUM(size), 0) FROM knowledge_documents WHERE knowledge_base_id = ?1 AND deleted_at IS NULL), \
                 updated_at = ?2 \
                 WHERE id = ?1",
                params![kb_id, Utc::now().to_rfc3339()],
            )
            .map_err(DatabaseError::Query)?;

        if rows == 0 {
            return Ok(None);
        }

        get_knowledge_base(&conn, kb_id)
    }
}

pub(super) fn get_knowledge_base(conn: &Connection, id: &str) -> ServiceResult<Option<KnowledgeBase>> {
    conn.query_row(
        &format!("SELECT {} FROM knowledge_bases WHERE id = ?1", KnowledgeBase::COLUMNS),
        params![id],
        KnowledgeBase::from_row,
    )
    .optional()
    .map_err(DatabaseError::Query)
    .map_err(Into::into)
}

/// Add `delta` to a knowledge base's document count in one statement. Works on
/// a plain connection or inside an open transaction.
pub(super) fn adjust_document_count(conn: &Connection, kb_id: &str, delta: i64) -> ServiceResult<bool> {
    let rows = conn
        .execute(
            "UPDATE knowledge_bases SET document_count = document_count + ?1, updated_at = ?2 WHERE id = ?3",
            params![delta, Utc::now().to_rfc3339(), kb_id],
        )
        .map_err(DatabaseError::Query)?;

    Ok(rows > 0)
}

/// Add `delta` bytes to a knowledge base's total size in one statement
pub(super) fn adjust_total_size(conn: &Connection, kb_id: &str, delta: i64) -> ServiceResult<bool> {
    let rows = conn
        .execute(
            "UPDATE knowledge_bases SET total_size = total_size + ?1, updated_at = ?2 WHERE id = ?3",
            params![delta, Utc::now().to_rfc3339(), kb_id],
        )
        .map_err(DatabaseError::Query)?;

    Ok(rows > 0)
}
