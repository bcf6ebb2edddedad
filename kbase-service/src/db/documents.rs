//! Document CRUD operations.
//!
//! Status writes are conditional on the status the caller expects the row to
//! hold, so a run can only move a document it still owns. Soft-deleted rows
//! are invisible to every read here.

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};

use super::Database;
use super::knowledge_bases::{adjust_document_count, adjust_total_size};
use super::models::{DocumentPage, DocumentTask, KnowledgeDocument, ParsingStatus, Workflow};
use super::tasks::insert_task;
use crate::error::{DatabaseError, ServiceResult};

/// Result of inserting a freshly uploaded document
#[derive(Debug)]
pub enum InsertOutcome {
    /// The row was inserted and the knowledge base aggregates were incremented
    Inserted,
    /// A live document with the same checksum already exists in the knowledge base
    Existing(KnowledgeDocument),
}

impl Database {
    /// Insert a new document, bump the owning knowledge base's aggregates and
    /// record the initial ledger task, all in one transaction.
    ///
    /// The checksum lookup is repeated inside the transaction so two identical
    /// uploads racing each other still produce a single document.
    pub fn insert_document(
        &self,
        doc: &KnowledgeDocument,
        task: Option<&DocumentTask>,
    ) -> ServiceResult<InsertOutcome> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(DatabaseError::Query)?;

        if let Some(existing) = find_by_checksum(&tx, &doc.knowledge_base_id, &doc.checksum)? {
            return Ok(InsertOutcome::Existing(existing));
        }

        tx.execute(
            r#"
            INSERT INTO knowledge_documents (id, knowledge_base_id, title, object_key, size, mime, checksum, parsing_status, workflow, chunk_count, error_message, created_by, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            "#,
            params![
                doc.id,
                doc.knowledge_base_id,
                doc.title,
                doc.object_key,
                doc.size,
                doc.mime,
                doc.checksum,
                doc.parsing_status.as_ref(),
                doc.workflow.as_ref(),
                doc.chunk_count,
                doc.error_message,
                doc.created_by,
                doc.created_at.to_rfc3339(),
                doc.updated_at.to_rfc3339(),
            ],
        )
        .map_err(DatabaseError::Query)?;

        adjust_document_count(&tx, &doc.knowledge_base_id, 1)?;
        adjust_total_size(&tx, &doc.knowledge_base_id, doc.size)?;

        if let Some(task) = task {
            insert_task(&tx, task)?;
        }

        tx.commit().map_err(DatabaseError::Query)?;
        Ok(InsertOutcome::Inserted)
    }

    /// Get a live document by ID
    pub fn get_document(&self, id: &str) -> ServiceResult<Option<KnowledgeDocument>> {
        let conn = self.lock()?;

        conn.query_row(
            &format!(
                "SELECT {} FROM knowledge_documents WHERE id = ?1 AND deleted_at IS NULL",
                KnowledgeDocument::COLUMNS
            ),
            params![id],
            KnowledgeDocument::from_row,
        )
        .optional()
        .map_err(DatabaseError::Query)
        .map_err(Into::into)
    }

    /// Find the live document holding `checksum` within a knowledge base
    pub fn get_document_by_checksum(
        &self,
        kb_id: &str,
        checksum: &str,
    ) -> ServiceResult<Option<KnowledgeDocument>> {
        let conn = self.lock()?;
        find_by_checksum(&conn, kb_id, checksum)
    }

    /// List a knowledge base's documents, newest first, optionally filtered by status
    pub fn list_documents(
        &self,
        kb_id: &str,
        status: Option<ParsingStatus>,
        page: u32,
        page_size: u32,
    ) -> ServiceResult<DocumentPage> {
        let conn = self.lock()?;

        let status_str = status.map(|s| s.as_ref().to_string());
        let offset = i64::from(page.saturating_sub(1)) * i64::from(page_size);

        let total: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM knowledge_documents WHERE knowledge_base_id = ?1 \
                 AND deleted_at IS NULL AND (?2 IS NULL OR parsing_status = ?2)",
                params![kb_id, status_str],
                |row| row.get(0),
            )
            .map_err(DatabaseError::Query)?;

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM knowledge_documents WHERE knowledge_base_id = ?1 \
                 AND deleted_at IS NULL AND (?2 IS NULL OR parsing_status = ?2) \
                 ORDER BY created_at DESC, id LIMIT ?3 OFFSET ?4",
                KnowledgeDocument::COLUMNS
            ))
            .map_err(DatabaseError::Query)?;

        let rows = stmt
            .query_map(
                params![kb_id, status_str, i64::from(page_size), offset],
                KnowledgeDocument::from_row,
            )
            .map_err(DatabaseError::Query)?;

        let mut documents = Vec::new();
        for row in rows {
            documents.push(row.map_err(DatabaseError::Query)?);
        }

        Ok(DocumentPage {
            documents,
            total: total as u64,
            page,
            page_size,
        })
    }

    /// Finish a run successfully: `completed`, chunk count set, error cleared.
    ///
    /// Only applies while the document still holds the running status of `workflow`.
    pub fn mark_document_completed(
        &self,
        document_id: &str,
        workflow: Workflow,
        chunk_count: i64,
    ) -> ServiceResult<bool> {
        let conn = self.lock()?;

        let rows = conn
            .execute(
                "UPDATE knowledge_documents SET parsing_status = ?1, workflow = ?2, chunk_count = ?3, \
                 error_message = NULL, updated_at = ?4 \
                 WHERE id = ?5 AND parsing_status = ?6 AND deleted_at IS NULL",
                params![
                    ParsingStatus::Completed.as_ref(),
                    workflow.as_ref(),
                    chunk_count,
                    Utc::now().to_rfc3339(),
                    document_id,
                    workflow.running_status().as_ref(),
                ],
            )
            .map_err(DatabaseError::Query)?;

        Ok(rows > 0)
    }

    /// Finish a run with a failure. `chunk_count` is left untouched.
    ///
    /// Only applies while the document still holds the running status of `workflow`.
    pub fn mark_document_failed(
        &self,
        document_id: &str,
        workflow: Workflow,
        error_message: &str,
    ) -> ServiceResult<bool> {
        let conn = self.lock()?;

        let rows = conn
            .execute(
                "UPDATE knowledge_documents SET parsing_status = ?1, workflow = ?2, error_message = ?3, \
                 updated_at = ?4 \
                 WHERE id = ?5 AND parsing_status = ?6 AND deleted_at IS NULL",
                params![
                    ParsingStatus::Failed.as_ref(),
                    workflow.as_ref(),
                    error_message,
                    Utc::now().to_rfc3339(),
                    document_id,
                    workflow.running_status().as_ref(),
                ],
            )
            .map_err(DatabaseError::Query)?;

        Ok(rows > 0)
    }

    /// Move a `completed` document to `vectorizing` and record its ledger task.
    ///
    /// Returns false without writing anything if the document is not `completed`,
    /// which also serializes concurrent re-vectorization requests.
    pub fn begin_revectorize(&self, document_id: &str, task: &DocumentTask) -> ServiceResult<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(DatabaseError::Query)?;

        let rows = tx
            .execute(
                "UPDATE knowledge_documents SET parsing_status = ?1, workflow = ?2, error_message = NULL, \
                 updated_at = ?3 \
                 WHERE id = ?4 AND parsing_status = ?5 AND deleted_at IS NULL",
                params![
                    ParsingStatus::Vectorizing.as_ref(),
                    Workflow::Revectorize.as_ref(),
                    Utc::now().to_rfc3339(),
                    document_id,
                    ParsingStatus::Completed.as_ref(),
                ],
            )
            .map_err(DatabaseError::Query)?;

        if rows == 0 {
            return Ok(false);
        }

        insert_task(&tx, task)?;
        tx.commit().map_err(DatabaseError::Query)?;
        Ok(true)
    }

    /// Undo [`Database::begin_revectorize`] when the task could not be dispatched.
    pub fn abort_revectorize(&self, document_id: &str) -> ServiceResult<bool> {
        let conn = self.lock()?;

        let rows = conn
            .execute(
                "UPDATE knowledge_documents SET parsing_status = ?1, updated_at = ?2 \
                 WHERE id = ?3 AND parsing_status = ?4 AND deleted_at IS NULL",
                params![
                    ParsingStatus::Completed.as_ref(),
                    Utc::now().to_rfc3339(),
                    document_id,
                    ParsingStatus::Vectorizing.as_ref(),
                ],
            )
            .map_err(DatabaseError::Query)?;

        Ok(rows > 0)
    }

    /// Soft-delete a document and apply the inverse of its upload's aggregate
    /// adjustment in the same transaction. Open ledger tasks for it are closed.
    pub fn soft_delete_document(&self, doc: &KnowledgeDocument) -> ServiceResult<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(DatabaseError::Query)?;
        let now = Utc::now().to_rfc3339();

        let rows = tx
            .execute(
                "UPDATE knowledge_documents SET deleted_at = ?1, updated_at = ?1 \
                 WHERE id = ?2 AND deleted_at IS NULL",
                params![now, doc.id],
            )
            .map_err(DatabaseError::Query)?;

        if rows == 0 {
            return Ok(false);
        }

        adjust_document_count(&tx, &doc.knowledge_base_id, -1)?;
        adjust_total_size(&tx, &doc.knowledge_base_id, -doc.size)?;

        tx.execute(
            "UPDATE document_tasks SET status = 'failed', error_message = 'document deleted', updated_at = ?1 \
             WHERE document_id = ?2 AND status IN ('pending', 'running')",
            params![now, doc.id],
        )
        .map_err(DatabaseError::Query)?;

        tx.commit().map_err(DatabaseError::Query)?;
        Ok(true)
    }
}

fn find_by_checksum(
    conn: &Connection,
    kb_id: &str,
    checksum: &str,
) -> ServiceResult<Option<KnowledgeDocument>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM knowledge_documents WHERE knowledge_base_id = ?1 AND checksum = ?2 \
             AND deleted_at IS NULL ORDER BY created_at LIMIT 1",
            KnowledgeDocument::COLUMNS
        ),
        params![kb_id, checksum],
        KnowledgeDocument::from_row,
    )
    .optional()
    .map_err(DatabaseError::Query)
    .map_err(Into::into)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::knowledge_bases::tests::knowledge_base;
    use crate::db::models::TaskType;

    pub(crate) fn document(id: &str, kb_id: &str, checksum: &str, size: i64) -> KnowledgeDocument {
        let now = Utc::now();
        KnowledgeDocument {
            id: id.to_string(),
            knowledge_base_id: kb_id.to_string(),
            title: format!("{}.txt", id),
            object_key: format!("documents/{}/20240101000000000_{}.txt", kb_id, id),
            size,
            mime: "text/plain".to_string(),
            checksum: checksum.to_string(),
            parsing_status: ParsingStatus::Processing,
            workflow: Workflow::Ingest,
            chunk_count: 0,
            error_message: None,
            created_by: Some(7),
            created_at: now,
            updated_at: now,
        }
    }

    fn setup() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.insert_knowledge_base(&knowledge_base("kb-1", "kb1")).unwrap();
        db.insert_knowledge_base(&knowledge_base("kb-2", "kb2")).unwrap();
        db
    }

    #[test]
    fn test_insert_updates_stats_in_same_unit() {
        let db = setup();
        let doc = document("doc-1", "kb-1", "abc", 10);
        let task = DocumentTask::new(&doc, TaskType::Process, 0);

        let outcome = db.insert_document(&doc, Some(&task)).unwrap();
        assert!(matches!(outcome, InsertOutcome::Inserted));

        let kb = db.get_knowledge_base("kb-1").unwrap().unwrap();
        assert_eq!(kb.document_count, 1);
        assert_eq!(kb.total_size, 10);

        let stored = db.get_document("doc-1").unwrap().unwrap();
        assert_eq!(stored.parsing_status, ParsingStatus::Processing);
        assert_eq!(stored.created_by, Some(7));
        assert!(db.get_task(&task.id).unwrap().is_some());
    }

    #[test]
    fn test_duplicate_checksum_returns_existing() {
        let db = setup();
        db.insert_document(&document("doc-1", "kb-1", "abc", 10), None)
            .unwrap();

        let outcome = db
            .insert_document(&document("doc-2", "kb-1", "abc", 10), None)
            .unwrap();
        match outcome {
            InsertOutcome::Existing(existing) => assert_eq!(existing.id, "doc-1"),
            InsertOutcome::Inserted => panic!("duplicate was inserted"),
        }

        let kb = db.get_knowledge_base("kb-1").unwrap().unwrap();
        assert_eq!(kb.document_count, 1);
        assert_eq!(kb.total_size, 10);
        assert!(db.get_document("doc-2").unwrap().is_none());
    }

    #[test]
    fn test_same_checksum_allowed_across_knowledge_bases() {
        let db = setup();
        db.insert_document(&document("doc-1", "kb-1", "abc", 10), None)
            .unwrap();
        let outcome = db
            .insert_document(&document("doc-2", "kb-2", "abc", 10), None)
            .unwrap();
        assert!(matches!(outcome, InsertOutcome::Inserted));

        let found = db.get_document_by_checksum("kb-2", "abc").unwrap().unwrap();
        assert_eq!(found.id, "doc-2");
    }

    #[test]
    fn test_status_writes_require_expected_state() {
        let db = setup();
        db.insert_document(&document("doc-1", "kb-1", "abc", 10), None)
            .unwrap();

        // A re-vectorize run does not own a `processing` document
        assert!(!db
            .mark_document_completed("doc-1", Workflow::Revectorize, 3)
            .unwrap());

        assert!(db
            .mark_document_completed("doc-1", Workflow::Ingest, 3)
            .unwrap());
        let doc = db.get_document("doc-1").unwrap().unwrap();
        assert_eq!(doc.parsing_status, ParsingStatus::Completed);
        assert_eq!(doc.chunk_count, 3);
        assert!(doc.error_message.is_none());

        // Terminal documents are not rewritten by a stale run
        assert!(!db
            .mark_document_failed("doc-1", Workflow::Ingest, "late failure")
            .unwrap());
    }

    #[test]
    fn test_failure_keeps_chunk_count() {
        let db = setup();
        let doc = document("doc-1", "kb-1", "abc", 10);
        db.insert_document(&doc, None).unwrap();
        db.mark_document_completed("doc-1", Workflow::Ingest, 4)
            .unwrap();

        let task = DocumentTask::new(&doc, TaskType::Vectorize, 0);
        assert!(db.begin_revectorize("doc-1", &task).unwrap());
        assert!(db
            .mark_document_failed("doc-1", Workflow::Revectorize, "vectorize rejected")
            .unwrap());

        let doc = db.get_document("doc-1").unwrap().unwrap();
        assert_eq!(doc.parsing_status, ParsingStatus::Failed);
        assert_eq!(doc.workflow, Workflow::Revectorize);
        assert_eq!(doc.chunk_count, 4);
        assert_eq!(doc.error_message.as_deref(), Some("vectorize rejected"));
        assert!(doc.has_vectors());
    }

    #[test]
    fn test_begin_revectorize_requires_completed() {
        let db = setup();
        let doc = document("doc-1", "kb-1", "abc", 10);
        db.insert_document(&doc, None).unwrap();

        let task = DocumentTask::new(&doc, TaskType::Vectorize, 0);
        assert!(!db.begin_revectorize("doc-1", &task).unwrap());
        assert!(db.get_task(&task.id).unwrap().is_none());

        db.mark_document_completed("doc-1", Workflow::Ingest, 2)
            .unwrap();
        assert!(db.begin_revectorize("doc-1", &task).unwrap());
        assert!(db.abort_revectorize("doc-1").unwrap());
        assert_eq!(
            db.get_document("doc-1").unwrap().unwrap().parsing_status,
            ParsingStatus::Completed
        );
    }

    #[test]
    fn test_soft_delete_reverses_stats() {
        let db = setup();
        let doc = document("doc-1", "kb-1", "abc", 10);
        let task = DocumentTask::new(&doc, TaskType::Process, 0);
        db.insert_document(&doc, Some(&task)).unwrap();
        db.insert_document(&document("doc-2", "kb-1", "def", 5), None)
            .unwrap();

        assert!(db.soft_delete_document(&doc).unwrap());
        assert!(!db.soft_delete_document(&doc).unwrap());

        let kb = db.get_knowledge_base("kb-1").unwrap().unwrap();
        assert_eq!(kb.document_count, 1);
        assert_eq!(kb.total_size, 5);
        assert!(db.get_document("doc-1").unwrap().is_none());
        assert!(db.get_document_by_checksum("kb-1", "abc").unwrap().is_none());

        let task = db.get_task(&task.id).unwrap().unwrap();
        assert_eq!(task.status, crate::db::TaskStatus::Failed);
    }

    #[test]
    fn test_list_paginates_and_filters() {
        let db = setup();
        for i in 0..5 {
            db.insert_document(
                &document(&format!("doc-{}", i), "kb-1", &format!("sum-{}", i), 1),
                None,
            )
            .unwrap();
        }
        db.mark_document_failed("doc-0", Workflow::Ingest, "boom")
            .unwrap();

        let page = db.list_documents("kb-1", None, 1, 2).unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.documents.len(), 2);

        let last = db.list_documents("kb-1", None, 3, 2).unwrap();
        assert_eq!(last.documents.len(), 1);

        let failed = db
            .list_documents("kb-1", Some(ParsingStatus::Failed), 1, 10)
            .unwrap();
        assert_eq!(failed.total, 1);
        assert_eq!(failed.documents[0].id, "doc-0");

        let other = db.list_documents("kb-2", None, 1, 10).unwrap();
        assert_eq!(other.total, 0);
    }
}
