//! Database schema migrations.
//!
//! This module contains all database migrations and schema setup.

use rusqlite::Connection;

use crate::error::{DatabaseError, ServiceResult};

/// Run all database migrations.
///
/// This function is called during database initialization to ensure
/// the schema is up to date.
pub(super) fn run_migrations(conn: &Connection) -> ServiceResult<()> {
    conn.execute_batch(
        r#"
        -- Knowledge bases
        CREATE TABLE IF NOT EXISTS knowledge_bases (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            english_name TEXT NOT NULL DEFAULT '',
            description TEXT NOT NULL DEFAULT '',
            document_count INTEGER NOT NULL DEFAULT 0,
            total_size INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        -- Documents. Soft-deleted rows keep their data with deleted_at set.
        CREATE TABLE IF NOT EXISTS knowledge_documents (
            id TEXT PRIMARY KEY,
            knowledge_base_id TEXT NOT NULL,
            title TEXT NOT NULL,
            object_key TEXT NOT NULL,
            size INTEGER NOT NULL DEFAULT 0,
            mime TEXT NOT NULL DEFAULT '',
            checksum TEXT NOT NULL,
            parsing_status TEXT NOT NULL DEFAULT 'processing',
            workflow TEXT NOT NULL DEFAULT 'ingest',
            chunk_count INTEGER NOT NULL DEFAULT 0,
            error_message TEXT,
            created_by INTEGER,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            deleted_at TEXT,
            FOREIGN KEY (knowledge_base_id) REFERENCES knowledge_bases(id)
        );

        -- Checksums are only unique per knowledge base, so this is a lookup
        -- index rather than a constraint.
        CREATE INDEX IF NOT EXISTS idx_documents_kb_checksum
            ON knowledge_documents(knowledge_base_id, checksum);
        CREATE INDEX IF NOT EXISTS idx_documents_kb_status
            ON knowledge_documents(knowledge_base_id, parsing_status);

        -- Durable ledger of background work
        CREATE TABLE IF NOT EXISTS document_tasks (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            knowledge_base_id TEXT NOT NULL,
            task_type TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 0,
            error_message TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY (document_id) REFERENCES knowledge_documents(id)
        );

        CREATE INDEX IF NOT EXISTS idx_document_tasks_status ON document_tasks(status);
        CREATE INDEX IF NOT EXISTS idx_document_tasks_document ON document_tasks(document_id);
    "#,
    )
    .map_err(|e| DatabaseError::Migration {
        message: e.to_string(),
    })?;

    Ok(())
}
