//! Task ledger operations.
//!
//! Every unit of background work is written here before it is dispatched, so
//! work that was queued or running when the process stopped can be found again.

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};

use super::Database;
use super::models::{DocumentTask, TaskStatus};
use crate::error::{DatabaseError, ServiceResult};

impl Database {
    /// Get a task by ID
    pub fn get_task(&self, id: &str) -> ServiceResult<Option<DocumentTask>> {
        let conn = self.lock()?;

        conn.query_row(
            &format!("SELECT {} FROM document_tasks WHERE id = ?1", DocumentTask::COLUMNS),
            params![id],
            DocumentTask::from_row,
        )
        .optional()
        .map_err(DatabaseError::Query)
        .map_err(Into::into)
    }

    /// All tasks in the given status, oldest first
    pub fn list_tasks_by_status(&self, status: TaskStatus) -> ServiceResult<Vec<DocumentTask>> {
        let conn = self.lock()?;

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM document_tasks WHERE status = ?1 ORDER BY created_at ASC",
                DocumentTask::COLUMNS
            ))
            .map_err(DatabaseError::Query)?;

        let rows = stmt
            .query_map(params![status.as_ref()], DocumentTask::from_row)
            .map_err(DatabaseError::Query)?;

        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row.map_err(DatabaseError::Query)?);
        }

        Ok(tasks)
    }

    /// Claim a pending task, returning it as `running`. Returns `None` if it is
    /// no longer pending.
    pub fn claim_task(&self, task_id: &str) -> ServiceResult<Option<DocumentTask>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(DatabaseError::Query)?;

        let rows = tx
            .execute(
                "UPDATE document_tasks SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
                params![
                    TaskStatus::Running.as_ref(),
                    Utc::now().to_rfc3339(),
                    task_id,
                    TaskStatus::Pending.as_ref(),
                ],
            )
            .map_err(DatabaseError::Query)?;

        if rows == 0 {
            return Ok(None);
        }

        let task = tx
            .query_row(
                &format!("SELECT {} FROM document_tasks WHERE id = ?1", DocumentTask::COLUMNS),
                params![task_id],
                DocumentTask::from_row,
            )
            .map_err(DatabaseError::Query)?;
        tx.commit().map_err(DatabaseError::Query)?;

        Ok(Some(task))
    }

    /// Count one more attempt on a running task and keep the failure that
    /// caused it
    pub fn record_task_retry(&self, task_id: &str, error_message: &str) -> ServiceResult<bool> {
        let conn = self.lock()?;

        let rows = conn
            .execute(
                "UPDATE document_tasks SET retry_count = retry_count + 1, error_message = ?1, updated_at = ?2 \
                 WHERE id = ?3 AND status = ?4",
                params![
                    error_message,
                    Utc::now().to_rfc3339(),
                    task_id,
                    TaskStatus::Running.as_ref(),
                ],
            )
            .map_err(DatabaseError::Query)?;

        Ok(rows > 0)
    }

    /// Hand a running task back to `pending` so the next startup re-dispatches it
    pub fn release_task(&self, task_id: &str) -> ServiceResult<bool> {
        let conn = self.lock()?;

        let rows = conn
            .execute(
                "UPDATE document_tasks SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
                params![
                    TaskStatus::Pending.as_ref(),
                    Utc::now().to_rfc3339(),
                    task_id,
                    TaskStatus::Running.as_ref(),
                ],
            )
            .map_err(DatabaseError::Query)?;

        Ok(rows > 0)
    }

    /// Record the outcome of a task that has not already been closed
    pub fn finish_task(
        &self,
        task_id: &str,
        status: TaskStatus,
        error_message: Option<&str>,
    ) -> ServiceResult<bool> {
        let conn = self.lock()?;

        let rows = conn
            .execute(
                "UPDATE document_tasks SET status = ?1, error_message = ?2, updated_at = ?3 \
                 WHERE id = ?4 AND status IN ('pending', 'running')",
                params![
                    status.as_ref(),
                    error_message,
                    Utc::now().to_rfc3339(),
                    task_id,
                ],
            )
            .map_err(DatabaseError::Query)?;

        Ok(rows > 0)
    }
}

pub(super) fn insert_task(conn: &Connection, task: &DocumentTask) -> ServiceResult<()> {
    conn.execute(
        "INSERT INTO document_tasks (id, document_id, knowledge_base_id, task_type, status, retry_count, max_retries, error_message, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            task.id,
            task.document_id,
            task.knowledge_base_id,
            task.task_type.as_ref(),
            task.status.as_ref(),
            task.retry_count,
            task.max_retries,
            task.error_message,
            task.created_at.to_rfc3339(),
            task.updated_at.to_rfc3339(),
        ],
    )
    .map_err(DatabaseError::Query)?;

    Ok(())
}
