//! Append-only assignment history.
//!
//! Rows are written only from inside state-machine and checkpoint
//! transactions; there is no update or delete path.

use super::Database;
use crate::error::TaskResult;
use crate::types::{AssignmentRecord, LifecycleAction, TaskStatus};
use rusqlite::{Connection, Row, params};

/// One history row, written in the same transaction as the task mutation it
/// describes.
pub(crate) struct HistoryRow<'a> {
    pub task_id: i64,
    pub action: LifecycleAction,
    pub performed_by: Option<&'a str>,
    pub previous_assignee: Option<&'a str>,
    pub new_assignee: Option<&'a str>,
    pub previous_status: Option<TaskStatus>,
    pub new_status: Option<TaskStatus>,
    pub notes: Option<&'a str>,
    pub metadata: Option<serde_json::Value>,
}

impl<'a> HistoryRow<'a> {
    pub(crate) fn new(task_id: i64, action: LifecycleAction) -> Self {
        Self {
            task_id,
            action,
            performed_by: None,
            previous_assignee: None,
            new_assignee: None,
            previous_status: None,
            new_status: None,
            notes: None,
            metadata: None,
        }
    }
}

/// Append an assignment history entry.
pub(crate) fn record(conn: &Connection, entry: &HistoryRow, now: i64) -> TaskResult<()> {
    let metadata = entry
        .metadata
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    conn.execute(
        "INSERT INTO task_assignment_history
             (task_id, action, performed_by, previous_assignee, new_assignee,
              previous_status, new_status, notes, metadata, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            entry.task_id,
            entry.action.as_str(),
            entry.performed_by,
            entry.previous_assignee,
            entry.new_assignee,
            entry.previous_status.map(|s| s.as_str()),
            entry.new_status.map(|s| s.as_str()),
            entry.notes,
            metadata,
            now,
        ],
    )?;

    Ok(())
}

fn parse_history_row(row: &Row) -> rusqlite::Result<AssignmentRecord> {
    let action_raw: String = row.get("action")?;
    let action = LifecycleAction::parse(&action_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("unknown history action: {action_raw}").into(),
        )
    })?;

    let previous_status: Option<String> = row.get("previous_status")?;
    let new_status: Option<String> = row.get("new_status")?;

    let metadata_json: Option<String> = row.get("metadata")?;
    let metadata = metadata_json
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(AssignmentRecord {
        id: row.get("id")?,
        task_id: row.get("task_id")?,
        action,
        performed_by: row.get("performed_by")?,
        previous_assignee: row.get("previous_assignee")?,
        new_assignee: row.get("new_assignee")?,
        previous_status: previous_status.as_deref().and_then(TaskStatus::parse),
        new_status: new_status.as_deref().and_then(TaskStatus::parse),
        notes: row.get("notes")?,
        metadata,
        timestamp: row.get("timestamp")?,
    })
}

impl Database {
    /// Get the assignment history for a task, most recent first, optionally
    /// filtered by action and/or actor.
    pub fn task_history(
        &self,
        public_id: &str,
        action: Option<LifecycleAction>,
        actor: Option<&str>,
    ) -> TaskResult<Vec<AssignmentRecord>> {
        let task = self
            .get_task(public_id)?
            .ok_or_else(|| crate::error::TaskError::TaskNotFound(public_id.to_string()))?;

        self.with_conn(|conn| {
            let mut sql = String::from(
                "SELECT id, task_id, action, performed_by, previous_assignee, new_assignee,
                        previous_status, new_status, notes, metadata, timestamp
                 FROM task_assignment_history
                 WHERE task_id = ?1",
            );
            let mut param_values: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(task.id)];

            if let Some(action) = action {
                sql.push_str(&format!(" AND action = ?{}", param_values.len() + 1));
                param_values.push(Box::new(action.as_str()));
            }

            if let Some(actor) = actor {
                sql.push_str(&format!(" AND performed_by = ?{}", param_values.len() + 1));
                param_values.push(Box::new(actor.to_string()));
            }

            sql.push_str(" ORDER BY timestamp DESC, id DESC");

            let mut stmt = conn.prepare(&sql)?;
            let param_refs: Vec<&dyn rusqlite::ToSql> =
                param_values.iter().map(|b| b.as_ref()).collect();

            let records = stmt
                .query_map(param_refs.as_slice(), parse_history_row)?
                .collect::<Result<Vec<_>, _>>()?;

            Ok(records)
        })
    }
}
