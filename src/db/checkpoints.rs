//! Checkpoint tracking and progress aggregation.
//!
//! Completing a checkpoint recomputes the owning task's derived counters
//! (`checkpoints_completed`, `checkpoints_total`, `completion_percentage`)
//! in the same transaction. It never changes the task's lifecycle state:
//! reaching 100% of checkpoints still requires an explicit `complete_task`.

use super::history::{self, HistoryRow};
use super::outbox;
use super::tasks::get_task_tx;
use super::{Database, now_ms};
use crate::error::{TaskError, TaskResult};
use crate::events::EventType;
use crate::types::{Checkpoint, LifecycleAction, NewCheckpoint, TaskStatus};
use rusqlite::{Connection, Row, params};
use serde_json::json;

fn parse_checkpoint_row(row: &Row) -> rusqlite::Result<Checkpoint> {
    Ok(Checkpoint {
        id: row.get("id")?,
        task_id: row.get("task_id")?,
        checkpoint_order: row.get("checkpoint_order")?,
        name: row.get("name")?,
        description: row.get("description")?,
        is_completed: row.get::<_, i64>("is_completed")? != 0,
        completed_at: row.get("completed_at")?,
        completed_by: row.get("completed_by")?,
        requires_evidence: row.get::<_, i64>("requires_evidence")? != 0,
        evidence_ref: row.get("evidence_ref")?,
        notes: row.get("notes")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn get_checkpoint_tx(conn: &Connection, checkpoint_id: i64) -> TaskResult<Option<Checkpoint>> {
    let mut stmt = conn.prepare("SELECT * FROM task_checkpoints WHERE id = ?1")?;

    match stmt.query_row(params![checkpoint_id], parse_checkpoint_row) {
        Ok(cp) => Ok(Some(cp)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Recompute the task's checkpoint counters and completion percentage from
/// the checkpoint rows. A force-completed task keeps its 100%.
fn refresh_progress(
    conn: &Connection,
    task_id: i64,
    status: TaskStatus,
    now: i64,
) -> TaskResult<(i32, i32, i32)> {
    let (total, completed): (i32, i32) = conn.query_row(
        "SELECT COUNT(*), COUNT(*) FILTER (WHERE is_completed = 1)
         FROM task_checkpoints WHERE task_id = ?1",
        params![task_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    let percentage = if status == TaskStatus::Completed {
        100
    } else if total > 0 {
        (completed * 100) / total
    } else {
        0
    };

    conn.execute(
        "UPDATE tasks
         SET checkpoints_total = ?1, checkpoints_completed = ?2,
             completion_percentage = ?3, updated_at = ?4
         WHERE id = ?5",
        params![total, completed, percentage, now, task_id],
    )?;

    Ok((total, completed, percentage))
}

impl Database {
    /// Add a checkpoint to a task, updating the task's derived totals in the
    /// same transaction. The order must be unique within the task.
    pub fn add_checkpoint(&self, public_id: &str, input: &NewCheckpoint) -> TaskResult<Checkpoint> {
        self.transaction(|tx| {
            let task = get_task_tx(tx, public_id)?
                .ok_or_else(|| TaskError::TaskNotFound(public_id.to_string()))?;

            let now = now_ms();

            tx.execute(
                "INSERT INTO task_checkpoints
                     (task_id, checkpoint_order, name, description, requires_evidence,
                      created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    task.id,
                    input.checkpoint_order,
                    input.name,
                    input.description,
                    input.requires_evidence as i64,
                    now,
                    now,
                ],
            )?;
            let checkpoint_id = tx.last_insert_rowid();

            refresh_progress(tx, task.id, task.status, now)?;

            get_checkpoint_tx(tx, checkpoint_id)?
                .ok_or(TaskError::CheckpointNotFound(checkpoint_id))
        })
    }

    /// Get a checkpoint by id.
    pub fn get_checkpoint(&self, checkpoint_id: i64) -> TaskResult<Option<Checkpoint>> {
        self.with_conn(|conn| get_checkpoint_tx(conn, checkpoint_id))
    }

    /// List a task's checkpoints in sequence order.
    pub fn list_checkpoints(&self, public_id: &str) -> TaskResult<Vec<Checkpoint>> {
        let task = self
            .get_task(public_id)?
            .ok_or_else(|| TaskError::TaskNotFound(public_id.to_string()))?;

        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM task_checkpoints WHERE task_id = ?1 ORDER BY checkpoint_order ASC",
            )?;

            let checkpoints = stmt
                .query_map(params![task.id], parse_checkpoint_row)?
                .collect::<Result<Vec<_>, _>>()?;

            Ok(checkpoints)
        })
    }

    /// Mark a checkpoint completed.
    ///
    /// Fails with `AlreadyCompleted` if the checkpoint is already done;
    /// completion is one-way. Otherwise atomically records completer and
    /// timestamp, stores evidence/notes, recomputes the task's progress,
    /// appends a `checkpoint_completed` history entry, and queues a
    /// `task.checkpoint_completed` event.
    pub fn complete_checkpoint(
        &self,
        checkpoint_id: i64,
        actor: &str,
        evidence_ref: Option<&str>,
        notes: Option<&str>,
    ) -> TaskResult<Checkpoint> {
        self.transaction(|tx| {
            let checkpoint = get_checkpoint_tx(tx, checkpoint_id)?
                .ok_or(TaskError::CheckpointNotFound(checkpoint_id))?;

            if checkpoint.is_completed {
                return Err(TaskError::AlreadyCompleted(checkpoint_id));
            }

            let now = now_ms();

            tx.execute(
                "UPDATE task_checkpoints
                 SET is_completed = 1, completed_at = ?1, completed_by = ?2,
                     evidence_ref = COALESCE(?3, evidence_ref),
                     notes = COALESCE(?4, notes),
                     updated_at = ?5
                 WHERE id = ?6",
                params![now, actor, evidence_ref, notes, now, checkpoint_id],
            )?;

            let task: crate::types::Task = {
                let mut stmt = tx.prepare("SELECT * FROM tasks WHERE id = ?1")?;
                stmt.query_row(params![checkpoint.task_id], super::tasks::parse_task_row)?
            };

            let (total, completed, percentage) =
                refresh_progress(tx, task.id, task.status, now)?;

            let mut entry = HistoryRow::new(task.id, LifecycleAction::CheckpointCompleted);
            entry.performed_by = Some(actor);
            entry.notes = notes;
            entry.metadata = Some(json!({
                "checkpoint_order": checkpoint.checkpoint_order,
                "checkpoints_completed": completed,
                "checkpoints_total": total,
                "completion_percentage": percentage,
            }));
            history::record(tx, &entry, now)?;

            outbox::enqueue_event(
                tx,
                &task.public_id,
                EventType::CheckpointCompleted,
                json!({
                    "checkpoint_order": checkpoint.checkpoint_order,
                    "checkpoint_name": checkpoint.name,
                    "completed_by": actor,
                    "checkpoints_completed": completed,
                    "checkpoints_total": total,
                    "completion_percentage": percentage,
                }),
                now,
            )?;

            get_checkpoint_tx(tx, checkpoint_id)?
                .ok_or(TaskError::CheckpointNotFound(checkpoint_id))
        })
    }
}
