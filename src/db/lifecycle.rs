//! Task lifecycle state machine.
//!
//! Transitions: `pending → assigned → in_progress ⇄ paused → completed`,
//! with `cancelled` reachable from any non-terminal state. `completed` and
//! `cancelled` are terminal.
//!
//! Every operation runs as one transaction that updates the task row,
//! appends exactly one assignment history entry, and queues exactly one
//! outbox event. A command racing against another serializes on the write
//! lock and either sees the committed result or fails with
//! `InvalidTransition` against the fresh state; updates are never lost.

use super::history::{self, HistoryRow};
use super::outbox;
use super::tasks::get_task_tx;
use super::{Database, now_ms};
use crate::error::{TaskError, TaskResult};
use crate::events::EventType;
use crate::types::{CompletionResult, LifecycleAction, Task, TaskStatus};
use rusqlite::{Connection, params};
use serde_json::json;
use tracing::debug;

fn load_task(conn: &Connection, public_id: &str) -> TaskResult<Task> {
    get_task_tx(conn, public_id)?.ok_or_else(|| TaskError::TaskNotFound(public_id.to_string()))
}

impl Database {
    /// Assign (or reassign) a task to an assignee.
    ///
    /// Valid from any non-terminal state. Moves `pending` to `assigned`;
    /// otherwise the state is untouched, so reassignment never resets
    /// progress. Emits `task.assigned` on first assignment and
    /// `task.reassigned` when an assignee was already set.
    pub fn assign_task(
        &self,
        public_id: &str,
        assignee: &str,
        actor: &str,
        note: Option<&str>,
    ) -> TaskResult<Task> {
        self.transaction(|tx| {
            let task = load_task(tx, public_id)?;

            if task.status.is_terminal() {
                return Err(TaskError::InvalidTransition {
                    action: "assign",
                    status: task.status,
                });
            }

            let now = now_ms();
            let previous_status = task.status;
            let new_status = if task.status == TaskStatus::Pending {
                TaskStatus::Assigned
            } else {
                task.status
            };

            tx.execute(
                "UPDATE tasks SET assignee = ?1, status = ?2, updated_at = ?3 WHERE id = ?4",
                params![assignee, new_status.as_str(), now, task.id],
            )?;

            let (action, event_type) = if task.assignee.is_none() {
                (LifecycleAction::Assigned, EventType::Assigned)
            } else {
                (LifecycleAction::Reassigned, EventType::Reassigned)
            };

            let mut entry = HistoryRow::new(task.id, action);
            entry.performed_by = Some(actor);
            entry.previous_assignee = task.assignee.as_deref();
            entry.new_assignee = Some(assignee);
            entry.previous_status = Some(previous_status);
            entry.new_status = Some(new_status);
            entry.notes = note;
            history::record(tx, &entry, now)?;

            outbox::enqueue_event(
                tx,
                &task.public_id,
                event_type,
                json!({
                    "previous_assignee": task.assignee,
                    "new_assignee": assignee,
                    "status": new_status.as_str(),
                }),
                now,
            )?;

            debug!(task = %task.public_id, assignee, "task assigned");
            load_task(tx, public_id)
        })
    }

    /// Start (or resume) work on a task.
    ///
    /// Valid only from `assigned` or `paused`. `started_at` is set once, on
    /// the first start; resuming keeps the original value. Emits
    /// `task.started` from `assigned` and `task.resumed` from `paused`.
    pub fn start_task(&self, public_id: &str, actor: &str) -> TaskResult<Task> {
        self.transaction(|tx| {
            let task = load_task(tx, public_id)?;

            if !matches!(task.status, TaskStatus::Assigned | TaskStatus::Paused) {
                return Err(TaskError::InvalidTransition {
                    action: "start",
                    status: task.status,
                });
            }

            let now = now_ms();
            let started_at = task.started_at.unwrap_or(now);

            tx.execute(
                "UPDATE tasks SET status = 'in_progress', started_at = ?1, updated_at = ?2
                 WHERE id = ?3",
                params![started_at, now, task.id],
            )?;

            let (action, event_type) = if task.status == TaskStatus::Paused {
                (LifecycleAction::Resumed, EventType::Resumed)
            } else {
                (LifecycleAction::Started, EventType::Started)
            };

            let mut entry = HistoryRow::new(task.id, action);
            entry.performed_by = Some(actor);
            entry.previous_status = Some(task.status);
            entry.new_status = Some(TaskStatus::InProgress);
            history::record(tx, &entry, now)?;

            outbox::enqueue_event(
                tx,
                &task.public_id,
                event_type,
                json!({
                    "assignee": task.assignee,
                    "started_at": started_at,
                }),
                now,
            )?;

            debug!(task = %task.public_id, action = action.as_str(), "task started");
            load_task(tx, public_id)
        })
    }

    /// Pause an in-progress task, recording when it was paused.
    pub fn pause_task(&self, public_id: &str, actor: &str, note: Option<&str>) -> TaskResult<Task> {
        self.transaction(|tx| {
            let task = load_task(tx, public_id)?;

            if task.status != TaskStatus::InProgress {
                return Err(TaskError::InvalidTransition {
                    action: "pause",
                    status: task.status,
                });
            }

            let now = now_ms();

            tx.execute(
                "UPDATE tasks SET status = 'paused', paused_at = ?1, updated_at = ?2
                 WHERE id = ?3",
                params![now, now, task.id],
            )?;

            let mut entry = HistoryRow::new(task.id, LifecycleAction::Paused);
            entry.performed_by = Some(actor);
            entry.previous_status = Some(TaskStatus::InProgress);
            entry.new_status = Some(TaskStatus::Paused);
            entry.notes = note;
            history::record(tx, &entry, now)?;

            outbox::enqueue_event(
                tx,
                &task.public_id,
                EventType::Paused,
                json!({
                    "assignee": task.assignee,
                    "paused_at": now,
                }),
                now,
            )?;

            debug!(task = %task.public_id, "task paused");
            load_task(tx, public_id)
        })
    }

    /// Complete a task.
    ///
    /// Valid only from `in_progress` or `assigned` (not `pending`). Forces
    /// `completion_percentage` to 100 regardless of the checkpoint tally and
    /// stores the supplied result fields.
    pub fn complete_task(
        &self,
        public_id: &str,
        actor: &str,
        result: &CompletionResult,
    ) -> TaskResult<Task> {
        self.transaction(|tx| {
            let task = load_task(tx, public_id)?;

            if !matches!(task.status, TaskStatus::InProgress | TaskStatus::Assigned) {
                return Err(TaskError::InvalidTransition {
                    action: "complete",
                    status: task.status,
                });
            }

            let now = now_ms();

            tx.execute(
                "UPDATE tasks
                 SET status = 'completed', completed_at = ?1, completion_percentage = 100,
                     result_notes = COALESCE(?2, result_notes),
                     waste_collected_kg = COALESCE(?3, waste_collected_kg),
                     updated_at = ?4
                 WHERE id = ?5",
                params![
                    now,
                    result.result_notes,
                    result.waste_collected_kg,
                    now,
                    task.id
                ],
            )?;

            let mut entry = HistoryRow::new(task.id, LifecycleAction::Completed);
            entry.performed_by = Some(actor);
            entry.previous_status = Some(task.status);
            entry.new_status = Some(TaskStatus::Completed);
            entry.notes = result.notes.as_deref();
            history::record(tx, &entry, now)?;

            outbox::enqueue_event(
                tx,
                &task.public_id,
                EventType::Completed,
                json!({
                    "assignee": task.assignee,
                    "completed_at": now,
                    "result_notes": result.result_notes,
                    "waste_collected_kg": result.waste_collected_kg,
                }),
                now,
            )?;

            debug!(task = %task.public_id, "task completed");
            load_task(tx, public_id)
        })
    }

    /// Cancel a task from any non-terminal state, storing the reason.
    /// Cancellation is a terminal state, not a deletion.
    pub fn cancel_task(
        &self,
        public_id: &str,
        actor: &str,
        reason: Option<&str>,
    ) -> TaskResult<Task> {
        self.transaction(|tx| {
            let task = load_task(tx, public_id)?;

            if task.status.is_terminal() {
                return Err(TaskError::InvalidTransition {
                    action: "cancel",
                    status: task.status,
                });
            }

            let now = now_ms();

            tx.execute(
                "UPDATE tasks SET status = 'cancelled', cancelled_reason = ?1, updated_at = ?2
                 WHERE id = ?3",
                params![reason, now, task.id],
            )?;

            let mut entry = HistoryRow::new(task.id, LifecycleAction::Cancelled);
            entry.performed_by = Some(actor);
            entry.previous_status = Some(task.status);
            entry.new_status = Some(TaskStatus::Cancelled);
            entry.notes = reason;
            history::record(tx, &entry, now)?;

            outbox::enqueue_event(
                tx,
                &task.public_id,
                EventType::Cancelled,
                json!({
                    "previous_status": task.status.as_str(),
                    "reason": reason,
                }),
                now,
            )?;

            debug!(task = %task.public_id, "task cancelled");
            load_task(tx, public_id)
        })
    }
}
