//! Task creation, row parsing, and read queries.

use super::history::{self, HistoryRow};
use super::outbox;
use super::{Database, now_ms};
use crate::error::{TaskError, TaskResult};
use crate::events::EventType;
use crate::types::{NewTask, PRIORITY_DEFAULT, Task, TaskStats, TaskStatus, clamp_priority};
use rusqlite::{Connection, Row, params};
use serde_json::json;
use uuid::Uuid;

pub(crate) fn parse_task_row(row: &Row) -> rusqlite::Result<Task> {
    let status_raw: String = row.get("status")?;
    let status = TaskStatus::parse(&status_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("unknown task status: {status_raw}").into(),
        )
    })?;

    Ok(Task {
        id: row.get("id")?,
        public_id: row.get("public_id")?,
        title: row.get("title")?,
        description: row.get("description")?,
        status,
        priority: row.get("priority")?,
        route_id: row.get("route_id")?,
        incident_id: row.get("incident_id")?,
        assignee: row.get("assignee")?,
        created_by: row.get("created_by")?,
        scheduled_date: row.get("scheduled_date")?,
        scheduled_start_time: row.get("scheduled_start_time")?,
        scheduled_end_time: row.get("scheduled_end_time")?,
        estimated_duration_min: row.get("estimated_duration_min")?,
        started_at: row.get("started_at")?,
        paused_at: row.get("paused_at")?,
        completed_at: row.get("completed_at")?,
        checkpoints_total: row.get("checkpoints_total")?,
        checkpoints_completed: row.get("checkpoints_completed")?,
        completion_percentage: row.get("completion_percentage")?,
        result_notes: row.get("result_notes")?,
        waste_collected_kg: row.get("waste_collected_kg")?,
        cancelled_reason: row.get("cancelled_reason")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

/// Look up a task by public id using an existing connection, so callers
/// inside a transaction observe their own writes.
pub(crate) fn get_task_tx(conn: &Connection, public_id: &str) -> TaskResult<Option<Task>> {
    let mut stmt = conn.prepare("SELECT * FROM tasks WHERE public_id = ?1")?;

    match stmt.query_row(params![public_id], parse_task_row) {
        Ok(task) => Ok(Some(task)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

impl Database {
    /// Create a new task in `pending` state.
    ///
    /// Atomically inserts the task row, appends the `created` history entry,
    /// and queues a `task.created` event.
    pub fn create_task(&self, input: &NewTask) -> TaskResult<Task> {
        let public_id = Uuid::new_v4().to_string();

        self.transaction(|tx| {
            let now = now_ms();
            let priority = clamp_priority(input.priority.unwrap_or(PRIORITY_DEFAULT));

            tx.execute(
                "INSERT INTO tasks
                     (public_id, title, description, status, priority,
                      route_id, incident_id, created_by,
                      scheduled_date, scheduled_start_time, scheduled_end_time,
                      estimated_duration_min, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    public_id,
                    input.title,
                    input.description,
                    priority,
                    input.route_id,
                    input.incident_id,
                    input.created_by,
                    input.scheduled_date,
                    input.scheduled_start_time,
                    input.scheduled_end_time,
                    input.estimated_duration_min.unwrap_or(30),
                    now,
                    now,
                ],
            )?;

            let task = get_task_tx(tx, &public_id)?
                .ok_or_else(|| TaskError::TaskNotFound(public_id.clone()))?;

            let mut entry = HistoryRow::new(task.id, crate::types::LifecycleAction::Created);
            entry.performed_by = Some(&input.created_by);
            entry.new_status = Some(TaskStatus::Pending);
            history::record(tx, &entry, now)?;

            outbox::enqueue_event(
                tx,
                &task.public_id,
                EventType::Created,
                json!({
                    "title": task.title,
                    "priority": task.priority,
                    "created_by": task.created_by,
                    "route_id": task.route_id,
                    "incident_id": task.incident_id,
                    "scheduled_date": task.scheduled_date,
                }),
                now,
            )?;

            Ok(task)
        })
    }

    /// Get a task by its public id.
    pub fn get_task(&self, public_id: &str) -> TaskResult<Option<Task>> {
        self.with_conn(|conn| get_task_tx(conn, public_id))
    }

    /// List tasks assigned to an actor, highest priority first.
    pub fn list_tasks_by_assignee(&self, assignee: &str) -> TaskResult<Vec<Task>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM tasks
                 WHERE assignee = ?1
                 ORDER BY priority DESC, scheduled_date ASC, id ASC",
            )?;

            let tasks = stmt
                .query_map(params![assignee], parse_task_row)?
                .collect::<Result<Vec<_>, _>>()?;

            Ok(tasks)
        })
    }

    /// Aggregate statistics over all tasks.
    pub fn task_stats(&self) -> TaskResult<TaskStats> {
        self.with_conn(|conn| {
            let (total, pending, assigned, in_progress, paused, completed, cancelled, waste) =
                conn.query_row(
                    "SELECT COUNT(*),
                            COUNT(*) FILTER (WHERE status = 'pending'),
                            COUNT(*) FILTER (WHERE status = 'assigned'),
                            COUNT(*) FILTER (WHERE status = 'in_progress'),
                            COUNT(*) FILTER (WHERE status = 'paused'),
                            COUNT(*) FILTER (WHERE status = 'completed'),
                            COUNT(*) FILTER (WHERE status = 'cancelled'),
                            COALESCE(SUM(waste_collected_kg), 0.0)
                     FROM tasks",
                    [],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, i64>(2)?,
                            row.get::<_, i64>(3)?,
                            row.get::<_, i64>(4)?,
                            row.get::<_, i64>(5)?,
                            row.get::<_, i64>(6)?,
                            row.get::<_, f64>(7)?,
                        ))
                    },
                )?;

            let completion_rate = if total > 0 {
                (completed as f64 / total as f64) * 100.0
            } else {
                0.0
            };

            Ok(TaskStats {
                total_tasks: total,
                pending_tasks: pending,
                assigned_tasks: assigned,
                in_progress_tasks: in_progress,
                paused_tasks: paused,
                completed_tasks: completed,
                cancelled_tasks: cancelled,
                completion_rate,
                total_waste_collected_kg: waste,
            })
        })
    }
}
