//! Durable outbox for reliable event delivery.
//!
//! Event rows are inserted by the same transaction that mutates a task, so a
//! committed mutation always has its event and vice versa. The relay is the
//! only other writer and touches nothing but delivery bookkeeping fields
//! (status, attempts, lease, error), so the two writers never contend on the
//! same columns of a fresh row.

use super::{Database, now_ms};
use crate::error::TaskResult;
use crate::events::{self, EventType};
use rusqlite::{Connection, Row, params};
use serde_json::Value;
use uuid::Uuid;

use crate::types::{OutboxEvent, OutboxStatus};

/// Retry schedule for failed publishes.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts at or above this count park the event as `failed`.
    pub max_attempts: i32,
    pub base_backoff_ms: i64,
    pub max_backoff_ms: i64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff for the given (post-increment) attempt count,
    /// bounded by the maximum interval.
    pub fn backoff_ms(&self, attempts: i32) -> i64 {
        let exp = attempts.saturating_sub(1).min(20) as u32;
        let backoff = self.base_backoff_ms.saturating_mul(1i64 << exp);
        backoff.min(self.max_backoff_ms)
    }
}

/// Insert a pending outbox event. Must run inside the transaction that
/// performs the task mutation the event describes.
///
/// Returns the generated event id.
pub(crate) fn enqueue_event(
    conn: &Connection,
    aggregate_id: &str,
    event_type: EventType,
    data: Value,
    now: i64,
) -> TaskResult<String> {
    let event_id = Uuid::new_v4().to_string();
    let payload = events::envelope(&event_id, aggregate_id, event_type, now, data);

    conn.execute(
        "INSERT INTO outbox_events
             (event_id, aggregate_type, aggregate_id, event_type, routing_key,
              payload, status, next_attempt_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, ?8)",
        params![
            event_id,
            events::AGGREGATE_TASK,
            aggregate_id,
            event_type.as_str(),
            event_type.routing_key(),
            serde_json::to_string(&payload)?,
            now,
            now,
        ],
    )?;

    Ok(event_id)
}

fn parse_outbox_row(row: &Row) -> rusqlite::Result<OutboxEvent> {
    let status_raw: String = row.get("status")?;
    let status = OutboxStatus::parse(&status_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("unknown outbox status: {status_raw}").into(),
        )
    })?;

    let payload_json: String = row.get("payload")?;
    let payload = serde_json::from_str(&payload_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(OutboxEvent {
        id: row.get("id")?,
        event_id: row.get("event_id")?,
        aggregate_type: row.get("aggregate_type")?,
        aggregate_id: row.get("aggregate_id")?,
        event_type: row.get("event_type")?,
        routing_key: row.get("routing_key")?,
        payload,
        status,
        attempts: row.get("attempts")?,
        last_error: row.get("last_error")?,
        claimed_by: row.get("claimed_by")?,
        lease_until: row.get("lease_until")?,
        next_attempt_at: row.get("next_attempt_at")?,
        created_at: row.get("created_at")?,
        published_at: row.get("published_at")?,
    })
}

impl Database {
    /// Claim a batch of due events for a relay worker.
    ///
    /// Due means `pending` with `next_attempt_at` in the past and either
    /// unclaimed or holding an expired lease. Claimed rows are stamped with
    /// the worker id, a fresh lease, and a token unique to this call in one
    /// statement; the read-back selects on the token, so two claims can
    /// never see the same row even when they share a worker id and land in
    /// the same millisecond.
    ///
    /// Events come back in creation order, which preserves per-aggregate
    /// ordering within a pass.
    pub fn claim_due_events(
        &self,
        worker_id: &str,
        limit: i64,
        now: i64,
        lease_ms: i64,
    ) -> TaskResult<Vec<OutboxEvent>> {
        let lease_until = now + lease_ms;
        let claim_token = Uuid::new_v4().to_string();

        self.with_conn(|conn| {
            conn.execute(
                "UPDATE outbox_events
                 SET claimed_by = ?1, claim_token = ?2, lease_until = ?3
                 WHERE id IN (
                     SELECT id FROM outbox_events
                     WHERE status = 'pending'
                       AND next_attempt_at <= ?4
                       AND (claimed_by IS NULL OR lease_until <= ?4)
                     ORDER BY created_at ASC, id ASC
                     LIMIT ?5
                 )",
                params![worker_id, claim_token, lease_until, now, limit],
            )?;

            let mut stmt = conn.prepare(
                "SELECT id, event_id, aggregate_type, aggregate_id, event_type, routing_key,
                        payload, status, attempts, last_error, claimed_by, lease_until,
                        next_attempt_at, created_at, published_at
                 FROM outbox_events
                 WHERE claim_token = ?1
                 ORDER BY created_at ASC, id ASC",
            )?;

            let events = stmt
                .query_map(params![claim_token], parse_outbox_row)?
                .collect::<Result<Vec<_>, _>>()?;

            Ok(events)
        })
    }

    /// Mark an event published after a confirmed broker acknowledgment.
    pub fn mark_published(&self, event_id: &str, now: i64) -> TaskResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE outbox_events
                 SET status = 'published', published_at = ?1,
                     claimed_by = NULL, claim_token = NULL, lease_until = NULL
                 WHERE event_id = ?2",
                params![now, event_id],
            )?;
            Ok(())
        })
    }

    /// Record a failed publish attempt.
    ///
    /// Increments the attempt count and stores the error. Below the retry
    /// ceiling the event stays `pending` with an exponential-backoff
    /// `next_attempt_at`; at the ceiling it is parked as `failed`. The row
    /// is never deleted.
    ///
    /// Returns the status after the update.
    pub fn mark_publish_failed(
        &self,
        event_id: &str,
        error: &str,
        now: i64,
        policy: &RetryPolicy,
    ) -> TaskResult<OutboxStatus> {
        self.with_conn(|conn| {
            let attempts: i32 = conn.query_row(
                "SELECT attempts FROM outbox_events WHERE event_id = ?1",
                params![event_id],
                |row| row.get(0),
            )?;

            let attempts = attempts + 1;
            let status = if attempts >= policy.max_attempts {
                OutboxStatus::Failed
            } else {
                OutboxStatus::Pending
            };
            let next_attempt_at = now + policy.backoff_ms(attempts);

            conn.execute(
                "UPDATE outbox_events
                 SET attempts = ?1, status = ?2, last_error = ?3, next_attempt_at = ?4,
                     claimed_by = NULL, claim_token = NULL, lease_until = NULL
                 WHERE event_id = ?5",
                params![attempts, status.as_str(), error, next_attempt_at, event_id],
            )?;

            Ok(status)
        })
    }

    /// Get one outbox event by its event id.
    pub fn get_outbox_event(&self, event_id: &str) -> TaskResult<Option<OutboxEvent>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, event_id, aggregate_type, aggregate_id, event_type, routing_key,
                        payload, status, attempts, last_error, claimed_by, lease_until,
                        next_attempt_at, created_at, published_at
                 FROM outbox_events WHERE event_id = ?1",
            )?;

            match stmt.query_row(params![event_id], parse_outbox_row) {
                Ok(event) => Ok(Some(event)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }

    /// Diagnostic backlog view, in creation order, optionally filtered by
    /// delivery status.
    pub fn outbox_backlog(&self, status: Option<OutboxStatus>) -> TaskResult<Vec<OutboxEvent>> {
        self.with_conn(|conn| {
            let mut sql = String::from(
                "SELECT id, event_id, aggregate_type, aggregate_id, event_type, routing_key,
                        payload, status, attempts, last_error, claimed_by, lease_until,
                        next_attempt_at, created_at, published_at
                 FROM outbox_events",
            );
            let mut param_values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

            if let Some(status) = status {
                sql.push_str(" WHERE status = ?1");
                param_values.push(Box::new(status.as_str()));
            }

            sql.push_str(" ORDER BY created_at ASC, id ASC");

            let mut stmt = conn.prepare(&sql)?;
            let param_refs: Vec<&dyn rusqlite::ToSql> =
                param_values.iter().map(|b| b.as_ref()).collect();

            let events = stmt
                .query_map(param_refs.as_slice(), parse_outbox_row)?
                .collect::<Result<Vec<_>, _>>()?;

            Ok(events)
        })
    }

    /// Release claims whose lease has expired (crashed or stalled worker).
    /// Rows revert to plain pending and become claimable again.
    pub fn release_expired_leases(&self) -> TaskResult<usize> {
        let now = now_ms();
        self.with_conn(|conn| {
            let released = conn.execute(
                "UPDATE outbox_events
                 SET claimed_by = NULL, claim_token = NULL, lease_until = NULL
                 WHERE status = 'pending' AND claimed_by IS NOT NULL AND lease_until <= ?1",
                params![now],
            )?;
            Ok(released)
        })
    }
}
