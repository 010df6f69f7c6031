//! Event types and broker payload construction.
//!
//! Every committed state change queues exactly one event. The payload shape
//! published to the broker is:
//!
//! ```json
//! {
//!   "event_id": "...",
//!   "aggregate_type": "task",
//!   "aggregate_id": "<task public id>",
//!   "event_type": "task.assigned",
//!   "occurred_at": 1712345678901,
//!   "data": { ... }
//! }
//! ```
//!
//! Consumers must be idempotent keyed on `event_id`; delivery is
//! at-least-once.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Aggregate type for all task events.
pub const AGGREGATE_TASK: &str = "task";

/// Type of a task lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Created,
    Assigned,
    Reassigned,
    Started,
    Resumed,
    Paused,
    Completed,
    Cancelled,
    CheckpointCompleted,
}

impl EventType {
    /// Dotted event type string as it appears in payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Created => "task.created",
            EventType::Assigned => "task.assigned",
            EventType::Reassigned => "task.reassigned",
            EventType::Started => "task.started",
            EventType::Resumed => "task.resumed",
            EventType::Paused => "task.paused",
            EventType::Completed => "task.completed",
            EventType::Cancelled => "task.cancelled",
            EventType::CheckpointCompleted => "task.checkpoint_completed",
        }
    }

    /// Routing key used for broker topic routing.
    pub fn routing_key(&self) -> &'static str {
        match self {
            EventType::Created => "tasks.created",
            EventType::Assigned => "tasks.assigned",
            EventType::Reassigned => "tasks.reassigned",
            EventType::Started => "tasks.started",
            EventType::Resumed => "tasks.resumed",
            EventType::Paused => "tasks.paused",
            EventType::Completed => "tasks.completed",
            EventType::Cancelled => "tasks.cancelled",
            EventType::CheckpointCompleted => "tasks.checkpoint_completed",
        }
    }
}

/// Build the broker payload envelope for an event.
pub fn envelope(
    event_id: &str,
    aggregate_id: &str,
    event_type: EventType,
    occurred_at: i64,
    data: Value,
) -> Value {
    json!({
        "event_id": event_id,
        "aggregate_type": AGGREGATE_TASK,
        "aggregate_id": aggregate_id,
        "event_type": event_type.as_str(),
        "occurred_at": occurred_at,
        "data": data,
    })
}
