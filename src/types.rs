//! Core domain types for the field-task lifecycle.

use serde::{Deserialize, Serialize};

/// Task priority as an integer (1 = very low, 5 = urgent).
pub type Priority = i32;

pub const PRIORITY_MIN: Priority = 1;
pub const PRIORITY_DEFAULT: Priority = 3;
pub const PRIORITY_MAX: Priority = 5;

/// Clamp a priority into the valid 1-5 range.
pub fn clamp_priority(p: Priority) -> Priority {
    p.clamp(PRIORITY_MIN, PRIORITY_MAX)
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    InProgress,
    Paused,
    Completed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "assigned" => Some(TaskStatus::Assigned),
            "in_progress" => Some(TaskStatus::InProgress),
            "paused" => Some(TaskStatus::Paused),
            "completed" => Some(TaskStatus::Completed),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal states accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Cancelled)
    }
}

/// Action recorded in the assignment history for each accepted command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleAction {
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

impl LifecycleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleAction::Created => "created",
            LifecycleAction::Assigned => "assigned",
            LifecycleAction::Reassigned => "reassigned",
            LifecycleAction::Started => "started",
            LifecycleAction::Resumed => "resumed",
            LifecycleAction::Paused => "paused",
            LifecycleAction::Completed => "completed",
            LifecycleAction::Cancelled => "cancelled",
            LifecycleAction::CheckpointCompleted => "checkpoint_completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(LifecycleAction::Created),
            "assigned" => Some(LifecycleAction::Assigned),
            "reassigned" => Some(LifecycleAction::Reassigned),
            "started" => Some(LifecycleAction::Started),
            "resumed" => Some(LifecycleAction::Resumed),
            "paused" => Some(LifecycleAction::Paused),
            "completed" => Some(LifecycleAction::Completed),
            "cancelled" => Some(LifecycleAction::Cancelled),
            "checkpoint_completed" => Some(LifecycleAction::CheckpointCompleted),
            _ => None,
        }
    }
}

/// A unit of assignable field work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Internal surrogate key.
    pub id: i64,
    /// Stable external identifier, immutable after creation.
    pub public_id: String,
    pub title: String,
    pub description: Option<String>,
    pub status: TaskStatus,
    pub priority: Priority,

    /// Opaque reference to an optimized route, if any.
    pub route_id: Option<String>,
    /// Opaque reference to the incident that originated this task, if any.
    pub incident_id: Option<String>,
    pub assignee: Option<String>,
    pub created_by: String,

    // Scheduling window (ISO date/time strings)
    pub scheduled_date: Option<String>,
    pub scheduled_start_time: Option<String>,
    pub scheduled_end_time: Option<String>,
    pub estimated_duration_min: i32,

    // Real timing (ms since epoch)
    pub started_at: Option<i64>,
    pub paused_at: Option<i64>,
    pub completed_at: Option<i64>,

    // Derived progress counters
    pub checkpoints_total: i32,
    pub checkpoints_completed: i32,
    pub completion_percentage: i32,

    // Outcome
    pub result_notes: Option<String>,
    pub waste_collected_kg: Option<f64>,
    pub cancelled_reason: Option<String>,

    pub created_at: i64,
    pub updated_at: i64,
}

/// Input for creating a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewTask {
    pub title: String,
    pub description: Option<String>,
    pub priority: Option<Priority>,
    pub route_id: Option<String>,
    pub incident_id: Option<String>,
    pub created_by: String,
    pub scheduled_date: Option<String>,
    pub scheduled_start_time: Option<String>,
    pub scheduled_end_time: Option<String>,
    pub estimated_duration_min: Option<i32>,
}

/// Result fields supplied when completing a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionResult {
    pub result_notes: Option<String>,
    pub waste_collected_kg: Option<f64>,
    pub notes: Option<String>,
}

/// An ordered milestone within a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: i64,
    pub task_id: i64,
    /// 1-based position in the task's checkpoint sequence, unique per task.
    pub checkpoint_order: i32,
    pub name: String,
    pub description: Option<String>,

    pub is_completed: bool,
    pub completed_at: Option<i64>,
    pub completed_by: Option<String>,

    pub requires_evidence: bool,
    pub evidence_ref: Option<String>,
    pub notes: Option<String>,

    pub created_at: i64,
    pub updated_at: i64,
}

/// Input for creating a checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCheckpoint {
    pub checkpoint_order: i32,
    pub name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub requires_evidence: bool,
}

/// Immutable audit record of a lifecycle action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentRecord {
    pub id: i64,
    pub task_id: i64,
    pub action: LifecycleAction,
    pub performed_by: Option<String>,
    pub previous_assignee: Option<String>,
    pub new_assignee: Option<String>,
    pub previous_status: Option<TaskStatus>,
    pub new_status: Option<TaskStatus>,
    pub notes: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub timestamp: i64,
}

/// Delivery status of an outbox event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Published,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Published => "published",
            OutboxStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OutboxStatus::Pending),
            "published" => Some(OutboxStatus::Published),
            "failed" => Some(OutboxStatus::Failed),
            _ => None,
        }
    }
}

/// A durable event row awaiting (or past) broker delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: i64,
    pub event_id: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub routing_key: String,
    pub payload: serde_json::Value,

    pub status: OutboxStatus,
    pub attempts: i32,
    pub last_error: Option<String>,

    pub claimed_by: Option<String>,
    pub lease_until: Option<i64>,
    pub next_attempt_at: i64,

    pub created_at: i64,
    pub published_at: Option<i64>,
}

/// Aggregate task statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStats {
    pub total_tasks: i64,
    pub pending_tasks: i64,
    pub assigned_tasks: i64,
    pub in_progress_tasks: i64,
    pub paused_tasks: i64,
    pub completed_tasks: i64,
    pub cancelled_tasks: i64,
    pub completion_rate: f64,
    pub total_waste_collected_kg: f64,
}
