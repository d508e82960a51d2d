//! Durable mutation records for the offline sync queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::MealSnapshot;

/// The kind of mutation a queue entry replays against the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Create,
    Update,
    Delete,
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationType::Create => write!(f, "create"),
            OperationType::Update => write!(f, "update"),
            OperationType::Delete => write!(f, "delete"),
        }
    }
}

impl FromStr for OperationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(OperationType::Create),
            "update" => Ok(OperationType::Update),
            "delete" => Ok(OperationType::Delete),
            _ => Err(format!("Invalid operation type '{}'", s)),
        }
    }
}

/// Processing state of a queued mutation.
///
/// `Completed` never appears in storage: a completed record is deleted, the
/// queue is not an audit log. A `Failed` record with a due `next_attempt_at`
/// is retried automatically; one with no `next_attempt_at` is terminal and
/// waits for the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStatus {
    Pending,
    InFlight,
    Failed,
    Completed,
}

impl fmt::Display for MutationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MutationStatus::Pending => write!(f, "pending"),
            MutationStatus::InFlight => write!(f, "in_flight"),
            MutationStatus::Failed => write!(f, "failed"),
            MutationStatus::Completed => write!(f, "completed"),
        }
    }
}

impl FromStr for MutationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MutationStatus::Pending),
            "in_flight" => Ok(MutationStatus::InFlight),
            "failed" => Ok(MutationStatus::Failed),
            "completed" => Ok(MutationStatus::Completed),
            _ => Err(format!("Invalid mutation status '{}'", s)),
        }
    }
}

/// One durable queue entry. Created at user-action time, deleted on terminal
/// success or conflict supersession.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationRecord {
    pub operation_id: Uuid,
    pub operation_type: OperationType,
    /// The logical meal this mutation applies to. Client-generated for
    /// creates, so offline updates can reference the meal before the server
    /// has seen it.
    pub target_id: Uuid,
    pub payload: MealSnapshot,
    pub status: MutationStatus,
    pub retry_count: i64,
    /// Not eligible before this time. `None` means never (terminal failure).
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MutationRecord {
    /// Builds a fresh pending record, eligible immediately.
    pub fn new(operation_type: OperationType, target_id: Uuid, payload: MealSnapshot) -> Self {
        let now = Utc::now();
        Self {
            operation_id: Uuid::new_v4(),
            operation_type,
            target_id,
            payload,
            status: MutationStatus::Pending,
            retry_count: 0,
            next_attempt_at: Some(now),
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}
