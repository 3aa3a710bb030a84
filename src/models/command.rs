use crate::error::{ErrorKind, StellarError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Named priority levels (`critical=100, high=75,
/// normal=50, low=25`). Carried as a newtype over the raw integer so the
/// dispatcher's sort key stays meaningful in logs without losing the
/// ability to enqueue arbitrary integer priorities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Priority(pub i32);

impl Priority {
    pub const CRITICAL: Priority = Priority(100);
    pub const HIGH: Priority = Priority(75);
    pub const NORMAL: Priority = Priority(50);
    pub const LOW: Priority = Priority(25);
}

impl Default for Priority {
    fn default() -> Self {
        Priority::NORMAL
    }
}

impl std::str::FromStr for Priority {
    type Err = StellarError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "critical" => Ok(Priority::CRITICAL),
            "high" => Ok(Priority::HIGH),
            "normal" => Ok(Priority::NORMAL),
            "low" => Ok(Priority::LOW),
            other => other
                .parse::<i32>()
                .map(Priority)
                .map_err(|_| StellarError::validation(format!("unknown priority level: {other}"))),
        }
    }
}

/// Command lifecycle state. Transition functions live on
/// this type and return `Err(StellarError{kind: InvalidStatus, ..})` for any
/// arrow not drawn in the FSM diagram, rather than the queue hand-checking
/// string states itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Queued,
    Pending,
    Acknowledged,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CommandStatus::Queued => "queued",
            CommandStatus::Pending => "pending",
            CommandStatus::Acknowledged => "acknowledged",
            CommandStatus::Executing => "executing",
            CommandStatus::Completed => "completed",
            CommandStatus::Failed => "failed",
            CommandStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl CommandStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CommandStatus::Completed | CommandStatus::Failed | CommandStatus::Cancelled
        )
    }

    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            CommandStatus::Pending | CommandStatus::Acknowledged | CommandStatus::Executing
        )
    }

    /// Validate `self -> next` against the command lifecycle diagram.
    pub fn validate_transition(self, next: CommandStatus) -> Result<(), StellarError> {
        use CommandStatus::*;
        let allowed: &[CommandStatus] = match self {
            Queued => &[Pending, Cancelled],
            Pending => &[Acknowledged, Failed, Cancelled],
            Acknowledged => &[Executing, Failed, Cancelled],
            Executing => &[Completed, Failed],
            Completed | Failed | Cancelled => &[],
        };
        if allowed.contains(&next) {
            Ok(())
        } else {
            Err(StellarError::new(
                ErrorKind::InvalidStatus,
                format!("cannot transition command from {self} to {next}"),
            ))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: String,
    pub satellite_id: String,
    pub command_type: String,
    pub payload: HashMap<String, Value>,
    pub priority: Priority,
    pub status: CommandStatus,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub timeout_ms: u64,
    pub inserted_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<HashMap<String, Value>>,
    pub error: Option<String>,
    pub retry_count: u32,
}

/// Options accepted by [`crate::queue::CommandQueue::enqueue`].
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub priority: Priority,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub timeout_ms: Option<u64>,
}

impl Command {
    pub fn new(
        id: String,
        satellite_id: String,
        command_type: String,
        payload: HashMap<String, Value>,
        opts: EnqueueOptions,
        default_timeout_ms: u64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            satellite_id,
            command_type,
            payload,
            priority: opts.priority,
            status: CommandStatus::Queued,
            scheduled_at: opts.scheduled_at,
            timeout_ms: opts.timeout_ms.unwrap_or(default_timeout_ms),
            inserted_at: now,
            sent_at: None,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            retry_count: 0,
        }
    }

    /// Whether the head-of-queue command is eligible to be picked up right
    /// now, i.e. it has no schedule or its schedule has elapsed.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        match self.scheduled_at {
            None => true,
            Some(at) => at <= now,
        }
    }

    pub fn transition(&mut self, next: CommandStatus) -> Result<(), StellarError> {
        self.status.validate_transition(next)?;
        self.status = next;
        Ok(())
    }
}

/// `(-priority, inserted_at)` ordering key for the dispatch queue.
pub fn queue_sort_key(cmd: &Command) -> (i32, DateTime<Utc>) {
    (-cmd.priority.0, cmd.inserted_at)
}
