// Outbox task types
//
// Fanout work is recorded as task rows in the same transaction as the event
// (transactional outbox). Workers claim committed rows, so a rolled back
// transaction never schedules anything.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EventlineError, Result};

/// Kind of fanout work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanoutKind {
    /// Compute recipients and write notifications (subject: event id)
    Notify,
    /// Match webhook subscriptions and create deliveries (subject: event id)
    DispatchWebhooks,
    /// Perform one HTTP delivery (subject: delivery id)
    DeliverWebhook,
}

impl FanoutKind {
    pub const ALL: [FanoutKind; 3] = [
        FanoutKind::Notify,
        FanoutKind::DispatchWebhooks,
        FanoutKind::DeliverWebhook,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Notify => "notify",
            Self::DispatchWebhooks => "dispatch_webhooks",
            Self::DeliverWebhook => "deliver_webhook",
        }
    }
}

impl fmt::Display for FanoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FanoutKind {
    type Err = EventlineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "notify" => Ok(Self::Notify),
            "dispatch_webhooks" => Ok(Self::DispatchWebhooks),
            "deliver_webhook" => Ok(Self::DeliverWebhook),
            other => Err(EventlineError::validation(format!(
                "unknown fanout kind: {other}"
            ))),
        }
    }
}

/// Task status in the outbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Claimed,
    Completed,
    /// Retry budget exhausted
    Dead,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Completed => "completed",
            Self::Dead => "dead",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "claimed" => Ok(Self::Claimed),
            "completed" => Ok(Self::Completed),
            "dead" => Ok(Self::Dead),
            other => Err(EventlineError::store(format!("unknown task status: {other}"))),
        }
    }
}

/// Task to be written to the outbox
///
/// `(kind, subject_id)` is unique: enqueuing the same pair twice is a no-op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFanoutTask {
    pub kind: FanoutKind,
    pub subject_id: Uuid,
    pub max_attempts: u32,
}

impl NewFanoutTask {
    pub fn new(kind: FanoutKind, subject_id: Uuid) -> Self {
        Self {
            kind,
            subject_id,
            max_attempts: 5,
        }
    }

    pub fn notify(event_id: Uuid) -> Self {
        Self::new(FanoutKind::Notify, event_id)
    }

    pub fn dispatch_webhooks(event_id: Uuid) -> Self {
        Self::new(FanoutKind::DispatchWebhooks, event_id)
    }

    pub fn deliver_webhook(delivery_id: Uuid) -> Self {
        Self::new(FanoutKind::DeliverWebhook, delivery_id)
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }
}

/// Task claimed by a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanoutTask {
    pub id: Uuid,
    pub kind: FanoutKind,
    pub subject_id: Uuid,
    /// 1-based attempt number of the current run
    pub attempt: u32,
    pub max_attempts: u32,
    /// Worker holding the claim
    pub claimed_by: String,
}

/// Outcome of failing a task
#[derive(Debug, Clone, PartialEq)]
pub enum TaskFailureOutcome {
    /// Task will become claimable again after `delay`
    WillRetry { next_attempt: u32, delay: Duration },
    /// Retry budget exhausted; the task is parked as dead
    Dead,
}

/// Outbox counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub claimed: usize,
    pub completed: usize,
    pub dead: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip() {
        for kind in FanoutKind::ALL {
            assert_eq!(kind.as_str().parse::<FanoutKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_max_attempts_floor() {
        let task = NewFanoutTask::notify(Uuid::now_v7()).with_max_attempts(0);
        assert_eq!(task.max_attempts, 1);
    }
}
