// Webhook deliveries and delinquency tracking
//
// A delivery is a single attempt to send one event to one webhook. Its
// outcome feeds the webhook's delinquency tracker, which deactivates
// endpoints that keep failing instead of retrying them forever.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EventlineError, Result};
use crate::retry::duration_millis;

/// Delivery lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,
    InProgress,
    /// Endpoint answered with a 2xx status
    Succeeded,
    /// Endpoint answered with a non-2xx status
    Failed,
    /// No usable response (connection error, timeout)
    Errored,
    /// Never sent; `error` holds the reason
    Skipped,
}

impl DeliveryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Errored => "errored",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "errored" => Ok(Self::Errored),
            "skipped" => Ok(Self::Skipped),
            other => Err(EventlineError::store(format!(
                "unknown delivery state: {other}"
            ))),
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Errored | Self::Skipped
        )
    }
}

/// Result of sending a payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Responded { status: u16 },
    Errored(String),
}

impl DeliveryOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Responded { status } if (200..300).contains(status))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub id: Uuid,
    pub webhook_id: Uuid,
    pub event_id: Uuid,
    pub state: DeliveryState,
    pub response_code: Option<u16>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Delivery {
    pub fn new(webhook_id: Uuid, event_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            webhook_id,
            event_id,
            state: DeliveryState::Pending,
            response_code: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn start(&mut self) {
        self.state = DeliveryState::InProgress;
        self.updated_at = Utc::now();
    }

    pub fn finish(&mut self, outcome: &DeliveryOutcome) {
        match outcome {
            DeliveryOutcome::Responded { status } => {
                self.response_code = Some(*status);
                self.error = None;
                self.state = if outcome.is_success() {
                    DeliveryState::Succeeded
                } else {
                    DeliveryState::Failed
                };
            }
            DeliveryOutcome::Errored(message) => {
                self.response_code = None;
                self.error = Some(message.clone());
                self.state = DeliveryState::Errored;
            }
        }
        self.updated_at = Utc::now();
    }

    /// Close the delivery without sending it
    pub fn skip(&mut self, reason: impl Into<String>) {
        self.state = DeliveryState::Skipped;
        self.response_code = None;
        self.error = Some(reason.into());
        self.updated_at = Utc::now();
    }
}

// ============================================================================
// Delinquency
// ============================================================================

/// When a failing webhook gets deactivated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelinquencyPolicy {
    /// Consecutive failures required
    pub threshold: u32,
    /// How long failures must have persisted since the first one
    #[serde(with = "duration_millis")]
    pub window: Duration,
}

impl Default for DelinquencyPolicy {
    fn default() -> Self {
        Self {
            threshold: 10,
            window: Duration::from_secs(60 * 60),
        }
    }
}

/// Consecutive-failure counter of one webhook
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelinquencyTracker {
    pub webhook_id: Uuid,
    pub consecutive_failures: u32,
    pub first_failure_at: Option<DateTime<Utc>>,
}

impl DelinquencyTracker {
    pub fn new(webhook_id: Uuid) -> Self {
        Self {
            webhook_id,
            consecutive_failures: 0,
            first_failure_at: None,
        }
    }

    /// Fold one delivery outcome into the counter
    pub fn record(&mut self, outcome: &DeliveryOutcome, now: DateTime<Utc>) {
        if outcome.is_success() {
            self.consecutive_failures = 0;
            self.first_failure_at = None;
        } else {
            self.consecutive_failures += 1;
            self.first_failure_at.get_or_insert(now);
        }
    }

    pub fn is_delinquent(&self, policy: &DelinquencyPolicy, now: DateTime<Utc>) -> bool {
        let window = chrono::Duration::from_std(policy.window).unwrap_or(chrono::Duration::zero());
        match self.first_failure_at {
            Some(first) => {
                self.consecutive_failures >= policy.threshold && now - first >= window
            }
            None => false,
        }
    }
}
