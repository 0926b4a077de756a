//! Outbox polling with exponential backoff
//!
//! Claims fanout tasks with an adaptive interval: the interval grows while
//! the queue is empty and snaps back to the minimum once work shows up.

use std::sync::Arc;
use std::time::Duration;

use eventline_core::{FanoutKind, FanoutQueue, FanoutTask, Result};
use tokio::sync::watch;
use tracing::{debug, instrument, trace};

/// Polling configuration
#[derive(Debug, Clone, PartialEq)]
pub struct PollerConfig {
    /// Poll interval while tasks keep arriving
    pub min_interval: Duration,
    /// Poll interval ceiling when idle
    pub max_interval: Duration,
    /// Backoff multiplier when no tasks were found
    pub backoff_multiplier: f64,
    /// Maximum tasks to claim per poll
    pub batch_size: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(50),
            max_interval: Duration::from_secs(2),
            backoff_multiplier: 1.5,
            batch_size: 20,
        }
    }
}

impl PollerConfig {
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval.max(self.min_interval);
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }
}

/// Task poller with adaptive backoff
pub struct TaskPoller {
    queue: Arc<dyn FanoutQueue>,
    worker_id: String,
    kinds: Vec<FanoutKind>,
    config: PollerConfig,
    current_interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl TaskPoller {
    pub fn new(
        queue: Arc<dyn FanoutQueue>,
        worker_id: String,
        kinds: Vec<FanoutKind>,
        config: PollerConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            queue,
            worker_id,
            kinds,
            current_interval: config.min_interval,
            config,
            shutdown_rx,
        }
    }

    /// Claim up to `max_tasks` tasks and update the backoff state
    #[instrument(skip(self), fields(worker_id = %self.worker_id))]
    pub async fn poll(&mut self, max_tasks: usize) -> Result<Vec<FanoutTask>> {
        if self.is_shutdown() {
            debug!("poller shutdown requested");
            return Ok(vec![]);
        }

        let batch_size = max_tasks.min(self.config.batch_size);
        let tasks = self
            .queue
            .claim(&self.worker_id, &self.kinds, batch_size)
            .await?;

        if tasks.is_empty() {
            self.increase_backoff();
            trace!(
                interval_ms = self.current_interval.as_millis() as u64,
                "no tasks found, backing off"
            );
        } else {
            self.reset_backoff();
            debug!(count = tasks.len(), "claimed tasks");
        }

        Ok(tasks)
    }

    /// Wait for the current interval or until the queue signals new work.
    /// Returns true if shutdown was signaled.
    pub async fn wait(&mut self) -> bool {
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = self.queue.wait_for_tasks(self.current_interval) => false,
            _ = shutdown_rx.changed() => {
                debug!("shutdown signal received during wait");
                true
            }
        }
    }

    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    fn reset_backoff(&mut self) {
        self.current_interval = self.config.min_interval;
    }

    fn increase_backoff(&mut self) {
        let next = Duration::from_secs_f64(
            self.current_interval.as_secs_f64() * self.config.backoff_multiplier,
        );
        self.current_interval = next.min(self.config.max_interval);
    }
}
