//! Worker pool for fanout tasks
//!
//! Claims outbox tasks, runs them concurrently under a semaphore and reports
//! each result back to the queue. A second loop hands stale claims (crashed
//! workers) back to the queue.

use std::sync::Arc;
use std::time::Duration;

use eventline_core::{FanoutConfig, FanoutKind, FanoutQueue, FanoutTask, TaskFailureOutcome};
use parking_lot::Mutex;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::config::WorkerConfig;
use crate::error::WorkerError;
use crate::jobs::FanoutContext;
use crate::poller::{PollerConfig, TaskPoller};

/// Worker pool configuration
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub worker_id: String,
    pub kinds: Vec<FanoutKind>,
    pub max_concurrency: usize,
    pub poller: PollerConfig,
    pub stale_reclaim_interval: Duration,
    pub stale_threshold: Duration,
    pub shutdown_timeout: Duration,
    /// Retry budgets per task kind
    pub fanout: FanoutConfig,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_id: "worker".to_string(),
            kinds: FanoutKind::ALL.to_vec(),
            max_concurrency: 10,
            poller: PollerConfig::default(),
            stale_reclaim_interval: Duration::from_secs(30),
            stale_threshold: Duration::from_secs(300),
            shutdown_timeout: Duration::from_secs(30),
            fanout: FanoutConfig::default(),
        }
    }
}

impl WorkerPoolConfig {
    pub fn from_worker_config(config: &WorkerConfig) -> Self {
        Self {
            worker_id: config.worker_id.clone(),
            max_concurrency: config.max_concurrent_tasks,
            poller: PollerConfig::default().with_max_interval(config.poll_interval),
            stale_threshold: config.stale_threshold,
            fanout: config.fanout.clone(),
            ..Default::default()
        }
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn with_poller(mut self, poller: PollerConfig) -> Self {
        self.poller = poller;
        self
    }

    pub fn with_stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = threshold;
        self
    }

    pub fn with_stale_reclaim_interval(mut self, interval: Duration) -> Self {
        self.stale_reclaim_interval = interval;
        self
    }

    pub fn with_fanout(mut self, fanout: FanoutConfig) -> Self {
        self.fanout = fanout;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPoolStatus {
    Running,
    /// Finishing in-flight tasks, not claiming new ones
    Draining,
    Stopped,
}

pub struct WorkerPool {
    context: FanoutContext,
    config: WorkerPoolConfig,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    status: Mutex<WorkerPoolStatus>,
    active_tasks: Arc<Semaphore>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(context: FanoutContext, config: WorkerPoolConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            active_tasks: Arc::new(Semaphore::new(config.max_concurrency)),
            context,
            config,
            shutdown_tx,
            shutdown_rx,
            status: Mutex::new(WorkerPoolStatus::Stopped),
            handles: Mutex::new(Vec::new()),
        }
    }

    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub fn start(&self) -> Result<(), WorkerError> {
        {
            let mut status = self.status.lock();
            if *status == WorkerPoolStatus::Running {
                return Err(WorkerError::AlreadyRunning);
            }
            *status = WorkerPoolStatus::Running;
        }

        info!(
            worker_id = %self.config.worker_id,
            kinds = ?self.config.kinds,
            max_concurrency = self.config.max_concurrency,
            "starting worker pool"
        );

        let poll = self.spawn_poll_loop();
        let reclaim = self.spawn_reclaim_loop();
        self.handles.lock().extend([poll, reclaim]);
        Ok(())
    }

    /// Stop claiming and wait for in-flight tasks
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn shutdown(&self) -> Result<(), WorkerError> {
        {
            let mut status = self.status.lock();
            if *status == WorkerPoolStatus::Stopped {
                return Ok(());
            }
            *status = WorkerPoolStatus::Draining;
        }

        info!("initiating graceful shutdown");
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        loop {
            let available = self.active_tasks.available_permits();
            if available == self.config.max_concurrency {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    remaining_tasks = self.config.max_concurrency - available,
                    "shutdown timeout reached"
                );
                return Err(WorkerError::ShutdownTimeout);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        *self.status.lock() = WorkerPoolStatus::Stopped;
        info!("worker pool stopped");
        Ok(())
    }

    pub fn status(&self) -> WorkerPoolStatus {
        *self.status.lock()
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    fn spawn_poll_loop(&self) -> JoinHandle<()> {
        let context = self.context.clone();
        let config = self.config.clone();
        let active_tasks = Arc::clone(&self.active_tasks);
        let shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            let mut poller = TaskPoller::new(
                context.queue.clone(),
                config.worker_id.clone(),
                config.kinds.clone(),
                config.poller.clone(),
                shutdown_rx,
            );
            let fanout = Arc::new(config.fanout);

            loop {
                if poller.is_shutdown() {
                    break;
                }

                let available = active_tasks.available_permits();
                if available == 0 {
                    if poller.wait().await {
                        break;
                    }
                    continue;
                }

                match poller.poll(available).await {
                    Ok(tasks) if !tasks.is_empty() => {
                        for task in tasks {
                            // Permits were counted before claiming, so this only
                            // fails if the semaphore was closed.
                            let Ok(permit) = active_tasks.clone().acquire_owned().await else {
                                break;
                            };
                            let context = context.clone();
                            let fanout = Arc::clone(&fanout);
                            tokio::spawn(async move {
                                execute(&context, &fanout, task).await;
                                drop(permit);
                            });
                        }
                        // Work found, poll again right away
                        continue;
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "poll failed"),
                }

                if poller.wait().await {
                    break;
                }
            }

            debug!("poll loop exited");
        })
    }

    fn spawn_reclaim_loop(&self) -> JoinHandle<()> {
        let queue = Arc::clone(&self.context.queue);
        let interval = self.config.stale_reclaim_interval;
        let threshold = self.config.stale_threshold;
        let mut shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match queue.reclaim_stale(threshold).await {
                            Ok(0) => {}
                            Ok(count) => info!(count, "reclaimed stale tasks"),
                            Err(e) => error!(error = %e, "stale task reclamation failed"),
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            debug!("reclaim loop exited");
        })
    }
}

/// Run one task and report the result to the queue
#[instrument(skip(context, fanout), fields(task_id = %task.id, kind = %task.kind, subject_id = %task.subject_id, attempt = task.attempt))]
pub async fn execute(context: &FanoutContext, fanout: &FanoutConfig, task: FanoutTask) {
    let queue: &dyn FanoutQueue = context.queue.as_ref();

    match context.run(&task).await {
        Ok(outcome) => {
            debug!(?outcome, "task completed");
            match queue.complete(&task).await {
                Ok(()) => {}
                Err(e) if e.is_claim_lost() => {
                    warn!("task was reclaimed before it completed");
                }
                Err(e) => error!(error = %e, "failed to mark task completed"),
            }
        }
        Err(err) => {
            let delay = fanout
                .retry_policy(task.kind)
                .delay_for_attempt(task.attempt + 1);
            match queue.fail(&task, &err.to_string(), delay).await {
                Ok(TaskFailureOutcome::WillRetry {
                    next_attempt,
                    delay,
                }) => {
                    warn!(
                        error = %err,
                        next_attempt,
                        delay_ms = delay.as_millis() as u64,
                        "task failed, will retry"
                    );
                }
                Ok(TaskFailureOutcome::Dead) => {
                    error!(error = %err, "task exhausted its retries and is dead");
                }
                Err(e) if e.is_claim_lost() => {
                    warn!(error = %err, "task failed after it was reclaimed");
                }
                Err(e) => error!(error = %e, "failed to record task failure"),
            }
        }
    }
}
