// Worker configuration from environment variables

use std::net::SocketAddr;
use std::time::Duration;

use eventline_core::FanoutConfig;
use uuid::Uuid;

use crate::error::WorkerError;

/// Runtime settings of the worker binary
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Postgres connection string; `None` runs against the in-memory store
    pub database_url: Option<String>,
    pub worker_id: String,
    /// Maximum concurrent fanout tasks
    pub max_concurrent_tasks: usize,
    /// Poll interval when the queue is empty
    pub poll_interval: Duration,
    /// Claimed tasks older than this are handed out again
    pub stale_threshold: Duration,
    pub webhook_timeout: Duration,
    pub api_addr: SocketAddr,
    pub fanout: FanoutConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            worker_id: format!("worker-{}", Uuid::now_v7()),
            max_concurrent_tasks: 10,
            poll_interval: Duration::from_millis(500),
            stale_threshold: Duration::from_secs(300),
            webhook_timeout: Duration::from_secs(7),
            api_addr: SocketAddr::from(([127, 0, 0, 1], 9400)),
            fanout: FanoutConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, WorkerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys keep their defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self, WorkerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let mut fanout = defaults.fanout;
        if let Some(threshold) = parse::<u32, _>(&lookup, "WEBHOOK_DELINQUENCY_THRESHOLD")? {
            fanout.delinquency.threshold = threshold;
        }
        fanout.validate()?;

        let api_addr = match lookup("API_ADDR") {
            Some(raw) => raw.parse().map_err(|_| {
                WorkerError::Config(format!("API_ADDR is not a socket address: {raw}"))
            })?,
            None => defaults.api_addr,
        };

        Ok(Self {
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            worker_id: lookup("WORKER_ID").unwrap_or(defaults.worker_id),
            max_concurrent_tasks: parse(&lookup, "MAX_CONCURRENT_TASKS")?
                .unwrap_or(defaults.max_concurrent_tasks)
                .max(1),
            poll_interval: parse(&lookup, "POLL_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            stale_threshold: parse(&lookup, "STALE_THRESHOLD_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.stale_threshold),
            webhook_timeout: parse(&lookup, "WEBHOOK_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.webhook_timeout),
            api_addr,
            fanout,
        })
    }
}

fn parse<T, F>(lookup: &F, key: &str) -> Result<Option<T>, WorkerError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| WorkerError::Config(format!("{key} has an invalid value: {raw}"))),
        None => Ok(None),
    }
}
