// Eventline fanout worker
//
// Claims outbox tasks written by the event tracker and runs them:
// - notify: compute recipients and write notifications
// - dispatch_webhooks: match subscriptions and create deliveries
// - deliver_webhook: POST the payload and track delinquency
//
// The same binary serves a small HTTP surface (health, activity feed).

pub mod api;
pub mod config;
pub mod error;
pub mod jobs;
pub mod poller;
pub mod pool;
pub mod telemetry;
pub mod transport;

pub use api::{routes, ApiState};
pub use config::WorkerConfig;
pub use error::WorkerError;
pub use jobs::{FanoutContext, JobOutcome};
pub use poller::{PollerConfig, TaskPoller};
pub use pool::{execute, WorkerPool, WorkerPoolConfig, WorkerPoolStatus};
pub use transport::{HttpTransport, WebhookTransport};
