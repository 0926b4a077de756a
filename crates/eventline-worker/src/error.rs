// Worker errors

use eventline_core::EventlineError;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// Invalid environment or fanout configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Store or domain error
    #[error(transparent)]
    Eventline(#[from] EventlineError),

    /// HTTP client setup error
    #[error("transport error: {0}")]
    Transport(String),

    #[error("worker pool is already running")]
    AlreadyRunning,

    #[error("graceful shutdown timed out")]
    ShutdownTimeout,
}
