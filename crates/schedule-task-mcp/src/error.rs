use schedule_mcp_transport::error::TransportError;
use thiserror::Error;

pub type SchedulerResult<T> = core::result::Result<T, SchedulerError>;

/// Error taxonomy of the scheduler service.
///
/// `Validation` and `TaskNotFound` surface to the caller as tool-call
/// errors and touch no state. `Store` aborts the current operation.
/// Execution-side failures (`Execution`, `SamplingTimeout`, `Transport`)
/// are captured by the fire pipeline and persisted as error outcomes.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("{0}")]
    Validation(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Sampling request timed out after {0}s")]
    SamplingTimeout(u64),

    #[error("{0}")]
    Execution(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SchedulerError {
    pub fn validation(message: impl Into<String>) -> Self {
        SchedulerError::Validation(message.into())
    }
}
