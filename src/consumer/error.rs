//! Consumer error types

use thiserror::Error;

/// Result type for consumer operations
pub type ConsumerResult<T> = Result<T, ConsumerError>;

/// Consumer error types
#[derive(Error, Debug)]
pub enum ConsumerError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Startup precondition not met; the supervisor never connected
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// Broker channel could not be acquired
    #[error("Connection error: {0}")]
    Connection(String),

    /// Consumption stream could not be opened
    #[error("Consume error: {0}")]
    Consume(String),

    /// Broker rejected an acknowledgment
    #[error("Ack error: {0}")]
    Ack(String),

    /// The delivery was already acknowledged
    #[error("Delivery {0} was already acknowledged")]
    AlreadyAcknowledged(u64),

    /// Document store errors
    #[error("Store error: {0}")]
    Store(String),

    /// Record could not be serialized
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Channel errors
    #[error("Channel error: {0}")]
    Channel(String),
}

impl ConsumerError {
    /// Whether the supervisor should reconnect after this error
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            ConsumerError::Connection(_) | ConsumerError::Consume(_) | ConsumerError::Channel(_)
        )
    }
}

/// Convert from channel send errors
impl<T> From<tokio::sync::mpsc::error::SendError<T>> for ConsumerError {
    fn from(err: tokio::sync::mpsc::error::SendError<T>) -> Self {
        ConsumerError::Channel(format!("Failed to send: {}", err))
    }
}

impl From<serde_json::Error> for ConsumerError {
    fn from(err: serde_json::Error) -> Self {
        ConsumerError::Serialization(err.to_string())
    }
}

/// Failure of a single processing attempt
///
/// Handler errors, validation errors and recovered panics all end up here,
/// so callers see one result shape whatever went wrong.
#[derive(Error, Debug)]
pub enum JobError {
    /// The event failed decoding or has no name
    #[error("event is not valid")]
    InvalidEvent,

    /// The event decoded but its name is empty
    #[error("event name is empty")]
    EmptyName,

    /// No handler is registered for the event name
    #[error("couldn't find task for event `{name}`")]
    TaskNotFound {
        /// Event name that had no handler
        name: String,
    },

    /// The handler returned an error
    #[error("{0}")]
    Task(anyhow::Error),

    /// The handler panicked
    #[error("task panicked: {message}")]
    Panicked {
        /// Panic payload rendered as text
        message: String,
    },
}

impl JobError {
    /// Short message stored as `error_message`
    pub fn error_message(&self) -> String {
        self.to_string()
    }

    /// Full detail stored as `error_backtrace`
    pub fn error_backtrace(&self) -> String {
        match self {
            JobError::Task(err) => format!("{:?}", err),
            other => format!("ERROR:\n{}\n\n{:?}", other, other),
        }
    }

    /// Whether this failure came from a recovered panic
    pub fn is_fault(&self) -> bool {
        matches!(self, JobError::Panicked { .. })
    }
}
