use thiserror::Error;

/// Convenience type alias for Results with CapstanError
pub type Result<T> = std::result::Result<T, CapstanError>;

/// Main error type for Capstan
///
/// This enum represents all possible errors that can occur within
/// the Capstan service, providing detailed error context for
/// debugging and error handling.
#[derive(Error, Debug)]
pub enum CapstanError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Validation error on field '{field}': {message}")]
    Validation { field: String, message: String },

    #[error("Task {task_id} execution error: {message}")]
    TaskExecution { task_id: i64, message: String },

    #[error("Invalid state transition for task {task_id}: expected {expected}, found {actual}")]
    InvalidTransition {
        task_id: i64,
        expected: String,
        actual: String,
    },

    #[error("Orchestration error: {0}")]
    Orchestration(String),

    #[error("Dependency graph error: {0}")]
    DependencyGraph(String),

    #[error("Log sink error: {message}")]
    LogSink { message: String },

    #[error("Circuit breaker error: {message}")]
    CircuitBreaker { message: String },

    #[error("Timeout error: {message}")]
    Timeout { message: String },

    #[error("State file corrupted: {0}")]
    Corruption(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl CapstanError {
    /// Build a field-level validation error for the strict admission surface.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }
}
