use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the overseer supervisor
#[derive(Debug, Error)]
pub enum OverseerError {
    // Spec errors, local to one declaration
    #[error("Invalid process spec '{name}': {reason}")]
    Validation { name: String, reason: String },

    #[error("Invalid configuration file: {0}")]
    InvalidConfig(String),

    // Process lifecycle errors
    #[error("Failed to launch process '{0}': {1}")]
    Launch(String, String),

    #[error("Process '{0}' exited: {1}")]
    RuntimeExit(String, String),

    #[error("Process not found: {0}")]
    ProcessNotFound(String),

    #[error("Timed out stopping process {0}: {1}")]
    Timeout(String, String),

    #[error("Signal error: {0}")]
    SignalError(String),

    // Log errors, never fatal to a process
    #[error("Failed to write log {0}: {1}")]
    LogWrite(String, String),

    #[error("Log error: {0}")]
    LogError(String),

    // IPC and daemon errors
    #[error("IPC error: {0}")]
    IpcError(String),

    #[error("Failed to connect to daemon: {0}")]
    ConnectionError(String),

    #[error("IPC protocol error: {0}")]
    ProtocolError(String),

    #[error("Daemon not running")]
    DaemonNotRunning,

    #[error("Daemon already running (PID {0})")]
    DaemonAlreadyRunning(u32),

    #[error("Daemon error: {0}")]
    DaemonError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("{0}")]
    Other(String),
}

impl OverseerError {
    pub fn validation(name: impl Into<String>, reason: impl Into<String>) -> Self {
        OverseerError::Validation {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Failure class of this error, as carried over IPC
    pub fn kind(&self) -> ErrorKind {
        match self {
            OverseerError::Validation { .. } | OverseerError::InvalidConfig(_) => {
                ErrorKind::InvalidSpec
            }
            OverseerError::ProcessNotFound(_) => ErrorKind::NotFound,
            OverseerError::Timeout(..) => ErrorKind::Timeout,
            OverseerError::Launch(..) => ErrorKind::Launch,
            OverseerError::DaemonNotRunning => ErrorKind::DaemonNotRunning,
            _ => ErrorKind::Internal,
        }
    }
}

/// Serializable failure class, mapped one-to-one onto CLI exit codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Internal,
    InvalidSpec,
    NotFound,
    Timeout,
    Launch,
    DaemonNotRunning,
}

impl ErrorKind {
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorKind::Internal => 1,
            ErrorKind::InvalidSpec => 2,
            ErrorKind::NotFound => 3,
            ErrorKind::Timeout => 4,
            ErrorKind::Launch => 5,
            ErrorKind::DaemonNotRunning => 6,
        }
    }

    /// Rank used to pick one exit code when several names failed differently
    pub fn severity(self) -> u8 {
        match self {
            ErrorKind::Internal => 1,
            ErrorKind::NotFound => 2,
            ErrorKind::InvalidSpec => 3,
            ErrorKind::Launch => 4,
            ErrorKind::Timeout => 5,
            ErrorKind::DaemonNotRunning => 6,
        }
    }
}

/// Result type alias for overseer operations
pub type Result<T> = std::result::Result<T, OverseerError>;
