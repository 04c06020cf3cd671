//! Error types for protocol-stack operations.

use thiserror::Error;

/// Failures reported by the Bluetooth protocol stack.
#[derive(Error, Debug)]
pub enum StackError {
    /// The referenced controller does not exist.
    #[error("controller not found: {0}")]
    ControllerNotFound(String),

    /// The referenced device object does not exist.
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// The stack already holds what we asked it to create
    /// (e.g., pairing a device that is already paired).
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The operation is already running or the stack is busy with it
    /// (e.g., starting discovery twice).
    #[error("operation in progress: {0}")]
    InProgress(String),

    /// The stack rejected the operation.
    #[error("{op} rejected: {message}")]
    Rejected { op: &'static str, message: String },

    /// The operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// Session-level failure talking to the stack daemon.
    #[error("stack session error: {0}")]
    Session(String),
}

impl StackError {
    /// True for the "already exists" class of failures, which pairing
    /// treats as success.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, StackError::AlreadyExists(_))
    }

    /// True when the stack reports the operation as already running or
    /// busy; discovery start swallows this, discovery stop logs it.
    pub fn is_in_progress(&self) -> bool {
        matches!(self, StackError::InProgress(_))
    }

    /// True when the referenced object is missing.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StackError::ControllerNotFound(_) | StackError::DeviceNotFound(_)
        )
    }
}

impl From<bluer::Error> for StackError {
    fn from(err: bluer::Error) -> Self {
        use bluer::ErrorKind;
        match err.kind {
            ErrorKind::AlreadyExists => StackError::AlreadyExists(err.message),
            ErrorKind::InProgress => StackError::InProgress(err.message),
            ErrorKind::NotFound => StackError::DeviceNotFound(err.message),
            _ => StackError::Rejected {
                op: "bluez",
                message: err.message,
            },
        }
    }
}

/// Convenience Result type for stack operations.
pub type Result<T> = std::result::Result<T, StackError>;
