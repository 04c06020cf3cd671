//! Error types for the orchestration core.

use chorus_bluetooth::{ControllerId, StackError};
use thiserror::Error;

/// Failures surfaced by the orchestration core.
#[derive(Error, Debug)]
pub enum CoreError {
    /// The controller is not in the adapter directory, even after a
    /// refresh.
    #[error("controller not available: {0}")]
    UnknownController(ControllerId),

    /// Underlying protocol-stack failure.
    #[error(transparent)]
    Stack(#[from] StackError),
}

/// Convenience Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
