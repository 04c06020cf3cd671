//! Error types for audio-routing operations.

use thiserror::Error;

/// Audio-routing failures.
#[derive(Error, Debug)]
pub enum AudioError {
    /// The PulseAudio daemon is not responding.
    #[error("PulseAudio daemon is not responding")]
    DaemonUnavailable,

    /// No sink matching the requested name appeared in time.
    #[error("sink not found: {0}")]
    SinkNotFound(String),

    /// A `pactl` invocation failed.
    #[error("pactl {command} failed: {message}")]
    CommandFailed { command: String, message: String },

    /// I/O error spawning the subprocess.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience Result type for audio operations.
pub type Result<T> = std::result::Result<T, AudioError>;
