//! Orchestrator configuration.

use std::env;
use std::time::Duration;

use chorus_bluetooth::ControllerId;
use thiserror::Error;

/// How long a reconnection session waits for the target to show up in the
/// object tree.
const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(20);

/// Pairing/connect attempts per reconnection session before giving up.
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Loopback latency applied when a route is created without an explicit
/// latency request.
const DEFAULT_LATENCY_MS: u32 = 100;

/// Intent queue depth.
const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The reserved controller must be named explicitly; allocation would
    /// otherwise hand the control-channel radio to a speaker.
    #[error("CHORUS_RESERVED_ADAPTER not set - cannot pick the reserved controller")]
    MissingReservedController,

    /// An override variable did not parse.
    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

/// Runtime configuration for the orchestrator.
#[derive(Debug, Clone)]
pub struct Config {
    /// Controller that is never allocated to speakers (e.g., "hci1").
    pub reserved_controller: ControllerId,
    /// Bound on each discovery wait.
    pub discovery_timeout: Duration,
    /// Attempt cap per reconnection session.
    pub max_attempts: u32,
    /// Default loopback latency in milliseconds.
    pub default_latency_ms: u32,
    /// Intent queue capacity.
    pub queue_capacity: usize,
}

impl Config {
    /// Defaults with the given reserved controller.
    pub fn new(reserved_controller: ControllerId) -> Self {
        Self {
            reserved_controller,
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            default_latency_ms: DEFAULT_LATENCY_MS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    /// Load from the environment.
    ///
    /// `CHORUS_RESERVED_ADAPTER` is required; `CHORUS_DISCOVERY_TIMEOUT_SECS`,
    /// `CHORUS_MAX_ATTEMPTS`, and `CHORUS_LATENCY_MS` override the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let reserved = env::var("CHORUS_RESERVED_ADAPTER")
            .map_err(|_| ConfigError::MissingReservedController)?;
        let mut config = Self::new(ControllerId::new(reserved));

        if let Ok(value) = env::var("CHORUS_DISCOVERY_TIMEOUT_SECS") {
            let secs: u64 = value.parse().map_err(|_| ConfigError::Invalid {
                key: "CHORUS_DISCOVERY_TIMEOUT_SECS",
                value,
            })?;
            config.discovery_timeout = Duration::from_secs(secs);
        }
        if let Ok(value) = env::var("CHORUS_MAX_ATTEMPTS") {
            config.max_attempts = value.parse().map_err(|_| ConfigError::Invalid {
                key: "CHORUS_MAX_ATTEMPTS",
                value,
            })?;
        }
        if let Ok(value) = env::var("CHORUS_LATENCY_MS") {
            config.default_latency_ms = value.parse().map_err(|_| ConfigError::Invalid {
                key: "CHORUS_LATENCY_MS",
                value,
            })?;
        }

        Ok(config)
    }
}
