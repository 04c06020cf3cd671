//! Operator-facing status notifications.
//!
//! Every phase transition, error, and final outcome of the orchestrator is
//! mirrored through a [`StatusHandler`]; transports render the events for
//! their clients.

use async_trait::async_trait;
use chorus_bluetooth::{Address, ControllerId};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::warn;

/// Phase or outcome being reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    /// A reconnection session is starting.
    SessionStart,
    DiscoveryStart,
    DiscoveryComplete,
    DiscoveryTimeout,
    PairingStart,
    PairingSuccess,
    PairingFailed,
    Trusting,
    ConnectStart,
    ConnectSuccess,
    ConnectFailed,
    /// The link is up but the audio route could not be created.
    RouteFailed,
    /// No free or freeable controller exists for the target.
    NoControllerAvailable,
    /// The session gave up after exhausting its retries or its discovery
    /// bound.
    SessionFailed,
}

impl StatusKind {
    /// Whether transports should render this as an error.
    pub fn is_error(self) -> bool {
        matches!(
            self,
            StatusKind::DiscoveryTimeout
                | StatusKind::PairingFailed
                | StatusKind::ConnectFailed
                | StatusKind::RouteFailed
                | StatusKind::NoControllerAvailable
                | StatusKind::SessionFailed
        )
    }
}

/// One status notification.
#[derive(Debug, Clone, Serialize)]
pub struct StatusEvent {
    #[serde(rename = "phase")]
    pub kind: StatusKind,
    pub device: Address,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub controller: Option<ControllerId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusEvent {
    pub fn new(kind: StatusKind, device: Address) -> Self {
        Self {
            kind,
            device,
            controller: None,
            attempt: None,
            error: None,
        }
    }

    pub fn with_controller(mut self, controller: ControllerId) -> Self {
        self.controller = Some(controller);
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Receiver of status notifications.
#[async_trait]
pub trait StatusHandler: Send + Sync {
    async fn on_status(&self, event: StatusEvent);
}

/// Discards all notifications.
pub struct NoOpHandler;

#[async_trait]
impl StatusHandler for NoOpHandler {
    async fn on_status(&self, _event: StatusEvent) {}
}

/// Forwards notifications into a channel without ever blocking the
/// worker; events are dropped (with a log line) if the receiver lags.
pub struct ChannelHandler {
    tx: mpsc::Sender<StatusEvent>,
}

impl ChannelHandler {
    pub fn new(tx: mpsc::Sender<StatusEvent>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl StatusHandler for ChannelHandler {
    async fn on_status(&self, event: StatusEvent) {
        if let Err(e) = self.tx.try_send(event) {
            warn!("Dropping status notification: {}", e);
        }
    }
}

/// Invokes a callback for every notification.
pub struct CallbackHandler<F>
where
    F: Fn(StatusEvent) + Send + Sync,
{
    callback: F,
}

impl<F> CallbackHandler<F>
where
    F: Fn(StatusEvent) + Send + Sync,
{
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

#[async_trait]
impl<F> StatusHandler for CallbackHandler<F>
where
    F: Fn(StatusEvent) + Send + Sync,
{
    async fn on_status(&self, event: StatusEvent) {
        (self.callback)(event);
    }
}
