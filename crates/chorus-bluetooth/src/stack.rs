//! The protocol-stack seam.
//!
//! Everything the orchestrator needs from the Bluetooth stack is expressed
//! through the [`Stack`] trait: protocol operations on devices, discovery
//! control per controller, object-tree capture, and an event subscription.
//! The production implementation is [`crate::BluezStack`]; tests substitute
//! scripted implementations.

use async_trait::async_trait;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::address::{Address, ControllerId, DevicePath};
use crate::error::Result;
use crate::snapshot::Snapshot;

/// Asynchronous event delivered by the stack's own event machinery.
///
/// Consumers must treat these as wake-up hints only: handlers never call
/// back into the stack from the delivery task; they translate events into
/// queued work.
#[derive(Debug, Clone)]
pub enum StackEvent {
    /// A device object appeared under a controller.
    DeviceAdded {
        controller: ControllerId,
        address: Address,
    },
    /// A device's Connected property flipped.
    ConnectedChanged { address: Address, connected: bool },
}

/// Operations the orchestrator issues against the Bluetooth stack.
#[async_trait]
pub trait Stack: Send + Sync {
    /// Capture the current adapter/device object tree.
    async fn snapshot(&self) -> Result<Snapshot>;

    /// Return the device's location under the given controller if the
    /// object tree currently shows it there.
    async fn find_device(
        &self,
        controller: &ControllerId,
        address: &Address,
    ) -> Result<Option<DevicePath>>;

    /// Start discovery on a controller. Fails with an "in progress"
    /// condition if discovery is already running.
    async fn start_discovery(&self, controller: &ControllerId) -> Result<()>;

    /// Stop discovery on a controller.
    async fn stop_discovery(&self, controller: &ControllerId) -> Result<()>;

    /// Initiate pairing with a device.
    async fn pair(&self, path: &DevicePath) -> Result<()>;

    /// Mark a device trusted or untrusted.
    async fn set_trusted(&self, path: &DevicePath, trusted: bool) -> Result<()>;

    /// Establish the base link to a device.
    async fn connect(&self, path: &DevicePath) -> Result<()>;

    /// Request a specific profile connection on an already-linked device.
    async fn connect_profile(&self, path: &DevicePath, profile: Uuid) -> Result<()>;

    /// Tear down the link to a device.
    async fn disconnect(&self, path: &DevicePath) -> Result<()>;

    /// Remove the device object (unpair and forget).
    async fn remove_device(&self, path: &DevicePath) -> Result<()>;

    /// Subscribe to asynchronous stack events.
    fn events(&self) -> broadcast::Receiver<StackEvent>;
}
