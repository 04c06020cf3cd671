//! BlueZ-backed [`Stack`] implementation.
//!
//! Wraps a `bluer` session. Discovery is held open per controller by a
//! drain task that owns the discovery stream (dropping the stream releases
//! the stack's discovery session); device "Connected" flips are watched by
//! per-device monitor tasks. Both kinds of task only forward events into
//! the broadcast channel; they never issue protocol calls themselves.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bluer::{Adapter, AdapterEvent, Device, DeviceEvent, DeviceProperty, Session};
use futures::StreamExt;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::address::{Address, ControllerId, DevicePath};
use crate::device::DeviceView;
use crate::error::{Result, StackError};
use crate::snapshot::{ControllerView, Snapshot};
use crate::stack::{Stack, StackEvent};

/// Capacity of the stack event fan-out channel.
const EVENT_CHANNEL_CAPACITY: usize = 128;

/// Production [`Stack`] backed by the BlueZ daemon.
pub struct BluezStack {
    session: Session,
    events_tx: broadcast::Sender<StackEvent>,
    discoveries: Mutex<HashMap<ControllerId, JoinHandle<()>>>,
    monitors: Arc<Mutex<HashMap<Address, JoinHandle<()>>>>,
}

impl BluezStack {
    /// Connect to the BlueZ daemon.
    pub async fn new() -> Result<Self> {
        let session = Session::new()
            .await
            .map_err(|e| StackError::Session(format!("failed to create BlueZ session: {e}")))?;

        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            session,
            events_tx,
            discoveries: Mutex::new(HashMap::new()),
            monitors: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Attach Connected-property monitors to every device currently in the
    /// object tree. Call once at startup; devices appearing later are
    /// picked up by the discovery drain tasks.
    pub async fn monitor_known_devices(&self) -> Result<()> {
        for name in self.adapter_names().await? {
            let adapter = match self.session.adapter(&name) {
                Ok(adapter) => adapter,
                Err(e) => {
                    warn!("Failed to open adapter {}: {}", name, e);
                    continue;
                }
            };
            for addr in adapter.device_addresses().await.unwrap_or_default() {
                monitor_device(&adapter, addr, self.events_tx.clone(), &self.monitors).await;
            }
        }
        Ok(())
    }

    async fn adapter_names(&self) -> Result<Vec<String>> {
        self.session
            .adapter_names()
            .await
            .map_err(|e| StackError::Session(format!("failed to list adapters: {e}")))
    }

    fn adapter(&self, controller: &ControllerId) -> Result<Adapter> {
        self.session
            .adapter(&controller.0)
            .map_err(|_| StackError::ControllerNotFound(controller.0.clone()))
    }

    fn device(&self, path: &DevicePath) -> Result<Device> {
        let adapter = self.adapter(&path.controller)?;
        adapter
            .device(bluer_address(&path.address)?)
            .map_err(|e| StackError::DeviceNotFound(format!("{}: {}", path, e)))
    }

    async fn device_view(device: &Device) -> DeviceView {
        DeviceView {
            address: Address::from(device.address()),
            alias: device.alias().await.ok(),
            paired: device.is_paired().await.unwrap_or(false),
            trusted: device.is_trusted().await.unwrap_or(false),
            connected: device.is_connected().await.unwrap_or(false),
            uuids: device.uuids().await.ok().flatten().unwrap_or_default(),
        }
    }
}

#[async_trait]
impl Stack for BluezStack {
    async fn snapshot(&self) -> Result<Snapshot> {
        let mut controllers = Vec::new();

        for name in self.adapter_names().await? {
            let adapter = match self.session.adapter(&name) {
                Ok(adapter) => adapter,
                Err(e) => {
                    warn!("Failed to open adapter {}: {}", name, e);
                    continue;
                }
            };
            let address = match adapter.address().await {
                Ok(addr) => Address::from(addr),
                Err(e) => {
                    warn!("Failed to read address of {}: {}", name, e);
                    continue;
                }
            };

            let mut devices = Vec::new();
            for addr in adapter.device_addresses().await.unwrap_or_default() {
                match adapter.device(addr) {
                    Ok(device) => devices.push(Self::device_view(&device).await),
                    Err(e) => debug!("Failed to get device {}: {}", addr, e),
                }
            }

            controllers.push(ControllerView {
                id: ControllerId::new(name),
                address,
                devices,
            });
        }

        Ok(Snapshot { controllers })
    }

    async fn find_device(
        &self,
        controller: &ControllerId,
        address: &Address,
    ) -> Result<Option<DevicePath>> {
        let adapter = self.adapter(controller)?;
        let wanted = bluer_address(address)?;
        let present = adapter
            .device_addresses()
            .await
            .map_err(StackError::from)?
            .contains(&wanted);
        Ok(present.then(|| DevicePath::new(controller.clone(), address.clone())))
    }

    async fn start_discovery(&self, controller: &ControllerId) -> Result<()> {
        let mut discoveries = self.discoveries.lock().await;
        if discoveries.contains_key(controller) {
            return Err(StackError::InProgress(format!(
                "discovery already running on {controller}"
            )));
        }

        let adapter = self.adapter(controller)?;
        let monitor_adapter = adapter.clone();
        let events = adapter.discover_devices().await.map_err(StackError::from)?;

        info!("Started discovery on {}", controller);

        let tx = self.events_tx.clone();
        let monitors = self.monitors.clone();
        let ctrl = controller.clone();
        let handle = tokio::spawn(async move {
            futures::pin_mut!(events);
            while let Some(event) = events.next().await {
                match event {
                    AdapterEvent::DeviceAdded(addr) => {
                        let _ = tx.send(StackEvent::DeviceAdded {
                            controller: ctrl.clone(),
                            address: Address::from(addr),
                        });
                        monitor_device(&monitor_adapter, addr, tx.clone(), &monitors).await;
                    }
                    AdapterEvent::DeviceRemoved(addr) => {
                        debug!("Device removed: {}", addr);
                    }
                    _ => {}
                }
            }
        });
        discoveries.insert(controller.clone(), handle);
        Ok(())
    }

    async fn stop_discovery(&self, controller: &ControllerId) -> Result<()> {
        let mut discoveries = self.discoveries.lock().await;
        match discoveries.remove(controller) {
            Some(handle) => {
                // Dropping the drain task releases the bluer discovery
                // session, which issues StopDiscovery.
                handle.abort();
                info!("Stopped discovery on {}", controller);
                Ok(())
            }
            None => {
                debug!("Discovery not running on {}", controller);
                Ok(())
            }
        }
    }

    async fn pair(&self, path: &DevicePath) -> Result<()> {
        let device = self.device(path)?;
        if device.is_paired().await.unwrap_or(false) {
            debug!("Device {} is already paired", path);
            return Ok(());
        }
        device.pair().await.map_err(StackError::from)
    }

    async fn set_trusted(&self, path: &DevicePath, trusted: bool) -> Result<()> {
        let device = self.device(path)?;
        device.set_trusted(trusted).await.map_err(StackError::from)
    }

    async fn connect(&self, path: &DevicePath) -> Result<()> {
        let device = self.device(path)?;
        device.connect().await.map_err(StackError::from)
    }

    async fn connect_profile(&self, path: &DevicePath, profile: Uuid) -> Result<()> {
        let device = self.device(path)?;
        device
            .connect_profile(&profile)
            .await
            .map_err(StackError::from)
    }

    async fn disconnect(&self, path: &DevicePath) -> Result<()> {
        let device = self.device(path)?;
        if !device.is_connected().await.unwrap_or(false) {
            debug!("Device {} is not connected", path);
            return Ok(());
        }
        device.disconnect().await.map_err(StackError::from)
    }

    async fn remove_device(&self, path: &DevicePath) -> Result<()> {
        let adapter = self.adapter(&path.controller)?;
        adapter
            .remove_device(bluer_address(&path.address)?)
            .await
            .map_err(StackError::from)
    }

    fn events(&self) -> broadcast::Receiver<StackEvent> {
        self.events_tx.subscribe()
    }
}

fn bluer_address(address: &Address) -> Result<bluer::Address> {
    address
        .0
        .parse()
        .map_err(|_| StackError::DeviceNotFound(address.0.clone()))
}

/// Spawn a task that forwards the device's Connected-property flips into
/// the event channel. Idempotent per address.
async fn monitor_device(
    adapter: &Adapter,
    addr: bluer::Address,
    tx: broadcast::Sender<StackEvent>,
    monitors: &Arc<Mutex<HashMap<Address, JoinHandle<()>>>>,
) {
    let address = Address::from(addr);
    let mut monitors = monitors.lock().await;
    if monitors.contains_key(&address) {
        return;
    }

    let device = match adapter.device(addr) {
        Ok(device) => device,
        Err(e) => {
            debug!("Cannot monitor {}: {}", address, e);
            return;
        }
    };

    let watched = address.clone();
    let handle = tokio::spawn(async move {
        let events = match device.events().await {
            Ok(events) => events,
            Err(e) => {
                debug!("No property events for {}: {}", watched, e);
                return;
            }
        };
        futures::pin_mut!(events);
        while let Some(event) = events.next().await {
            match event {
                DeviceEvent::PropertyChanged(DeviceProperty::Connected(connected)) => {
                    let _ = tx.send(StackEvent::ConnectedChanged {
                        address: watched.clone(),
                        connected,
                    });
                }
                _ => {}
            }
        }
    });
    monitors.insert(address, handle);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore = "requires real Bluetooth hardware"]
    async fn session_creation() {
        let stack = BluezStack::new().await;
        assert!(stack.is_ok() || matches!(stack.err(), Some(StackError::Session(_))));
    }

    #[tokio::test]
    #[ignore = "requires real Bluetooth hardware"]
    async fn snapshot_lists_adapters() {
        if let Ok(stack) = BluezStack::new().await {
            let snapshot = stack.snapshot().await;
            assert!(snapshot.is_ok());
        }
    }

    #[test]
    fn address_parse_failure_maps_to_not_found() {
        let err = bluer_address(&Address::new("not-a-mac")).unwrap_err();
        assert!(err.is_not_found());
    }
}
