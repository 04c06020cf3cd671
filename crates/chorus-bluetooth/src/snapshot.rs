//! Point-in-time captures of the stack's object tree.

use crate::address::{Address, ControllerId, DevicePath};
use crate::device::DeviceView;

/// Everything one controller exposes at capture time.
#[derive(Debug, Clone)]
pub struct ControllerView {
    /// Adapter name (e.g., "hci0").
    pub id: ControllerId,
    /// The controller's own Bluetooth address.
    pub address: Address,
    /// Devices attached to this controller, in tree order.
    pub devices: Vec<DeviceView>,
}

impl ControllerView {
    /// Look up a device under this controller.
    pub fn device(&self, address: &Address) -> Option<&DeviceView> {
        self.devices.iter().find(|d| &d.address == address)
    }
}

/// A capture of the whole adapter/device tree.
///
/// Iteration order over [`Snapshot::controllers`] is the stack's
/// enumeration order at capture time; it is deterministic per snapshot
/// but carries no other meaning.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub controllers: Vec<ControllerView>,
}

impl Snapshot {
    /// Look up one controller by id.
    pub fn controller(&self, id: &ControllerId) -> Option<&ControllerView> {
        self.controllers.iter().find(|c| &c.id == id)
    }

    /// Look up a device under a specific controller.
    pub fn device_on(&self, controller: &ControllerId, address: &Address) -> Option<&DeviceView> {
        self.controller(controller).and_then(|c| c.device(address))
    }

    /// Every controller the device is currently connected on, in snapshot
    /// order.
    pub fn connected_on(&self, address: &Address) -> Vec<ControllerId> {
        self.controllers
            .iter()
            .filter(|c| c.device(address).is_some_and(|d| d.connected))
            .map(|c| c.id.clone())
            .collect()
    }

    /// Locations of every connected instance of the device, in snapshot
    /// order.
    pub fn connected_paths(&self, address: &Address) -> Vec<DevicePath> {
        self.connected_on(address)
            .into_iter()
            .map(|controller| DevicePath::new(controller, address.clone()))
            .collect()
    }

    /// All paired devices across controllers, deduplicated by address.
    pub fn paired_devices(&self) -> Vec<&DeviceView> {
        let mut seen = Vec::new();
        let mut out = Vec::new();
        for controller in &self.controllers {
            for device in &controller.devices {
                if device.paired && !seen.contains(&&device.address) {
                    seen.push(&device.address);
                    out.push(device);
                }
            }
        }
        out
    }
}
