//! Device properties as seen in the stack's object tree.

use std::collections::HashSet;

use uuid::Uuid;

use crate::address::Address;

/// A2DP Sink UUID (0000110b-0000-1000-8000-00805f9b34fb): the remote
/// device can receive audio from us.
pub const A2DP_SINK_UUID: Uuid = Uuid::from_u128(0x0000110b_0000_1000_8000_00805f9b34fb);

/// A2DP Source UUID (0000110a-0000-1000-8000-00805f9b34fb): the remote
/// device can send audio to us.
pub const A2DP_SOURCE_UUID: Uuid = Uuid::from_u128(0x0000110a_0000_1000_8000_00805f9b34fb);

/// Properties of one device under one controller, captured at snapshot
/// time.
#[derive(Debug, Clone)]
pub struct DeviceView {
    /// Device Bluetooth address.
    pub address: Address,
    /// User-friendly name, if the stack has resolved one.
    pub alias: Option<String>,
    /// Whether the device is paired.
    pub paired: bool,
    /// Whether the device is trusted.
    pub trusted: bool,
    /// Whether the device is connected.
    pub connected: bool,
    /// Service UUIDs advertised by the device.
    pub uuids: HashSet<Uuid>,
}

impl DeviceView {
    /// Check if the device advertises the A2DP sink profile (it can play
    /// audio we send).
    pub fn supports_audio_sink(&self) -> bool {
        self.uuids.contains(&A2DP_SINK_UUID)
    }

    /// Display name (alias if resolved, otherwise the address).
    pub fn display_name(&self) -> String {
        self.alias
            .clone()
            .unwrap_or_else(|| self.address.to_string())
    }
}

impl Default for DeviceView {
    fn default() -> Self {
        Self {
            address: Address::new("00:00:00:00:00:00"),
            alias: None,
            paired: false,
            trusted: false,
            connected: false,
            uuids: HashSet::new(),
        }
    }
}
