//! Identifiers for devices and radio controllers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Bluetooth device address, normalized to uppercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address(pub String);

impl Address {
    /// Create from a MAC address string (e.g., "00:11:22:33:44:55").
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into().to_uppercase())
    }

    /// The PulseAudio sink name prefix for this device
    /// (e.g., "bluez_sink.00_11_22_33_44_55").
    pub fn sink_prefix(&self) -> String {
        format!("bluez_sink.{}", self.0.replace(':', "_"))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<bluer::Address> for Address {
    fn from(addr: bluer::Address) -> Self {
        Self(addr.to_string().to_uppercase())
    }
}

/// One physical radio controller, identified by its adapter name
/// (e.g., "hci0").
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ControllerId(pub String);

impl ControllerId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl fmt::Display for ControllerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable location of one device object under one controller.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DevicePath {
    pub controller: ControllerId,
    pub address: Address,
}

impl DevicePath {
    pub fn new(controller: ControllerId, address: Address) -> Self {
        Self {
            controller,
            address,
        }
    }
}

impl fmt::Display for DevicePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.controller, self.address)
    }
}
