//! # chorus-bluetooth
//!
//! The BlueZ boundary of the chorus orchestrator.
//!
//! This crate owns everything that talks to the Bluetooth protocol stack:
//!
//! - Typed addresses and object locations ([`Address`], [`ControllerId`],
//!   [`DevicePath`])
//! - Point-in-time captures of the stack's adapter/device object tree
//!   ([`Snapshot`])
//! - The [`Stack`] trait, the single seam through which the rest of the
//!   system issues protocol operations and receives stack events
//! - [`BluezStack`], the production implementation backed by BlueZ via
//!   the `bluer` crate
//!
//! The orchestration logic itself lives in `chorus-core` and is written
//! entirely against [`Stack`], so it can be exercised without radios.
//!
//! ## Requirements
//!
//! The `bluer`-backed implementation is Linux-only and requires a running
//! BlueZ daemon (bluetooth service).

pub mod address;
pub mod bluez;
pub mod device;
pub mod error;
pub mod snapshot;
pub mod stack;

pub use address::{Address, ControllerId, DevicePath};
pub use bluez::BluezStack;
pub use device::{DeviceView, A2DP_SINK_UUID, A2DP_SOURCE_UUID};
pub use error::{Result, StackError};
pub use snapshot::{ControllerView, Snapshot};
pub use stack::{Stack, StackEvent};
