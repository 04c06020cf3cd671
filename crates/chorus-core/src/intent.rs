//! Queued units of orchestration work.

use chorus_bluetooth::Address;

/// One user- or event-driven request, consumed at most once by the intent
/// worker, strictly in arrival order.
#[derive(Debug, Clone)]
pub enum Intent {
    /// Connect one speaker, rebalancing controllers as needed.
    ConnectOne {
        target: Address,
        /// The caller's full configured speaker set; used to decide which
        /// existing connections may be displaced.
        allowed: Vec<Address>,
    },
    /// Disconnect a speaker from every controller it is attached to.
    Disconnect { address: Address },
    /// Replace or extend the tracked speaker set.
    SetExpected {
        addresses: Vec<Address>,
        replace: bool,
    },
    /// Reconcile the audio route with a reported link flip. Raised
    /// internally from stack events, never by transports.
    LoopbackSync { address: Address, connected: bool },
}

impl Intent {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Intent::ConnectOne { .. } => "connect_one",
            Intent::Disconnect { .. } => "disconnect",
            Intent::SetExpected { .. } => "set_expected",
            Intent::LoopbackSync { .. } => "loopback_sync",
        }
    }
}
