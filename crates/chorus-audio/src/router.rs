//! The audio-routing seam.

use async_trait::async_trait;

use crate::error::Result;

/// Creates and removes audio routes from the shared output to individual
/// speaker sinks.
///
/// Both operations are idempotent: creating a route replaces any existing
/// route to the same sink, and removing an absent route succeeds.
#[async_trait]
pub trait AudioRouter: Send + Sync {
    /// Route the shared output to the sink whose name starts with
    /// `sink_prefix`, with the given loopback latency. Waits briefly for
    /// the sink to appear if it is not there yet.
    async fn create_route(&self, sink_prefix: &str, latency_ms: u32) -> Result<()>;

    /// Remove every route targeting a sink whose name starts with
    /// `sink_prefix`.
    async fn remove_route(&self, sink_prefix: &str) -> Result<()>;
}
