//! Bookkeeping of live audio routes.

use std::collections::HashSet;
use std::sync::Arc;

use chorus_audio::AudioRouter;
use chorus_bluetooth::Address;
use tracing::{debug, info, warn};

/// Which devices currently have a live loopback route. Mutated only from
/// the intent worker's task.
pub struct LoopbackTracker {
    router: Arc<dyn AudioRouter>,
    routed: HashSet<Address>,
}

impl LoopbackTracker {
    pub fn new(router: Arc<dyn AudioRouter>) -> Self {
        Self {
            router,
            routed: HashSet::new(),
        }
    }

    pub fn is_routed(&self, address: &Address) -> bool {
        self.routed.contains(address)
    }

    /// Create the device's route. The device is marked routed only once
    /// the collaborator reports success. Returns whether a route is live
    /// afterwards.
    pub async fn route(&mut self, address: &Address, latency_ms: u32) -> bool {
        if self.routed.contains(address) {
            debug!("Loopback for {} already live", address);
            return true;
        }
        match self.router.create_route(&address.sink_prefix(), latency_ms).await {
            Ok(()) => {
                self.routed.insert(address.clone());
                info!("Loopback established for {}", address);
                true
            }
            Err(e) => {
                warn!("Loopback creation for {} failed: {}", address, e);
                false
            }
        }
    }

    /// Remove the device's route. The routed mark is cleared even if the
    /// collaborator reports a failure: repeating a removal is always safe.
    pub async fn unroute(&mut self, address: &Address) {
        if let Err(e) = self.router.remove_route(&address.sink_prefix()).await {
            warn!("Loopback removal for {} failed: {}", address, e);
        }
        self.routed.remove(address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::MockRouter;

    const DEV: &str = "AA:AA:AA:AA:AA:AA";

    #[tokio::test]
    async fn routes_once_and_remembers() {
        let router = Arc::new(MockRouter::new());
        let mut tracker = LoopbackTracker::new(router.clone());
        let addr = Address::new(DEV);

        assert!(tracker.route(&addr, 100).await);
        assert!(tracker.route(&addr, 100).await);
        assert_eq!(router.created(), 1);
        assert!(tracker.is_routed(&addr));
    }

    #[tokio::test]
    async fn failed_creation_leaves_device_unrouted() {
        let router = Arc::new(MockRouter::new());
        router.fail_creates(true);
        let mut tracker = LoopbackTracker::new(router.clone());
        let addr = Address::new(DEV);

        assert!(!tracker.route(&addr, 100).await);
        assert!(!tracker.is_routed(&addr));

        // A later retry can still succeed.
        router.fail_creates(false);
        assert!(tracker.route(&addr, 100).await);
        assert!(tracker.is_routed(&addr));
    }

    #[tokio::test]
    async fn unroute_clears_the_mark_even_on_failure() {
        let router = Arc::new(MockRouter::new());
        let mut tracker = LoopbackTracker::new(router.clone());
        let addr = Address::new(DEV);

        tracker.route(&addr, 100).await;
        router.fail_removes(true);
        tracker.unroute(&addr).await;
        assert!(!tracker.is_routed(&addr));
    }
}
