//! Serialized discovery across shared radio controllers.
//!
//! Any number of callers may want discovery running on the same controller
//! at once; the stack only tolerates one StartDiscovery/StopDiscovery
//! sequence. The coordinator reference-counts per controller, issuing the
//! start exactly on the 0→1 transition and the stop exactly on 1→0, and
//! offers a bounded wait for a device to appear in the object tree.
//!
//! Unlike the rest of the orchestrator this component is entered
//! concurrently (the intent worker and transport callers may overlap); its
//! correctness rests entirely on its own lock and wakeup, independent of
//! the worker's serialization.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chorus_bluetooth::{Address, ControllerId, DevicePath, Stack, StackEvent};
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::error::{CoreError, Result};

struct AdapterEntry {
    refcount: u32,
}

/// Reference-counted discovery control, one entry per controller.
pub struct DiscoveryCoordinator {
    stack: Arc<dyn Stack>,
    adapters: Mutex<HashMap<ControllerId, AdapterEntry>>,
    /// Pinged whenever the stack reports a new device object; waiters
    /// re-check the tree on every wake.
    added: Arc<Notify>,
}

impl DiscoveryCoordinator {
    /// Build the coordinator and start listening for object-added events.
    pub fn new(stack: Arc<dyn Stack>) -> Arc<Self> {
        let added = Arc::new(Notify::new());
        let coordinator = Arc::new(Self {
            stack: stack.clone(),
            adapters: Mutex::new(HashMap::new()),
            added: added.clone(),
        });

        let mut events = stack.events();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(StackEvent::DeviceAdded { .. }) => added.notify_waiters(),
                    Ok(_) => {}
                    // Missed events are harmless: waiters re-check the
                    // tree, so a spurious wake covers the gap.
                    Err(broadcast::error::RecvError::Lagged(_)) => added.notify_waiters(),
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        coordinator
    }

    /// Rebuild the controller map from the current object tree, keeping
    /// refcounts of controllers that are still present.
    pub async fn refresh_adapters(&self) -> Result<()> {
        let snapshot = self.stack.snapshot().await?;
        let mut adapters = self.adapters.lock().await;
        let old: HashMap<ControllerId, AdapterEntry> = adapters.drain().collect();
        for view in snapshot.controllers {
            let refcount = old.get(&view.id).map_or(0, |e| e.refcount);
            adapters.insert(view.id, AdapterEntry { refcount });
        }
        debug!("Adapter directory refreshed: {} controller(s)", adapters.len());
        Ok(())
    }

    /// Increment the controller's refcount, starting discovery on the
    /// 0→1 transition. A stack report that discovery is already running
    /// is swallowed.
    pub async fn ensure(&self, controller: &ControllerId) -> Result<()> {
        let mut adapters = self.adapters.lock().await;
        if !adapters.contains_key(controller) {
            drop(adapters);
            self.refresh_adapters().await?;
            adapters = self.adapters.lock().await;
        }
        let entry = adapters
            .get_mut(controller)
            .ok_or_else(|| CoreError::UnknownController(controller.clone()))?;

        if entry.refcount == 0 {
            match self.stack.start_discovery(controller).await {
                Ok(()) => info!("Discovery started on {}", controller),
                Err(e) if e.is_in_progress() => {
                    debug!("Discovery already running on {}", controller);
                }
                Err(e) => return Err(e.into()),
            }
        }
        entry.refcount += 1;
        Ok(())
    }

    /// Decrement the controller's refcount, stopping discovery on the
    /// 1→0 transition. A busy report from the stack while stopping is
    /// logged, not fatal.
    pub async fn release(&self, controller: &ControllerId) {
        let mut adapters = self.adapters.lock().await;
        let Some(entry) = adapters.get_mut(controller) else {
            return;
        };
        if entry.refcount == 0 {
            warn!("Release without matching ensure on {}", controller);
            return;
        }
        entry.refcount -= 1;
        if entry.refcount == 0 {
            match self.stack.stop_discovery(controller).await {
                Ok(()) => info!("Discovery stopped on {}", controller),
                Err(e) if e.is_in_progress() => {
                    info!("StopDiscovery on {} ignored (stack busy)", controller);
                }
                Err(e) => warn!("Failed to stop discovery on {}: {}", controller, e),
            }
        }
    }

    /// Block until the device shows up under the controller in the object
    /// tree, or the timeout elapses. Returns the device's location, or
    /// `None` on timeout.
    ///
    /// The waiter is registered before every tree check, so an object
    /// added between the check and the wait still wakes us.
    pub async fn wait_for(
        &self,
        controller: &ControllerId,
        address: &Address,
        timeout: Duration,
    ) -> Option<DevicePath> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.added.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.stack.find_device(controller, address).await {
                Ok(Some(path)) => return Some(path),
                Ok(None) => {}
                Err(e) => warn!("Object tree lookup on {} failed: {}", controller, e),
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let _ = time::timeout(deadline - now, notified).await;
        }
    }

    #[cfg(test)]
    pub(crate) async fn refcount(&self, controller: &ControllerId) -> u32 {
        self.adapters
            .lock()
            .await
            .get(controller)
            .map_or(0, |e| e.refcount)
    }
}
