//! The intent worker: one queue, one consumer, all mutation.
//!
//! Transports and stack-event pumps only enqueue [`Intent`]s; a single
//! task drains the queue in arrival order and performs every mutating
//! protocol/audio operation, so at most one is ever in flight. Failures
//! are caught at each call site and converted into logged negative
//! results; nothing ever terminates the loop.

use std::collections::HashSet;
use std::sync::Arc;

use chorus_audio::AudioRouter;
use chorus_bluetooth::{Address, ControllerId, DevicePath, Stack, StackEvent, A2DP_SINK_UUID};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::discovery::DiscoveryCoordinator;
use crate::intent::Intent;
use crate::loopback::LoopbackTracker;
use crate::planner::{plan, AllocationPlan};
use crate::reconnect::{resume_from, Phase, ReconnectSession, Resume, SessionOutcome};
use crate::registry::{DeviceRegistry, LinkState};
use crate::status::{StatusEvent, StatusHandler, StatusKind};

/// Cloneable enqueue handle. `submit` never blocks; a full or closed
/// queue drops the intent with an error log.
#[derive(Clone)]
pub struct IntentSender {
    tx: mpsc::Sender<Intent>,
}

impl IntentSender {
    pub fn new(tx: mpsc::Sender<Intent>) -> Self {
        Self { tx }
    }

    pub fn submit(&self, intent: Intent) {
        match self.tx.try_send(intent) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(intent)) => {
                error!("Intent queue full, dropping {}", intent.kind());
            }
            Err(mpsc::error::TrySendError::Closed(intent)) => {
                error!("Intent worker gone, dropping {}", intent.kind());
            }
        }
    }
}

/// Owns the worker task, the stack-event pump, and the queue.
pub struct ConnectionService {
    sender: IntentSender,
    worker: JoinHandle<()>,
    pump: JoinHandle<()>,
}

impl ConnectionService {
    /// Spawn the worker and the event pump.
    pub fn spawn(
        stack: Arc<dyn Stack>,
        discovery: Arc<DiscoveryCoordinator>,
        router: Arc<dyn AudioRouter>,
        status: Arc<dyn StatusHandler>,
        config: Config,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let pump = spawn_event_pump(stack.events(), tx.clone());
        let worker = Worker::new(stack, discovery, router, status, config);
        let worker = tokio::spawn(worker.run(rx));
        Self {
            sender: IntentSender::new(tx),
            worker,
            pump,
        }
    }

    /// Non-blocking enqueue.
    pub fn submit(&self, intent: Intent) {
        self.sender.submit(intent);
    }

    /// A cloneable handle for transports.
    pub fn sender(&self) -> IntentSender {
        self.sender.clone()
    }

    /// Stop the worker and pump. Queued intents are lost.
    pub fn shutdown(self) {
        self.worker.abort();
        self.pump.abort();
    }
}

/// Translate Connected-property flips into queued intents. Runs on its
/// own task and never calls back into the stack.
fn spawn_event_pump(
    mut events: broadcast::Receiver<StackEvent>,
    tx: mpsc::Sender<Intent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(StackEvent::ConnectedChanged { address, connected }) => {
                    if tx
                        .send(Intent::LoopbackSync { address, connected })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Event pump lagged, {} stack event(s) dropped", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

struct Worker {
    stack: Arc<dyn Stack>,
    discovery: Arc<DiscoveryCoordinator>,
    status: Arc<dyn StatusHandler>,
    config: Config,
    expected: HashSet<Address>,
    registry: DeviceRegistry,
    loopbacks: LoopbackTracker,
}

impl Worker {
    fn new(
        stack: Arc<dyn Stack>,
        discovery: Arc<DiscoveryCoordinator>,
        router: Arc<dyn AudioRouter>,
        status: Arc<dyn StatusHandler>,
        config: Config,
    ) -> Self {
        Self {
            stack,
            discovery,
            status,
            config,
            expected: HashSet::new(),
            registry: DeviceRegistry::new(),
            loopbacks: LoopbackTracker::new(router),
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Intent>) {
        info!("Connection worker started");
        while let Some(intent) = rx.recv().await {
            debug!("Handling intent {}", intent.kind());
            self.handle(intent).await;
        }
        info!("Connection worker stopped");
    }

    async fn handle(&mut self, intent: Intent) {
        match intent {
            Intent::SetExpected { addresses, replace } => self.set_expected(addresses, replace),
            Intent::ConnectOne { target, allowed } => self.connect_one(target, allowed).await,
            Intent::Disconnect { address } => self.disconnect_everywhere(address).await,
            Intent::LoopbackSync { address, connected } => {
                self.loopback_sync(address, connected).await;
            }
        }
    }

    fn set_expected(&mut self, addresses: Vec<Address>, replace: bool) {
        if replace {
            self.expected = addresses.into_iter().collect();
            self.registry.set_allowed_exactly(&self.expected);
        } else {
            for address in addresses {
                self.registry.record_mut(&address).allowed = true;
                self.expected.insert(address);
            }
        }
        info!("Expected speaker set now {:?}", self.expected);
    }

    async fn connect_one(&mut self, target: Address, allowed: Vec<Address>) {
        // Track the target immediately so link-flip events for it are
        // honored even if the session is still in flight.
        self.expected.insert(target.clone());

        let mut allowed_set: HashSet<Address> = allowed.into_iter().collect();
        allowed_set.insert(target.clone());
        for address in &allowed_set {
            self.registry.record_mut(address).allowed = true;
        }

        let snapshot = match self.stack.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!("Cannot capture object tree: {}", e);
                self.emit(
                    StatusEvent::new(StatusKind::SessionFailed, target.clone())
                        .with_error(e.to_string()),
                )
                .await;
                return;
            }
        };

        let plan = plan(
            &target,
            &allowed_set,
            &snapshot,
            &self.config.reserved_controller,
        );
        self.apply_disconnects(plan.disconnects()).await;

        match plan {
            AllocationPlan::AlreadyConnected { controller, .. } => {
                self.assert_link(&target, &controller).await;
            }
            AllocationPlan::NeedsConnection { controller, .. } => {
                self.reconnect(&target, &controller).await;
            }
            AllocationPlan::Unavailable { .. } => {
                warn!("No controller available for {}", target);
                self.emit(
                    StatusEvent::new(StatusKind::NoControllerAvailable, target.clone())
                        .with_error("no free or freeable controller"),
                )
                .await;
            }
        }
    }

    /// Vacate the planned (device, controller) connections. An
    /// already-absent device counts as success.
    async fn apply_disconnects(&mut self, disconnects: &[(Address, ControllerId)]) {
        for (address, controller) in disconnects {
            let path = DevicePath::new(controller.clone(), address.clone());
            info!("Vacating {} from {}", address, controller);
            if let Err(e) = self.stack.disconnect(&path).await {
                debug!("Disconnect of {} failed: {}", path, e);
            }
            self.loopbacks.unroute(address).await;
            if let Some(record) = self.registry.get_mut(address) {
                record.state = LinkState::Disconnected;
                record.routed = false;
                if record.assigned_controller.as_ref() == Some(controller) {
                    record.assigned_controller = None;
                }
            }
        }
    }

    /// The target already holds a usable controller: (re)assert the audio
    /// profile and route, both idempotent.
    async fn assert_link(&mut self, target: &Address, controller: &ControllerId) {
        let path = DevicePath::new(controller.clone(), target.clone());
        if let Err(e) = self.stack.connect_profile(&path, A2DP_SINK_UUID).await {
            warn!("Audio profile assert on {} failed: {}", path, e);
        }
        self.emit(
            StatusEvent::new(StatusKind::ConnectSuccess, target.clone())
                .with_controller(controller.clone()),
        )
        .await;

        if !self.loopbacks.is_routed(target)
            && !self
                .loopbacks
                .route(target, self.config.default_latency_ms)
                .await
        {
            self.emit(
                StatusEvent::new(StatusKind::RouteFailed, target.clone())
                    .with_controller(controller.clone())
                    .with_error("loopback creation failed"),
            )
            .await;
        }

        let routed = self.loopbacks.is_routed(target);
        let record = self.registry.record_mut(target);
        record.state = LinkState::Connected;
        record.assigned_controller = Some(controller.clone());
        record.routed = routed;
    }

    /// Run one reconnection session for the target on the chosen
    /// controller.
    async fn reconnect(&mut self, target: &Address, controller: &ControllerId) {
        self.emit(
            StatusEvent::new(StatusKind::SessionStart, target.clone())
                .with_controller(controller.clone()),
        )
        .await;

        // The disconnects just changed the tree; re-read the device to
        // pick the right entry point.
        let view = self.stack.snapshot().await.ok();
        let view = view
            .as_ref()
            .and_then(|snapshot| snapshot.device_on(controller, target));

        let (start, known_path) = match resume_from(view) {
            Resume::AlreadyLinked => {
                self.assert_link(target, controller).await;
                return;
            }
            Resume::Start(Phase::RunDiscovery) => (Phase::RunDiscovery, None),
            Resume::Start(phase) => (
                phase,
                Some(DevicePath::new(controller.clone(), target.clone())),
            ),
        };

        {
            let record = self.registry.record_mut(target);
            record.state = LinkState::Connecting;
            record.attempts = 0;
        }

        let session = ReconnectSession::new(
            self.stack.as_ref(),
            self.discovery.as_ref(),
            &mut self.loopbacks,
            self.status.as_ref(),
            &self.config,
            target.clone(),
            controller.clone(),
            known_path,
        );

        match session.run(start).await {
            SessionOutcome::Connected { attempts, .. } => {
                let routed = self.loopbacks.is_routed(target);
                let record = self.registry.record_mut(target);
                record.state = LinkState::Connected;
                record.assigned_controller = Some(controller.clone());
                record.attempts = attempts;
                record.routed = routed;
            }
            SessionOutcome::Failed { reason, attempts } => {
                {
                    let record = self.registry.record_mut(target);
                    record.state = LinkState::Disconnected;
                    record.attempts = attempts;
                }
                self.emit(
                    StatusEvent::new(StatusKind::SessionFailed, target.clone())
                        .with_controller(controller.clone())
                        .with_attempt(attempts)
                        .with_error(reason.as_str()),
                )
                .await;
            }
        }
    }

    /// Disconnect the device from every controller it is attached to,
    /// not only its intended one, then drop its route.
    async fn disconnect_everywhere(&mut self, address: Address) {
        let snapshot = match self.stack.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!("Cannot capture object tree: {}", e);
                return;
            }
        };

        for path in snapshot.connected_paths(&address) {
            info!("Disconnecting {} from {}", address, path.controller);
            if let Err(e) = self.stack.disconnect(&path).await {
                warn!("Disconnect of {} failed: {}", path, e);
            }
        }
        self.loopbacks.unroute(&address).await;

        if let Some(record) = self.registry.get_mut(&address) {
            record.state = LinkState::Disconnected;
            record.assigned_controller = None;
            record.routed = false;
        }
    }

    /// Reconcile the audio route with a reported link flip. Duplicate
    /// reports are no-ops.
    async fn loopback_sync(&mut self, address: Address, connected: bool) {
        if !self.expected.contains(&address) {
            debug!("Ignoring link change for untracked {}", address);
            return;
        }

        if connected && !self.loopbacks.is_routed(&address) {
            if self
                .loopbacks
                .route(&address, self.config.default_latency_ms)
                .await
            {
                info!("Loopback autoprovisioned for {}", address);
            } else {
                self.emit(
                    StatusEvent::new(StatusKind::RouteFailed, address.clone())
                        .with_error("loopback creation failed"),
                )
                .await;
            }
        } else if !connected && self.loopbacks.is_routed(&address) {
            self.loopbacks.unroute(&address).await;
            info!("Loopback removed after disconnect of {}", address);
        }

        let routed = self.loopbacks.is_routed(&address);
        let record = self.registry.record_mut(&address);
        record.state = if connected {
            LinkState::Connected
        } else {
            LinkState::Disconnected
        };
        record.routed = routed;
    }

    async fn emit(&self, event: StatusEvent) {
        self.status.on_status(event).await;
    }
}
