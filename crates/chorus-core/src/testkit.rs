//! Scripted collaborators for exercising the orchestrator without radios
//! or a sound server.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chorus_audio::{AudioError, AudioRouter};
use chorus_bluetooth::{
    Address, ControllerId, ControllerView, DevicePath, DeviceView, Snapshot, Stack, StackError,
    StackEvent, A2DP_SINK_UUID,
};
use tokio::sync::broadcast;
use uuid::Uuid;

/// A connected-or-not speaker view carrying the audio sink profile.
pub fn speaker(addr: &str, connected: bool) -> DeviceView {
    let mut view = DeviceView {
        address: Address::new(addr),
        paired: true,
        trusted: true,
        connected,
        ..DeviceView::default()
    };
    view.uuids.insert(A2DP_SINK_UUID);
    view
}

/// In-memory [`Stack`] with a mutable object tree and scripted operation
/// outcomes.
///
/// `remove_device` is recorded but leaves the tree entry in place, so a
/// following discovery wait finds the device again immediately (on real
/// stacks rediscovery re-adds the object).
pub struct MockStack {
    snapshot: Mutex<Snapshot>,
    events: broadcast::Sender<StackEvent>,
    starts: AtomicUsize,
    stops: AtomicUsize,
    next_start_error: Mutex<Option<StackError>>,
    pair_script: Mutex<VecDeque<Result<(), StackError>>>,
    connect_script: Mutex<VecDeque<Result<(), StackError>>>,
    trust_fails: AtomicBool,
    calls: Mutex<Vec<String>>,
}

impl MockStack {
    pub fn with_controllers(names: &[&str]) -> Self {
        let controllers = names
            .iter()
            .enumerate()
            .map(|(i, name)| ControllerView {
                id: ControllerId::new(*name),
                address: Address::new(format!("10:00:00:00:00:{i:02X}")),
                devices: Vec::new(),
            })
            .collect();
        let (events, _) = broadcast::channel(64);
        Self {
            snapshot: Mutex::new(Snapshot { controllers }),
            events,
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            next_start_error: Mutex::new(None),
            pair_script: Mutex::new(VecDeque::new()),
            connect_script: Mutex::new(VecDeque::new()),
            trust_fails: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn add_device(&self, controller: &str, device: DeviceView) {
        let mut snapshot = self.snapshot.lock().unwrap();
        let view = snapshot
            .controllers
            .iter_mut()
            .find(|c| c.id.0 == controller)
            .expect("unknown controller in test");
        view.devices.push(device);
    }

    pub fn emit_device_added(&self, controller: &str, addr: &str) {
        let _ = self.events.send(StackEvent::DeviceAdded {
            controller: ControllerId::new(controller),
            address: Address::new(addr),
        });
    }

    pub fn emit_connected_changed(&self, addr: &str, connected: bool) {
        let _ = self.events.send(StackEvent::ConnectedChanged {
            address: Address::new(addr),
            connected,
        });
    }

    pub fn fail_next_start(&self, error: StackError) {
        *self.next_start_error.lock().unwrap() = Some(error);
    }

    pub fn script_pair(&self, outcomes: Vec<Result<(), StackError>>) {
        *self.pair_script.lock().unwrap() = outcomes.into();
    }

    pub fn script_connect(&self, outcomes: Vec<Result<(), StackError>>) {
        *self.connect_script.lock().unwrap() = outcomes.into();
    }

    pub fn fail_trust(&self, fail: bool) {
        self.trust_fails.store(fail, Ordering::SeqCst);
    }

    pub fn discovery_starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn discovery_stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// Number of recorded calls of the given operation.
    pub fn calls_of(&self, op: &str) -> usize {
        let prefix = format!("{op} ");
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(&prefix))
            .count()
    }

    /// Full call log, `"<op> <controller>/<address>"` per entry.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, op: &str, path: &DevicePath) {
        self.calls.lock().unwrap().push(format!("{op} {path}"));
    }
}

#[async_trait]
impl Stack for MockStack {
    async fn snapshot(&self) -> Result<Snapshot, StackError> {
        Ok(self.snapshot.lock().unwrap().clone())
    }

    async fn find_device(
        &self,
        controller: &ControllerId,
        address: &Address,
    ) -> Result<Option<DevicePath>, StackError> {
        let snapshot = self.snapshot.lock().unwrap();
        Ok(snapshot
            .device_on(controller, address)
            .map(|_| DevicePath::new(controller.clone(), address.clone())))
    }

    async fn start_discovery(&self, _controller: &ControllerId) -> Result<(), StackError> {
        if let Some(error) = self.next_start_error.lock().unwrap().take() {
            return Err(error);
        }
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_discovery(&self, _controller: &ControllerId) -> Result<(), StackError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn pair(&self, path: &DevicePath) -> Result<(), StackError> {
        self.record("pair", path);
        self.pair_script.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }

    async fn set_trusted(&self, path: &DevicePath, _trusted: bool) -> Result<(), StackError> {
        self.record("set_trusted", path);
        if self.trust_fails.load(Ordering::SeqCst) {
            Err(StackError::Rejected {
                op: "set_trusted",
                message: "not permitted".to_string(),
            })
        } else {
            Ok(())
        }
    }

    async fn connect(&self, path: &DevicePath) -> Result<(), StackError> {
        self.record("connect", path);
        self.connect_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(()))
    }

    async fn connect_profile(&self, path: &DevicePath, _profile: Uuid) -> Result<(), StackError> {
        self.record("connect_profile", path);
        Ok(())
    }

    async fn disconnect(&self, path: &DevicePath) -> Result<(), StackError> {
        self.record("disconnect", path);
        Ok(())
    }

    async fn remove_device(&self, path: &DevicePath) -> Result<(), StackError> {
        self.record("remove_device", path);
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<StackEvent> {
        self.events.subscribe()
    }
}

/// In-memory [`AudioRouter`] recording create/remove calls.
pub struct MockRouter {
    created_routes: Mutex<Vec<(String, u32)>>,
    removed_routes: Mutex<Vec<String>>,
    fail_creates: AtomicBool,
    fail_removes: AtomicBool,
}

impl MockRouter {
    pub fn new() -> Self {
        Self {
            created_routes: Mutex::new(Vec::new()),
            removed_routes: Mutex::new(Vec::new()),
            fail_creates: AtomicBool::new(false),
            fail_removes: AtomicBool::new(false),
        }
    }

    pub fn fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    pub fn fail_removes(&self, fail: bool) {
        self.fail_removes.store(fail, Ordering::SeqCst);
    }

    pub fn created(&self) -> usize {
        self.created_routes.lock().unwrap().len()
    }

    pub fn removed(&self) -> usize {
        self.removed_routes.lock().unwrap().len()
    }

    pub fn created_sinks(&self) -> Vec<String> {
        self.created_routes
            .lock()
            .unwrap()
            .iter()
            .map(|(sink, _)| sink.clone())
            .collect()
    }
}

#[async_trait]
impl AudioRouter for MockRouter {
    async fn create_route(&self, sink_prefix: &str, latency_ms: u32) -> Result<(), AudioError> {
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(AudioError::SinkNotFound(sink_prefix.to_string()));
        }
        self.created_routes
            .lock()
            .unwrap()
            .push((sink_prefix.to_string(), latency_ms));
        Ok(())
    }

    async fn remove_route(&self, sink_prefix: &str) -> Result<(), AudioError> {
        if self.fail_removes.load(Ordering::SeqCst) {
            return Err(AudioError::CommandFailed {
                command: "unload-module".to_string(),
                message: "scripted failure".to_string(),
            });
        }
        self.removed_routes
            .lock()
            .unwrap()
            .push(sink_prefix.to_string());
        Ok(())
    }
}
