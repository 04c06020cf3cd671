//! The per-device reconnection state machine.
//!
//! One session drives one speaker through
//! `discovery → pair → trust → connect` to a connected-and-routed terminal
//! state. Transitions are decided by the pure [`advance`] function so the
//! retry logic is testable on its own; [`ReconnectSession`] performs the
//! protocol operations and feeds their outcomes through it.

use chorus_bluetooth::{
    Address, ControllerId, DevicePath, DeviceView, Stack, A2DP_SINK_UUID,
};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::discovery::DiscoveryCoordinator;
use crate::loopback::LoopbackTracker;
use crate::status::{StatusEvent, StatusHandler, StatusKind};

/// Protocol step a session is currently in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    RunDiscovery,
    Pair,
    Trust,
    Connect,
}

/// Where to pick up a device that may already be partway through the
/// protocol, judged from its current object-tree entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resume {
    /// Run the state machine starting at this phase.
    Start(Phase),
    /// Connected with the audio profile: nothing left but asserting the
    /// profile and route.
    AlreadyLinked,
}

/// Judge the entry point for a device view (absent view means the object
/// tree has no entry for it).
pub fn resume_from(view: Option<&DeviceView>) -> Resume {
    match view {
        None => Resume::Start(Phase::RunDiscovery),
        Some(d) if d.connected && d.supports_audio_sink() => Resume::AlreadyLinked,
        Some(d) if !d.paired => Resume::Start(Phase::Pair),
        Some(d) if !d.trusted => Resume::Start(Phase::Trust),
        Some(d) if !d.connected => Resume::Start(Phase::Connect),
        // Connected but without the audio profile: start over.
        Some(_) => Resume::Start(Phase::RunDiscovery),
    }
}

/// Result of performing one phase's protocol operation.
#[derive(Debug)]
pub enum PhaseOutcome {
    /// Discovery surfaced the device at this location.
    Found(DevicePath),
    /// Discovery hit its bound without the device appearing.
    NotSeen,
    /// Pairing succeeded (or the device was already paired).
    PairAccepted,
    /// Pairing was rejected; the half-paired device has been removed.
    PairRejected(String),
    /// Trust is best-effort and always advances.
    Trusted,
    /// Base link and profile are up; `route_ok` reports the audio route.
    LinkUp { route_ok: bool },
    /// The link could not be established.
    LinkFailed(String),
}

/// Why a session ended without connecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    DiscoveryTimeout,
    AttemptsExhausted,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureReason::DiscoveryTimeout => "discovery timeout",
            FailureReason::AttemptsExhausted => "retry attempts exhausted",
        }
    }
}

/// What the session does after a phase outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Continue(Phase),
    Done { route_ok: bool },
    Failed(FailureReason),
}

/// Pure transition function: phase outcome in, next step and updated
/// attempt count out. Retry points spend an attempt; reaching
/// `max_attempts` aborts the session.
pub fn advance(outcome: &PhaseOutcome, attempts: u32, max_attempts: u32) -> (Step, u32) {
    match outcome {
        PhaseOutcome::Found(_) => (Step::Continue(Phase::Pair), attempts),
        PhaseOutcome::NotSeen => (Step::Failed(FailureReason::DiscoveryTimeout), attempts),
        PhaseOutcome::PairAccepted => (Step::Continue(Phase::Trust), attempts),
        PhaseOutcome::PairRejected(_) => retry(Phase::RunDiscovery, attempts, max_attempts),
        PhaseOutcome::Trusted => (Step::Continue(Phase::Connect), attempts),
        PhaseOutcome::LinkUp { route_ok } => (Step::Done { route_ok: *route_ok }, attempts),
        PhaseOutcome::LinkFailed(_) => retry(Phase::Pair, attempts, max_attempts),
    }
}

fn retry(next: Phase, attempts: u32, max_attempts: u32) -> (Step, u32) {
    let attempts = attempts + 1;
    if attempts >= max_attempts {
        (Step::Failed(FailureReason::AttemptsExhausted), attempts)
    } else {
        (Step::Continue(next), attempts)
    }
}

/// Terminal result of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Connected { route_ok: bool, attempts: u32 },
    Failed { reason: FailureReason, attempts: u32 },
}

/// One reconnection run for one device on one controller.
pub struct ReconnectSession<'a> {
    stack: &'a dyn Stack,
    discovery: &'a DiscoveryCoordinator,
    loopbacks: &'a mut LoopbackTracker,
    status: &'a dyn StatusHandler,
    config: &'a Config,
    device: Address,
    controller: ControllerId,
    path: Option<DevicePath>,
    attempts: u32,
}

impl<'a> ReconnectSession<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stack: &'a dyn Stack,
        discovery: &'a DiscoveryCoordinator,
        loopbacks: &'a mut LoopbackTracker,
        status: &'a dyn StatusHandler,
        config: &'a Config,
        device: Address,
        controller: ControllerId,
        known_path: Option<DevicePath>,
    ) -> Self {
        Self {
            stack,
            discovery,
            loopbacks,
            status,
            config,
            device,
            controller,
            path: known_path,
            attempts: 0,
        }
    }

    /// Drive the machine from `start` to a terminal state.
    pub async fn run(mut self, start: Phase) -> SessionOutcome {
        info!("Reconnecting {} via {}", self.device, self.controller);
        let mut phase = start;
        loop {
            debug!(
                "Reconnect {}: phase {:?}, attempt {}/{}",
                self.device, phase, self.attempts, self.config.max_attempts
            );

            let outcome = match phase {
                Phase::RunDiscovery => self.run_discovery().await,
                Phase::Pair => self.pair().await,
                Phase::Trust => self.trust().await,
                Phase::Connect => self.connect().await,
            };
            if let PhaseOutcome::Found(path) = &outcome {
                self.path = Some(path.clone());
            }

            let (step, attempts) = advance(&outcome, self.attempts, self.config.max_attempts);
            self.attempts = attempts;

            match step {
                Step::Continue(next) => phase = next,
                Step::Done { route_ok } => {
                    info!(
                        "Reconnected {} via {} ({} attempt(s) spent)",
                        self.device, self.controller, self.attempts
                    );
                    return SessionOutcome::Connected {
                        route_ok,
                        attempts: self.attempts,
                    };
                }
                Step::Failed(reason) => {
                    warn!(
                        "Failed to reconnect {}: {} after {} attempt(s)",
                        self.device,
                        reason.as_str(),
                        self.attempts
                    );
                    return SessionOutcome::Failed {
                        reason,
                        attempts: self.attempts,
                    };
                }
            }
        }
    }

    async fn run_discovery(&mut self) -> PhaseOutcome {
        self.emit(self.event(StatusKind::DiscoveryStart)).await;

        if let Err(e) = self.discovery.ensure(&self.controller).await {
            warn!("Cannot start discovery on {}: {}", self.controller, e);
            self.emit(self.event(StatusKind::DiscoveryTimeout).with_error(e.to_string()))
                .await;
            return PhaseOutcome::NotSeen;
        }
        let found = self
            .discovery
            .wait_for(&self.controller, &self.device, self.config.discovery_timeout)
            .await;
        self.discovery.release(&self.controller).await;

        match found {
            Some(path) => {
                self.emit(self.event(StatusKind::DiscoveryComplete)).await;
                PhaseOutcome::Found(path)
            }
            None => {
                info!("Discovery timeout waiting for {}", self.device);
                self.emit(self.event(StatusKind::DiscoveryTimeout)).await;
                PhaseOutcome::NotSeen
            }
        }
    }

    async fn pair(&mut self) -> PhaseOutcome {
        self.emit(self.event(StatusKind::PairingStart)).await;

        let Some(path) = self.path.clone() else {
            // No object to pair with; force a rediscovery.
            return PhaseOutcome::PairRejected("device location unknown".to_string());
        };

        match self.stack.pair(&path).await {
            Ok(()) => {
                self.emit(self.event(StatusKind::PairingSuccess)).await;
                PhaseOutcome::PairAccepted
            }
            Err(e) if e.is_already_exists() => {
                debug!("Device {} already paired", self.device);
                self.emit(self.event(StatusKind::PairingSuccess)).await;
                PhaseOutcome::PairAccepted
            }
            Err(e) => {
                warn!("Pairing {} failed: {}", self.device, e);
                // Clear the possibly half-paired object before retrying.
                if let Err(removal) = self.stack.remove_device(&path).await {
                    debug!("Removing {} failed: {}", path, removal);
                }
                self.path = None;
                self.emit(
                    self.event(StatusKind::PairingFailed)
                        .with_attempt(self.attempts + 1)
                        .with_error(e.to_string()),
                )
                .await;
                PhaseOutcome::PairRejected(e.to_string())
            }
        }
    }

    async fn trust(&mut self) -> PhaseOutcome {
        if let Some(path) = self.path.clone() {
            if let Err(e) = self.stack.set_trusted(&path, true).await {
                warn!("Trusting {} failed: {}", self.device, e);
            }
        }
        self.emit(self.event(StatusKind::Trusting)).await;
        PhaseOutcome::Trusted
    }

    async fn connect(&mut self) -> PhaseOutcome {
        self.emit(self.event(StatusKind::ConnectStart)).await;

        let Some(path) = self.path.clone() else {
            return PhaseOutcome::LinkFailed("device location unknown".to_string());
        };

        match self.stack.connect(&path).await {
            Ok(()) => {
                // Some stacks do not negotiate the audio profile on their
                // own; ask for it explicitly.
                if let Err(e) = self.stack.connect_profile(&path, A2DP_SINK_UUID).await {
                    warn!("Audio profile connect on {} failed: {}", path, e);
                }
                self.emit(self.event(StatusKind::ConnectSuccess)).await;

                let route_ok = self
                    .loopbacks
                    .route(&self.device, self.config.default_latency_ms)
                    .await;
                if !route_ok {
                    self.emit(
                        self.event(StatusKind::RouteFailed)
                            .with_error("loopback creation failed"),
                    )
                    .await;
                }
                PhaseOutcome::LinkUp { route_ok }
            }
            Err(e) => {
                warn!("Connecting {} failed: {}", self.device, e);
                self.emit(
                    self.event(StatusKind::ConnectFailed)
                        .with_attempt(self.attempts + 1)
                        .with_error(e.to_string()),
                )
                .await;
                PhaseOutcome::LinkFailed(e.to_string())
            }
        }
    }

    fn event(&self, kind: StatusKind) -> StatusEvent {
        StatusEvent::new(kind, self.device.clone()).with_controller(self.controller.clone())
    }

    async fn emit(&self, event: StatusEvent) {
        self.status.on_status(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod transitions {
        use super::*;

        #[test]
        fn discovery_timeout_is_terminal() {
            let (step, attempts) = advance(&PhaseOutcome::NotSeen, 0, 3);
            assert_eq!(step, Step::Failed(FailureReason::DiscoveryTimeout));
            assert_eq!(attempts, 0);
        }

        #[test]
        fn pair_rejection_spends_an_attempt_and_rediscovers() {
            let (step, attempts) =
                advance(&PhaseOutcome::PairRejected("nope".to_string()), 0, 3);
            assert_eq!(step, Step::Continue(Phase::RunDiscovery));
            assert_eq!(attempts, 1);
        }

        #[test]
        fn third_pair_rejection_exhausts_the_session() {
            let (step, attempts) =
                advance(&PhaseOutcome::PairRejected("nope".to_string()), 2, 3);
            assert_eq!(step, Step::Failed(FailureReason::AttemptsExhausted));
            assert_eq!(attempts, 3);
        }

        #[test]
        fn link_failure_falls_back_to_pairing() {
            let (step, attempts) =
                advance(&PhaseOutcome::LinkFailed("nope".to_string()), 1, 3);
            assert_eq!(step, Step::Continue(Phase::Pair));
            assert_eq!(attempts, 2);
        }

        #[test]
        fn route_failure_is_still_terminal_success() {
            let (step, _) = advance(&PhaseOutcome::LinkUp { route_ok: false }, 0, 3);
            assert_eq!(step, Step::Done { route_ok: false });
        }

        #[test]
        fn happy_path_never_spends_attempts() {
            let path = DevicePath::new(
                ControllerId::new("hci0"),
                Address::new("AA:AA:AA:AA:AA:AA"),
            );
            let (step, a) = advance(&PhaseOutcome::Found(path), 0, 3);
            assert_eq!(step, Step::Continue(Phase::Pair));
            let (step, a) = advance(&PhaseOutcome::PairAccepted, a, 3);
            assert_eq!(step, Step::Continue(Phase::Trust));
            let (step, a) = advance(&PhaseOutcome::Trusted, a, 3);
            assert_eq!(step, Step::Continue(Phase::Connect));
            let (step, a) = advance(&PhaseOutcome::LinkUp { route_ok: true }, a, 3);
            assert_eq!(step, Step::Done { route_ok: true });
            assert_eq!(a, 0);
        }
    }

    mod resume {
        use super::*;
        use chorus_bluetooth::A2DP_SINK_UUID;

        fn view(paired: bool, trusted: bool, connected: bool, audio: bool) -> DeviceView {
            let mut view = DeviceView {
                address: Address::new("AA:AA:AA:AA:AA:AA"),
                paired,
                trusted,
                connected,
                ..DeviceView::default()
            };
            if audio {
                view.uuids.insert(A2DP_SINK_UUID);
            }
            view
        }

        #[test]
        fn absent_device_starts_with_discovery() {
            assert_eq!(resume_from(None), Resume::Start(Phase::RunDiscovery));
        }

        #[test]
        fn unpaired_device_starts_with_pairing() {
            let v = view(false, false, false, false);
            assert_eq!(resume_from(Some(&v)), Resume::Start(Phase::Pair));
        }

        #[test]
        fn untrusted_device_starts_with_trusting() {
            let v = view(true, false, false, false);
            assert_eq!(resume_from(Some(&v)), Resume::Start(Phase::Trust));
        }

        #[test]
        fn paired_trusted_disconnected_device_starts_with_connect() {
            let v = view(true, true, false, false);
            assert_eq!(resume_from(Some(&v)), Resume::Start(Phase::Connect));
        }

        #[test]
        fn connected_audio_device_needs_no_session() {
            let v = view(true, true, true, true);
            assert_eq!(resume_from(Some(&v)), Resume::AlreadyLinked);
        }

        #[test]
        fn connected_device_without_audio_profile_starts_over() {
            let v = view(true, true, true, false);
            assert_eq!(resume_from(Some(&v)), Resume::Start(Phase::RunDiscovery));
        }
    }

    mod sessions {
        use super::*;
        use crate::testkit::{speaker, MockRouter, MockStack};
        use crate::status::ChannelHandler;
        use chorus_bluetooth::StackError;
        use std::sync::Arc;
        use tokio::sync::mpsc;

        const DEV: &str = "AA:AA:AA:AA:AA:AA";

        fn config() -> Config {
            let mut config = Config::new(ControllerId::new("hci9"));
            config.discovery_timeout = std::time::Duration::from_millis(200);
            config
        }

        fn rejection() -> StackError {
            StackError::Rejected {
                op: "pair",
                message: "authentication failed".to_string(),
            }
        }

        async fn run_session(
            stack: &Arc<MockStack>,
            start: Phase,
        ) -> (SessionOutcome, Vec<StatusKind>, Arc<MockRouter>) {
            let router = Arc::new(MockRouter::new());
            let mut loopbacks = LoopbackTracker::new(router.clone());
            let discovery = DiscoveryCoordinator::new(stack.clone());
            let (tx, mut rx) = mpsc::channel(64);
            let handler = ChannelHandler::new(tx);
            let config = config();

            let session = ReconnectSession::new(
                stack.as_ref(),
                &discovery,
                &mut loopbacks,
                &handler,
                &config,
                Address::new(DEV),
                ControllerId::new("hci0"),
                None,
            );
            let outcome = session.run(start).await;

            let mut phases = Vec::new();
            while let Ok(event) = rx.try_recv() {
                phases.push(event.kind);
            }
            (outcome, phases, router)
        }

        #[tokio::test]
        async fn two_pair_failures_then_success_reaches_done_with_two_attempts() {
            let stack = Arc::new(MockStack::with_controllers(&["hci0"]));
            stack.add_device("hci0", speaker(DEV, false));
            stack.script_pair(vec![Err(rejection()), Err(rejection()), Ok(())]);

            let (outcome, phases, router) = run_session(&stack, Phase::RunDiscovery).await;

            assert_eq!(
                outcome,
                SessionOutcome::Connected {
                    route_ok: true,
                    attempts: 2
                }
            );
            assert_eq!(router.created(), 1);
            // One discovery cycle per pairing attempt.
            assert_eq!(stack.discovery_starts(), 3);
            assert_eq!(stack.discovery_stops(), 3);
            // The half-paired device was removed after each rejection.
            assert_eq!(stack.calls_of("remove_device"), 2);
            assert_eq!(
                phases
                    .iter()
                    .filter(|k| **k == StatusKind::PairingFailed)
                    .count(),
                2
            );
            assert!(phases.contains(&StatusKind::ConnectSuccess));
        }

        #[tokio::test]
        async fn three_pair_failures_fail_the_session() {
            let stack = Arc::new(MockStack::with_controllers(&["hci0"]));
            stack.add_device("hci0", speaker(DEV, false));
            stack.script_pair(vec![Err(rejection()), Err(rejection()), Err(rejection())]);

            let (outcome, phases, router) = run_session(&stack, Phase::RunDiscovery).await;

            assert_eq!(
                outcome,
                SessionOutcome::Failed {
                    reason: FailureReason::AttemptsExhausted,
                    attempts: 3
                }
            );
            assert_eq!(router.created(), 0);
            // Never more pairing attempts than the cap.
            assert_eq!(stack.calls_of("pair"), 3);
            assert!(!phases.contains(&StatusKind::ConnectStart));
        }

        #[tokio::test]
        async fn link_failure_retries_through_pairing() {
            let stack = Arc::new(MockStack::with_controllers(&["hci0"]));
            stack.add_device("hci0", speaker(DEV, false));
            stack.script_connect(vec![
                Err(StackError::Rejected {
                    op: "connect",
                    message: "page timeout".to_string(),
                }),
                Ok(()),
            ]);

            let (outcome, phases, _) = run_session(&stack, Phase::RunDiscovery).await;

            assert_eq!(
                outcome,
                SessionOutcome::Connected {
                    route_ok: true,
                    attempts: 1
                }
            );
            // The fallback re-pairs without another discovery cycle.
            assert_eq!(stack.discovery_starts(), 1);
            assert_eq!(stack.calls_of("pair"), 2);
            assert!(phases.contains(&StatusKind::ConnectFailed));
        }

        #[tokio::test]
        async fn discovery_timeout_fails_the_run() {
            let stack = Arc::new(MockStack::with_controllers(&["hci0"]));
            // Device never appears in the tree.

            let (outcome, phases, _) = run_session(&stack, Phase::RunDiscovery).await;

            assert_eq!(
                outcome,
                SessionOutcome::Failed {
                    reason: FailureReason::DiscoveryTimeout,
                    attempts: 0
                }
            );
            assert!(phases.contains(&StatusKind::DiscoveryTimeout));
            assert_eq!(stack.discovery_stops(), stack.discovery_starts());
        }

        #[tokio::test]
        async fn already_paired_report_counts_as_success() {
            let stack = Arc::new(MockStack::with_controllers(&["hci0"]));
            stack.add_device("hci0", speaker(DEV, false));
            stack.script_pair(vec![Err(StackError::AlreadyExists(
                "pairing exists".to_string(),
            ))]);

            let (outcome, phases, _) = run_session(&stack, Phase::RunDiscovery).await;

            assert_eq!(
                outcome,
                SessionOutcome::Connected {
                    route_ok: true,
                    attempts: 0
                }
            );
            assert!(phases.contains(&StatusKind::PairingSuccess));
            assert_eq!(stack.calls_of("remove_device"), 0);
        }

        #[tokio::test]
        async fn trust_failure_is_not_fatal() {
            let stack = Arc::new(MockStack::with_controllers(&["hci0"]));
            stack.add_device("hci0", speaker(DEV, false));
            stack.fail_trust(true);

            let (outcome, phases, _) = run_session(&stack, Phase::RunDiscovery).await;

            assert!(matches!(outcome, SessionOutcome::Connected { .. }));
            assert!(phases.contains(&StatusKind::Trusting));
        }

        #[tokio::test]
        async fn route_failure_still_ends_as_connected() {
            let stack = Arc::new(MockStack::with_controllers(&["hci0"]));
            stack.add_device("hci0", speaker(DEV, false));

            let router = Arc::new(MockRouter::new());
            router.fail_creates(true);
            let mut loopbacks = LoopbackTracker::new(router.clone());
            let discovery = DiscoveryCoordinator::new(stack.clone());
            let (tx, mut rx) = mpsc::channel(64);
            let handler = ChannelHandler::new(tx);
            let config = config();

            let session = ReconnectSession::new(
                stack.as_ref(),
                &discovery,
                &mut loopbacks,
                &handler,
                &config,
                Address::new(DEV),
                ControllerId::new("hci0"),
                None,
            );
            let outcome = session.run(Phase::RunDiscovery).await;

            assert_eq!(
                outcome,
                SessionOutcome::Connected {
                    route_ok: false,
                    attempts: 0
                }
            );
            let mut phases = Vec::new();
            while let Ok(event) = rx.try_recv() {
                phases.push(event.kind);
            }
            assert!(phases.contains(&StatusKind::RouteFailed));
        }
    }
}
