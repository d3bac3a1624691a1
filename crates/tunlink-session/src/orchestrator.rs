//! Session Orchestrator
//!
//! Single-threaded state machine that brings the session up in dependency
//! order and tears it down bridge first, engine second, interface last:
//!
//! ```text
//!  Idle ──start──▶ EngineStarting ──ok──▶ EngineRunning ──▶ PermissionPending
//!   ▲                   │ err                                  │ granted   │ denied
//!   │                   ▼                                      ▼           │
//!   ├────────────────  Idle            Active ◀── TunnelEstablishing       │
//!   │                                    │ stop / bridge exit              │
//!   └──────────── Stopping ◀─────────────┴─────────────────────────────────┘
//! ```
//!
//! Blocking engine calls run on the tokio blocking pool and the relay on
//! its own thread; their completions come back as [`SessionEvent`]s on one
//! channel, and only [`SessionOrchestrator::handle`] mutates the state.
//! A stop issued while the engine is still starting, or a start issued
//! while stopping, waits in a single pending slot.

use crate::bridge::{BridgeArgs, BridgeBackend, BridgeError, TunnelBridge};
use crate::engine::{EngineClient, EngineError};
use crate::error::SessionError;
use crate::interface::{TunnelHandle, VirtualInterface};
use crate::message::{Command, SessionEvent, StatusUpdate};
use crate::settings::{SessionSettings, PING_TIMEOUT};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};
use tunlink_config::{socks_proxy_url, ConfigStore};

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    EngineStarting,
    EngineRunning,
    PermissionPending,
    TunnelEstablishing,
    Active,
    Stopping,
}

impl SessionState {
    /// Whether the engine is up and serving the local proxy
    pub fn is_engine_up(&self) -> bool {
        matches!(self, SessionState::EngineRunning | SessionState::Active)
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, SessionState::Idle)
    }

    /// Whether a stop would tear something down right now
    fn is_stoppable(&self) -> bool {
        matches!(
            self,
            SessionState::EngineRunning
                | SessionState::PermissionPending
                | SessionState::TunnelEstablishing
                | SessionState::Active
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::EngineStarting => "engine starting",
            SessionState::EngineRunning => "engine running",
            SessionState::PermissionPending => "permission pending",
            SessionState::TunnelEstablishing => "tunnel establishing",
            SessionState::Active => "active",
            SessionState::Stopping => "stopping",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Drives engine, interface and bridge through one session at a time
pub struct SessionOrchestrator {
    state: SessionState,
    pending: Option<Command>,
    store: Arc<ConfigStore>,
    engine: EngineClient,
    interface: Box<dyn VirtualInterface>,
    bridge: TunnelBridge,
    /// Borrowed from the interface while it is up
    tunnel: Option<TunnelHandle>,
    settings: SessionSettings,
    runtime: Handle,
    events_tx: Sender<SessionEvent>,
    events_rx: Receiver<SessionEvent>,
    status: Sender<StatusUpdate>,
}

impl SessionOrchestrator {
    pub fn new(
        store: Arc<ConfigStore>,
        engine: EngineClient,
        interface: Box<dyn VirtualInterface>,
        bridge: Arc<dyn BridgeBackend>,
        settings: SessionSettings,
        runtime: Handle,
        status: Sender<StatusUpdate>,
    ) -> Self {
        let (events_tx, events_rx) = unbounded();
        let bridge = TunnelBridge::new(bridge, events_tx.clone());

        Self {
            state: SessionState::Idle,
            pending: None,
            store,
            engine,
            interface,
            bridge,
            tunnel: None,
            settings,
            runtime,
            events_tx,
            events_rx,
            status,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Sender for user commands and consent answers
    pub fn sender(&self) -> Sender<SessionEvent> {
        self.events_tx.clone()
    }

    /// Wait up to `timeout` for one event and handle it
    pub fn process_next(&mut self, timeout: Duration) -> bool {
        match self.events_rx.recv_timeout(timeout) {
            Ok(event) => {
                self.handle(event);
                true
            }
            Err(_) => false,
        }
    }

    /// Issue a stop and pump events until idle or `timeout` elapses
    pub fn shutdown(&mut self, timeout: Duration) -> bool {
        if !self.state.is_idle() {
            self.handle(SessionEvent::User(Command::Stop));
        }
        let deadline = Instant::now() + timeout;
        while !self.state.is_idle() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!("Session did not stop within {:?} ({})", timeout, self.state);
                return false;
            }
            self.process_next(remaining.min(Duration::from_millis(100)));
        }
        true
    }

    /// Apply one event
    pub fn handle(&mut self, event: SessionEvent) {
        debug!("Session event in {}: {:?}", self.state, event);

        match event {
            SessionEvent::User(command) => self.on_command(command),
            SessionEvent::ConsentResolved { granted } => self.on_consent(granted),
            SessionEvent::EngineStarted(result) => self.on_engine_started(result),
            SessionEvent::EngineStopped(result) => self.on_engine_stopped(result),
            SessionEvent::PingCompleted(result) => {
                match &result {
                    Ok(ms) => info!("Ping success: {} ms", ms),
                    Err(e) => warn!("Ping failed: {}", e),
                }
                self.publish(StatusUpdate::Ping(result));
            }
            SessionEvent::BridgeExited { worker, result } => self.on_bridge_exited(worker, result),
        }
    }

    fn on_command(&mut self, command: Command) {
        use SessionState::*;

        match (command, self.state) {
            (Command::Start, Idle) => self.begin_start(),
            (Command::Start, Stopping) => {
                self.pending = Some(Command::Start);
                self.info("Start queued until the session has stopped");
            }
            (Command::Start, EngineStarting) => {
                // Cancels a queued stop
                self.pending = None;
                self.notice("Session is already starting");
            }
            (Command::Start, _) => self.notice("Session is already running"),

            (Command::Stop, EngineStarting) => {
                self.pending = Some(Command::Stop);
                self.info("Stop queued until the engine has started");
            }
            (Command::Stop, Stopping) => {
                self.pending = None;
                self.notice("Session is already stopping");
            }
            (Command::Stop, state) if state.is_stoppable() => self.begin_stop(),
            (Command::Stop, _) => self.notice("Session is not running"),

            (Command::Ping, state) if state.is_engine_up() => self.begin_ping(),
            (Command::Ping, _) => self.notice("Engine is not running"),
        }
    }

    fn begin_start(&mut self) {
        if let Err(e) = self.store.load_checked() {
            warn!("Cannot start session: {}", e);
            self.notice(e.to_string());
            return;
        }

        self.set_state(SessionState::EngineStarting);
        self.spawn_engine_call(None, |engine| engine.start(), SessionEvent::EngineStarted);
    }

    fn on_engine_started(&mut self, result: Result<(), EngineError>) {
        if self.state != SessionState::EngineStarting {
            warn!("Ignoring engine start completion in {}", self.state);
            return;
        }

        match result {
            Ok(()) => {
                self.set_state(SessionState::EngineRunning);
                self.info("Engine started successfully.");

                if self.pending.take() == Some(Command::Stop) {
                    info!("Applying queued stop");
                    self.begin_stop();
                } else {
                    self.request_consent();
                }
            }
            Err(e) => {
                self.pending = None;
                self.set_state(SessionState::Idle);
                self.fail(e.into());
            }
        }
    }

    fn request_consent(&mut self) {
        self.set_state(SessionState::PermissionPending);

        match self.interface.prepare_consent() {
            None => self.on_consent(true),
            Some(request) => {
                info!("Requesting consent for {}", request.session_name);
                self.publish(StatusUpdate::ConsentRequired(request));
            }
        }
    }

    fn on_consent(&mut self, granted: bool) {
        if self.state != SessionState::PermissionPending {
            debug!("Ignoring consent answer in {}", self.state);
            return;
        }
        self.interface.record_consent(granted);
        if !granted {
            self.fail(SessionError::PermissionDenied);
            self.begin_stop();
            return;
        }

        self.set_state(SessionState::TunnelEstablishing);
        match self.establish_tunnel() {
            Ok(()) => {
                self.set_state(SessionState::Active);
                self.info("VPN connected.");
            }
            Err(e) => {
                self.fail(e);
                self.begin_stop();
            }
        }
    }

    fn establish_tunnel(&mut self) -> Result<(), SessionError> {
        let spec = &self.settings.interface;
        spec.validate()?;

        let handle = self.interface.establish(spec)?;
        info!("Virtual interface established ({})", handle);
        self.tunnel = Some(handle);

        self.bridge.start(BridgeArgs::new(socks_proxy_url(), handle))?;
        Ok(())
    }

    /// Bridge, then engine; the interface closes once the engine is down
    fn begin_stop(&mut self) {
        self.set_state(SessionState::Stopping);

        if let Err(e) = self.bridge.stop() {
            self.fail(e.into());
        }
        self.spawn_engine_call(None, |engine| engine.stop(), SessionEvent::EngineStopped);
    }

    fn on_engine_stopped(&mut self, result: Result<(), EngineError>) {
        if self.state != SessionState::Stopping {
            warn!("Ignoring engine stop completion in {}", self.state);
            return;
        }

        if let Err(e) = result {
            self.fail(e.into());
        }
        if let Some(handle) = self.tunnel.take() {
            match self.interface.close(handle) {
                Ok(()) => info!("Virtual interface closed ({})", handle),
                Err(e) => self.fail(e.into()),
            }
        }

        self.set_state(SessionState::Idle);
        self.info("VPN stopped.");

        if self.pending.take() == Some(Command::Start) {
            info!("Applying queued start");
            self.begin_start();
        }
    }

    fn on_bridge_exited(&mut self, worker: u64, result: Result<(), BridgeError>) {
        if !self.bridge.is_current(worker) {
            debug!("Ignoring exit of superseded bridge worker {}", worker);
            return;
        }
        self.bridge.reap(worker);

        match self.state {
            SessionState::Active | SessionState::TunnelEstablishing => {
                let error = result.err().unwrap_or(BridgeError::Exited(0));
                self.fail(error.into());
                self.begin_stop();
            }
            state => debug!("Bridge worker {} exited in {}", worker, state),
        }
    }

    fn begin_ping(&mut self) {
        self.info("Pinging...");
        self.spawn_engine_call(
            Some(PING_TIMEOUT),
            |engine| engine.ping(),
            SessionEvent::PingCompleted,
        );
    }

    /// Run a blocking engine call off the foreground and post its result
    fn spawn_engine_call<T, F, E>(&self, timeout: Option<Duration>, call: F, into_event: E)
    where
        T: Send + 'static,
        F: FnOnce(EngineClient) -> Result<T, EngineError> + Send + 'static,
        E: FnOnce(Result<T, EngineError>) -> SessionEvent + Send + 'static,
    {
        let engine = self.engine.clone();
        let events = self.events_tx.clone();

        self.runtime.spawn(async move {
            let task = tokio::task::spawn_blocking(move || call(engine));
            let joined = match timeout {
                Some(limit) => match tokio::time::timeout(limit, task).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        let _ = events.send(into_event(Err(EngineError::Timeout(limit.as_secs()))));
                        return;
                    }
                },
                None => task.await,
            };
            let result = joined.unwrap_or_else(|e| Err(EngineError::Task(e.to_string())));
            if events.send(into_event(result)).is_err() {
                debug!("Session gone, dropping engine completion");
            }
        });
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            info!("Session state: {} -> {}", self.state, state);
            self.state = state;
            self.publish(StatusUpdate::StateChanged(state));
        }
    }

    fn info(&self, text: impl Into<String>) {
        self.publish(StatusUpdate::Info(text.into()));
    }

    fn notice(&self, text: impl Into<String>) {
        self.publish(StatusUpdate::Notice(text.into()));
    }

    fn fail(&self, error: SessionError) {
        error!("{}", error);
        self.publish(StatusUpdate::Failure(error));
    }

    fn publish(&self, update: StatusUpdate) {
        if self.status.send(update).is_err() {
            debug!("Status receiver gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineResponse, Envelope, ProxyEngine};
    use crate::interface::{ConsentRequest, InterfaceError, InterfaceSpec};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tunlink_config::{synthesize, Credentials, ProxyDescriptor};

    type CallLog = Arc<Mutex<Vec<&'static str>>>;

    struct FakeEngine {
        log: CallLog,
        start_gate: Mutex<Option<Receiver<()>>>,
        start_response: String,
        stop_response: String,
        stops: AtomicUsize,
    }

    impl ProxyEngine for FakeEngine {
        fn run(&self, _request: &str) -> Result<String, EngineError> {
            let gate = self.start_gate.lock().unwrap().take();
            if let Some(gate) = gate {
                gate.recv().unwrap();
            }
            self.log.lock().unwrap().push("engine.run");
            Ok(self.start_response.clone())
        }

        fn stop(&self) -> Result<String, EngineError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            self.log.lock().unwrap().push("engine.stop");
            Ok(self.stop_response.clone())
        }

        fn ping(&self, _request: &str) -> Result<String, EngineError> {
            EngineResponse::ok(Some(42.into())).encode()
        }
    }

    struct FakeInterface {
        log: CallLog,
        consent: Option<ConsentRequest>,
        fail_establish: bool,
        fail_close: bool,
    }

    impl VirtualInterface for FakeInterface {
        fn prepare_consent(&mut self) -> Option<ConsentRequest> {
            self.consent.clone()
        }

        fn establish(&mut self, _spec: &InterfaceSpec) -> Result<TunnelHandle, InterfaceError> {
            self.log.lock().unwrap().push("interface.establish");
            if self.fail_establish {
                return Err(InterfaceError::Establish("no tun device".into()));
            }
            Ok(TunnelHandle::from_raw(9))
        }

        fn close(&mut self, _handle: TunnelHandle) -> Result<(), InterfaceError> {
            self.log.lock().unwrap().push("interface.close");
            if self.fail_close {
                return Err(InterfaceError::Close("device busy".into()));
            }
            Ok(())
        }
    }

    struct FakeBridge {
        log: CallLog,
        release_tx: Sender<Result<(), BridgeError>>,
        release_rx: Receiver<Result<(), BridgeError>>,
        fail_stop: bool,
    }

    impl BridgeBackend for FakeBridge {
        fn run(&self, _args: &BridgeArgs) -> Result<(), BridgeError> {
            self.release_rx.recv().unwrap_or(Ok(()))
        }

        fn stop(&self) -> Result<(), BridgeError> {
            self.log.lock().unwrap().push("bridge.stop");
            let _ = self.release_tx.send(Ok(()));
            if self.fail_stop {
                return Err(BridgeError::Launch("relay did not acknowledge stop".into()));
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct Options {
        gated_start: bool,
        failed_start: bool,
        consent: bool,
        fail_establish: bool,
        failing_teardown: bool,
        no_config: bool,
    }

    struct Harness {
        session: SessionOrchestrator,
        status: Receiver<StatusUpdate>,
        log: CallLog,
        engine: Arc<FakeEngine>,
        bridge: Arc<FakeBridge>,
        start_gate: Sender<()>,
        _dir: TempDir,
        _runtime: tokio::runtime::Runtime,
    }

    impl Harness {
        fn new(options: Options) -> Self {
            let runtime = tokio::runtime::Runtime::new().unwrap();
            let dir = tempfile::tempdir().unwrap();
            let store = Arc::new(ConfigStore::new(dir.path()));
            if !options.no_config {
                let doc = synthesize(&[ProxyDescriptor::new(
                    "1.2.3.4",
                    443,
                    Credentials::trojan("pw"),
                )]);
                store.save(Some(&doc)).unwrap();
            }

            let log = CallLog::default();
            let (start_gate, gate_rx) = unbounded();
            let start_response = if options.failed_start {
                EngineResponse::failed("invalid config").encode().unwrap()
            } else {
                EngineResponse::ok(None).encode().unwrap()
            };
            let engine = Arc::new(FakeEngine {
                log: log.clone(),
                start_gate: Mutex::new(options.gated_start.then_some(gate_rx)),
                start_response,
                stop_response: if options.failing_teardown {
                    EngineResponse::failed("engine busy").encode().unwrap()
                } else {
                    String::new()
                },
                stops: AtomicUsize::new(0),
            });
            let interface = FakeInterface {
                log: log.clone(),
                consent: options.consent.then(|| ConsentRequest::new("tunlink")),
                fail_establish: options.fail_establish,
                fail_close: options.failing_teardown,
            };
            let (release_tx, release_rx) = unbounded();
            let bridge = Arc::new(FakeBridge {
                log: log.clone(),
                release_tx,
                release_rx,
                fail_stop: options.failing_teardown,
            });

            let settings = SessionSettings::default();
            let client = EngineClient::new(engine.clone(), dir.path(), store.path(), &settings);
            let (status_tx, status) = unbounded();
            let session = SessionOrchestrator::new(
                store,
                client,
                Box::new(interface),
                bridge.clone(),
                settings,
                runtime.handle().clone(),
                status_tx,
            );

            Self {
                session,
                status,
                log,
                engine,
                bridge,
                start_gate,
                _dir: dir,
                _runtime: runtime,
            }
        }

        fn command(&mut self, command: Command) {
            self.session.handle(SessionEvent::User(command));
        }

        fn pump_until(&mut self, state: SessionState) {
            let deadline = Instant::now() + Duration::from_secs(5);
            while self.session.state() != state && Instant::now() < deadline {
                self.session.process_next(Duration::from_millis(20));
            }
            assert_eq!(self.session.state(), state);
        }

        fn updates(&self) -> Vec<StatusUpdate> {
            self.status.try_iter().collect()
        }

        fn calls(&self) -> Vec<&'static str> {
            self.log.lock().unwrap().clone()
        }
    }

    #[test]
    fn test_start_and_stop_order() {
        let mut h = Harness::new(Options::default());

        h.command(Command::Start);
        assert_eq!(h.session.state(), SessionState::EngineStarting);
        h.pump_until(SessionState::Active);
        assert!(h.session.bridge.is_running());

        h.command(Command::Stop);
        assert_eq!(h.session.state(), SessionState::Stopping);
        h.pump_until(SessionState::Idle);

        let teardown: Vec<_> = h
            .calls()
            .into_iter()
            .filter(|c| matches!(*c, "bridge.stop" | "engine.stop" | "interface.close"))
            .collect();
        assert_eq!(teardown, vec!["bridge.stop", "engine.stop", "interface.close"]);

        let states: Vec<_> = h
            .updates()
            .into_iter()
            .filter_map(|u| match u {
                StatusUpdate::StateChanged(s) => Some(s),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                SessionState::EngineStarting,
                SessionState::EngineRunning,
                SessionState::PermissionPending,
                SessionState::TunnelEstablishing,
                SessionState::Active,
                SessionState::Stopping,
                SessionState::Idle,
            ]
        );
    }

    #[test]
    fn test_teardown_failures_are_each_reported() {
        let mut h = Harness::new(Options {
            failing_teardown: true,
            ..Options::default()
        });

        h.command(Command::Start);
        h.pump_until(SessionState::Active);
        h.updates();

        h.command(Command::Stop);
        h.pump_until(SessionState::Idle);

        let teardown: Vec<_> = h
            .calls()
            .into_iter()
            .filter(|c| matches!(*c, "bridge.stop" | "engine.stop" | "interface.close"))
            .collect();
        assert_eq!(teardown, vec!["bridge.stop", "engine.stop", "interface.close"]);

        let failures: Vec<_> = h
            .updates()
            .into_iter()
            .filter_map(|u| match u {
                StatusUpdate::Failure(e) => Some(e),
                _ => None,
            })
            .collect();
        assert_eq!(failures.len(), 3);
        assert!(matches!(failures[0], SessionError::Bridge(BridgeError::Launch(_))));
        assert!(matches!(
            &failures[1],
            SessionError::Engine(EngineError::Rejected(msg)) if msg == "engine busy"
        ));
        assert!(matches!(failures[2], SessionError::Interface(InterfaceError::Close(_))));

        // The stopped relay's exit is not a new failure
        h.session.process_next(Duration::from_millis(100));
        assert_eq!(h.session.state(), SessionState::Idle);
        assert!(h.updates().iter().all(|u| !matches!(u, StatusUpdate::Failure(_))));
    }

    #[test]
    fn test_stop_during_engine_starting_ends_idle() {
        let mut h = Harness::new(Options {
            gated_start: true,
            ..Options::default()
        });

        h.command(Command::Start);
        h.command(Command::Stop);
        assert_eq!(h.session.state(), SessionState::EngineStarting);

        h.start_gate.send(()).unwrap();
        h.pump_until(SessionState::Idle);

        // Nothing left in flight
        h.session.process_next(Duration::from_millis(100));
        assert_eq!(h.session.state(), SessionState::Idle);
        assert_eq!(h.engine.stops.load(Ordering::SeqCst), 1);
        assert!(!h.calls().contains(&"interface.establish"));
    }

    #[test]
    fn test_permission_denied_rolls_back_engine() {
        let mut h = Harness::new(Options {
            consent: true,
            ..Options::default()
        });

        h.command(Command::Start);
        h.pump_until(SessionState::PermissionPending);
        assert!(h
            .updates()
            .iter()
            .any(|u| matches!(u, StatusUpdate::ConsentRequired(_))));

        h.session
            .sender()
            .send(SessionEvent::ConsentResolved { granted: false })
            .unwrap();
        h.pump_until(SessionState::Idle);

        assert_eq!(h.engine.stops.load(Ordering::SeqCst), 1);
        assert!(!h.calls().contains(&"interface.establish"));
        assert!(h
            .updates()
            .iter()
            .any(|u| matches!(u, StatusUpdate::Failure(SessionError::PermissionDenied))));
    }

    #[test]
    fn test_consent_granted_activates() {
        let mut h = Harness::new(Options {
            consent: true,
            ..Options::default()
        });

        h.command(Command::Start);
        h.pump_until(SessionState::PermissionPending);
        h.session.handle(SessionEvent::ConsentResolved { granted: true });

        assert_eq!(h.session.state(), SessionState::Active);
        assert!(h.session.shutdown(Duration::from_secs(5)));
    }

    #[test]
    fn test_start_without_config_is_notice() {
        let mut h = Harness::new(Options {
            no_config: true,
            ..Options::default()
        });

        h.command(Command::Start);

        assert_eq!(h.session.state(), SessionState::Idle);
        let updates = h.updates();
        assert_eq!(updates.len(), 1);
        assert!(matches!(&updates[0], StatusUpdate::Notice(text) if text.contains("not found")));
        assert!(h.calls().is_empty());
    }

    #[test]
    fn test_engine_failure_returns_idle() {
        let mut h = Harness::new(Options {
            failed_start: true,
            ..Options::default()
        });

        h.command(Command::Start);
        h.pump_until(SessionState::Idle);

        assert!(h.updates().iter().any(|u| matches!(
            u,
            StatusUpdate::Failure(SessionError::Engine(EngineError::Rejected(msg))) if msg == "invalid config"
        )));
        assert_eq!(h.engine.stops.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_establish_failure_rolls_back() {
        let mut h = Harness::new(Options {
            fail_establish: true,
            ..Options::default()
        });

        h.command(Command::Start);
        h.pump_until(SessionState::Idle);

        assert_eq!(h.engine.stops.load(Ordering::SeqCst), 1);
        assert!(!h.calls().contains(&"interface.close"));
        assert!(h
            .updates()
            .iter()
            .any(|u| matches!(u, StatusUpdate::Failure(e) if e.is_tunnel())));
    }

    #[test]
    fn test_ping_only_when_engine_up() {
        let mut h = Harness::new(Options::default());

        h.command(Command::Ping);
        assert!(matches!(&h.updates()[..], [StatusUpdate::Notice(_)]));

        h.command(Command::Start);
        h.pump_until(SessionState::Active);
        h.updates();

        h.command(Command::Ping);
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut latency = None;
        while latency.is_none() && Instant::now() < deadline {
            h.session.process_next(Duration::from_millis(20));
            latency = h.updates().into_iter().find_map(|u| match u {
                StatusUpdate::Ping(result) => Some(result),
                _ => None,
            });
        }
        assert_eq!(latency.unwrap().unwrap(), 42);
        assert_eq!(h.session.state(), SessionState::Active);

        assert!(h.session.shutdown(Duration::from_secs(5)));
    }

    #[test]
    fn test_bridge_exit_tears_down_session() {
        let mut h = Harness::new(Options::default());

        h.command(Command::Start);
        h.pump_until(SessionState::Active);

        h.bridge.release_tx.send(Err(BridgeError::Exited(5))).unwrap();
        h.pump_until(SessionState::Idle);

        assert!(h.calls().contains(&"interface.close"));
        assert!(h.updates().iter().any(|u| matches!(
            u,
            StatusUpdate::Failure(SessionError::Bridge(BridgeError::Exited(5)))
        )));
    }

    #[test]
    fn test_start_queued_while_stopping() {
        let mut h = Harness::new(Options::default());

        h.command(Command::Start);
        h.pump_until(SessionState::Active);

        h.updates();
        h.command(Command::Stop);
        h.command(Command::Start);
        assert_eq!(h.session.state(), SessionState::Stopping);

        h.pump_until(SessionState::Active);

        let states: Vec<_> = h
            .updates()
            .into_iter()
            .filter_map(|u| match u {
                StatusUpdate::StateChanged(s) => Some(s),
                _ => None,
            })
            .collect();
        assert_eq!(states[..3], [SessionState::Stopping, SessionState::Idle, SessionState::EngineStarting]);
        assert_eq!(h.engine.stops.load(Ordering::SeqCst), 1);

        assert!(h.session.shutdown(Duration::from_secs(5)));
    }
}
