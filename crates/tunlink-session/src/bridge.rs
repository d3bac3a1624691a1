//! Tunnel Bridge
//!
//! Runs the packet relay between the virtual interface and the local
//! SOCKS inbound on a dedicated worker thread. At most one worker is alive
//! at a time; its exit is reported to the orchestrator as a
//! [`SessionEvent::BridgeExited`] tagged with the worker id so that exits
//! of superseded workers can be told apart.
//!
//! A stopped worker may keep relaying for a moment after `stop`; the next
//! `start` waits for it to exit before spawning a replacement.

use crate::interface::{TunnelHandle, TUNNEL_MTU};
use crate::message::SessionEvent;
use crossbeam_channel::Sender;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Longest wait in `start` for a stopped worker to exit
const RETIRE_TIMEOUT: Duration = Duration::from_secs(2);
const RETIRE_POLL: Duration = Duration::from_millis(10);

/// Relay log level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Verbosity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verbosity::Off => "off",
            Verbosity::Error => "error",
            Verbosity::Warn => "warn",
            Verbosity::Info => "info",
            Verbosity::Debug => "debug",
            Verbosity::Trace => "trace",
        }
    }
}

/// How the relay resolves DNS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsStrategy {
    Virtual,
    OverTcp,
    Direct,
}

impl DnsStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DnsStrategy::Virtual => "virtual",
            DnsStrategy::OverTcp => "over-tcp",
            DnsStrategy::Direct => "direct",
        }
    }
}

/// Relay parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeArgs {
    pub proxy_url: String,
    pub tun: TunnelHandle,
    /// The interface keeps ownership of the descriptor
    pub close_fd_on_drop: bool,
    pub mtu: u16,
    pub verbosity: Verbosity,
    pub dns: DnsStrategy,
}

impl BridgeArgs {
    pub fn new(proxy_url: impl Into<String>, tun: TunnelHandle) -> Self {
        Self {
            proxy_url: proxy_url.into(),
            tun,
            close_fd_on_drop: false,
            mtu: TUNNEL_MTU,
            verbosity: Verbosity::Info,
            dns: DnsStrategy::Direct,
        }
    }
}

/// Bridge errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    #[error("Bridge library unavailable")]
    Unavailable,

    #[error("Bridge entry point missing")]
    MissingEntryPoint,

    #[error("Bridge already running")]
    AlreadyRunning,

    #[error("Bridge relay exited with code {0}")]
    Exited(i32),

    #[error("Failed to launch bridge: {0}")]
    Launch(String),

    #[error("Bridge worker panicked")]
    Panicked,
}

impl BridgeError {
    /// Map a native return code; `0` is a clean exit
    pub fn from_code(code: i32) -> Result<(), BridgeError> {
        match code {
            0 => Ok(()),
            -1 => Err(BridgeError::Unavailable),
            -2 => Err(BridgeError::MissingEntryPoint),
            -3 => Err(BridgeError::AlreadyRunning),
            other => Err(BridgeError::Exited(other)),
        }
    }
}

/// Native relay entry points
pub trait BridgeBackend: Send + Sync {
    /// Relay until stopped or failed; blocks the calling thread
    fn run(&self, args: &BridgeArgs) -> Result<(), BridgeError>;

    /// Ask a running relay to exit
    fn stop(&self) -> Result<(), BridgeError>;
}

struct Worker {
    id: u64,
    handle: JoinHandle<()>,
}

/// Owner of the single relay worker
pub struct TunnelBridge {
    backend: Arc<dyn BridgeBackend>,
    worker: Option<Worker>,
    /// Stopped but possibly still relaying
    retired: Option<Worker>,
    next_id: u64,
    events: Sender<SessionEvent>,
}

impl TunnelBridge {
    pub fn new(backend: Arc<dyn BridgeBackend>, events: Sender<SessionEvent>) -> Self {
        Self {
            backend,
            worker: None,
            retired: None,
            next_id: 1,
            events,
        }
    }

    /// Start the relay; returns the id of the live worker
    ///
    /// A no-op while a worker is alive. Fails with
    /// [`BridgeError::AlreadyRunning`] if a stopped worker does not exit
    /// in time.
    pub fn start(&mut self, args: BridgeArgs) -> Result<u64, BridgeError> {
        if let Some(worker) = &self.worker {
            if !worker.handle.is_finished() {
                debug!("Tunnel bridge worker {} already running", worker.id);
                return Ok(worker.id);
            }
        }
        self.await_retired()?;

        let id = self.next_id;
        self.next_id += 1;

        let backend = Arc::clone(&self.backend);
        let events = self.events.clone();
        let handle = thread::Builder::new()
            .name(format!("tunnel-bridge-{}", id))
            .spawn(move || {
                info!("Tunnel bridge worker {} started on {}", id, args.tun);
                let result = panic::catch_unwind(AssertUnwindSafe(|| backend.run(&args)))
                    .unwrap_or_else(|_| {
                        error!("Tunnel bridge worker {} panicked", id);
                        Err(BridgeError::Panicked)
                    });
                info!("Tunnel bridge worker {} stopped: {:?}", id, result);
                if events
                    .send(SessionEvent::BridgeExited { worker: id, result })
                    .is_err()
                {
                    debug!("Session gone, dropping bridge exit of worker {}", id);
                }
            })
            .map_err(|e| BridgeError::Launch(e.to_string()))?;

        self.worker = Some(Worker { id, handle });
        Ok(id)
    }

    /// Stop the relay; a no-op when nothing is running
    ///
    /// Does not wait for the worker; its exit arrives as an event.
    pub fn stop(&mut self) -> Result<(), BridgeError> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        if worker.handle.is_finished() {
            debug!("Tunnel bridge worker {} already exited", worker.id);
            return Ok(());
        }

        info!("Stopping tunnel bridge worker {}", worker.id);
        let result = self.backend.stop().inspect_err(|e| {
            warn!("Tunnel bridge stop failed: {}", e);
        });
        self.retired = Some(worker);
        result
    }

    /// Join the last stopped worker, waiting up to [`RETIRE_TIMEOUT`]
    fn await_retired(&mut self) -> Result<(), BridgeError> {
        let Some(worker) = self.retired.take() else {
            return Ok(());
        };

        let deadline = Instant::now() + RETIRE_TIMEOUT;
        while !worker.handle.is_finished() {
            if Instant::now() >= deadline {
                warn!("Tunnel bridge worker {} still running after stop", worker.id);
                self.retired = Some(worker);
                return Err(BridgeError::AlreadyRunning);
            }
            thread::sleep(RETIRE_POLL);
        }

        debug!("Tunnel bridge worker {} exited after stop", worker.id);
        if worker.handle.join().is_err() {
            warn!("Tunnel bridge worker {} join failed", worker.id);
        }
        Ok(())
    }

    /// Whether `worker` is the live worker
    pub fn is_current(&self, worker: u64) -> bool {
        self.worker.as_ref().is_some_and(|w| w.id == worker)
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.handle.is_finished())
    }

    /// Forget `worker` after its exit event
    pub fn reap(&mut self, worker: u64) {
        if self.is_current(worker) {
            if let Some(w) = self.worker.take() {
                if w.handle.join().is_err() {
                    warn!("Tunnel bridge worker {} join failed", worker);
                }
            }
        }
    }
}

impl Drop for TunnelBridge {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.stop();
        }
    }
}
