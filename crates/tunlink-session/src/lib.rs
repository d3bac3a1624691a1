//! tunlink Session - Engine, Tunnel Bridge and Session Lifecycle
//!
//! Coordinates the three external collaborators of a VPN session:
//!
//! ```text
//!                     ┌─────────────────────┐
//!                     │ SessionOrchestrator │ ◀── SessionEvent (commands, completions)
//!                     └──────────┬──────────┘
//!         ┌──────────────────────┼──────────────────────┐
//!         ▼                      ▼                      ▼
//!  ┌──────────────┐    ┌──────────────────┐    ┌──────────────┐
//!  │ EngineClient │    │ VirtualInterface │    │ TunnelBridge │
//!  └──────┬───────┘    └────────┬─────────┘    └──────┬───────┘
//!         ▼                     ▼                     ▼
//!   proxy engine          OS tun device        relay to socks5://127.0.0.1:1080
//! ```
//!
//! # Ordering
//!
//! Startup: engine, consent, interface, bridge. Teardown: bridge, engine,
//! then interface.
//!
//! Background completions are delivered as [`SessionEvent`]s on a channel
//! consumed by the orchestrator, so session state is only ever touched
//! from one thread.

mod bridge;
mod engine;
mod error;
mod interface;
mod message;
mod orchestrator;
mod probe;
mod process;
mod settings;

pub use bridge::{BridgeArgs, BridgeBackend, BridgeError, DnsStrategy, TunnelBridge, Verbosity};
pub use engine::{
    EngineClient, EngineError, EngineResponse, Envelope, PingRequest, ProxyEngine, RunRequest,
};
pub use error::SessionError;
pub use interface::{
    ConsentRequest, InterfaceError, InterfaceSpec, TunnelHandle, VirtualInterface, TUNNEL_MTU,
};
pub use message::{Command, SessionEvent, StatusUpdate};
pub use orchestrator::{SessionOrchestrator, SessionState};
pub use probe::{measure_latency, ProbeError};
pub use process::{ProcessBridge, ProcessEngine};
pub use settings::{SessionSettings, PING_TIMEOUT};
