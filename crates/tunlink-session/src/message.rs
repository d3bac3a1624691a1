//! Messages in and out of the session state machine.

use crate::bridge::BridgeError;
use crate::engine::EngineError;
use crate::error::SessionError;
use crate::interface::ConsentRequest;
use crate::orchestrator::SessionState;

/// User-issued commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    Ping,
}

/// Input to the state machine: user commands and background completions
#[derive(Debug)]
pub enum SessionEvent {
    User(Command),
    /// Answer to a [`StatusUpdate::ConsentRequired`]
    ConsentResolved { granted: bool },
    EngineStarted(Result<(), EngineError>),
    EngineStopped(Result<(), EngineError>),
    PingCompleted(Result<u64, EngineError>),
    BridgeExited {
        worker: u64,
        result: Result<(), BridgeError>,
    },
}

/// Output of the state machine, for whoever renders status
#[derive(Debug)]
pub enum StatusUpdate {
    StateChanged(SessionState),
    /// Progress messages
    Info(String),
    /// Rejected requests; no state change
    Notice(String),
    /// Surfaced errors
    Failure(SessionError),
    ConsentRequired(ConsentRequest),
    Ping(Result<u64, EngineError>),
}

impl StatusUpdate {
    /// One-line text for a status line
    pub fn describe(&self) -> String {
        match self {
            StatusUpdate::StateChanged(state) => format!("State: {}", state),
            StatusUpdate::Info(text) | StatusUpdate::Notice(text) => text.clone(),
            StatusUpdate::Failure(e) => format!("Error: {}", e),
            StatusUpdate::ConsentRequired(request) => request.message.clone(),
            StatusUpdate::Ping(Ok(ms)) => format!("Ping success: {} ms", ms),
            StatusUpdate::Ping(Err(e)) => format!("Ping failed: {}", e),
        }
    }
}
