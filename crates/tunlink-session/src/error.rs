//! Session error taxonomy

use crate::bridge::BridgeError;
use crate::engine::EngineError;
use crate::interface::InterfaceError;
use tunlink_config::ConfigError;

/// Errors surfaced on the status channel
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("VPN permission denied")]
    PermissionDenied,

    #[error("Tunnel error: {0}")]
    Interface(#[from] InterfaceError),

    #[error("Tunnel error: {0}")]
    Bridge(#[from] BridgeError),
}

impl SessionError {
    /// Tunnel-side failure (interface or bridge)
    pub fn is_tunnel(&self) -> bool {
        matches!(self, SessionError::Interface(_) | SessionError::Bridge(_))
    }
}
