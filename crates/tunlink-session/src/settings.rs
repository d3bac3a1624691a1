//! Session settings (`[session]` table of the application settings)
//!
//! The relay proxy address, MTU and ping bound are fixed; only the engine
//! memory cap, the ping target and the interface addressing are tunable.

use crate::interface::InterfaceSpec;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Latency probe bound
pub const PING_TIMEOUT: Duration = Duration::from_secs(10);

/// Engine, probe and interface parameters for one session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionSettings {
    /// Engine memory ceiling in bytes
    #[serde(default = "default_max_memory")]
    pub max_memory: u64,

    /// Latency probe target
    #[serde(default = "default_ping_url")]
    pub ping_url: String,

    /// Virtual interface parameters
    #[serde(default)]
    pub interface: InterfaceSpec,
}

fn default_max_memory() -> u64 {
    128 * 1024 * 1024
}

fn default_ping_url() -> String {
    "https://www.google.com".to_string()
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_memory: default_max_memory(),
            ping_url: default_ping_url(),
            interface: InterfaceSpec::default(),
        }
    }
}
