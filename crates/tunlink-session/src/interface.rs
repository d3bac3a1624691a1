//! Virtual Network Interface
//!
//! The OS-provided point-to-point device that captures device traffic.
//! The orchestrator talks to it only through [`VirtualInterface`]; the
//! interface owns the tunnel descriptor and lends it out as a
//! [`TunnelHandle`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

/// MTU of the interface and the relay
pub const TUNNEL_MTU: u16 = 1500;

/// Opaque tunnel descriptor owned by the interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TunnelHandle(i32);

impl TunnelHandle {
    pub fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> i32 {
        self.0
    }
}

impl fmt::Display for TunnelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fd {}", self.0)
    }
}

/// Request for the user's consent to create the interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsentRequest {
    pub session_name: String,
    pub message: String,
}

impl ConsentRequest {
    pub fn new(session_name: impl Into<String>) -> Self {
        let session_name = session_name.into();
        let message = format!("{} wants to set up a VPN connection", session_name);
        Self {
            session_name,
            message,
        }
    }
}

/// Interface parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InterfaceSpec {
    pub session_name: String,
    pub address: Ipv4Addr,
    pub prefix_len: u8,
    /// CIDR routes captured by the interface
    pub routes: Vec<String>,
    /// Applications excluded from the tunnel
    pub disallowed_apps: Vec<String>,
}

impl Default for InterfaceSpec {
    fn default() -> Self {
        Self {
            session_name: "tunlink".to_string(),
            address: Ipv4Addr::new(10, 0, 0, 2),
            prefix_len: 24,
            routes: vec!["0.0.0.0/0".to_string()],
            disallowed_apps: vec!["tunlink".to_string()],
        }
    }
}

impl InterfaceSpec {
    /// Check the parameters before handing them to the OS
    pub fn validate(&self) -> Result<(), InterfaceError> {
        if self.prefix_len > 32 {
            return Err(InterfaceError::InvalidSpec(format!(
                "prefix length {} exceeds 32",
                self.prefix_len
            )));
        }
        for route in &self.routes {
            let valid = route.split_once('/').is_some_and(|(addr, len)| {
                addr.parse::<Ipv4Addr>().is_ok() && len.parse::<u8>().is_ok_and(|l| l <= 32)
            });
            if !valid {
                return Err(InterfaceError::InvalidSpec(format!("bad route {}", route)));
            }
        }
        Ok(())
    }
}

/// Virtual interface errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum InterfaceError {
    #[error("Invalid interface parameters: {0}")]
    InvalidSpec(String),

    #[error("Failed to establish virtual interface: {0}")]
    Establish(String),

    #[error("Failed to close virtual interface: {0}")]
    Close(String),
}

/// OS virtual-interface contract
pub trait VirtualInterface: Send {
    /// `None` when consent is already granted
    fn prepare_consent(&mut self) -> Option<ConsentRequest>;

    /// The user's answer to the last consent request
    fn record_consent(&mut self, _granted: bool) {}

    /// Create the interface and return its tunnel handle
    fn establish(&mut self, spec: &InterfaceSpec) -> Result<TunnelHandle, InterfaceError>;

    /// Tear the interface down, invalidating `handle`
    fn close(&mut self, handle: TunnelHandle) -> Result<(), InterfaceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_spec_is_valid() {
        let spec = InterfaceSpec::default();

        assert!(spec.validate().is_ok());
        assert_eq!(spec.address, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(spec.routes, vec!["0.0.0.0/0"]);
    }

    #[test]
    fn test_invalid_spec() {
        let mut spec = InterfaceSpec {
            prefix_len: 33,
            ..InterfaceSpec::default()
        };
        assert!(spec.validate().is_err());

        spec.prefix_len = 24;
        spec.routes = vec!["0.0.0.0".to_string()];
        assert!(spec.validate().is_err());

        spec.routes = vec!["10.0.0.0/8".to_string(), "10.1.0.0/33".to_string()];
        assert!(spec.validate().is_err());

        spec.routes = vec!["10.0.0.0/8".to_string()];
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_consent_request_message() {
        let request = ConsentRequest::new("tunlink");
        assert!(request.message.starts_with("tunlink"));
    }
}
