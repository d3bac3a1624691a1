//! Virtual interface backed by a tunnel descriptor opened by the caller
//!
//! The process that launches `tunlink run` creates the tun device, applies
//! address and routes, and passes the open descriptor with `--tun-fd`.
//! The descriptor stays open across sessions so the session can restart.

use tracing::{debug, info};
use tunlink_session::{
    ConsentRequest, InterfaceError, InterfaceSpec, TunnelHandle, VirtualInterface, TUNNEL_MTU,
};

pub struct PreopenedInterface {
    fd: Option<i32>,
    session_name: String,
    /// Consent still has to be asked for
    ask_consent: bool,
    granted: bool,
}

impl PreopenedInterface {
    pub fn new(fd: Option<i32>, ask_consent: bool, session_name: impl Into<String>) -> Self {
        Self {
            fd,
            session_name: session_name.into(),
            ask_consent,
            granted: false,
        }
    }
}

impl VirtualInterface for PreopenedInterface {
    fn prepare_consent(&mut self) -> Option<ConsentRequest> {
        if self.ask_consent && !self.granted {
            Some(ConsentRequest::new(self.session_name.clone()))
        } else {
            None
        }
    }

    fn record_consent(&mut self, granted: bool) {
        self.granted = granted;
    }

    fn establish(&mut self, spec: &InterfaceSpec) -> Result<TunnelHandle, InterfaceError> {
        let fd = match self.fd {
            Some(fd) if fd >= 0 => fd,
            Some(fd) => return Err(InterfaceError::Establish(format!("invalid descriptor {}", fd))),
            None => {
                return Err(InterfaceError::Establish(
                    "no tunnel descriptor, pass --tun-fd".to_string(),
                ))
            }
        };

        info!(
            "Using tunnel descriptor {} for {} ({}/{}, mtu {})",
            fd, spec.session_name, spec.address, spec.prefix_len, TUNNEL_MTU
        );
        debug!(
            "Routes {:?} and exclusions {:?} are applied by the caller",
            spec.routes, spec.disallowed_apps
        );
        Ok(TunnelHandle::from_raw(fd))
    }

    fn close(&mut self, handle: TunnelHandle) -> Result<(), InterfaceError> {
        debug!("Releasing {}; descriptor left open for the next session", handle);
        Ok(())
    }
}
