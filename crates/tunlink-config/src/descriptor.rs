//! Proxy Descriptors
//!
//! Normalized, protocol-tagged records produced by parsing one share-link.

use std::fmt;

/// Default transport, TLS mode and header type when a link omits them
pub const DEFAULT_NETWORK: &str = "none";
pub const DEFAULT_SECURITY: &str = "none";
pub const DEFAULT_HEADER_TYPE: &str = "none";

/// vmess cipher when the payload has no `scy`
pub const DEFAULT_VMESS_CIPHER: &str = "auto";

/// VLESS carries no payload encryption of its own
pub const VLESS_ENCRYPTION: &str = "none";

/// Share-link scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Vmess,
    Vless,
    Trojan,
}

impl Scheme {
    /// All recognised schemes
    pub fn all() -> &'static [Scheme] {
        &[Scheme::Vmess, Scheme::Vless, Scheme::Trojan]
    }

    /// URI prefix including `://`
    pub fn prefix(&self) -> &'static str {
        match self {
            Scheme::Vmess => "vmess://",
            Scheme::Vless => "vless://",
            Scheme::Trojan => "trojan://",
        }
    }

    /// Engine protocol name
    pub fn protocol(&self) -> &'static str {
        match self {
            Scheme::Vmess => "vmess",
            Scheme::Vless => "vless",
            Scheme::Trojan => "trojan",
        }
    }

    /// Look up a scheme by its engine protocol name
    pub fn from_protocol(protocol: &str) -> Option<Self> {
        Self::all().iter().copied().find(|s| s.protocol() == protocol)
    }

    /// Split a link into its scheme and the remainder after the prefix
    pub fn detect(link: &str) -> Option<(Scheme, &str)> {
        Self::all()
            .iter()
            .find_map(|s| link.strip_prefix(s.prefix()).map(|rest| (*s, rest)))
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.protocol())
    }
}

/// Protocol-specific credentials
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    Vmess {
        user_id: String,
        alter_id: u32,
        cipher: String,
    },
    Vless {
        user_id: String,
        encryption: String,
    },
    Trojan {
        password: String,
    },
}

impl Credentials {
    /// VLESS credentials with the fixed encryption mode
    pub fn vless(user_id: impl Into<String>) -> Self {
        Credentials::Vless {
            user_id: user_id.into(),
            encryption: VLESS_ENCRYPTION.to_string(),
        }
    }

    /// Trojan credentials
    pub fn trojan(password: impl Into<String>) -> Self {
        Credentials::Trojan {
            password: password.into(),
        }
    }

    /// Scheme these credentials belong to
    pub fn scheme(&self) -> Scheme {
        match self {
            Credentials::Vmess { .. } => Scheme::Vmess,
            Credentials::Vless { .. } => Scheme::Vless,
            Credentials::Trojan { .. } => Scheme::Trojan,
        }
    }
}

/// One upstream proxy server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyDescriptor {
    /// Display name
    pub tag: Option<String>,
    /// Server address (host name or IP literal)
    pub address: String,
    /// Server port (never 0)
    pub port: u16,
    /// Transport type
    pub network: String,
    /// TLS mode
    pub security: String,
    /// Obfuscation header type
    pub header_type: String,
    /// Protocol-specific fields
    pub credentials: Credentials,
}

impl ProxyDescriptor {
    /// Create a descriptor with default transport settings
    pub fn new(address: impl Into<String>, port: u16, credentials: Credentials) -> Self {
        Self {
            tag: None,
            address: address.into(),
            port,
            network: DEFAULT_NETWORK.to_string(),
            security: DEFAULT_SECURITY.to_string(),
            header_type: DEFAULT_HEADER_TYPE.to_string(),
            credentials,
        }
    }

    /// Set the display name
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Scheme of this descriptor
    pub fn scheme(&self) -> Scheme {
        self.credentials.scheme()
    }

    /// `address:port`
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

impl fmt::Display for ProxyDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.tag {
            Some(tag) => write!(f, "{} {} ({})", self.scheme(), self.endpoint(), tag),
            None => write!(f, "{} {}", self.scheme(), self.endpoint()),
        }
    }
}
