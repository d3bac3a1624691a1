//! Engine Config Synthesis
//!
//! Builds the four-section engine document (log, inbounds, outbounds,
//! routing) from a list of proxy descriptors.
//!
//! The inbound and routing sections are fixed: a local SOCKS5 listener on
//! `127.0.0.1:1080` and a rule set that blocks ads, sends CN and private
//! traffic direct and everything else through the outbounds.

use crate::descriptor::{Credentials, ProxyDescriptor, Scheme};
use crate::link::ParseError;
use serde::{Deserialize, Serialize};
use serde_json::ser::PrettyFormatter;
use serde_json::Value;

/// Local SOCKS5 inbound
pub const SOCKS_PORT: u16 = 1080;
pub const SOCKS_LISTEN: &str = "127.0.0.1";
pub const INBOUND_TAG: &str = "socks";

/// URL of the local SOCKS5 inbound, as seen by clients on this host
pub fn socks_proxy_url() -> String {
    format!("socks5://{}:{}", SOCKS_LISTEN, SOCKS_PORT)
}

/// Routing targets
pub const PROXY_TAG: &str = "proxy";
pub const DIRECT_TAG: &str = "direct";
pub const BLOCK_TAG: &str = "block";

/// Indentation of documents written to disk
const INDENT: &[u8] = b"    ";

/// Engine configuration document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigDocument {
    pub log: LogSection,
    pub inbounds: Vec<Inbound>,
    pub outbounds: Vec<Outbound>,
    pub routing: Routing,
}

impl ConfigDocument {
    /// Document with the fixed sections and the given outbounds
    pub fn new(outbounds: Vec<Outbound>) -> Self {
        Self {
            log: LogSection::default(),
            inbounds: vec![Inbound::default()],
            outbounds,
            routing: Routing::default(),
        }
    }

    /// True when there is nothing to connect through
    pub fn is_empty(&self) -> bool {
        self.outbounds.is_empty()
    }

    /// Parse a document from JSON text
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Serialize as a JSON value
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// Serialize with 4-space indentation
    pub fn to_pretty_json(&self) -> Result<String, serde_json::Error> {
        pretty_json(self)
    }

    /// Recover descriptors from the outbounds, skipping unknown protocols
    pub fn descriptors(&self) -> Vec<ProxyDescriptor> {
        self.outbounds
            .iter()
            .filter_map(|o| ProxyDescriptor::try_from(o).ok())
            .collect()
    }
}

/// Serialize any value with the on-disk indentation
pub(crate) fn pretty_json<T: Serialize + ?Sized>(value: &T) -> Result<String, serde_json::Error> {
    let mut out = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut out, PrettyFormatter::with_indent(INDENT));
    value.serialize(&mut ser)?;
    // serde_json only emits valid UTF-8
    Ok(String::from_utf8_lossy(&out).into_owned())
}

/// Build an engine document from descriptors, one outbound each, in order
pub fn synthesize(descriptors: &[ProxyDescriptor]) -> ConfigDocument {
    ConfigDocument::new(descriptors.iter().map(Outbound::from).collect())
}

/// `log` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogSection {
    pub loglevel: String,
    pub access: String,
    pub error: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            loglevel: "debug".to_string(),
            access: String::new(),
            error: String::new(),
        }
    }
}

/// Local SOCKS5 inbound
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inbound {
    pub tag: String,
    pub port: u16,
    pub listen: String,
    pub protocol: String,
    pub sniffing: Sniffing,
    pub settings: SocksSettings,
}

impl Default for Inbound {
    fn default() -> Self {
        Self {
            tag: INBOUND_TAG.to_string(),
            port: SOCKS_PORT,
            listen: SOCKS_LISTEN.to_string(),
            protocol: "socks".to_string(),
            sniffing: Sniffing {
                enabled: true,
                dest_override: vec!["http".to_string(), "tls".to_string()],
            },
            settings: SocksSettings {
                auth: "noauth".to_string(),
                udp: true,
                allow_transparent: false,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sniffing {
    pub enabled: bool,
    pub dest_override: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SocksSettings {
    pub auth: String,
    pub udp: bool,
    pub allow_transparent: bool,
}

/// Upstream proxy outbound
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Outbound {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    pub protocol: String,
    pub settings: OutboundSettings,
    pub stream_settings: StreamSettings,
}

/// Server list, shaped per protocol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutboundSettings {
    /// vmess and vless
    Vnext { vnext: Vec<VnextServer> },
    /// trojan
    Servers { servers: Vec<TrojanServer> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VnextServer {
    pub address: String,
    pub port: u16,
    pub users: Vec<VnextUser>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VnextUser {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alter_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrojanServer {
    pub address: String,
    pub port: u16,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSettings {
    pub network: String,
    pub security: String,
    pub tcp_settings: TcpSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TcpSettings {
    pub header: TcpHeader,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TcpHeader {
    #[serde(rename = "type")]
    pub kind: String,
}

impl From<&ProxyDescriptor> for Outbound {
    fn from(d: &ProxyDescriptor) -> Self {
        let settings = match &d.credentials {
            Credentials::Vmess {
                user_id,
                alter_id,
                cipher,
            } => OutboundSettings::Vnext {
                vnext: vec![VnextServer {
                    address: d.address.clone(),
                    port: d.port,
                    users: vec![VnextUser {
                        id: user_id.clone(),
                        alter_id: Some(*alter_id),
                        security: Some(cipher.clone()),
                        encryption: None,
                    }],
                }],
            },
            Credentials::Vless {
                user_id,
                encryption,
            } => OutboundSettings::Vnext {
                vnext: vec![VnextServer {
                    address: d.address.clone(),
                    port: d.port,
                    users: vec![VnextUser {
                        id: user_id.clone(),
                        alter_id: None,
                        security: None,
                        encryption: Some(encryption.clone()),
                    }],
                }],
            },
            Credentials::Trojan { password } => OutboundSettings::Servers {
                servers: vec![TrojanServer {
                    address: d.address.clone(),
                    port: d.port,
                    password: password.clone(),
                }],
            },
        };

        Self {
            tag: d.tag.clone(),
            protocol: d.scheme().protocol().to_string(),
            settings,
            stream_settings: StreamSettings {
                network: d.network.clone(),
                security: d.security.clone(),
                tcp_settings: TcpSettings {
                    header: TcpHeader {
                        kind: d.header_type.clone(),
                    },
                },
            },
        }
    }
}

impl TryFrom<&Outbound> for ProxyDescriptor {
    type Error = ParseError;

    fn try_from(o: &Outbound) -> Result<Self, Self::Error> {
        let scheme = Scheme::from_protocol(&o.protocol).ok_or(ParseError::UnsupportedScheme)?;

        let (address, port, credentials) = match (&o.settings, scheme) {
            (OutboundSettings::Vnext { vnext }, Scheme::Vmess | Scheme::Vless) => {
                let server = vnext.first().ok_or(ParseError::MissingField("vnext"))?;
                let user = server.users.first().ok_or(ParseError::MissingField("users"))?;
                let credentials = if scheme == Scheme::Vmess {
                    Credentials::Vmess {
                        user_id: user.id.clone(),
                        alter_id: user.alter_id.unwrap_or(0),
                        cipher: user
                            .security
                            .clone()
                            .unwrap_or_else(|| crate::descriptor::DEFAULT_VMESS_CIPHER.to_string()),
                    }
                } else {
                    Credentials::Vless {
                        user_id: user.id.clone(),
                        encryption: user
                            .encryption
                            .clone()
                            .unwrap_or_else(|| crate::descriptor::VLESS_ENCRYPTION.to_string()),
                    }
                };
                (server.address.clone(), server.port, credentials)
            }
            (OutboundSettings::Servers { servers }, Scheme::Trojan) => {
                let server = servers.first().ok_or(ParseError::MissingField("servers"))?;
                (
                    server.address.clone(),
                    server.port,
                    Credentials::trojan(server.password.clone()),
                )
            }
            _ => {
                return Err(ParseError::InvalidField {
                    field: "settings",
                    value: o.protocol.clone(),
                })
            }
        };

        if port == 0 {
            return Err(ParseError::InvalidPort(port.to_string()));
        }

        Ok(ProxyDescriptor {
            tag: o.tag.clone(),
            address,
            port,
            network: o.stream_settings.network.clone(),
            security: o.stream_settings.security.clone(),
            header_type: o.stream_settings.tcp_settings.header.kind.clone(),
            credentials,
        })
    }
}

/// `routing` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Routing {
    pub domain_strategy: String,
    pub domain_matcher: String,
    pub rules: Vec<RoutingRule>,
}

impl Default for Routing {
    fn default() -> Self {
        Self {
            domain_strategy: "IPIfNonMatch".to_string(),
            domain_matcher: "hybrid".to_string(),
            rules: vec![
                RoutingRule::domains(&["geosite:category-ads-all"], BLOCK_TAG),
                RoutingRule::domains(&["geosite:cn"], DIRECT_TAG),
                RoutingRule::ips(&["geoip:private", "geoip:cn"], DIRECT_TAG),
                RoutingRule::ports("0-65535", PROXY_TAG),
            ],
        }
    }
}

/// One routing rule; exactly one matcher is set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingRule {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    pub outbound_tag: String,
}

impl RoutingRule {
    fn field(outbound_tag: &str) -> Self {
        Self {
            kind: "field".to_string(),
            domain: None,
            ip: None,
            port: None,
            outbound_tag: outbound_tag.to_string(),
        }
    }

    pub fn domains(domains: &[&str], outbound_tag: &str) -> Self {
        Self {
            domain: Some(domains.iter().map(|d| d.to_string()).collect()),
            ..Self::field(outbound_tag)
        }
    }

    pub fn ips(ips: &[&str], outbound_tag: &str) -> Self {
        Self {
            ip: Some(ips.iter().map(|i| i.to_string()).collect()),
            ..Self::field(outbound_tag)
        }
    }

    pub fn ports(range: &str, outbound_tag: &str) -> Self {
        Self {
            port: Some(range.to_string()),
            ..Self::field(outbound_tag)
        }
    }
}
