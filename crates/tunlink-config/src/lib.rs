//! tunlink Config - Share-Link Conversion and Engine Documents
//!
//! Turns free-text proxy share-links into an engine-ready configuration
//! document and persists it with merge-on-save semantics.
//!
//! # Pipeline
//!
//! ```text
//! ┌────────────┐    ┌──────────────┐    ┌───────────────┐    ┌──────────────┐
//! │ link text  │───▶│  LinkParser  │───▶│  Synthesizer  │───▶│ ConfigStore  │
//! │ (N lines)  │    │ (descriptor) │    │  (document)   │    │ config.json  │
//! └────────────┘    └──────────────┘    └───────────────┘    └──────────────┘
//! ```
//!
//! # Supported Schemes
//!
//! - **vmess://** base64-encoded JSON payload
//! - **vless://** `uuid@address:port?query#tag`
//! - **trojan://** `password@address:port?query#tag`
//!
//! Unrecognised or malformed links are dropped from a batch, never
//! reported as a batch failure.

mod convert;
mod descriptor;
mod link;
mod store;
mod synth;

pub use convert::{convert, parse_batch, Conversion};
pub use descriptor::{Credentials, ProxyDescriptor, Scheme};
pub use link::{parse, try_parse, ParseError};
pub use store::{ConfigError, ConfigStore, CONFIG_FILE_NAME, REQUIRED_SECTIONS};
pub use synth::{
    socks_proxy_url, synthesize, ConfigDocument, Inbound, LogSection, Outbound, OutboundSettings,
    Routing, RoutingRule, StreamSettings, INBOUND_TAG, PROXY_TAG, SOCKS_LISTEN, SOCKS_PORT,
};
