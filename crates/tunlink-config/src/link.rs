//! Share-Link Parser
//!
//! # Formats
//!
//! ```text
//! vmess://<base64(JSON {ps, add, port, id, aid, scy, net, tls, type})>
//! vless://<uuid>@<address>:<port>[?key=value&...][#tag]
//! trojan://<password>@<address>:<port>[?key=value&...][#tag]
//! ```
//!
//! Parsing is lenient in the way real-world link generators need: optional
//! query parameters fall back to `"none"`, malformed parameters are skipped,
//! and a fragment glued onto `headerType` is cut off.

use crate::descriptor::{Credentials, ProxyDescriptor, Scheme, DEFAULT_VMESS_CIPHER};
use base64::{
    engine::general_purpose::{STANDARD as BASE64, STANDARD_NO_PAD as BASE64_NO_PAD},
    Engine as _,
};
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Share-link parse errors
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("Unsupported scheme")]
    UnsupportedScheme,

    #[error("Invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Payload is not UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("Invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Payload is not a JSON object")]
    NotAnObject,

    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("Invalid {field}: {value}")]
    InvalidField { field: &'static str, value: String },

    #[error("Missing '{0}' separator")]
    MissingSeparator(char),

    #[error("Invalid port: {0}")]
    InvalidPort(String),
}

/// Parse a single share-link
///
/// Returns `None` for unrecognised schemes and for malformed links; the
/// failure reason of a malformed link is logged, never returned.
pub fn parse(link: &str) -> Option<ProxyDescriptor> {
    match try_parse(link) {
        Ok(descriptor) => {
            debug!("Parsed share-link: {}", descriptor);
            Some(descriptor)
        }
        Err(ParseError::UnsupportedScheme) => None,
        Err(e) => {
            warn!("Skipping malformed share-link: {}", e);
            None
        }
    }
}

/// Parse a single share-link, keeping the failure reason
pub fn try_parse(link: &str) -> Result<ProxyDescriptor, ParseError> {
    let (scheme, rest) = Scheme::detect(link).ok_or(ParseError::UnsupportedScheme)?;

    match scheme {
        Scheme::Vmess => parse_vmess(rest),
        Scheme::Vless => parse_uri(rest, Credentials::vless),
        Scheme::Trojan => parse_uri(rest, Credentials::trojan),
    }
}

fn parse_vmess(payload: &str) -> Result<ProxyDescriptor, ParseError> {
    let compact: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = match BASE64.decode(&compact) {
        Ok(bytes) => bytes,
        Err(_) => BASE64_NO_PAD.decode(compact.trim_end_matches('='))?,
    };
    let text = String::from_utf8(bytes)?;

    let value: Value = serde_json::from_str(&text)?;
    let obj = value.as_object().ok_or(ParseError::NotAnObject)?;

    let address = required_str(obj, "add")?;
    let port = port_from_int(required_int(obj, "port")?)?;
    let user_id = required_str(obj, "id")?;
    let aid = required_int(obj, "aid")?;
    let alter_id = u32::try_from(aid).map_err(|_| ParseError::InvalidField {
        field: "aid",
        value: aid.to_string(),
    })?;

    let cipher = optional_str(obj, "scy").unwrap_or(DEFAULT_VMESS_CIPHER);
    let credentials = Credentials::Vmess {
        user_id: user_id.to_string(),
        alter_id,
        cipher: cipher.to_string(),
    };

    let mut descriptor = ProxyDescriptor::new(address, port, credentials);
    descriptor.tag = optional_str(obj, "ps").map(str::to_string);
    if let Some(net) = optional_str(obj, "net") {
        descriptor.network = net.to_string();
    }
    if let Some(tls) = optional_str(obj, "tls") {
        descriptor.security = tls.to_string();
    }
    if let Some(header) = optional_str(obj, "type") {
        descriptor.header_type = header.to_string();
    }

    Ok(descriptor)
}

fn parse_uri(
    rest: &str,
    credentials: fn(String) -> Credentials,
) -> Result<ProxyDescriptor, ParseError> {
    let (credential, server) = rest.split_once('@').ok_or(ParseError::MissingSeparator('@'))?;
    let (address, tail) = server.split_once(':').ok_or(ParseError::MissingSeparator(':'))?;

    let (tail, fragment) = match tail.split_once('#') {
        Some((tail, fragment)) => (tail, Some(fragment)),
        None => (tail, None),
    };
    let (port, query) = tail.split_once('?').unwrap_or((tail, ""));
    let port = parse_port(port)?;

    let params = query_params(query);
    let mut descriptor = ProxyDescriptor::new(address, port, credentials(credential.to_string()));
    descriptor.tag = fragment.map(decode_fragment);

    if let Some(network) = params.get("type") {
        descriptor.network = network.clone();
    }
    if let Some(security) = params.get("security") {
        descriptor.security = security.clone();
    }
    if let Some(header) = params.get("headerType") {
        // `http#tag` from generators that percent-encode the fragment into the value
        let header = header.split_once('#').map_or(header.as_str(), |(h, _)| h);
        descriptor.header_type = header.to_string();
    }

    Ok(descriptor)
}

/// Parse `key=value&key=value`, skipping anything of another shape
fn query_params(query: &str) -> HashMap<&str, String> {
    query
        .split('&')
        .filter_map(|pair| {
            let mut parts = pair.split('=');
            match (parts.next(), parts.next(), parts.next()) {
                (Some(key), Some(value), None) if !key.is_empty() && !value.is_empty() => {
                    let value = urlencoding::decode(value)
                        .map(|v| v.into_owned())
                        .unwrap_or_else(|_| value.to_string());
                    Some((key, value))
                }
                _ => None,
            }
        })
        .collect()
}

/// Form-decode a fragment; undecodable input is kept verbatim
fn decode_fragment(fragment: &str) -> String {
    let spaced = fragment.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(tag) => tag.into_owned(),
        Err(_) => fragment.to_string(),
    }
}

fn parse_port(raw: &str) -> Result<u16, ParseError> {
    match raw.trim().parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(ParseError::InvalidPort(raw.to_string())),
    }
}

fn port_from_int(value: i64) -> Result<u16, ParseError> {
    match u16::try_from(value) {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(ParseError::InvalidPort(value.to_string())),
    }
}

fn required_str<'a>(obj: &'a Map<String, Value>, field: &'static str) -> Result<&'a str, ParseError> {
    obj.get(field)
        .and_then(Value::as_str)
        .ok_or(ParseError::MissingField(field))
}

/// Integer field given as a JSON number or a numeric string
fn required_int(obj: &Map<String, Value>, field: &'static str) -> Result<i64, ParseError> {
    match obj.get(field) {
        Some(Value::Number(n)) => n.as_i64().ok_or_else(|| ParseError::InvalidField {
            field,
            value: n.to_string(),
        }),
        Some(Value::String(s)) => s.trim().parse().map_err(|_| ParseError::InvalidField {
            field,
            value: s.clone(),
        }),
        Some(other) => Err(ParseError::InvalidField {
            field,
            value: other.to_string(),
        }),
        None => Err(ParseError::MissingField(field)),
    }
}

fn optional_str<'a>(obj: &'a Map<String, Value>, field: &str) -> Option<&'a str> {
    obj.get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vmess_link(payload: &str) -> String {
        format!("vmess://{}", BASE64.encode(payload))
    }

    #[test]
    fn test_trojan_link() {
        let d = parse("trojan://pw@1.2.3.4:443?security=tls&type=ws#MyServer").unwrap();

        assert_eq!(d.credentials, Credentials::trojan("pw"));
        assert_eq!(d.address, "1.2.3.4");
        assert_eq!(d.port, 443);
        assert_eq!(d.network, "ws");
        assert_eq!(d.security, "tls");
        assert_eq!(d.header_type, "none");
        assert_eq!(d.tag.as_deref(), Some("MyServer"));
    }

    #[test]
    fn test_vless_link() {
        let d = parse("vless://b831381d-6324@example.com:8443?type=tcp&headerType=http#Tokyo%20%231")
            .unwrap();

        assert_eq!(
            d.credentials,
            Credentials::Vless {
                user_id: "b831381d-6324".into(),
                encryption: "none".into(),
            }
        );
        assert_eq!(d.address, "example.com");
        assert_eq!(d.port, 8443);
        assert_eq!(d.network, "tcp");
        assert_eq!(d.security, "none");
        assert_eq!(d.header_type, "http");
        assert_eq!(d.tag.as_deref(), Some("Tokyo #1"));
    }

    #[test]
    fn test_vless_invalid_port() {
        assert!(parse("vless://uuid@host:notaport").is_none());
        assert!(parse("vless://uuid@host:0").is_none());
        assert!(parse("vless://uuid@host:70000?type=ws").is_none());
        assert!(matches!(
            try_parse("vless://uuid@host:notaport"),
            Err(ParseError::InvalidPort(_))
        ));
    }

    #[test]
    fn test_missing_separators() {
        assert!(matches!(
            try_parse("vless://uuid-host-443"),
            Err(ParseError::MissingSeparator('@'))
        ));
        assert!(matches!(
            try_parse("trojan://pw@host"),
            Err(ParseError::MissingSeparator(':'))
        ));
    }

    #[test]
    fn test_unknown_scheme() {
        assert!(parse("ss://YWVzLTI1Ni1nY206cGFzcw@1.2.3.4:8388").is_none());
        assert!(parse("https://example.com").is_none());
        assert!(parse("").is_none());
        assert!(matches!(try_parse("hello"), Err(ParseError::UnsupportedScheme)));
    }

    #[test]
    fn test_port_without_query() {
        let d = parse("trojan://secret@host.example:443").unwrap();
        assert_eq!(d.port, 443);
        assert!(d.tag.is_none());
        assert_eq!(d.network, "none");

        let d = parse("trojan://secret@host.example:443#Plain").unwrap();
        assert_eq!(d.port, 443);
        assert_eq!(d.tag.as_deref(), Some("Plain"));
    }

    #[test]
    fn test_malformed_params_skipped() {
        let d = parse("trojan://pw@h:443?junk&type=grpc&a=b=c&security=&=x").unwrap();

        assert_eq!(d.network, "grpc");
        assert_eq!(d.security, "none");
    }

    #[test]
    fn test_query_values_are_decoded() {
        let d = parse("vless://id@h:443?type=h2%2Bws&security=tls#Tag").unwrap();

        assert_eq!(d.network, "h2+ws");
        assert_eq!(d.security, "tls");
    }

    #[test]
    fn test_header_type_truncated_at_hash() {
        let d = parse("vless://id@h:443?headerType=http%23Stray#Tag").unwrap();

        assert_eq!(d.header_type, "http");
        assert_eq!(d.tag.as_deref(), Some("Tag"));
    }

    #[test]
    fn test_vmess_link() {
        let link = vmess_link(
            r#"{"v":"2","ps":"HK-01","add":"hk.example.net","port":"10086","id":"2b2f5b7e","aid":0,"scy":"aes-128-gcm","net":"ws","tls":"tls","type":"none"}"#,
        );
        let d = parse(&link).unwrap();

        assert_eq!(d.tag.as_deref(), Some("HK-01"));
        assert_eq!(d.address, "hk.example.net");
        assert_eq!(d.port, 10086);
        assert_eq!(d.network, "ws");
        assert_eq!(d.security, "tls");
        assert_eq!(
            d.credentials,
            Credentials::Vmess {
                user_id: "2b2f5b7e".into(),
                alter_id: 0,
                cipher: "aes-128-gcm".into(),
            }
        );
    }

    #[test]
    fn test_vmess_optional_defaults() {
        let d = parse(&vmess_link(r#"{"add":"1.1.1.1","port":443,"id":"u","aid":"4"}"#)).unwrap();

        assert!(d.tag.is_none());
        assert_eq!(d.network, "none");
        assert_eq!(d.security, "none");
        assert_eq!(d.header_type, "none");
        assert!(matches!(
            d.credentials,
            Credentials::Vmess { alter_id: 4, ref cipher, .. } if cipher == "auto"
        ));
    }

    #[test]
    fn test_vmess_unpadded_payload() {
        let payload = r#"{"add":"1.1.1.1","port":443,"id":"u","aid":0}"#;
        let link = format!("vmess://{}", BASE64_NO_PAD.encode(payload));

        assert!(parse(&link).is_some());
    }

    #[test]
    fn test_vmess_failures() {
        assert!(matches!(
            try_parse(&vmess_link(r#"{"add":"1.1.1.1","port":443,"aid":0}"#)),
            Err(ParseError::MissingField("id"))
        ));
        assert!(matches!(
            try_parse(&vmess_link(r#"{"add":"1.1.1.1","port":"x","id":"u","aid":0}"#)),
            Err(ParseError::InvalidField { field: "port", .. })
        ));
        assert!(matches!(
            try_parse(&vmess_link(r#"{"add":"1.1.1.1","port":443,"id":"u","aid":-1}"#)),
            Err(ParseError::InvalidField { field: "aid", .. })
        ));
        assert!(matches!(
            try_parse(&vmess_link("[1,2,3]")),
            Err(ParseError::NotAnObject)
        ));
        assert!(matches!(try_parse(&vmess_link("not json")), Err(ParseError::Json(_))));
        assert!(parse("vmess://@@@not-base64@@@").is_none());
        assert!(parse(&format!("vmess://{}", BASE64.encode([0xff, 0xfe, 0x00]))).is_none());
    }
}
