//! SOCKS5 Latency Probe
//!
//! Measures the time to open a connection to a target through the local
//! SOCKS5 inbound:
//!
//! ```text
//! probe ──greeting──▶ 127.0.0.1:1080 ──CONNECT target:443──▶ upstream ──▶ target
//!       ◀─────────────────────── reply 0x00 ─────────────────────────────┘
//! ```
//!
//! The elapsed time covers the TCP connect to the proxy, the no-auth
//! greeting and the CONNECT round trip, which includes the proxy's own
//! connection to the target.

use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;
use url::{Host, Url};

const SOCKS5_VERSION: u8 = 0x05;
const AUTH_NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ADDR_IPV4: u8 = 0x01;
const ADDR_DOMAIN: u8 = 0x03;
const ADDR_IPV6: u8 = 0x04;
const REPLY_SUCCESS: u8 = 0x00;

const DEFAULT_SOCKS_PORT: u16 = 1080;

/// Probe errors
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("Invalid URL {0}")]
    InvalidUrl(String),

    #[error("Unsupported proxy scheme: {0}")]
    UnsupportedProxy(String),

    #[error("Proxy refused no-auth greeting")]
    AuthRejected,

    #[error("Proxy replied with code {0:#04x}")]
    Rejected(u8),

    #[error("Malformed proxy reply: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timed out after {}s", .0.as_secs())]
    Timeout(Duration),
}

/// Round-trip milliseconds to `target_url` through `proxy_url`
pub async fn measure_latency(
    proxy_url: &str,
    target_url: &str,
    timeout: Duration,
) -> Result<u64, ProbeError> {
    let (proxy_host, proxy_port) = proxy_endpoint(proxy_url)?;
    let (target_host, target_port) = target_endpoint(target_url)?;

    tokio::time::timeout(timeout, async {
        let started = Instant::now();
        let mut stream = TcpStream::connect((proxy_host.as_str(), proxy_port)).await?;
        stream.set_nodelay(true)?;

        greet(&mut stream).await?;
        connect(&mut stream, &target_host, target_port).await?;

        let elapsed = started.elapsed().as_millis() as u64;
        debug!(
            "Probe to {}:{} through {} took {} ms",
            target_host, target_port, proxy_url, elapsed
        );
        Ok::<u64, ProbeError>(elapsed)
    })
    .await
    .map_err(|_| ProbeError::Timeout(timeout))?
}

fn proxy_endpoint(proxy_url: &str) -> Result<(String, u16), ProbeError> {
    let url = Url::parse(proxy_url).map_err(|e| ProbeError::InvalidUrl(format!("{}: {}", proxy_url, e)))?;
    if !matches!(url.scheme(), "socks5" | "socks5h") {
        return Err(ProbeError::UnsupportedProxy(url.scheme().to_string()));
    }
    let host = url
        .host_str()
        .ok_or_else(|| ProbeError::InvalidUrl(proxy_url.to_string()))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    Ok((host, url.port().unwrap_or(DEFAULT_SOCKS_PORT)))
}

fn target_endpoint(target_url: &str) -> Result<(Host<String>, u16), ProbeError> {
    let url = Url::parse(target_url).map_err(|e| ProbeError::InvalidUrl(format!("{}: {}", target_url, e)))?;
    let host = url
        .host()
        .ok_or_else(|| ProbeError::InvalidUrl(target_url.to_string()))?
        .to_owned();
    let port = url
        .port_or_known_default()
        .ok_or_else(|| ProbeError::InvalidUrl(target_url.to_string()))?;
    Ok((host, port))
}

async fn greet(stream: &mut TcpStream) -> Result<(), ProbeError> {
    stream.write_all(&[SOCKS5_VERSION, 1, AUTH_NO_AUTH]).await?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply[0] != SOCKS5_VERSION {
        return Err(ProbeError::Protocol(format!("version {:#04x}", reply[0])));
    }
    if reply[1] != AUTH_NO_AUTH {
        return Err(ProbeError::AuthRejected);
    }
    Ok(())
}

async fn connect(stream: &mut TcpStream, host: &Host<String>, port: u16) -> Result<(), ProbeError> {
    let mut request = vec![SOCKS5_VERSION, CMD_CONNECT, 0x00];
    match host {
        Host::Ipv4(ip) => {
            request.push(ADDR_IPV4);
            request.extend_from_slice(&ip.octets());
        }
        Host::Ipv6(ip) => {
            request.push(ADDR_IPV6);
            request.extend_from_slice(&ip.octets());
        }
        Host::Domain(domain) => {
            let len = u8::try_from(domain.len())
                .map_err(|_| ProbeError::InvalidUrl(format!("host too long: {}", domain)))?;
            request.push(ADDR_DOMAIN);
            request.push(len);
            request.extend_from_slice(domain.as_bytes());
        }
    }
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS5_VERSION {
        return Err(ProbeError::Protocol(format!("version {:#04x}", header[0])));
    }
    if header[1] != REPLY_SUCCESS {
        return Err(ProbeError::Rejected(header[1]));
    }

    // Bound address, unused
    let remaining = match header[3] {
        ADDR_IPV4 => 4 + 2,
        ADDR_IPV6 => 16 + 2,
        ADDR_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize + 2
        }
        other => return Err(ProbeError::Protocol(format!("address type {:#04x}", other))),
    };
    let mut bound = vec![0u8; remaining];
    stream.read_exact(&mut bound).await?;
    Ok(())
}
