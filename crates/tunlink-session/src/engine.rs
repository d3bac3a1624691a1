//! Proxy Engine Client
//!
//! The engine is an external component driven through three raw calls,
//! each taking and returning a base64-encoded JSON envelope:
//!
//! ```text
//! run   <- {datDir, configPath, maxMemory}                -> {success, ...}
//! stop  <- ()                                             -> {success, ...} | ""
//! ping  <- {datDir, configPath, timeout, url, proxy}      -> {success, data: ms, error}
//! ```
//!
//! [`EngineClient`] builds the requests and interprets the responses.
//! The calls block; callers run them off the foreground.

use crate::settings::{SessionSettings, PING_TIMEOUT};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tunlink_config::socks_proxy_url;
use tracing::{debug, info, warn};

/// Engine errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("Engine call failed: {0}")]
    Call(String),

    #[error("{0}")]
    Rejected(String),

    #[error("Malformed engine response: {0}")]
    Malformed(String),

    #[error("Engine task failed: {0}")]
    Task(String),

    #[error("Ping timed out after {0}s")]
    Timeout(u64),
}

/// Raw engine entry points
pub trait ProxyEngine: Send + Sync {
    fn run(&self, request: &str) -> Result<String, EngineError>;
    fn stop(&self) -> Result<String, EngineError>;
    fn ping(&self, request: &str) -> Result<String, EngineError>;
}

/// base64(JSON) wire form shared by every engine message
pub trait Envelope: Serialize + DeserializeOwned {
    fn encode(&self) -> Result<String, EngineError> {
        let json = serde_json::to_vec(self).map_err(|e| EngineError::Malformed(e.to_string()))?;
        Ok(BASE64.encode(json))
    }

    fn decode(raw: &str) -> Result<Self, EngineError> {
        let text = decode_text(raw)?;
        serde_json::from_str(&text).map_err(|_| EngineError::Malformed(text))
    }
}

/// Decode the base64 layer only
fn decode_text(raw: &str) -> Result<String, EngineError> {
    let bytes = BASE64
        .decode(raw.trim())
        .map_err(|e| EngineError::Malformed(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| EngineError::Malformed(e.to_string()))
}

/// Start request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    pub dat_dir: String,
    pub config_path: String,
    pub max_memory: u64,
}

impl Envelope for RunRequest {}

/// Latency probe request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingRequest {
    pub dat_dir: String,
    pub config_path: String,
    /// Seconds
    pub timeout: u64,
    pub url: String,
    pub proxy: String,
}

impl Envelope for PingRequest {}

/// Response to any call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Envelope for EngineResponse {}

impl EngineResponse {
    pub fn ok(data: Option<Value>) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }

    /// `data` as milliseconds (number or numeric string)
    fn latency_ms(&self) -> Option<u64> {
        match self.data.as_ref()? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

/// Typed front for a [`ProxyEngine`]
#[derive(Clone)]
pub struct EngineClient {
    engine: Arc<dyn ProxyEngine>,
    dat_dir: String,
    config_path: String,
    max_memory: u64,
    ping_url: String,
    proxy_url: String,
}

impl EngineClient {
    pub fn new(
        engine: Arc<dyn ProxyEngine>,
        dat_dir: &Path,
        config_path: &Path,
        settings: &SessionSettings,
    ) -> Self {
        Self {
            engine,
            dat_dir: dat_dir.display().to_string(),
            config_path: config_path.display().to_string(),
            max_memory: settings.max_memory,
            ping_url: settings.ping_url.clone(),
            proxy_url: socks_proxy_url(),
        }
    }

    /// Start the engine against the persisted document
    pub fn start(&self) -> Result<(), EngineError> {
        let request = RunRequest {
            dat_dir: self.dat_dir.clone(),
            config_path: self.config_path.clone(),
            max_memory: self.max_memory,
        };
        info!("Starting proxy engine with {}", self.config_path);

        let raw = self.engine.run(&request.encode()?)?;
        let text = decode_text(&raw)?;
        match serde_json::from_str::<EngineResponse>(&text) {
            Ok(response) if response.success => {
                info!("Proxy engine started");
                Ok(())
            }
            Ok(response) => Err(EngineError::Rejected(response.error.unwrap_or(text))),
            Err(_) => Err(EngineError::Rejected(text)),
        }
    }

    /// Stop the engine; an empty response counts as success
    pub fn stop(&self) -> Result<(), EngineError> {
        let raw = self.engine.stop()?;
        if raw.trim().is_empty() {
            debug!("Proxy engine stop returned no response");
            return Ok(());
        }

        let response = EngineResponse::decode(&raw)?;
        if response.success {
            info!("Proxy engine stopped");
            Ok(())
        } else {
            let reason = response.error.unwrap_or_else(|| "stop failed".to_string());
            warn!("Proxy engine stop failed: {}", reason);
            Err(EngineError::Rejected(reason))
        }
    }

    /// Probe latency through the local proxy, in milliseconds
    pub fn ping(&self) -> Result<u64, EngineError> {
        let request = PingRequest {
            dat_dir: self.dat_dir.clone(),
            config_path: self.config_path.clone(),
            timeout: PING_TIMEOUT.as_secs(),
            url: self.ping_url.clone(),
            proxy: self.proxy_url.clone(),
        };

        let response = EngineResponse::decode(&self.engine.ping(&request.encode()?)?)?;
        if !response.success {
            return Err(EngineError::Rejected(
                response.error.unwrap_or_else(|| "unknown error".to_string()),
            ));
        }
        response
            .latency_ms()
            .ok_or_else(|| EngineError::Malformed(format!("latency {:?}", response.data)))
    }
}
