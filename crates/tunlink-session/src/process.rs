//! Process-backed engine and bridge
//!
//! Adapters that satisfy [`ProxyEngine`] and [`BridgeBackend`] by running
//! the external binaries as child processes.

use crate::bridge::{BridgeArgs, BridgeBackend, BridgeError};
use crate::engine::{EngineError, EngineResponse, Envelope, PingRequest, ProxyEngine, RunRequest};
use crate::probe::measure_latency;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

/// How long a freshly started engine must stay up to count as started
const DEFAULT_GRACE: Duration = Duration::from_millis(500);

/// Child process poll interval
const POLL_INTERVAL: Duration = Duration::from_millis(50);

fn lock(slot: &Mutex<Option<Child>>) -> MutexGuard<'_, Option<Child>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

fn kill(mut child: Child) -> io::Result<()> {
    match child.kill() {
        Ok(()) => {}
        // Already exited
        Err(e) if e.kind() == io::ErrorKind::InvalidInput => {}
        Err(e) => return Err(e),
    }
    child.wait().map(|_| ())
}

/// Engine run as `<binary> run -c <configPath>`
pub struct ProcessEngine {
    binary: PathBuf,
    child: Mutex<Option<Child>>,
    runtime: Handle,
    grace: Duration,
}

impl ProcessEngine {
    /// `runtime` drives the latency probe
    pub fn new(binary: impl Into<PathBuf>, runtime: Handle) -> Self {
        Self {
            binary: binary.into(),
            child: Mutex::new(None),
            runtime,
            grace: DEFAULT_GRACE,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    fn launch(&self, request: &RunRequest) -> EngineResponse {
        let mut slot = lock(&self.child);
        if let Some(child) = slot.as_mut() {
            if matches!(child.try_wait(), Ok(None)) {
                return EngineResponse::failed("Engine is already running");
            }
        }

        let spawned = Command::new(&self.binary)
            .arg("run")
            .arg("-c")
            .arg(&request.config_path)
            .env("XRAY_LOCATION_ASSET", &request.dat_dir)
            .env("GOMEMLIMIT", request.max_memory.to_string())
            .stdin(Stdio::null())
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                return EngineResponse::failed(format!(
                    "Failed to launch {}: {}",
                    self.binary.display(),
                    e
                ))
            }
        };
        info!("Engine process {} launched", child.id());

        let deadline = Instant::now() + self.grace;
        while Instant::now() < deadline {
            match child.try_wait() {
                Ok(Some(status)) => {
                    return EngineResponse::failed(format!("Engine exited during startup ({})", status));
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(e) => {
                    let _ = kill(child);
                    return EngineResponse::failed(format!("Failed to watch engine: {}", e));
                }
            }
        }

        *slot = Some(child);
        EngineResponse::ok(None)
    }
}

impl ProxyEngine for ProcessEngine {
    fn run(&self, request: &str) -> Result<String, EngineError> {
        let request = RunRequest::decode(request)?;
        self.launch(&request).encode()
    }

    fn stop(&self) -> Result<String, EngineError> {
        let Some(child) = lock(&self.child).take() else {
            debug!("No engine process to stop");
            return Ok(String::new());
        };

        let pid = child.id();
        match kill(child) {
            Ok(()) => {
                info!("Engine process {} stopped", pid);
                EngineResponse::ok(None).encode()
            }
            Err(e) => EngineResponse::failed(format!("Failed to stop engine: {}", e)).encode(),
        }
    }

    fn ping(&self, request: &str) -> Result<String, EngineError> {
        let request = PingRequest::decode(request)?;
        let timeout = Duration::from_secs(request.timeout);

        let response = match self
            .runtime
            .block_on(measure_latency(&request.proxy, &request.url, timeout))
        {
            Ok(ms) => EngineResponse::ok(Some(ms.into())),
            Err(e) => EngineResponse::failed(e.to_string()),
        };
        response.encode()
    }
}

impl Drop for ProcessEngine {
    fn drop(&mut self) {
        if let Some(child) = lock(&self.child).take() {
            if let Err(e) = kill(child) {
                warn!("Failed to stop engine process on drop: {}", e);
            }
        }
    }
}

/// Bridge run as `<binary> --tun-fd N --proxy URL --dns S --verbosity V --mtu M`
pub struct ProcessBridge {
    binary: PathBuf,
    child: Mutex<Option<Child>>,
}

impl ProcessBridge {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            child: Mutex::new(None),
        }
    }

    fn command(&self, args: &BridgeArgs) -> Command {
        let mut command = Command::new(&self.binary);
        command
            .arg("--tun-fd")
            .arg(args.tun.raw().to_string())
            .arg("--proxy")
            .arg(&args.proxy_url)
            .arg("--dns")
            .arg(args.dns.as_str())
            .arg("--verbosity")
            .arg(args.verbosity.as_str())
            .arg("--mtu")
            .arg(args.mtu.to_string())
            .stdin(Stdio::null());
        if args.close_fd_on_drop {
            command.arg("--close-fd-on-drop");
        }
        command
    }
}

impl BridgeBackend for ProcessBridge {
    fn run(&self, args: &BridgeArgs) -> Result<(), BridgeError> {
        {
            let mut slot = lock(&self.child);
            if slot.is_some() {
                return Err(BridgeError::AlreadyRunning);
            }
            let child = self.command(args).spawn().map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => BridgeError::Unavailable,
                _ => BridgeError::Launch(e.to_string()),
            })?;
            info!("Bridge process {} launched on {}", child.id(), args.tun);
            *slot = Some(child);
        }

        let status = loop {
            {
                let mut slot = lock(&self.child);
                let Some(child) = slot.as_mut() else {
                    // Reaped by stop
                    return Ok(());
                };
                match child.try_wait() {
                    Ok(Some(status)) => {
                        slot.take();
                        break status;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        if let Some(child) = slot.take() {
                            let _ = kill(child);
                        }
                        return Err(BridgeError::Launch(e.to_string()));
                    }
                }
            }
            thread::sleep(POLL_INTERVAL);
        };

        debug!("Bridge process exited with {}", status);
        match status.code() {
            Some(code) => BridgeError::from_code(code),
            // Killed by a signal
            None => Ok(()),
        }
    }

    fn stop(&self) -> Result<(), BridgeError> {
        let Some(child) = lock(&self.child).take() else {
            return Ok(());
        };
        kill(child).map_err(|e| BridgeError::Launch(e.to_string()))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::interface::TunnelHandle;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn script(dir: &TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn run_request(dir: &TempDir) -> String {
        RunRequest {
            dat_dir: dir.path().display().to_string(),
            config_path: dir.path().join("config.json").display().to_string(),
            max_memory: 1024,
        }
        .encode()
        .unwrap()
    }

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Runtime::new().unwrap()
    }

    #[test]
    fn test_engine_start_and_stop() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime();
        let engine = ProcessEngine::new(script(&dir, "engine", "exec sleep 30"), rt.handle().clone())
            .with_grace(Duration::from_millis(200));

        let response = EngineResponse::decode(&engine.run(&run_request(&dir)).unwrap()).unwrap();
        assert!(response.success, "{:?}", response.error);

        let again = EngineResponse::decode(&engine.run(&run_request(&dir)).unwrap()).unwrap();
        assert!(!again.success);

        let stopped = EngineResponse::decode(&engine.stop().unwrap()).unwrap();
        assert!(stopped.success);
        assert_eq!(engine.stop().unwrap(), "");
    }

    #[test]
    fn test_engine_early_exit_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime();
        let engine = ProcessEngine::new(script(&dir, "engine", "exit 23"), rt.handle().clone())
            .with_grace(Duration::from_millis(500));

        let response = EngineResponse::decode(&engine.run(&run_request(&dir)).unwrap()).unwrap();
        assert!(!response.success);
        assert!(response.error.unwrap().contains("startup"));
    }

    #[test]
    fn test_engine_missing_binary() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime();
        let engine = ProcessEngine::new(dir.path().join("absent"), rt.handle().clone());

        let response = EngineResponse::decode(&engine.run(&run_request(&dir)).unwrap()).unwrap();
        assert!(!response.success);
        assert!(response.error.unwrap().starts_with("Failed to launch"));
    }

    #[test]
    fn test_engine_ping_uses_probe() {
        let dir = tempfile::tempdir().unwrap();
        let rt = runtime();
        let (port, _server) = rt.block_on(crate::probe::tests::fake_socks(0x00));
        let engine = ProcessEngine::new(dir.path().join("unused"), rt.handle().clone());

        let request = PingRequest {
            dat_dir: String::new(),
            config_path: String::new(),
            timeout: 5,
            url: "https://www.google.com".into(),
            proxy: format!("socks5://127.0.0.1:{}", port),
        }
        .encode()
        .unwrap();
        let response = EngineResponse::decode(&engine.ping(&request).unwrap()).unwrap();

        assert!(response.success, "{:?}", response.error);
        assert!(response.data.unwrap().is_u64());
    }

    #[test]
    fn test_bridge_exit_code_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let args = BridgeArgs::new("socks5://127.0.0.1:1080", TunnelHandle::from_raw(3));

        let ok = ProcessBridge::new(script(&dir, "ok", "exit 0"));
        assert_eq!(ok.run(&args), Ok(()));

        let failed = ProcessBridge::new(script(&dir, "failed", "exit 4"));
        assert_eq!(failed.run(&args), Err(BridgeError::Exited(4)));

        let missing = ProcessBridge::new(dir.path().join("absent"));
        assert_eq!(missing.run(&args), Err(BridgeError::Unavailable));
    }

    #[test]
    fn test_bridge_receives_args() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("args");
        let bridge = ProcessBridge::new(script(
            &dir,
            "bridge",
            &format!("echo \"$@\" > {}", out.display()),
        ));

        bridge
            .run(&BridgeArgs::new("socks5://127.0.0.1:1080", TunnelHandle::from_raw(5)))
            .unwrap();

        let recorded = fs::read_to_string(out).unwrap();
        assert_eq!(
            recorded.trim(),
            "--tun-fd 5 --proxy socks5://127.0.0.1:1080 --dns direct --verbosity info --mtu 1500"
        );
    }

    #[test]
    fn test_bridge_stop_ends_run() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = Arc::new(ProcessBridge::new(script(&dir, "bridge", "exec sleep 30")));
        let args = BridgeArgs::new("socks5://127.0.0.1:1080", TunnelHandle::from_raw(3));

        let worker = {
            let bridge = bridge.clone();
            thread::spawn(move || bridge.run(&args))
        };
        let deadline = Instant::now() + Duration::from_secs(5);
        while lock(&bridge.child).is_none() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }

        bridge.stop().unwrap();
        assert_eq!(worker.join().unwrap(), Ok(()));
        assert!(bridge.stop().is_ok());
    }
}
