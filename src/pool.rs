//! Chrome Instance Pool (§4.2): the legacy path's keyed cache of locally
//! launched Chrome processes, used when a client connects without a
//! `deviceId` and expects the gateway to drive a real browser directly.
//!
//! Process spawning and readiness-probing are abstracted behind the
//! [`Launcher`] trait so the admission-control and eviction bookkeeping can
//! be exercised with a [`FakeLauncher`] in unit tests, without starting a
//! real Chrome binary.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::error::{GatewayError, Result};

/// A running Chrome-like process and the debug port it exposes.
#[async_trait]
pub trait ManagedProcess: Send + Sync {
    fn debug_port(&self) -> u16;
    /// Hard-kill the process. Called from the pool's eviction sweeper and
    /// from shutdown; must be safe to call more than once.
    async fn kill(&mut self);
}

/// Spawns and readiness-probes browser processes. `SystemLauncher` is the
/// production implementation; tests substitute `FakeLauncher`.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, user_key: &str, browser_data_root: &std::path::Path) -> Result<Box<dyn ManagedProcess>>;
}

struct RealProcess {
    child: Child,
    port: u16,
}

#[async_trait]
impl ManagedProcess for RealProcess {
    fn debug_port(&self) -> u16 {
        self.port
    }

    async fn kill(&mut self) {
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
    }
}

/// Launches a real local Chrome/Chromium binary with a persistent profile
/// directory under `<browser_data_root>/<userKey>`, in the manner of
/// `chrome/launcher.rs`'s `launch_chrome`: open a debug port, poll
/// `/json/version` until it answers or a deadline passes.
pub struct SystemLauncher {
    pub binary: std::path::PathBuf,
    pub startup_timeout: Duration,
    pub poll_interval: Duration,
}

impl SystemLauncher {
    pub fn new(binary: std::path::PathBuf, startup_timeout: Duration) -> Self {
        SystemLauncher {
            binary,
            startup_timeout,
            poll_interval: Duration::from_millis(100),
        }
    }

    fn find_available_port() -> Result<u16> {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        Ok(listener.local_addr()?.port())
    }

    async fn probe_version(port: u16) -> bool {
        let url = format!("http://127.0.0.1:{port}/json/version");
        let Ok(client) = reqwest::Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs(2))
            .build()
        else {
            return false;
        };
        client
            .get(&url)
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}

#[async_trait]
impl Launcher for SystemLauncher {
    async fn launch(&self, user_key: &str, browser_data_root: &std::path::Path) -> Result<Box<dyn ManagedProcess>> {
        let port = Self::find_available_port()?;
        let profile_dir = browser_data_root.join(user_key);
        tokio::fs::create_dir_all(&profile_dir).await?;

        let child = Command::new(&self.binary)
            .arg(format!("--remote-debugging-port={port}"))
            .arg(format!("--user-data-dir={}", profile_dir.display()))
            .arg("--no-first-run")
            .arg("--headless=new")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| GatewayError::LaunchFailed(e.to_string()))?;

        // A freshly forked Chrome needs a moment before its debug listener
        // comes up; probing immediately just burns the first few attempts.
        tokio::time::sleep(Duration::from_secs(3)).await;

        let deadline = Instant::now() + self.startup_timeout;
        loop {
            if Self::probe_version(port).await {
                return Ok(Box::new(RealProcess { child, port }));
            }
            if Instant::now() >= deadline {
                let mut child = child;
                let _ = child.start_kill();
                return Err(GatewayError::StartupTimeout(port));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

struct Instance {
    process: Box<dyn ManagedProcess>,
    last_used: Instant,
}

pub struct PoolConfig {
    pub max_instances: usize,
    pub instance_timeout: Duration,
    pub inactive_check_interval: Duration,
    pub browser_data_root: std::path::PathBuf,
}

struct Inner {
    instances: HashMap<String, Instance>,
}

/// Keyed cache of launched browser processes with an admission ceiling and
/// an idle-eviction sweeper, per §4.2.
pub struct ChromePool {
    inner: Mutex<Inner>,
    launcher: Box<dyn Launcher>,
    config: PoolConfig,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    ephemeral_seq: AtomicU64,
}

impl ChromePool {
    pub fn new(launcher: Box<dyn Launcher>, config: PoolConfig) -> Arc<ChromePool> {
        let pool = Arc::new(ChromePool {
            inner: Mutex::new(Inner {
                instances: HashMap::new(),
            }),
            launcher,
            config,
            sweeper: Mutex::new(None),
            ephemeral_seq: AtomicU64::new(0),
        });
        pool.clone().spawn_sweeper();
        pool
    }

    fn spawn_sweeper(self: Arc<Self>) {
        let interval = self.config.inactive_check_interval;
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            loop {
                tick.tick().await;
                self.sweep_idle().await;
            }
        });
        if let Ok(mut guard) = self.sweeper.try_lock() {
            *guard = Some(handle);
        }
    }

    async fn sweep_idle(&self) {
        let expired: Vec<String> = {
            let inner = self.inner.lock().await;
            inner
                .instances
                .iter()
                .filter(|(_, i)| i.last_used.elapsed() > self.config.instance_timeout)
                .map(|(key, _)| key.clone())
                .collect()
        };
        for key in expired {
            let mut inner = self.inner.lock().await;
            if let Some(mut instance) = inner.instances.remove(&key) {
                drop(inner);
                tracing::info!(user_key = %key, "evicting idle chrome instance");
                instance.process.kill().await;
            }
        }
    }

    /// Return the debug port for `user_key`, launching a new instance if
    /// none exists and the pool is below `maxInstances` (§4.2 admission
    /// control). Touches `last_used` on every call.
    pub async fn acquire(&self, user_key: &str) -> Result<u16> {
        {
            let mut inner = self.inner.lock().await;
            if let Some(instance) = inner.instances.get_mut(user_key) {
                instance.last_used = Instant::now();
                return Ok(instance.process.debug_port());
            }
            if inner.instances.len() >= self.config.max_instances {
                return Err(GatewayError::AtCapacity);
            }
        }

        let process = self.launcher.launch(user_key, &self.config.browser_data_root).await?;
        let port = process.debug_port();

        let mut inner = self.inner.lock().await;
        if inner.instances.len() >= self.config.max_instances {
            drop(inner);
            let mut process = process;
            process.kill().await;
            return Err(GatewayError::AtCapacity);
        }
        inner.instances.insert(
            user_key.to_string(),
            Instance {
                process,
                last_used: Instant::now(),
            },
        );
        Ok(port)
    }

    /// Launch a fresh, never-reused instance for an anonymous legacy
    /// connection (§4.2): unlike a keyed instance it is never stored under
    /// a shared key or handed back to a later caller, so the mint key is
    /// unique per call and the caller must `kill` it directly when the
    /// connection ends instead of `touch`ing it for reuse.
    pub async fn acquire_ephemeral(&self) -> Result<(String, u16)> {
        let key = format!("__ephemeral_{}", self.ephemeral_seq.fetch_add(1, Ordering::Relaxed));
        let port = self.acquire(&key).await?;
        Ok((key, port))
    }

    pub async fn touch(&self, user_key: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(instance) = inner.instances.get_mut(user_key) {
            instance.last_used = Instant::now();
        }
    }

    pub async fn size(&self) -> usize {
        self.inner.lock().await.instances.len()
    }

    /// Synchronous, best-effort admission check used by the Upgrade
    /// Dispatcher to return `503` before a handshake completes (§4.4). If
    /// the pool is momentarily locked by another task, fails open — the
    /// real check in [`Self::acquire`] is still authoritative.
    pub fn try_has_capacity(&self, user_key: &str) -> bool {
        match self.inner.try_lock() {
            Ok(inner) => inner.instances.contains_key(user_key) || inner.instances.len() < self.config.max_instances,
            Err(_) => true,
        }
    }

    /// Same admission check as [`Self::try_has_capacity`] for a connection
    /// that has no key yet (an anonymous legacy launch mints its ephemeral
    /// key only after the pool actually launches it), so there's no
    /// existing entry to look up — just room for one more instance.
    pub fn try_has_capacity_for_new(&self) -> bool {
        match self.inner.try_lock() {
            Ok(inner) => inner.instances.len() < self.config.max_instances,
            Err(_) => true,
        }
    }

    pub async fn kill(&self, user_key: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(mut instance) = inner.instances.remove(user_key) {
            drop(inner);
            instance.process.kill().await;
        }
    }

    pub async fn shutdown(&self) {
        if let Some(handle) = self.sweeper.lock().await.take() {
            handle.abort();
        }
        let instances: Vec<Instance> = {
            let mut inner = self.inner.lock().await;
            inner.instances.drain().map(|(_, v)| v).collect()
        };
        for mut instance in instances {
            instance.process.kill().await;
        }
    }
}
