//! Device Registry (§4.1): the authoritative map of connected extension
//! devices, their last-seen heartbeat, and the CDP target they are currently
//! bound to.
//!
//! A single `Arc<Mutex<Inner>>` backs the whole registry. Every public
//! method takes the lock, does a constant amount of `HashMap` work, and
//! drops it before returning — no `.await` is ever held across the guard,
//! so a slow client can't stall an unrelated device's heartbeat.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::transport::Transport;

/// How long a device may go without a heartbeat before the sweeper reaps it.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);

const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct AttachedTarget {
    pub target_id: String,
    pub session_id: String,
    pub target_info: serde_json::Value,
}

/// The `{name, version, userAgent}` the extension supplies in its
/// `device:register` frame. Used verbatim to fabricate `Browser.getVersion`
/// (§4.3.4) without ever asking the extension.
#[derive(Clone, Debug, Default)]
pub struct DeviceMeta {
    pub name: String,
    pub version: String,
    pub user_agent: String,
}

struct Device {
    transport: Transport,
    meta: DeviceMeta,
    last_heartbeat: Instant,
    registered_at: Instant,
    target: Option<AttachedTarget>,
}

#[derive(Clone, Debug)]
pub struct DeviceInfo {
    pub device_id: String,
    pub connected: bool,
    pub last_heartbeat_ms_ago: u128,
    pub uptime_ms: u128,
    pub meta: DeviceMeta,
    pub target: Option<AttachedTarget>,
}

#[derive(Clone, Debug, Default, serde::Serialize)]
pub struct RegistryStats {
    pub device_count: usize,
    pub bound_count: usize,
}

struct Inner {
    devices: HashMap<String, Device>,
}

pub struct Registry {
    inner: Mutex<Inner>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Registry {
    pub fn new() -> Arc<Registry> {
        let registry = Arc::new(Registry {
            inner: Mutex::new(Inner {
                devices: HashMap::new(),
            }),
            sweeper: Mutex::new(None),
        });
        registry.clone().spawn_sweeper();
        registry
    }

    fn spawn_sweeper(self: Arc<Self>) {
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tick.tick().await;
                self.sweep().await;
            }
        });
        // spawn_sweeper only ever runs once from new(), before any other
        // task can observe `self.sweeper`, so this lock never contends.
        if let Ok(mut guard) = self.sweeper.try_lock() {
            *guard = Some(handle);
        }
    }

    async fn sweep(&self) {
        let stale: Vec<(String, Transport)> = {
            let inner = self.inner.lock().await;
            inner
                .devices
                .iter()
                .filter(|(_, d)| d.last_heartbeat.elapsed() > HEARTBEAT_TIMEOUT || !d.transport.is_open())
                .map(|(id, d)| (id.clone(), d.transport.clone()))
                .collect()
        };
        for (device_id, transport) in stale {
            tracing::info!(%device_id, "reaping device with stale heartbeat");
            transport.close("Heartbeat timeout");
            let mut inner = self.inner.lock().await;
            inner.devices.remove(&device_id);
        }
    }

    /// Register a device, replacing and closing any prior connection with
    /// the same id (§4.1 reconnect race: "New connection established").
    pub async fn register(&self, device_id: String, meta: DeviceMeta, transport: Transport) {
        let previous = {
            let mut inner = self.inner.lock().await;
            let device = Device {
                transport,
                meta,
                last_heartbeat: Instant::now(),
                registered_at: Instant::now(),
                target: None,
            };
            inner.devices.insert(device_id.clone(), device)
        };
        if let Some(previous) = previous {
            tracing::info!(%device_id, "replacing existing device connection");
            previous.transport.close("New connection established");
        }
    }

    /// Remove a device, but only if `witness` still identifies the
    /// currently-registered transport (ABA guard, §4.1). Returns `true` if
    /// a device was actually removed.
    pub async fn unregister(&self, device_id: &str, witness: &Transport) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.devices.get(device_id) {
            Some(device) if device.transport.is_same(witness) => {
                inner.devices.remove(device_id);
                true
            }
            _ => false,
        }
    }

    pub async fn heartbeat(&self, device_id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.devices.get_mut(device_id) {
            Some(device) => {
                device.last_heartbeat = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Returns the transport iff it is still OPEN. A closed-but-not-yet-
    /// reaped transport triggers a witnessed `unregister` instead of being
    /// handed back to the caller (§4.1).
    pub async fn get_transport(&self, device_id: &str) -> Option<Transport> {
        let transport = {
            let inner = self.inner.lock().await;
            inner.devices.get(device_id).map(|d| d.transport.clone())
        }?;
        if transport.is_open() {
            Some(transport)
        } else {
            self.unregister(device_id, &transport).await;
            None
        }
    }

    pub async fn contains(&self, device_id: &str) -> bool {
        let inner = self.inner.lock().await;
        inner.devices.contains_key(device_id)
    }

    pub async fn set_target(&self, device_id: &str, target: Option<AttachedTarget>) {
        let mut inner = self.inner.lock().await;
        if let Some(device) = inner.devices.get_mut(device_id) {
            device.target = target;
        }
    }

    pub async fn target(&self, device_id: &str) -> Option<AttachedTarget> {
        let inner = self.inner.lock().await;
        inner.devices.get(device_id).and_then(|d| d.target.clone())
    }

    pub async fn meta(&self, device_id: &str) -> Option<DeviceMeta> {
        let inner = self.inner.lock().await;
        inner.devices.get(device_id).map(|d| d.meta.clone())
    }

    pub async fn info(&self, device_id: &str) -> Option<DeviceInfo> {
        let inner = self.inner.lock().await;
        inner.devices.get(device_id).map(|d| DeviceInfo {
            device_id: device_id.to_string(),
            connected: d.transport.is_open(),
            last_heartbeat_ms_ago: d.last_heartbeat.elapsed().as_millis(),
            uptime_ms: d.registered_at.elapsed().as_millis(),
            meta: d.meta.clone(),
            target: d.target.clone(),
        })
    }

    pub async fn list(&self) -> Vec<DeviceInfo> {
        let inner = self.inner.lock().await;
        inner
            .devices
            .iter()
            .map(|(device_id, d)| DeviceInfo {
                device_id: device_id.clone(),
                connected: d.transport.is_open(),
                last_heartbeat_ms_ago: d.last_heartbeat.elapsed().as_millis(),
                uptime_ms: d.registered_at.elapsed().as_millis(),
                meta: d.meta.clone(),
                target: d.target.clone(),
            })
            .collect()
    }

    pub async fn stats(&self) -> RegistryStats {
        let inner = self.inner.lock().await;
        RegistryStats {
            device_count: inner.devices.len(),
            bound_count: inner.devices.values().filter(|d| d.target.is_some()).count(),
        }
    }

    /// Close every device connection and stop the sweeper. Called from the
    /// top-level shutdown sequence (§5, component E).
    pub async fn shutdown(&self) {
        if let Some(handle) = self.sweeper.lock().await.take() {
            handle.abort();
        }
        let mut inner = self.inner.lock().await;
        for (device_id, device) in inner.devices.drain() {
            tracing::debug!(%device_id, "closing device on shutdown");
            device.transport.close("Server shutdown");
        }
    }
}
