//! Admin/stats contract types (§6). These mirror the shape an HTTP admin
//! API would return, but no such API is wired up here — out of scope per
//! §1. They exist so `Registry::stats()` and `ChromePool` sizing have a
//! stable, serializable destination.

use serde::Serialize;

use crate::registry::{DeviceInfo, RegistryStats};

#[derive(Debug, Clone, Serialize)]
pub struct DeviceSummary {
    pub device_id: String,
    pub connected: bool,
    pub last_heartbeat_ms_ago: u128,
    pub uptime_ms: u128,
    pub bound: bool,
}

impl From<DeviceInfo> for DeviceSummary {
    fn from(info: DeviceInfo) -> Self {
        DeviceSummary {
            device_id: info.device_id,
            connected: info.connected,
            last_heartbeat_ms_ago: info.last_heartbeat_ms_ago,
            uptime_ms: info.uptime_ms,
            bound: info.target.is_some(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub live_instances: usize,
    pub max_instances: usize,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct ConnectionCounts {
    pub total: u64,
    pub active: u64,
    pub errors: u64,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct PerformanceStats {
    pub avg_response_time_ms: f64,
    pub msg_per_sec: f64,
    pub error_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthPayload {
    pub status: &'static str,
    pub uptime_ms: u128,
    pub connections: ConnectionCounts,
    pub performance: PerformanceStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdminStats {
    pub registry: RegistryStats,
    pub pool: PoolStats,
}
