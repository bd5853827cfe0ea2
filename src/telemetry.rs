//! Telemetry value objects (spec.md §4.C): immutable snapshots of the
//! metrics families, constructed from the wire (protobuf) types with
//! sanitization applied to every free-text field on construction.

use serde::Serialize;

use crate::proto;
use crate::sanitize::sanitize_hostname;

/// `FullMetrics`: the slow-cadence, everything-included snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct FullMetrics {
    pub timestamp: u64,
    pub hostname: String,
    pub is_initial: bool,
    pub cpu: Option<proto::CpuInfo>,
    pub memory: Option<proto::MemoryInfo>,
    pub system: Option<proto::SystemInfo>,
    pub disks: Vec<proto::DiskInfo>,
    pub networks: Vec<proto::NetworkInfo>,
    pub gpus: Vec<proto::GpuInfo>,
    pub npus: Vec<proto::NpuInfo>,
    pub sessions: Vec<proto::UserSession>,
    pub load_avg: (f64, f64, f64),
}

impl From<proto::Metrics> for FullMetrics {
    fn from(m: proto::Metrics) -> Self {
        Self {
            timestamp: m.timestamp,
            hostname: sanitize_hostname(&m.hostname),
            is_initial: m.is_initial,
            cpu: m.cpu,
            memory: m.memory,
            system: m.system,
            disks: m.disks,
            networks: m.networks,
            gpus: m.gpus,
            npus: m.npus,
            sessions: m.sessions,
            load_avg: (m.load_avg_1, m.load_avg_5, m.load_avg_15),
        }
    }
}

/// `RealtimeMetrics`: the ~1s-cadence lightweight scalar snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct RealtimeMetrics {
    pub timestamp: u64,
    pub cpu_usage_percent: f64,
    pub per_core_usage: Vec<f64>,
    pub memory_used_bytes: u64,
    pub swap_used_bytes: u64,
    pub cpu_temperature_celsius: f64,
    pub load_avg_1: f64,
    pub disk_io: Vec<proto::DiskIoRate>,
    pub net_io: Vec<proto::NetIoRate>,
    pub gpu_io: Vec<proto::GpuIoRate>,
    pub npu_io: Vec<proto::NpuIoRate>,
}

impl From<proto::RealtimeMetrics> for RealtimeMetrics {
    fn from(m: proto::RealtimeMetrics) -> Self {
        Self {
            timestamp: m.timestamp,
            cpu_usage_percent: m.cpu_usage_percent,
            per_core_usage: m.per_core_usage,
            memory_used_bytes: m.memory_used_bytes,
            swap_used_bytes: m.swap_used_bytes,
            cpu_temperature_celsius: m.cpu_temperature_celsius,
            load_avg_1: m.load_avg_1,
            disk_io: m.disk_io,
            net_io: m.net_io,
            gpu_io: m.gpu_io,
            npu_io: m.npu_io,
        }
    }
}

/// `StaticInfo`: hardware inventory, sent once at connect and on demand.
#[derive(Debug, Clone, Serialize)]
pub struct StaticInfo {
    pub timestamp: u64,
    pub cpu_model: String,
    pub memory_slots: Vec<proto::MemorySlot>,
    pub disks: Vec<proto::DiskStaticInfo>,
    pub nic_macs: Vec<String>,
    pub gpu_names: Vec<String>,
    pub gpu_drivers: Vec<String>,
    pub npu_names: Vec<String>,
    pub npu_drivers: Vec<String>,
    pub os_name: String,
    pub os_version: String,
    pub kernel_version: String,
    pub motherboard: String,
    pub bios_version: String,
}

impl From<proto::StaticInfo> for StaticInfo {
    fn from(s: proto::StaticInfo) -> Self {
        Self {
            timestamp: s.timestamp,
            cpu_model: s.cpu_model,
            memory_slots: s.memory_slots,
            disks: s.disks,
            nic_macs: s.nic_macs,
            gpu_names: s.gpu_names,
            gpu_drivers: s.gpu_drivers,
            npu_names: s.npu_names,
            npu_drivers: s.npu_drivers,
            os_name: s.os_name,
            os_version: s.os_version,
            kernel_version: s.kernel_version,
            motherboard: s.motherboard,
            bios_version: s.bios_version,
        }
    }
}

/// `PeriodicData`: slowly-changing lists sent every 30s-5min and on demand.
#[derive(Debug, Clone, Serialize)]
pub struct PeriodicData {
    pub timestamp: u64,
    pub disk_usage: Vec<proto::DiskUsage>,
    pub network_addresses: Vec<proto::NetworkAddresses>,
    pub sessions: Vec<proto::UserSession>,
}

impl From<proto::PeriodicData> for PeriodicData {
    fn from(p: proto::PeriodicData) -> Self {
        Self {
            timestamp: p.timestamp,
            disk_usage: p.disk_usage,
            network_addresses: p.network_addresses,
            sessions: p.sessions,
        }
    }
}

/// Result of one dispatched `Command`, correlated back to it by id.
#[derive(Debug, Clone, Serialize)]
pub struct CommandResult {
    pub command_id: String,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    #[serde(skip)]
    pub file_data: Vec<u8>,
    pub structured_lines: Vec<String>,
}

impl From<proto::CommandResult> for CommandResult {
    fn from(r: proto::CommandResult) -> Self {
        Self {
            command_id: r.command_id,
            success: r.success,
            stdout: r.stdout,
            stderr: r.stderr,
            file_data: r.file_data,
            structured_lines: r.structured_lines,
        }
    }
}
