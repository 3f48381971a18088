use serde::{Deserialize, Serialize};

/// Everything the sampler reads in one tick, nested the way `/api/all` serves it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub timestamp: i64,
    pub cpu: CpuSnapshot,
    pub memory: MemoryUsage,
    pub disk: DiskSnapshot,
    pub network: NetworkSnapshot,
    pub gpu: Option<GpuInfo>,
    pub system: SystemSnapshot,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuSnapshot {
    pub usage: f32,
    pub per_core: Vec<f32>,
    /// `[physical, logical]`
    pub count: (usize, usize),
    /// GHz
    pub freq: Option<f64>,
    /// °C
    pub temp: Option<f32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryUsage {
    pub percent: f32,
    pub used: u64,
    pub total: u64,
    pub free: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SwapUsage {
    pub percent: f32,
    pub used: u64,
    pub total: u64,
    pub free: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskUsage {
    pub percent: f32,
    pub used: u64,
    pub total: u64,
    pub free: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionInfo {
    pub device: String,
    pub mountpoint: String,
    pub fstype: String,
    /// "SSD", "HDD" or "Drive" when the kind is unknown
    #[serde(rename = "type")]
    pub kind: String,
    pub usage: DiskUsage,
}

/// Disk throughput in MB/s (1 MB = 1024 * 1024 bytes).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskIo {
    pub read_speed: f64,
    pub write_speed: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskSnapshot {
    pub usage: DiskUsage,
    pub info: Vec<PartitionInfo>,
    pub io: DiskIo,
}

/// Network throughput in bytes per second, summed over all interfaces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkSpeed {
    pub upload: f64,
    pub download: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceInfo {
    pub name: String,
    pub ip: String,
    pub mac: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkSnapshot {
    pub speed: NetworkSpeed,
    pub info: Vec<InterfaceInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuInfo {
    pub name: String,
    pub usage: f32,
    pub temp: f32,
}

impl GpuInfo {
    /// Served by `/api/gpu` when no vendor tool answered.
    pub fn not_detected() -> Self {
        Self {
            name: "Not detected".to_string(),
            usage: 0.0,
            temp: 0.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub os: String,
    pub os_version: String,
    pub architecture: String,
    pub processor: String,
    pub hostname: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatteryInfo {
    pub percent: f32,
    pub plugged: bool,
    /// `None` while charging or when the kernel does not report a rate
    pub secs_left: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemSnapshot {
    pub info: SystemInfo,
    /// Human readable, e.g. `2 days, 03:14:07`
    pub uptime: String,
    pub uptime_secs: u64,
    pub battery: Option<BatteryInfo>,
}

pub fn format_uptime(secs: u64) -> String {
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3_600;
    let minutes = (secs % 3_600) / 60;
    let seconds = secs % 60;
    match days {
        0 => format!("{hours:02}:{minutes:02}:{seconds:02}"),
        1 => format!("1 day, {hours:02}:{minutes:02}:{seconds:02}"),
        n => format!("{n} days, {hours:02}:{minutes:02}:{seconds:02}"),
    }
}
