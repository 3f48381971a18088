//! Host telemetry sampler.
//!
//! Every accessor is infallible from the caller's point of view: platform
//! errors turn into zeros, empty lists or `None` and are logged at debug
//! level. The sampler owns the rate state for disk and network counters, so
//! it must only be mutated through one `&mut` at a time; shared users go
//! through [`SharedSampler`].

pub mod gpu;
pub mod power;
pub mod rate;

use crate::types::{
    BatteryInfo, CpuSnapshot, DiskIo, DiskSnapshot, DiskUsage, InterfaceInfo, MemoryUsage,
    MetricSnapshot, NetworkSnapshot, NetworkSpeed, PartitionInfo, SwapUsage, SystemInfo,
    SystemSnapshot, format_uptime,
};
use gpu::GpuProbe;
use log::debug;
use rate::CounterPair;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use sysinfo::{Components, DiskKind, Disks, MINIMUM_CPU_UPDATE_INTERVAL, Networks, System};

pub type SharedSampler = Arc<tokio::sync::Mutex<Sampler>>;

const MIB: f64 = 1024.0 * 1024.0;
const SECTOR_BYTES: u64 = 512;

/// Temperature sensor drivers, most specific first.
const CPU_SENSORS: [&str; 5] = ["coretemp", "k10temp", "zenpower", "cpu_thermal", "acpitz"];

pub struct Sampler {
    sys: System,
    disks: Disks,
    networks: Networks,
    components: Components,
    cpu_refreshed_at: Instant,
    disk_io: CounterPair,
    net_io: CounterPair,
}

impl Sampler {
    /// Builds the sampler and primes CPU accounting. Blocks for
    /// `MINIMUM_CPU_UPDATE_INTERVAL` so the first `cpu_usage()` is a real
    /// measurement instead of 0.
    pub fn new() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu_all();
        std::thread::sleep(MINIMUM_CPU_UPDATE_INTERVAL);
        sys.refresh_cpu_usage();
        sys.refresh_memory();

        Self {
            sys,
            disks: Disks::new_with_refreshed_list(),
            networks: Networks::new_with_refreshed_list(),
            components: Components::new_with_refreshed_list(),
            cpu_refreshed_at: Instant::now(),
            disk_io: CounterPair::new(),
            net_io: CounterPair::new(),
        }
    }

    pub fn shared(self) -> SharedSampler {
        Arc::new(tokio::sync::Mutex::new(self))
    }

    /// Refreshing more often than sysinfo's minimum interval yields noise,
    /// so back-to-back callers share the last measurement.
    fn refresh_cpu(&mut self) {
        if self.cpu_refreshed_at.elapsed() >= MINIMUM_CPU_UPDATE_INTERVAL {
            self.sys.refresh_cpu_usage();
            self.cpu_refreshed_at = Instant::now();
        }
    }

    pub fn cpu_usage(&mut self) -> f32 {
        self.refresh_cpu();
        self.sys.global_cpu_usage().clamp(0.0, 100.0)
    }

    pub fn cpu_per_core(&mut self) -> Vec<f32> {
        self.refresh_cpu();
        self.sys.cpus().iter().map(|cpu| cpu.cpu_usage()).collect()
    }

    /// `(physical, logical)`, never zero.
    pub fn cpu_count(&self) -> (usize, usize) {
        let logical = self.sys.cpus().len().max(1);
        let physical = System::physical_core_count().unwrap_or(logical).max(1);
        (physical, logical)
    }

    /// Mean current frequency across cores in GHz.
    pub fn cpu_frequency_ghz(&mut self) -> Option<f64> {
        self.sys.refresh_cpu_frequency();
        let cpus = self.sys.cpus();
        if cpus.is_empty() {
            return None;
        }
        let mhz = cpus.iter().map(|cpu| cpu.frequency()).sum::<u64>() as f64 / cpus.len() as f64;
        (mhz > 0.0).then_some(mhz / 1000.0)
    }

    pub fn cpu_temperature(&mut self) -> Option<f32> {
        self.components.refresh(true);
        let readings: Vec<(String, Option<f32>)> = self
            .components
            .list()
            .iter()
            .map(|c| (c.label().to_string(), c.temperature()))
            .collect();
        pick_cpu_temperature(&readings)
    }

    /// `percent` comes from the kernel's "available" figure, so page cache
    /// and reclaimable buffers count as free.
    pub fn memory(&mut self) -> MemoryUsage {
        self.sys.refresh_memory();
        let total = self.sys.total_memory();
        let available = self.sys.available_memory().min(total);
        let used = total - available;
        MemoryUsage {
            percent: percent_of(used, total),
            used,
            total,
            free: available,
        }
    }

    pub fn swap(&mut self) -> SwapUsage {
        self.sys.refresh_memory();
        let total = self.sys.total_swap();
        let used = self.sys.used_swap();
        SwapUsage {
            percent: percent_of(used, total),
            used,
            total,
            free: self.sys.free_swap(),
        }
    }

    /// Usage of the filesystem holding `path` (root when `None`).
    pub fn disk_usage(&mut self, path: Option<&Path>) -> DiskUsage {
        self.disks.refresh(true);
        let path = path.unwrap_or(Path::new("/"));
        self.disks
            .list()
            .iter()
            .filter(|disk| path.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| usage_from(disk.total_space(), disk.available_space()))
            .unwrap_or_default()
    }

    pub fn disk_partitions(&mut self) -> Vec<PartitionInfo> {
        self.disks.refresh(true);
        self.disks
            .list()
            .iter()
            .map(|disk| {
                let name = disk.name().to_string_lossy();
                let device = name.rsplit('/').next().unwrap_or(&name).to_string();
                let kind = match disk.kind() {
                    DiskKind::SSD => "SSD",
                    DiskKind::HDD => "HDD",
                    _ => "Drive",
                };
                PartitionInfo {
                    device,
                    mountpoint: disk.mount_point().display().to_string(),
                    fstype: disk.file_system().to_string_lossy().into_owned(),
                    kind: kind.to_string(),
                    usage: usage_from(disk.total_space(), disk.available_space()),
                }
            })
            .collect()
    }

    /// MB/s since the previous call; zero on the first call.
    pub fn disk_io_rate(&mut self) -> DiskIo {
        let Some(counters) = read_disk_counters() else {
            return DiskIo::default();
        };
        let (read, write) = self.disk_io.observe(counters, Instant::now());
        DiskIo {
            read_speed: read / MIB,
            write_speed: write / MIB,
        }
    }

    /// Bytes/s since the previous call; zero on the first call.
    pub fn network_rate(&mut self) -> NetworkSpeed {
        self.networks.refresh(true);
        let (sent, received) = self
            .networks
            .list()
            .iter()
            .filter(|(name, _)| name.as_str() != "lo")
            .fold((0u64, 0u64), |(tx, rx), (_, data)| {
                (
                    tx.saturating_add(data.total_transmitted()),
                    rx.saturating_add(data.total_received()),
                )
            });
        let (upload, download) = self.net_io.observe((sent, received), Instant::now());
        NetworkSpeed { upload, download }
    }

    /// Interfaces holding a non-loopback IPv4 address.
    pub fn network_interfaces(&self) -> Vec<InterfaceInfo> {
        let mut interfaces: Vec<InterfaceInfo> = self
            .networks
            .list()
            .iter()
            .filter_map(|(name, data)| {
                let ip = data
                    .ip_networks()
                    .iter()
                    .map(|net| net.addr)
                    .find(|addr| addr.is_ipv4() && !addr.is_loopback())?;
                Some(InterfaceInfo {
                    name: name.clone(),
                    ip: ip.to_string(),
                    mac: data.mac_address().to_string(),
                })
            })
            .collect();
        interfaces.sort_by(|a, b| a.name.cmp(&b.name));
        interfaces
    }

    pub fn system_info(&self) -> SystemInfo {
        let processor = self
            .sys
            .cpus()
            .first()
            .map(|cpu| cpu.brand().trim().to_string())
            .filter(|brand| !brand.is_empty())
            .unwrap_or_else(|| "Unknown CPU".to_string());
        SystemInfo {
            os: System::name().unwrap_or_else(|| std::env::consts::OS.to_string()),
            os_version: System::kernel_version().unwrap_or_default(),
            architecture: std::env::consts::ARCH.to_string(),
            processor,
            hostname: System::host_name().unwrap_or_default(),
        }
    }

    pub fn uptime(&self) -> u64 {
        System::uptime()
    }

    pub fn battery(&self) -> Option<BatteryInfo> {
        power::read_battery()
    }

    /// Everything except the GPU, which needs an async subprocess call and
    /// is filled in by [`collect`].
    pub fn snapshot(&mut self) -> MetricSnapshot {
        let usage = self.cpu_usage();
        let per_core = self.cpu_per_core();
        let uptime_secs = self.uptime();
        MetricSnapshot {
            timestamp: chrono::Utc::now().timestamp(),
            cpu: CpuSnapshot {
                usage,
                per_core,
                count: self.cpu_count(),
                freq: self.cpu_frequency_ghz(),
                temp: self.cpu_temperature(),
            },
            memory: self.memory(),
            disk: DiskSnapshot {
                usage: self.disk_usage(None),
                info: self.disk_partitions(),
                io: self.disk_io_rate(),
            },
            network: NetworkSnapshot {
                speed: self.network_rate(),
                info: self.network_interfaces(),
            },
            gpu: None,
            system: SystemSnapshot {
                info: self.system_info(),
                uptime: format_uptime(uptime_secs),
                uptime_secs,
                battery: self.battery(),
            },
        }
    }
}

impl Default for Sampler {
    fn default() -> Self {
        Self::new()
    }
}

/// Full snapshot including the GPU. The sampler lock is released before the
/// GPU tool runs so API readers are not held up by a slow `nvidia-smi`.
pub async fn collect(sampler: &tokio::sync::Mutex<Sampler>, gpu: &GpuProbe) -> MetricSnapshot {
    let mut snapshot = sampler.lock().await.snapshot();
    snapshot.gpu = gpu.read().await;
    snapshot
}

pub fn pick_cpu_temperature(readings: &[(String, Option<f32>)]) -> Option<f32> {
    let valid = |t: &Option<f32>| t.filter(|v| v.is_finite() && *v > 0.0);
    CPU_SENSORS
        .iter()
        .find_map(|sensor| {
            readings
                .iter()
                .filter(|(label, _)| label.to_lowercase().contains(sensor))
                .find_map(|(_, t)| valid(t))
        })
        .or_else(|| readings.iter().find_map(|(_, t)| valid(t)))
}

fn usage_from(total: u64, available: u64) -> DiskUsage {
    let free = available.min(total);
    let used = total - free;
    DiskUsage {
        percent: percent_of(used, total),
        used,
        total,
        free,
    }
}

fn percent_of(part: u64, whole: u64) -> f32 {
    if whole == 0 {
        return 0.0;
    }
    ((part as f64 / whole as f64) * 100.0) as f32
}

/// Cumulative `(read, written)` bytes over whole block devices.
fn read_disk_counters() -> Option<(u64, u64)> {
    let stats = match procfs::diskstats() {
        Ok(stats) => stats,
        Err(err) => {
            debug!("[sampler] diskstats unavailable: {err}");
            return None;
        }
    };
    let totals = stats
        .iter()
        .filter(|stat| is_physical_disk(&stat.name))
        .fold((0u64, 0u64), |(read, written), stat| {
            (
                read.saturating_add(stat.sectors_read as u64 * SECTOR_BYTES),
                written.saturating_add(stat.sectors_written as u64 * SECTOR_BYTES),
            )
        });
    Some(totals)
}

/// Partitions would double count their parent disk, and virtual devices
/// mirror I/O already counted elsewhere.
fn is_physical_disk(name: &str) -> bool {
    const VIRTUAL: [&str; 4] = ["loop", "ram", "zram", "dm-"];
    if VIRTUAL.iter().any(|prefix| name.starts_with(prefix)) {
        return false;
    }
    Path::new("/sys/block").join(name).exists()
}
