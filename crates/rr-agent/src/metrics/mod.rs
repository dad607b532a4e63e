//! System metrics collection

use std::net::IpAddr;
use std::time::Duration;

use chrono::{DateTime, Local, TimeZone};
use serde::Serialize;
use sysinfo::{Components, Disks, Networks, ProcessesToUpdate, System};

/// System metrics for a machine
#[derive(Debug, Clone)]
pub struct SystemMetrics {
    /// CPU usage percentage (0-100)
    pub cpu_percent: f32,
    /// Logical CPU count
    pub cpu_count: usize,
    /// Used memory in bytes
    pub memory_used: u64,
    /// Total memory in bytes
    pub memory_total: u64,
    /// Time since boot
    pub uptime: Duration,
}

impl SystemMetrics {
    /// Collect current system metrics
    ///
    /// Blocks for sysinfo's minimum CPU sampling interval; call it from a
    /// blocking task.
    pub fn collect() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu_usage();
        std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
        sys.refresh_cpu_usage();
        sys.refresh_memory();

        Self {
            cpu_percent: sys.global_cpu_usage(),
            cpu_count: sys.cpus().len(),
            memory_used: sys.used_memory(),
            memory_total: sys.total_memory(),
            uptime: Duration::from_secs(System::uptime()),
        }
    }

    /// Memory usage percentage (0-100)
    pub fn memory_percent(&self) -> f32 {
        if self.memory_total == 0 {
            return 0.0;
        }
        (self.memory_used as f64 / self.memory_total as f64 * 100.0) as f32
    }
}

/// When the machine booted, in local time
pub fn boot_time() -> Option<DateTime<Local>> {
    Local.timestamp_opt(System::boot_time() as i64, 0).single()
}

/// One running process
#[derive(Debug, Clone, Serialize)]
pub struct ProcessSample {
    pub pid: u32,
    pub name: String,
    /// Resident memory in MiB
    pub ram_mb: u64,
    /// CPU usage percentage, rounded to one decimal
    pub cpu: f32,
}

/// The `limit` processes using the most memory
///
/// Blocks for sysinfo's minimum CPU sampling interval.
pub fn top_processes(limit: usize) -> Vec<ProcessSample> {
    let mut sys = System::new();
    sys.refresh_cpu_usage();
    sys.refresh_processes(ProcessesToUpdate::All);
    std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
    sys.refresh_processes(ProcessesToUpdate::All);

    let cpu_count = sys.cpus().len().max(1) as f32;
    let mut processes: Vec<ProcessSample> = sys
        .processes()
        .values()
        .map(|p| ProcessSample {
            pid: p.pid().as_u32(),
            name: p.name().to_string_lossy().to_string(),
            ram_mb: p.memory() / 1024 / 1024,
            cpu: ((p.cpu_usage() / cpu_count) * 10.0).round() / 10.0,
        })
        .collect();

    processes.sort_by(|a, b| b.ram_mb.cmp(&a.ram_mb).then(a.pid.cmp(&b.pid)));
    processes.truncate(limit);
    processes
}

/// One mounted volume
#[derive(Debug, Clone, Serialize)]
pub struct DriveSample {
    pub name: String,
    pub mount_point: String,
    pub file_system: String,
    pub kind: String,
    pub available: u64,
    pub total: u64,
}

/// Mounted volumes, in mount point order
pub fn drives() -> Vec<DriveSample> {
    let disks = Disks::new_with_refreshed_list();
    let mut drives: Vec<DriveSample> = disks
        .list()
        .iter()
        .map(|d| DriveSample {
            name: d.name().to_string_lossy().to_string(),
            mount_point: d.mount_point().to_string_lossy().to_string(),
            file_system: d.file_system().to_string_lossy().to_string(),
            kind: format!("{:?}", d.kind()),
            available: d.available_space(),
            total: d.total_space(),
        })
        .collect();
    drives.sort_by(|a, b| a.mount_point.cmp(&b.mount_point));
    drives.dedup_by(|a, b| a.mount_point == b.mount_point);
    drives
}

/// One IPv4 address and the interface carrying it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceAddress {
    pub interface: String,
    pub address: IpAddr,
}

/// IPv4 addresses of every interface, loopback excluded
pub fn ip_addresses() -> Vec<InterfaceAddress> {
    let networks = Networks::new_with_refreshed_list();
    let mut addresses: Vec<InterfaceAddress> = networks
        .list()
        .iter()
        .flat_map(|(name, data)| {
            data.ip_networks().iter().map(move |net| InterfaceAddress {
                interface: name.clone(),
                address: net.addr,
            })
        })
        .filter(|a| a.address.is_ipv4() && !a.address.is_loopback())
        .collect();
    addresses.sort_by(|a, b| a.interface.cmp(&b.interface).then(a.address.cmp(&b.address)));
    addresses
}

/// Live resource usage over one sampling window
#[derive(Debug, Clone)]
pub struct MonitorSample {
    pub cpu_percent: f32,
    /// Current frequency of the first core, in MHz
    pub cpu_mhz: u64,
    pub memory_used: u64,
    pub memory_total: u64,
    /// Fixed (non-removable) volumes: mount point, used, total
    pub disks: Vec<(String, u64, u64)>,
    /// Bytes per second across all interfaces
    pub upload_rate: u64,
    pub download_rate: u64,
    /// Hottest CPU sensor, if any is exposed
    pub cpu_temperature: Option<f32>,
    pub uptime: Duration,
}

impl MonitorSample {
    /// Sample CPU and network traffic over `window`
    ///
    /// Blocks for `window` (at least sysinfo's CPU interval); call it from a
    /// blocking task.
    pub fn collect(window: Duration) -> Self {
        let window = window.max(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
        let mut sys = System::new();
        let mut networks = Networks::new_with_refreshed_list();
        sys.refresh_cpu_all();
        std::thread::sleep(window);
        sys.refresh_cpu_all();
        networks.refresh();
        sys.refresh_memory();

        let seconds = window.as_secs_f64();
        let (received, transmitted) = networks
            .list()
            .values()
            .fold((0u64, 0u64), |(rx, tx), data| {
                (rx + data.received(), tx + data.transmitted())
            });

        let disks = Disks::new_with_refreshed_list()
            .list()
            .iter()
            .filter(|d| !d.is_removable() && d.total_space() > 0)
            .map(|d| {
                (
                    d.mount_point().to_string_lossy().to_string(),
                    d.total_space().saturating_sub(d.available_space()),
                    d.total_space(),
                )
            })
            .collect();

        let cpu_temperature = Components::new_with_refreshed_list()
            .list()
            .iter()
            .filter(|c| is_cpu_sensor(c.label()))
            .map(|c| c.temperature())
            .filter(|t| t.is_finite() && *t > 0.0)
            .reduce(f32::max);

        Self {
            cpu_percent: sys.global_cpu_usage(),
            cpu_mhz: sys.cpus().first().map(|c| c.frequency()).unwrap_or(0),
            memory_used: sys.used_memory(),
            memory_total: sys.total_memory(),
            disks,
            upload_rate: (transmitted as f64 / seconds) as u64,
            download_rate: (received as f64 / seconds) as u64,
            cpu_temperature,
            uptime: Duration::from_secs(System::uptime()),
        }
    }
}

fn is_cpu_sensor(label: &str) -> bool {
    let label = label.to_ascii_lowercase();
    ["cpu", "core", "package", "tctl", "tdie"]
        .iter()
        .any(|needle| label.contains(needle))
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

/// Render a sample as the `monitor` report
pub fn format_monitor(sample: &MonitorSample) -> String {
    let mut lines = Vec::new();
    if sample.cpu_mhz > 0 {
        lines.push(format!(
            "CPU: {:.0}% @ {} MHz",
            sample.cpu_percent, sample.cpu_mhz
        ));
    } else {
        lines.push(format!("CPU: {:.0}%", sample.cpu_percent));
    }
    lines.push(format!(
        "RAM: {} / {} ({:.0}%)",
        format_bytes(sample.memory_used),
        format_bytes(sample.memory_total),
        percent(sample.memory_used, sample.memory_total)
    ));
    for (mount_point, used, total) in &sample.disks {
        lines.push(format!(
            "Disk {}: {} / {} ({:.0}%)",
            mount_point,
            format_bytes(*used),
            format_bytes(*total),
            percent(*used, *total)
        ));
    }
    lines.push(format!(
        "Network: up {}/s, down {}/s",
        format_bytes(sample.upload_rate),
        format_bytes(sample.download_rate)
    ));
    if let Some(celsius) = sample.cpu_temperature {
        lines.push(format!("CPU temperature: {:.0} C", celsius));
    }
    lines.push(format!("Uptime: {}", format_uptime(sample.uptime)));
    lines.join("\n")
}

/// Render a duration as `3d 4h 12m`
pub fn format_uptime(uptime: Duration) -> String {
    let minutes = uptime.as_secs() / 60;
    format!("{}d {}h {}m", minutes / 1440, (minutes / 60) % 24, minutes % 60)
}

/// Render a byte count in the largest unit that keeps it above 1
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
