//! Machine status and process commands

use std::time::Duration;

use async_trait::async_trait;
use chrono::Local;
use sysinfo::{Pid, ProcessesToUpdate, System};

use rr_protocol::{AgentCommand, AgentResponse};

use crate::executor::{CommandHandler, HandlerError};
use crate::metrics::{self, MonitorSample, SystemMetrics};

/// Processes reported by `processes`
const PROCESS_LIMIT: usize = 50;

/// Traffic sampling window of `monitor`
const MONITOR_WINDOW: Duration = Duration::from_millis(500);

/// Run blocking collection off the async workers
async fn blocking<T, F>(collect: F) -> Result<T, HandlerError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(collect)
        .await
        .map_err(|e| HandlerError::Failed(format!("Metrics collection failed: {}", e)))
}

/// `ping`: liveness check answered without touching the system
pub struct PingHandler;

#[async_trait]
impl CommandHandler for PingHandler {
    async fn handle(&self, command: &AgentCommand) -> Result<AgentResponse, HandlerError> {
        Ok(AgentResponse::text(command.correlation_id.clone(), "pong"))
    }
}

/// `status`: machine, user, OS and load summary
pub struct StatusHandler;

#[async_trait]
impl CommandHandler for StatusHandler {
    async fn handle(&self, command: &AgentCommand) -> Result<AgentResponse, HandlerError> {
        let m = blocking(SystemMetrics::collect).await?;
        let machine = gethostname::gethostname().to_string_lossy().to_string();
        let os = System::long_os_version().unwrap_or_else(|| "unknown".to_string());

        let text = format!(
            "Machine: {}\nUser: {}\nOS: {}\nUptime: {}\nCPU: {} cores, {:.0}% used\nMemory: {} of {} ({:.0}%)",
            machine,
            whoami::username(),
            os,
            metrics::format_uptime(m.uptime),
            m.cpu_count,
            m.cpu_percent,
            metrics::format_bytes(m.memory_used),
            metrics::format_bytes(m.memory_total),
            m.memory_percent(),
        );
        Ok(AgentResponse::text(command.correlation_id.clone(), text))
    }
}

/// `uptime`: time since boot and boot time
pub struct UptimeHandler;

#[async_trait]
impl CommandHandler for UptimeHandler {
    async fn handle(&self, command: &AgentCommand) -> Result<AgentResponse, HandlerError> {
        let uptime = Duration::from_secs(System::uptime());
        let booted = metrics::boot_time()
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "unknown".to_string());

        let text = format!(
            "Uptime: {}\nBooted: {}\nNow: {}",
            metrics::format_uptime(uptime),
            booted,
            Local::now().format("%Y-%m-%d %H:%M:%S"),
        );
        Ok(AgentResponse::text(command.correlation_id.clone(), text))
    }
}

/// `ip`: IPv4 addresses by interface
pub struct IpHandler;

#[async_trait]
impl CommandHandler for IpHandler {
    async fn handle(&self, command: &AgentCommand) -> Result<AgentResponse, HandlerError> {
        let addresses = blocking(metrics::ip_addresses).await?;
        if addresses.is_empty() {
            return Ok(AgentResponse::text(
                command.correlation_id.clone(),
                "No IPv4 addresses found",
            ));
        }

        let lines: Vec<String> = addresses
            .iter()
            .map(|a| format!("{}: {}", a.interface, a.address))
            .collect();
        Ok(AgentResponse::text(
            command.correlation_id.clone(),
            format!("IP addresses:\n{}", lines.join("\n")),
        ))
    }
}

/// `monitor`: CPU, memory, disk, network and temperature snapshot
pub struct MonitorHandler;

#[async_trait]
impl CommandHandler for MonitorHandler {
    async fn handle(&self, command: &AgentCommand) -> Result<AgentResponse, HandlerError> {
        let sample = blocking(|| MonitorSample::collect(MONITOR_WINDOW)).await?;
        Ok(AgentResponse::text(
            command.correlation_id.clone(),
            metrics::format_monitor(&sample),
        ))
    }
}

/// `drives`: mounted volumes with free and total space
pub struct DrivesHandler;

#[async_trait]
impl CommandHandler for DrivesHandler {
    async fn handle(&self, command: &AgentCommand) -> Result<AgentResponse, HandlerError> {
        let drives = blocking(metrics::drives).await?;
        if drives.is_empty() {
            return Ok(AgentResponse::text(
                command.correlation_id.clone(),
                "No drives found",
            ));
        }

        let lines: Vec<String> = drives
            .iter()
            .map(|d| {
                format!(
                    "{} ({}, {}): {} free of {}",
                    d.mount_point,
                    d.file_system,
                    d.kind,
                    metrics::format_bytes(d.available),
                    metrics::format_bytes(d.total)
                )
            })
            .collect();
        Ok(AgentResponse::text(
            command.correlation_id.clone(),
            format!("Drives:\n{}", lines.join("\n")),
        ))
    }
}

/// `processes`: top processes by memory, as JSON
pub struct ProcessesHandler;

#[async_trait]
impl CommandHandler for ProcessesHandler {
    async fn handle(&self, command: &AgentCommand) -> Result<AgentResponse, HandlerError> {
        let processes = blocking(|| metrics::top_processes(PROCESS_LIMIT)).await?;
        let json = serde_json::to_string(&processes)
            .map_err(|e| HandlerError::Failed(format!("Failed to encode processes: {}", e)))?;
        Ok(AgentResponse::structured(command.correlation_id.clone(), json))
    }
}

/// `kill`: terminate a process by PID
///
/// The PID comes from the `pid` parameter, or the argument text.
pub struct KillHandler;

#[async_trait]
impl CommandHandler for KillHandler {
    async fn handle(&self, command: &AgentCommand) -> Result<AgentResponse, HandlerError> {
        let pid_text = command
            .parameter("pid")
            .or_else(|| command.arguments())
            .ok_or_else(|| HandlerError::InvalidArgument("No PID given".to_string()))?;
        let pid: u32 = pid_text
            .trim()
            .parse()
            .map_err(|_| HandlerError::InvalidArgument(format!("Invalid PID: {}", pid_text)))?;

        if pid == std::process::id() {
            return Err(HandlerError::InvalidArgument(
                "Refusing to kill the agent itself".to_string(),
            ));
        }

        let killed = blocking(move || kill_process(pid)).await??;
        Ok(AgentResponse::text(
            command.correlation_id.clone(),
            format!("Process {} ({}) terminated", pid, killed),
        ))
    }
}

/// Kill `pid`, returning its name
fn kill_process(pid: u32) -> Result<String, HandlerError> {
    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]));

    let process = sys
        .process(pid)
        .ok_or_else(|| HandlerError::NotFound(format!("No process with PID {}", pid)))?;
    let name = process.name().to_string_lossy().to_string();

    if process.kill() {
        Ok(name)
    } else {
        Err(HandlerError::Failed(format!(
            "Failed to terminate process {} ({})",
            pid, name
        )))
    }
}
