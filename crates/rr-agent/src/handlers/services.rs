//! OS service listing and control
//!
//! Windows services are driven through PowerShell's service cmdlets; other
//! platforms use `systemctl`.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use rr_protocol::{AgentCommand, AgentResponse};

use crate::executor::{CommandHandler, HandlerError};

/// Limit on a single service query or state change
const SERVICE_TIMEOUT: Duration = Duration::from_secs(45);

/// One OS service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub name: String,
    pub display_name: String,
    pub status: String,
    pub start_type: String,
}

/// What `service_action` should do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceAction {
    Start,
    Stop,
    Restart,
    Info,
}

impl ServiceAction {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "start" => Some(Self::Start),
            "stop" => Some(Self::Stop),
            "restart" => Some(Self::Restart),
            "info" => Some(Self::Info),
            _ => None,
        }
    }

    fn past_tense(self) -> &'static str {
        match self {
            Self::Start => "started",
            Self::Stop => "stopped",
            Self::Restart => "restarted",
            Self::Info => "queried",
        }
    }
}

/// Read `action` and `name` from parameters, or `action:name` arguments
fn parse_request(command: &AgentCommand) -> Result<(ServiceAction, String), HandlerError> {
    let (action, name) = match (command.parameter("action"), command.parameter("name")) {
        (Some(action), Some(name)) => (action.to_string(), name.to_string()),
        _ => command
            .arguments()
            .and_then(|args| args.split_once(':'))
            .map(|(a, n)| (a.to_string(), n.to_string()))
            .ok_or_else(|| {
                HandlerError::InvalidArgument("Specify an action and a service name".to_string())
            })?,
    };

    let action = ServiceAction::parse(&action)
        .ok_or_else(|| HandlerError::InvalidArgument(format!("Unknown action: {}", action)))?;
    let name = validate_name(&name)?;
    Ok((action, name))
}

/// Service names are passed to a shell, so only plain names are accepted
fn validate_name(name: &str) -> Result<String, HandlerError> {
    let name = name.trim();
    let valid = !name.is_empty()
        && name.len() <= 256
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '@' | ' '));
    if valid {
        Ok(name.to_string())
    } else {
        Err(HandlerError::InvalidArgument(format!(
            "Invalid service name: {}",
            name
        )))
    }
}

/// `services`: every service, as JSON
pub struct ServicesHandler;

#[async_trait]
impl CommandHandler for ServicesHandler {
    async fn handle(&self, command: &AgentCommand) -> Result<AgentResponse, HandlerError> {
        let mut services = platform::list().await?;
        services.sort_by(|a, b| {
            a.display_name
                .to_lowercase()
                .cmp(&b.display_name.to_lowercase())
        });
        let json = serde_json::to_string(&services)
            .map_err(|e| HandlerError::Failed(format!("Failed to encode services: {}", e)))?;
        Ok(AgentResponse::structured(command.correlation_id.clone(), json))
    }
}

/// `service_action`: start, stop, restart or inspect one service
pub struct ServiceActionHandler;

#[async_trait]
impl CommandHandler for ServiceActionHandler {
    async fn handle(&self, command: &AgentCommand) -> Result<AgentResponse, HandlerError> {
        let (action, name) = parse_request(command)?;
        let id = command.correlation_id.clone();

        if action == ServiceAction::Info {
            let info = platform::info(&name).await?;
            let json = serde_json::to_string(&info)
                .map_err(|e| HandlerError::Failed(format!("Failed to encode service: {}", e)))?;
            return Ok(AgentResponse::structured(id, json));
        }

        tracing::info!("Service {}: {:?}", name, action);
        platform::control(action, &name).await?;
        Ok(AgentResponse::text(
            id,
            format!("Service {} {}", name, action.past_tense()),
        ))
    }
}

#[cfg(windows)]
mod platform {
    use super::*;
    use crate::handlers::shell::run_program;

    const POWERSHELL: &str = "powershell.exe";
    const PREFIX: &[&str] = &["-NoProfile", "-NonInteractive", "-Command"];

    /// Projection that renders enum columns as names
    const SELECT: &str = "Select-Object @{n='name';e={$_.Name}},@{n='display_name';e={$_.DisplayName}},\
        @{n='status';e={$_.Status.ToString()}},@{n='start_type';e={$_.StartType.ToString()}}";

    async fn powershell(script: &str) -> Result<String, HandlerError> {
        run_program(POWERSHELL, PREFIX, script, SERVICE_TIMEOUT).await
    }

    pub async fn list() -> Result<Vec<ServiceInfo>, HandlerError> {
        let output = powershell(&format!(
            "Get-Service | {} | ConvertTo-Json -Compress",
            SELECT
        ))
        .await?;
        serde_json::from_str(output.trim())
            .map_err(|e| HandlerError::Failed(format!("Unexpected service list: {}", e)))
    }

    pub async fn info(name: &str) -> Result<ServiceInfo, HandlerError> {
        let output = powershell(&format!(
            "Get-Service -Name '{}' -ErrorAction Stop | {} | ConvertTo-Json -Compress",
            name, SELECT
        ))
        .await?;
        serde_json::from_str(output.trim())
            .map_err(|_| HandlerError::NotFound(format!("Service {} not found", name)))
    }

    pub async fn control(action: ServiceAction, name: &str) -> Result<(), HandlerError> {
        let cmdlet = match action {
            ServiceAction::Start => "Start-Service",
            ServiceAction::Stop => "Stop-Service -Force",
            ServiceAction::Restart => "Restart-Service -Force",
            ServiceAction::Info => return Ok(()),
        };
        let output = powershell(&format!(
            "{} -Name '{}' -ErrorAction Stop; 'ok'",
            cmdlet, name
        ))
        .await?;
        if output.trim_end().ends_with("ok") {
            Ok(())
        } else {
            Err(HandlerError::Failed(output))
        }
    }
}

#[cfg(not(windows))]
mod platform {
    use super::*;

    const SYSTEMCTL: &str = "systemctl";

    async fn systemctl(args: &[&str]) -> Result<std::process::Output, HandlerError> {
        let child = tokio::process::Command::new(SYSTEMCTL)
            .args(args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| HandlerError::Unsupported(format!("systemctl unavailable: {}", e)))?;

        match tokio::time::timeout(SERVICE_TIMEOUT, child.wait_with_output()).await {
            Ok(output) => Ok(output?),
            Err(_) => Err(HandlerError::Timeout(SERVICE_TIMEOUT)),
        }
    }

    pub async fn list() -> Result<Vec<ServiceInfo>, HandlerError> {
        let output = systemctl(&[
            "list-units",
            "--type=service",
            "--all",
            "--no-legend",
            "--plain",
            "--no-pager",
        ])
        .await?;
        Ok(parse_list_units(&String::from_utf8_lossy(&output.stdout)))
    }

    pub async fn info(name: &str) -> Result<ServiceInfo, HandlerError> {
        let output = systemctl(&[
            "show",
            name,
            "--no-pager",
            "--property=Id,Description,ActiveState,UnitFileState,LoadState",
        ])
        .await?;
        parse_show(name, &String::from_utf8_lossy(&output.stdout))
    }

    pub async fn control(action: ServiceAction, name: &str) -> Result<(), HandlerError> {
        let verb = match action {
            ServiceAction::Start => "start",
            ServiceAction::Stop => "stop",
            ServiceAction::Restart => "restart",
            ServiceAction::Info => return Ok(()),
        };
        let output = systemctl(&[verb, name]).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(HandlerError::Failed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }

    /// Parse `systemctl list-units --plain --no-legend` rows
    ///
    /// Columns: unit, load, active, sub, description (with spaces).
    pub(super) fn parse_list_units(output: &str) -> Vec<ServiceInfo> {
        output
            .lines()
            .filter_map(|line| {
                let mut columns = line.split_whitespace();
                let unit = columns.next()?;
                let _load = columns.next()?;
                let active = columns.next()?;
                let sub = columns.next()?;
                let description = columns.collect::<Vec<_>>().join(" ");
                Some(ServiceInfo {
                    name: unit.trim_end_matches(".service").to_string(),
                    display_name: if description.is_empty() {
                        unit.to_string()
                    } else {
                        description
                    },
                    status: format!("{} ({})", active, sub),
                    start_type: String::new(),
                })
            })
            .collect()
    }

    /// Parse `systemctl show --property=...` output
    pub(super) fn parse_show(name: &str, output: &str) -> Result<ServiceInfo, HandlerError> {
        let mut info = ServiceInfo {
            name: name.to_string(),
            display_name: String::new(),
            status: String::new(),
            start_type: String::new(),
        };
        let mut loaded = false;

        for line in output.lines() {
            match line.split_once('=') {
                Some(("Description", v)) => info.display_name = v.to_string(),
                Some(("ActiveState", v)) => info.status = v.to_string(),
                Some(("UnitFileState", v)) => info.start_type = v.to_string(),
                Some(("LoadState", v)) => loaded = v == "loaded",
                _ => {}
            }
        }

        if loaded {
            Ok(info)
        } else {
            Err(HandlerError::NotFound(format!("Service {} not found", name)))
        }
    }
}
