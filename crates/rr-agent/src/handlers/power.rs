//! Power state commands

use std::time::Duration;

use async_trait::async_trait;

use rr_protocol::{AgentCommand, AgentResponse};

use crate::executor::{CommandHandler, HandlerError};

/// Delay before suspending, so the response leaves the machine first
const SUSPEND_DELAY: Duration = Duration::from_secs(1);

/// Which power transition to perform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    Shutdown,
    Restart,
    Sleep,
    Hibernate,
}

impl PowerAction {
    /// Program and arguments that perform the transition
    pub fn command_line(self) -> (&'static str, &'static [&'static str]) {
        #[cfg(windows)]
        let command: (&'static str, &'static [&'static str]) = match self {
            PowerAction::Shutdown => ("shutdown.exe", &["/s", "/t", "10"]),
            PowerAction::Restart => ("shutdown.exe", &["/r", "/t", "10"]),
            PowerAction::Sleep => ("rundll32.exe", &["powrprof.dll,SetSuspendState", "0,1,0"]),
            PowerAction::Hibernate => ("shutdown.exe", &["/h"]),
        };

        #[cfg(not(windows))]
        let command: (&'static str, &'static [&'static str]) = match self {
            PowerAction::Shutdown => ("shutdown", &["-h", "+1"]),
            PowerAction::Restart => ("shutdown", &["-r", "+1"]),
            PowerAction::Sleep => ("systemctl", &["suspend"]),
            PowerAction::Hibernate => ("systemctl", &["hibernate"]),
        };

        command
    }

    /// Suspends take the network down at once, so they run after replying
    fn is_deferred(self) -> bool {
        matches!(self, PowerAction::Sleep | PowerAction::Hibernate)
    }

    fn announcement(self) -> &'static str {
        #[cfg(windows)]
        let announcement = match self {
            PowerAction::Shutdown => "Shutting down in 10 seconds (cancel with: shutdown /a)",
            PowerAction::Restart => "Restarting in 10 seconds (cancel with: shutdown /a)",
            PowerAction::Sleep => "Going to sleep...",
            PowerAction::Hibernate => "Hibernating...",
        };

        #[cfg(not(windows))]
        let announcement = match self {
            PowerAction::Shutdown => "Shutting down in 1 minute (cancel with: shutdown -c)",
            PowerAction::Restart => "Restarting in 1 minute (cancel with: shutdown -c)",
            PowerAction::Sleep => "Going to sleep...",
            PowerAction::Hibernate => "Hibernating...",
        };

        announcement
    }
}

/// Runs one power transition
pub struct PowerHandler {
    action: PowerAction,
}

impl PowerHandler {
    pub fn new(action: PowerAction) -> Self {
        Self { action }
    }
}

#[async_trait]
impl CommandHandler for PowerHandler {
    async fn handle(&self, command: &AgentCommand) -> Result<AgentResponse, HandlerError> {
        let action = self.action;
        let (program, args) = action.command_line();
        tracing::warn!("Power action requested: {:?}", action);

        if action.is_deferred() {
            tokio::spawn(async move {
                tokio::time::sleep(SUSPEND_DELAY).await;
                if let Err(e) = run(program, args).await {
                    tracing::error!("{:?} failed: {}", action, e);
                }
            });
        } else {
            run(program, args).await?;
        }

        Ok(AgentResponse::text(
            command.correlation_id.clone(),
            action.announcement(),
        ))
    }
}

async fn run(program: &str, args: &[&str]) -> Result<(), HandlerError> {
    let output = tokio::process::Command::new(program)
        .args(args)
        .stdin(std::process::Stdio::null())
        .output()
        .await
        .map_err(|e| HandlerError::Failed(format!("Failed to start {}: {}", program, e)))?;

    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(HandlerError::Failed(format!(
            "{} exited with {}: {}",
            program,
            output.status,
            stderr.trim()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_suspends_are_deferred() {
        assert!(!PowerAction::Shutdown.is_deferred());
        assert!(!PowerAction::Restart.is_deferred());
        assert!(PowerAction::Sleep.is_deferred());
        assert!(PowerAction::Hibernate.is_deferred());
    }

    #[test]
    fn test_shutdown_and_restart_are_delayed() {
        let (_, shutdown) = PowerAction::Shutdown.command_line();
        let (_, restart) = PowerAction::Restart.command_line();
        assert_ne!(shutdown, restart);
        // Neither powers off immediately, so the reply gets out
        assert!(shutdown.iter().any(|a| *a == "10" || *a == "+1"));
        assert!(restart.iter().any(|a| *a == "10" || *a == "+1"));
    }
}
