//! Shell commands: `cmd` and `power_shell`

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use rr_protocol::{AgentCommand, AgentResponse};

use crate::executor::{CommandHandler, HandlerError};

/// Reply for a command that printed nothing
const NO_OUTPUT: &str = "Done (no output)";

/// Which interpreter runs the argument text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shell {
    /// `cmd.exe /c` on Windows, `sh -c` elsewhere
    Cmd,
    /// Windows PowerShell, or `pwsh` elsewhere
    PowerShell,
}

impl Shell {
    /// Program and leading arguments, before the command text
    pub fn invocation(self) -> (&'static str, &'static [&'static str]) {
        #[cfg(windows)]
        let invocation: (&'static str, &'static [&'static str]) = match self {
            Shell::Cmd => ("cmd.exe", &["/c"]),
            Shell::PowerShell => ("powershell.exe", &["-NoProfile", "-NonInteractive", "-Command"]),
        };

        #[cfg(not(windows))]
        let invocation: (&'static str, &'static [&'static str]) = match self {
            Shell::Cmd => ("sh", &["-c"]),
            Shell::PowerShell => ("pwsh", &["-NoProfile", "-NonInteractive", "-Command"]),
        };

        invocation
    }
}

/// Runs the argument text through a shell
pub struct ShellHandler {
    shell: Shell,
    timeout: Duration,
}

impl ShellHandler {
    /// Create a handler whose commands may run for at most `timeout`
    pub fn new(shell: Shell, timeout: Duration) -> Self {
        Self { shell, timeout }
    }
}

#[async_trait]
impl CommandHandler for ShellHandler {
    async fn handle(&self, command: &AgentCommand) -> Result<AgentResponse, HandlerError> {
        let text = command
            .arguments()
            .ok_or_else(|| HandlerError::InvalidArgument("No command given".to_string()))?;

        let (program, prefix) = self.shell.invocation();
        let output = run_program(program, prefix, text, self.timeout).await?;
        Ok(AgentResponse::text(command.correlation_id.clone(), output))
    }
}

/// Run `program prefix... text` and collect its combined output
///
/// A nonzero exit status is not an error: the operator sees the output and
/// decides. Only failing to start, or running past `timeout`, is.
pub async fn run_program(
    program: &str,
    prefix: &[&str],
    text: &str,
    timeout: Duration,
) -> Result<String, HandlerError> {
    let mut command = Command::new(program);
    command
        .args(prefix)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    // cmd.exe does its own parsing of everything after /c
    #[cfg(windows)]
    {
        command.raw_arg(text);
        command.creation_flags(0x0800_0000); // CREATE_NO_WINDOW
    }
    #[cfg(not(windows))]
    command.arg(text);

    let child = command.spawn().map_err(|e| {
        HandlerError::Failed(format!("Failed to start {}: {}", program, e))
    })?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => output?,
        // Dropping the future drops the child, which kills it
        Err(_) => return Err(HandlerError::Timeout(timeout)),
    };

    Ok(format_output(
        &String::from_utf8_lossy(&output.stdout),
        &String::from_utf8_lossy(&output.stderr),
        output.status.code(),
    ))
}

fn format_output(stdout: &str, stderr: &str, code: Option<i32>) -> String {
    let mut result = String::new();

    if !stdout.trim().is_empty() {
        result.push_str(stdout.trim_end());
    }

    if !stderr.trim().is_empty() {
        if !result.is_empty() {
            result.push_str("\n\n");
        }
        result.push_str("Errors:\n");
        result.push_str(stderr.trim_end());
    }

    match code {
        Some(0) | None => {}
        Some(code) => {
            if !result.is_empty() {
                result.push_str("\n\n");
            }
            result.push_str(&format!("Exit code: {}", code));
        }
    }

    if result.is_empty() {
        NO_OUTPUT.to_string()
    } else {
        result
    }
}
