//! Commands that need the interactive desktop: `screenshot`, `lock`
//!
//! When the agent runs as a background service these go through the
//! session bridge; otherwise they run in-process. The window commands in
//! [`super::window`] reach the desktop the same way.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use rr_protocol::{AgentCommand, AgentResponse};

use crate::bridge::{BridgeOutcome, SessionBridge};
use crate::executor::{CommandHandler, HandlerError};

/// Captures the whole virtual screen to the PNG path given as its argument
const CAPTURE_SCRIPT: &str = "param([string]$Path)\r\n\
Add-Type -AssemblyName System.Windows.Forms, System.Drawing\r\n\
$bounds = [System.Windows.Forms.SystemInformation]::VirtualScreen\r\n\
$bitmap = New-Object System.Drawing.Bitmap $bounds.Width, $bounds.Height\r\n\
$graphics = [System.Drawing.Graphics]::FromImage($bitmap)\r\n\
$graphics.CopyFromScreen($bounds.Left, $bounds.Top, 0, 0, $bitmap.Size)\r\n\
$bitmap.Save($Path, [System.Drawing.Imaging.ImageFormat]::Png)\r\n\
$graphics.Dispose()\r\n\
$bitmap.Dispose()\r\n";

/// How desktop commands reach the screen
#[derive(Clone)]
pub enum DesktopAccess {
    /// The agent owns a desktop
    Direct,
    /// The agent is a service; go through the user's session
    Bridged(Arc<SessionBridge>),
}

impl DesktopAccess {
    /// Whether PowerShell scripts can reach the desktop
    ///
    /// Bridged access always lands in a Windows session.
    pub(super) fn has_powershell(&self) -> bool {
        !matches!(self, DesktopAccess::Direct) || cfg!(windows)
    }

    /// Run `program arguments` where the desktop is
    ///
    /// A nonzero exit is reported as `failure`.
    pub(super) async fn run(
        &self,
        program: &str,
        arguments: &[String],
        timeout: Duration,
        failure: &str,
    ) -> Result<(), HandlerError> {
        match self {
            DesktopAccess::Direct => run_direct(program, arguments, timeout, failure).await,
            DesktopAccess::Bridged(bridge) => {
                let arguments = arguments
                    .iter()
                    .map(|a| quote(a))
                    .collect::<Vec<_>>()
                    .join(" ");
                let outcome = bridge.run(program, &arguments).await?;
                outcome_result(outcome, bridge.job_timeout(), failure)
            }
        }
    }
}

/// Map a bridged outcome to the handler's result
fn outcome_result(
    outcome: BridgeOutcome,
    timeout: Duration,
    failure: &str,
) -> Result<(), HandlerError> {
    match outcome {
        BridgeOutcome::Exited(0) => Ok(()),
        BridgeOutcome::Exited(code) => Err(HandlerError::Failed(format!(
            "{} (exit code {})",
            failure, code
        ))),
        BridgeOutcome::NoActiveSession | BridgeOutcome::NoSessionUser => Err(
            HandlerError::Failed("No active user session".to_string()),
        ),
        BridgeOutcome::Timeout => Err(HandlerError::Timeout(timeout)),
        BridgeOutcome::Cancelled => Err(HandlerError::Failed(
            "Agent is shutting down".to_string(),
        )),
    }
}

/// Quote paths and anything with spaces
fn quote(argument: &str) -> String {
    if argument.contains([' ', '\\', '/']) {
        format!("\"{}\"", argument)
    } else {
        argument.to_string()
    }
}

async fn run_direct(
    program: &str,
    arguments: &[String],
    timeout: Duration,
    failure: &str,
) -> Result<(), HandlerError> {
    let mut command = tokio::process::Command::new(program);
    command
        .args(arguments)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(windows)]
    command.creation_flags(0x0800_0000); // CREATE_NO_WINDOW

    let child = command.spawn().map_err(|e| {
        HandlerError::Unsupported(format!("{} is not available: {}", program, e))
    })?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => output?,
        Err(_) => return Err(HandlerError::Timeout(timeout)),
    };

    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    if stderr.trim().is_empty() {
        Err(HandlerError::Failed(failure.to_string()))
    } else {
        Err(HandlerError::Failed(format!("{}: {}", failure, stderr.trim())))
    }
}

/// PowerShell arguments that run `script` with `arguments`
pub(super) fn powershell_file(script: &Path, arguments: Vec<String>) -> Vec<String> {
    let mut all = vec![
        "-NoProfile".to_string(),
        "-NonInteractive".to_string(),
        "-ExecutionPolicy".to_string(),
        "Bypass".to_string(),
        "-WindowStyle".to_string(),
        "Hidden".to_string(),
        "-File".to_string(),
        script.to_string_lossy().to_string(),
    ];
    all.extend(arguments);
    all
}

/// A staged script and the file it writes, removed when dropped
pub(super) struct StagedFiles {
    pub(super) script: PathBuf,
    pub(super) output: PathBuf,
}

impl StagedFiles {
    /// Unique `<prefix>_<id>.ps1` and `<prefix>_<id>.<output_extension>` in `dir`
    pub(super) async fn create(
        dir: &Path,
        prefix: &str,
        output_extension: &str,
    ) -> Result<Self, HandlerError> {
        tokio::fs::create_dir_all(dir).await?;
        let id = uuid::Uuid::new_v4().simple().to_string();
        Ok(Self {
            script: dir.join(format!("{}_{}.ps1", prefix, id)),
            output: dir.join(format!("{}_{}.{}", prefix, id, output_extension)),
        })
    }

    /// Write the script body
    pub(super) async fn write_script(&self, body: &str) -> Result<(), HandlerError> {
        tokio::fs::write(&self.script, body).await?;
        Ok(())
    }

    /// The output file, if it was written and is not empty
    pub(super) async fn read_output(&self) -> Option<Vec<u8>> {
        match tokio::fs::read(&self.output).await {
            Ok(bytes) if !bytes.is_empty() => Some(bytes),
            _ => None,
        }
    }
}

impl Drop for StagedFiles {
    fn drop(&mut self) {
        for path in [&self.script, &self.output] {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!("Failed to remove {:?}: {}", path, e),
            }
        }
    }
}

/// `screenshot`: PNG of the whole desktop
pub struct ScreenshotHandler {
    access: DesktopAccess,
    staging_dir: PathBuf,
    timeout: Duration,
}

impl ScreenshotHandler {
    /// Captures are staged in `staging_dir`, which must be readable by the
    /// interactive user when bridged
    pub fn new(access: DesktopAccess, staging_dir: PathBuf, timeout: Duration) -> Self {
        Self {
            access,
            staging_dir,
            timeout,
        }
    }

    /// Program and arguments that write a capture to `files.output`
    async fn capture_command(
        &self,
        files: &StagedFiles,
    ) -> Result<(&'static str, Vec<String>), HandlerError> {
        let image = files.output.to_string_lossy().to_string();

        if !self.access.has_powershell() {
            return Ok(("import", vec!["-window".to_string(), "root".to_string(), image]));
        }

        files.write_script(CAPTURE_SCRIPT).await?;
        Ok(("powershell.exe", powershell_file(&files.script, vec![image])))
    }
}

#[async_trait]
impl CommandHandler for ScreenshotHandler {
    async fn handle(&self, command: &AgentCommand) -> Result<AgentResponse, HandlerError> {
        let files = StagedFiles::create(&self.staging_dir, "shot", "png").await?;

        let (program, arguments) = self.capture_command(&files).await?;
        self.access
            .run(program, &arguments, self.timeout, "Screenshot capture failed")
            .await?;

        let png = files.read_output().await.ok_or_else(|| {
            HandlerError::Failed("Screenshot was not produced".to_string())
        })?;

        tracing::debug!("Captured screenshot ({} bytes)", png.len());
        Ok(AgentResponse::photo(
            command.correlation_id.clone(),
            png,
            "screenshot.png",
        ))
    }
}

/// `lock`: lock the workstation
pub struct LockHandler {
    access: DesktopAccess,
    timeout: Duration,
}

impl LockHandler {
    pub fn new(access: DesktopAccess, timeout: Duration) -> Self {
        Self { access, timeout }
    }
}

#[async_trait]
impl CommandHandler for LockHandler {
    async fn handle(&self, command: &AgentCommand) -> Result<AgentResponse, HandlerError> {
        let (program, arguments) = lock_command(&self.access);
        self.access
            .run(program, &arguments, self.timeout, "Failed to lock the workstation")
            .await?;

        tracing::info!("Workstation locked");
        Ok(AgentResponse::text(
            command.correlation_id.clone(),
            "Workstation locked",
        ))
    }
}

fn lock_command(access: &DesktopAccess) -> (&'static str, Vec<String>) {
    if !access.has_powershell() {
        ("loginctl", vec!["lock-session".to_string()])
    } else {
        (
            "rundll32.exe",
            vec!["user32.dll,LockWorkStation".to_string()],
        )
    }
}
