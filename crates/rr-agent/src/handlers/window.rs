//! Window commands: `windows_list`, `window_action`, `window_screenshot`
//!
//! Windows are addressed by their handle (HWND) as reported by
//! `windows_list`. Each command is a PowerShell script run where the
//! desktop is, directly or through the session bridge.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use rr_protocol::{AgentCommand, AgentResponse};

use super::desktop::{powershell_file, DesktopAccess, StagedFiles};
use crate::executor::{CommandHandler, HandlerError};

/// Writes `hwnd|pid|state|title` for every visible, titled top-level window
const LIST_SCRIPT: &str = r#"param([string]$Path)
Add-Type @"
using System;
using System.Collections.Generic;
using System.Runtime.InteropServices;
using System.Text;

public static class RrWindows {
    public delegate bool EnumProc(IntPtr hWnd, IntPtr lParam);
    [DllImport("user32.dll")] static extern bool EnumWindows(EnumProc proc, IntPtr lParam);
    [DllImport("user32.dll")] static extern int GetWindowTextLength(IntPtr hWnd);
    [DllImport("user32.dll", CharSet = CharSet.Unicode)] static extern int GetWindowText(IntPtr hWnd, StringBuilder text, int max);
    [DllImport("user32.dll")] static extern bool IsWindowVisible(IntPtr hWnd);
    [DllImport("user32.dll")] static extern uint GetWindowThreadProcessId(IntPtr hWnd, out uint pid);
    [DllImport("user32.dll")] static extern bool IsIconic(IntPtr hWnd);
    [DllImport("user32.dll")] static extern bool IsZoomed(IntPtr hWnd);

    public static List<string> List() {
        var lines = new List<string>();
        EnumWindows((h, _) => {
            if (!IsWindowVisible(h)) return true;
            int len = GetWindowTextLength(h);
            if (len == 0) return true;
            var text = new StringBuilder(len + 1);
            GetWindowText(h, text, text.Capacity);
            var title = text.ToString().Replace("\r", " ").Replace("\n", " ");
            if (title.Trim().Length == 0) return true;
            uint pid;
            GetWindowThreadProcessId(h, out pid);
            var state = IsIconic(h) ? "minimized" : IsZoomed(h) ? "maximized" : "normal";
            lines.Add(h.ToInt64() + "|" + pid + "|" + state + "|" + title);
            return true;
        }, IntPtr.Zero);
        return lines;
    }
}
"@
[System.IO.File]::WriteAllLines($Path, [RrWindows]::List(), (New-Object System.Text.UTF8Encoding $false))
"#;

/// Applies `min`, `max`, `restore` or `close` to one window; exit 1 if it is gone
const ACTION_SCRIPT: &str = r#"param([long]$Hwnd, [string]$Action)
Add-Type @"
using System;
using System.Diagnostics;
using System.Runtime.InteropServices;
using System.Threading;

public static class RrWindowAction {
    [DllImport("user32.dll")] static extern bool IsWindow(IntPtr hWnd);
    [DllImport("user32.dll")] static extern bool ShowWindow(IntPtr hWnd, int cmd);
    [DllImport("user32.dll")] static extern IntPtr SendMessage(IntPtr hWnd, uint msg, IntPtr w, IntPtr l);
    [DllImport("user32.dll")] static extern uint GetWindowThreadProcessId(IntPtr hWnd, out uint pid);

    public static bool Apply(long hwnd, string action) {
        var h = new IntPtr(hwnd);
        if (!IsWindow(h)) return false;
        switch (action) {
            case "min": ShowWindow(h, 6); return true;
            case "max": ShowWindow(h, 3); return true;
            case "restore": ShowWindow(h, 9); return true;
            case "close":
                SendMessage(h, 0x0010, IntPtr.Zero, IntPtr.Zero);
                Thread.Sleep(500);
                if (IsWindow(h)) {
                    uint pid;
                    GetWindowThreadProcessId(h, out pid);
                    if (pid != 0) {
                        try { Process.GetProcessById((int)pid).Kill(); } catch { }
                    }
                }
                return true;
            default: return false;
        }
    }
}
"@
if (-not [RrWindowAction]::Apply($Hwnd, $Action)) { exit 1 }
"#;

const MINIMIZE_ALL_SCRIPT: &str = "(New-Object -ComObject Shell.Application).MinimizeAll()\r\n";

/// Captures one window to a PNG; exit 1 if it is gone or has no area
const CAPTURE_SCRIPT: &str = r#"param([long]$Hwnd, [string]$Path)
Add-Type -AssemblyName System.Drawing
Add-Type @"
using System;
using System.Runtime.InteropServices;

public static class RrWindowCapture {
    [StructLayout(LayoutKind.Sequential)]
    public struct RECT { public int Left, Top, Right, Bottom; }
    [DllImport("user32.dll")] public static extern bool IsWindow(IntPtr hWnd);
    [DllImport("user32.dll")] public static extern bool IsIconic(IntPtr hWnd);
    [DllImport("user32.dll")] public static extern bool ShowWindow(IntPtr hWnd, int cmd);
    [DllImport("user32.dll")] public static extern bool SetForegroundWindow(IntPtr hWnd);
    [DllImport("user32.dll")] public static extern bool GetWindowRect(IntPtr hWnd, out RECT rect);
    [DllImport("user32.dll")] public static extern bool SetProcessDPIAware();
    [DllImport("dwmapi.dll")] public static extern int DwmGetWindowAttribute(IntPtr hWnd, int attr, out RECT rect, int size);
}
"@
$h = [IntPtr]::new($Hwnd)
if (-not [RrWindowCapture]::IsWindow($h)) { exit 1 }
[void][RrWindowCapture]::SetProcessDPIAware()
if ([RrWindowCapture]::IsIconic($h)) {
    [void][RrWindowCapture]::ShowWindow($h, 9)
    Start-Sleep -Milliseconds 300
}
[void][RrWindowCapture]::SetForegroundWindow($h)
Start-Sleep -Milliseconds 200
$r = New-Object RrWindowCapture+RECT
if ([RrWindowCapture]::DwmGetWindowAttribute($h, 9, [ref]$r, 16) -ne 0) {
    if (-not [RrWindowCapture]::GetWindowRect($h, [ref]$r)) { exit 1 }
}
$w = $r.Right - $r.Left
$ht = $r.Bottom - $r.Top
if ($w -le 0 -or $ht -le 0) { exit 1 }
$bmp = New-Object System.Drawing.Bitmap $w, $ht
$g = [System.Drawing.Graphics]::FromImage($bmp)
$g.CopyFromScreen($r.Left, $r.Top, 0, 0, $bmp.Size)
$bmp.Save($Path, [System.Drawing.Imaging.ImageFormat]::Png)
$g.Dispose()
$bmp.Dispose()
"#;

/// Window display state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowState {
    Normal,
    Minimized,
    Maximized,
}

/// One top-level window
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WindowInfo {
    pub hwnd: i64,
    pub pid: u32,
    pub state: WindowState,
    pub title: String,
}

/// Parse the list script's output, skipping malformed lines
fn parse_window_list(text: &str) -> Vec<WindowInfo> {
    text.trim_start_matches('\u{feff}')
        .lines()
        .filter_map(|line| {
            let mut parts = line.splitn(4, '|');
            let hwnd = parts.next()?.trim().parse().ok()?;
            let pid = parts.next()?.trim().parse().ok()?;
            let state = match parts.next()?.trim() {
                "minimized" => WindowState::Minimized,
                "maximized" => WindowState::Maximized,
                _ => WindowState::Normal,
            };
            let title = parts.next()?.trim_end_matches('\r').to_string();
            Some(WindowInfo {
                hwnd,
                pid,
                state,
                title,
            })
        })
        .collect()
}

/// What `window_action` does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WindowAction {
    Minimize(i64),
    Maximize(i64),
    Restore(i64),
    Close(i64),
    MinimizeAll,
}

impl WindowAction {
    /// Parse `action:hwnd` (or `minall`), or the `action` and `hwnd` parameters
    fn from_command(command: &AgentCommand) -> Result<Self, HandlerError> {
        let (action, hwnd) = match command.parameter("action") {
            Some(action) => (action, command.parameter("hwnd")),
            None => {
                let text = command.arguments().ok_or_else(|| {
                    HandlerError::InvalidArgument(
                        "Specify an action: min|max|restore|close:<hwnd> or minall".to_string(),
                    )
                })?;
                match text.split_once(':') {
                    Some((action, hwnd)) => (action, Some(hwnd)),
                    None => (text, None),
                }
            }
        };

        let action = action.trim();
        if action == "minall" {
            return Ok(WindowAction::MinimizeAll);
        }

        let hwnd = parse_hwnd(hwnd)?;
        match action {
            "min" => Ok(WindowAction::Minimize(hwnd)),
            "max" => Ok(WindowAction::Maximize(hwnd)),
            "restore" => Ok(WindowAction::Restore(hwnd)),
            "close" => Ok(WindowAction::Close(hwnd)),
            other => Err(HandlerError::InvalidArgument(format!(
                "Unknown window action: {}",
                other
            ))),
        }
    }

    fn script_action(self) -> Option<(&'static str, i64)> {
        match self {
            WindowAction::Minimize(hwnd) => Some(("min", hwnd)),
            WindowAction::Maximize(hwnd) => Some(("max", hwnd)),
            WindowAction::Restore(hwnd) => Some(("restore", hwnd)),
            WindowAction::Close(hwnd) => Some(("close", hwnd)),
            WindowAction::MinimizeAll => None,
        }
    }

    fn done_message(self) -> &'static str {
        match self {
            WindowAction::Minimize(_) => "Window minimized",
            WindowAction::Maximize(_) => "Window maximized",
            WindowAction::Restore(_) => "Window restored",
            WindowAction::Close(_) => "Window closed",
            WindowAction::MinimizeAll => "All windows minimized",
        }
    }
}

fn parse_hwnd(text: Option<&str>) -> Result<i64, HandlerError> {
    let text = text
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| HandlerError::InvalidArgument("No window handle given".to_string()))?;
    match text.parse::<i64>() {
        Ok(hwnd) if hwnd > 0 => Ok(hwnd),
        _ => Err(HandlerError::InvalidArgument(format!(
            "Invalid window handle: {}",
            text
        ))),
    }
}

/// Shared setup of the window handlers
struct WindowRunner {
    access: DesktopAccess,
    staging_dir: PathBuf,
    timeout: Duration,
}

impl WindowRunner {
    fn ensure_supported(&self) -> Result<(), HandlerError> {
        if self.access.has_powershell() {
            Ok(())
        } else {
            Err(HandlerError::Unsupported(
                "Window commands are only available on Windows".to_string(),
            ))
        }
    }

    /// Stage `script` and run it with `arguments`; `output` is appended last
    async fn run(
        &self,
        prefix: &str,
        output_extension: &str,
        script: &str,
        arguments: Vec<String>,
        failure: &str,
    ) -> Result<StagedFiles, HandlerError> {
        self.ensure_supported()?;
        let files = StagedFiles::create(&self.staging_dir, prefix, output_extension).await?;
        files.write_script(script).await?;

        let mut arguments = arguments;
        arguments.push(files.output.to_string_lossy().to_string());
        self.access
            .run(
                "powershell.exe",
                &powershell_file(&files.script, arguments),
                self.timeout,
                failure,
            )
            .await?;
        Ok(files)
    }
}

/// `windows_list`: visible top-level windows, as JSON
pub struct WindowsListHandler {
    runner: WindowRunner,
}

impl WindowsListHandler {
    pub fn new(access: DesktopAccess, staging_dir: PathBuf, timeout: Duration) -> Self {
        Self {
            runner: WindowRunner {
                access,
                staging_dir,
                timeout,
            },
        }
    }
}

#[async_trait]
impl CommandHandler for WindowsListHandler {
    async fn handle(&self, command: &AgentCommand) -> Result<AgentResponse, HandlerError> {
        let files = self
            .runner
            .run("winlist", "txt", LIST_SCRIPT, Vec::new(), "Failed to list windows")
            .await?;
        let raw = files.read_output().await.unwrap_or_default();
        let windows = parse_window_list(&String::from_utf8_lossy(&raw));

        tracing::debug!("Listed {} windows", windows.len());
        let json = serde_json::to_string(&windows)
            .map_err(|e| HandlerError::Failed(format!("Failed to encode windows: {}", e)))?;
        Ok(AgentResponse::structured(command.correlation_id.clone(), json))
    }
}

/// `window_action`: minimize, maximize, restore or close a window, or minimize all
pub struct WindowActionHandler {
    runner: WindowRunner,
}

impl WindowActionHandler {
    pub fn new(access: DesktopAccess, staging_dir: PathBuf, timeout: Duration) -> Self {
        Self {
            runner: WindowRunner {
                access,
                staging_dir,
                timeout,
            },
        }
    }
}

#[async_trait]
impl CommandHandler for WindowActionHandler {
    async fn handle(&self, command: &AgentCommand) -> Result<AgentResponse, HandlerError> {
        let action = WindowAction::from_command(command)?;

        let (script, arguments) = match action.script_action() {
            Some((name, hwnd)) => (ACTION_SCRIPT, vec![hwnd.to_string(), name.to_string()]),
            None => (MINIMIZE_ALL_SCRIPT, Vec::new()),
        };
        // The output path is unused by these scripts
        let _files = self
            .runner
            .run(
                "winact",
                "txt",
                script,
                arguments,
                "Window not found or action failed",
            )
            .await?;

        tracing::info!("{:?} done", action);
        Ok(AgentResponse::text(
            command.correlation_id.clone(),
            action.done_message(),
        ))
    }
}

/// `window_screenshot`: PNG of one window
pub struct WindowScreenshotHandler {
    runner: WindowRunner,
}

impl WindowScreenshotHandler {
    pub fn new(access: DesktopAccess, staging_dir: PathBuf, timeout: Duration) -> Self {
        Self {
            runner: WindowRunner {
                access,
                staging_dir,
                timeout,
            },
        }
    }
}

#[async_trait]
impl CommandHandler for WindowScreenshotHandler {
    async fn handle(&self, command: &AgentCommand) -> Result<AgentResponse, HandlerError> {
        let hwnd = parse_hwnd(command.parameter("hwnd").or_else(|| command.arguments()))?;

        let files = self
            .runner
            .run(
                "winshot",
                "png",
                CAPTURE_SCRIPT,
                vec![hwnd.to_string()],
                "Window not found or could not be captured",
            )
            .await?;
        let png = files.read_output().await.ok_or_else(|| {
            HandlerError::Failed("Window screenshot was not produced".to_string())
        })?;

        Ok(AgentResponse::photo(
            command.correlation_id.clone(),
            png,
            "window.png",
        ))
    }
}
