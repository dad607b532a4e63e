//! Rendering of the staged wrapper script and scheduled job definition
//!
//! The wrapper runs the bridged command hidden, waits for it, and writes the
//! exit code to a file the agent polls for. The job definition runs the
//! wrapper once as the interactive user.

use std::path::Path;

/// Minimum execution time limit written into a job definition, in seconds
pub const MIN_JOB_TIME_LIMIT_SECS: u64 = 10;

/// Build a command line from a program and its argument string
pub fn command_line(program: &str, arguments: &str) -> String {
    if arguments.trim().is_empty() {
        format!("\"{}\"", program)
    } else {
        format!("\"{}\" {}", program, arguments)
    }
}

/// Escape a string for use inside a VBScript string literal
pub fn vbs_escape(s: &str) -> String {
    s.replace('"', "\"\"")
}

/// Escape a string for use in XML text or attribute values
pub fn xml_escape(s: &str) -> String {
    let mut escaped = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// VBScript that runs `command_line` hidden and records its exit code
pub fn render_vbs_wrapper(command_line: &str, exit_code_file: &Path) -> String {
    let exit_code_file = exit_code_file.to_string_lossy();
    [
        "Set WshShell = CreateObject(\"WScript.Shell\")".to_string(),
        format!(
            "exitCode = WshShell.Run(\"{}\", 0, True)",
            vbs_escape(command_line)
        ),
        "Set fso = CreateObject(\"Scripting.FileSystemObject\")".to_string(),
        format!(
            "Set f = fso.CreateTextFile(\"{}\", True)",
            vbs_escape(&exit_code_file)
        ),
        "f.Write exitCode".to_string(),
        "f.Close".to_string(),
        String::new(),
    ]
    .join("\r\n")
}

/// Task Scheduler definition running `wrapper` once as `user`
///
/// The job runs with the user's interactive token, least privilege, hidden,
/// and is stopped by the scheduler after `time_limit_secs` (never less than
/// [`MIN_JOB_TIME_LIMIT_SECS`]).
pub fn render_task_xml(user: &str, wrapper: &Path, time_limit_secs: u64) -> String {
    let time_limit = time_limit_secs.max(MIN_JOB_TIME_LIMIT_SECS);
    let wrapper = wrapper.to_string_lossy();
    format!(
        r#"<?xml version="1.0" encoding="UTF-16"?>
<Task version="1.2" xmlns="http://schemas.microsoft.com/windows/2004/02/mit/task">
  <Principals>
    <Principal id="Author">
      <UserId>{user}</UserId>
      <LogonType>InteractiveToken</LogonType>
      <RunLevel>LeastPrivilege</RunLevel>
    </Principal>
  </Principals>
  <Settings>
    <MultipleInstancesPolicy>IgnoreNew</MultipleInstancesPolicy>
    <DisallowStartIfOnBatteries>false</DisallowStartIfOnBatteries>
    <StopIfGoingOnBatteries>false</StopIfGoingOnBatteries>
    <ExecutionTimeLimit>PT{time_limit}S</ExecutionTimeLimit>
    <Hidden>true</Hidden>
  </Settings>
  <Actions>
    <Exec>
      <Command>wscript.exe</Command>
      <Arguments>//B //NoLogo "{wrapper}"</Arguments>
    </Exec>
  </Actions>
</Task>
"#,
        user = xml_escape(user),
        time_limit = time_limit,
        wrapper = xml_escape(&wrapper),
    )
}

/// UTF-16LE bytes with a byte order mark, as the scheduler expects
pub fn utf16_with_bom(s: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(2 + s.len() * 2);
    bytes.extend_from_slice(&[0xFF, 0xFE]);
    for unit in s.encode_utf16() {
        bytes.extend_from_slice(&unit.to_le_bytes());
    }
    bytes
}
