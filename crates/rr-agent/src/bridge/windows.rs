//! Windows session host: WTS session queries and `schtasks.exe`

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use windows_sys::Win32::Foundation::{CloseHandle, HANDLE};
use windows_sys::Win32::Security::{
    GetTokenInformation, LookupAccountSidW, TokenUser, SID_NAME_USE, TOKEN_USER,
};
use windows_sys::Win32::System::RemoteDesktop::{
    ProcessIdToSessionId, WTSActive, WTSEnumerateSessionsW, WTSFreeMemory,
    WTSGetActiveConsoleSessionId, WTSQueryUserToken, WTS_CURRENT_SERVER_HANDLE,
    WTS_SESSION_INFOW,
};
use windows_sys::Win32::System::Threading::GetCurrentProcessId;

use super::{script, BridgeError, SessionHost};

/// Returned by `WTSGetActiveConsoleSessionId` when no session is attached
const NO_SESSION: u32 = 0xFFFF_FFFF;

/// Limit on each `schtasks.exe` invocation
const SCHTASKS_TIMEOUT: Duration = Duration::from_secs(10);

/// Hide the console window of child processes
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Session host backed by Terminal Services and the Task Scheduler
#[derive(Debug, Default)]
pub struct WindowsSessionHost;

impl WindowsSessionHost {
    /// Create a host for the local machine
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SessionHost for WindowsSessionHost {
    fn active_session(&self) -> Option<u32> {
        // Console session first, then any other active session with a user
        let console = unsafe { WTSGetActiveConsoleSessionId() };
        if console != NO_SESSION && console != 0 && has_user_token(console) {
            return Some(console);
        }

        let mut sessions: *mut WTS_SESSION_INFOW = std::ptr::null_mut();
        let mut count: u32 = 0;
        let ok = unsafe {
            WTSEnumerateSessionsW(WTS_CURRENT_SERVER_HANDLE, 0, 1, &mut sessions, &mut count)
        };
        if ok == 0 || sessions.is_null() {
            return None;
        }

        let found = unsafe { std::slice::from_raw_parts(sessions, count as usize) }
            .iter()
            .filter(|s| s.State == WTSActive && s.SessionId != 0)
            .map(|s| s.SessionId)
            .find(|&id| has_user_token(id));

        unsafe { WTSFreeMemory(sessions.cast()) };
        found
    }

    fn session_user(&self, session_id: u32) -> Option<String> {
        let token = query_user_token(session_id)?;
        let user = token_account_name(token);
        unsafe { CloseHandle(token) };
        user
    }

    fn wrapper_extension(&self) -> &'static str {
        "vbs"
    }

    fn render_wrapper(&self, command_line: &str, exit_code_file: &Path) -> Vec<u8> {
        // wscript reads the wrapper as ANSI
        script::render_vbs_wrapper(command_line, exit_code_file).into_bytes()
    }

    fn render_job(&self, user: &str, wrapper: &Path, time_limit_secs: u64) -> Vec<u8> {
        script::utf16_with_bom(&script::render_task_xml(user, wrapper, time_limit_secs))
    }

    async fn register_job(&self, name: &str, definition: &Path) -> Result<(), BridgeError> {
        let definition = definition.to_string_lossy();
        schtasks("create", &["/Create", "/TN", name, "/XML", &definition, "/F"]).await
    }

    async fn run_job(&self, name: &str) -> Result<(), BridgeError> {
        schtasks("run", &["/Run", "/TN", name]).await
    }

    async fn delete_job(&self, name: &str) -> Result<(), BridgeError> {
        schtasks("delete", &["/Delete", "/TN", name, "/F"]).await
    }
}

/// Session ID of the current process
pub(super) fn current_process_session() -> Option<u32> {
    let mut session_id: u32 = 0;
    let ok = unsafe { ProcessIdToSessionId(GetCurrentProcessId(), &mut session_id) };
    (ok != 0).then_some(session_id)
}

fn query_user_token(session_id: u32) -> Option<HANDLE> {
    let mut token: HANDLE = unsafe { std::mem::zeroed() };
    let ok = unsafe { WTSQueryUserToken(session_id, &mut token) };
    (ok != 0).then_some(token)
}

fn has_user_token(session_id: u32) -> bool {
    match query_user_token(session_id) {
        Some(token) => {
            unsafe { CloseHandle(token) };
            true
        }
        None => false,
    }
}

/// `DOMAIN\name` of the account a token belongs to
fn token_account_name(token: HANDLE) -> Option<String> {
    let mut needed: u32 = 0;
    unsafe { GetTokenInformation(token, TokenUser, std::ptr::null_mut(), 0, &mut needed) };
    if needed == 0 {
        return None;
    }

    // u64 storage keeps TOKEN_USER suitably aligned
    let mut buffer = vec![0u64; (needed as usize).div_ceil(8)];
    let ok = unsafe {
        GetTokenInformation(token, TokenUser, buffer.as_mut_ptr().cast(), needed, &mut needed)
    };
    if ok == 0 {
        return None;
    }
    let sid = unsafe { (*(buffer.as_ptr() as *const TOKEN_USER)).User.Sid };

    let mut name = [0u16; 256];
    let mut domain = [0u16; 256];
    let mut name_len = name.len() as u32;
    let mut domain_len = domain.len() as u32;
    let mut sid_use: SID_NAME_USE = 0;
    let ok = unsafe {
        LookupAccountSidW(
            std::ptr::null(),
            sid,
            name.as_mut_ptr(),
            &mut name_len,
            domain.as_mut_ptr(),
            &mut domain_len,
            &mut sid_use,
        )
    };
    if ok == 0 {
        return None;
    }

    let name = String::from_utf16_lossy(&name[..name_len as usize]);
    let domain = String::from_utf16_lossy(&domain[..domain_len as usize]);
    Some(if domain.is_empty() {
        name
    } else {
        format!("{}\\{}", domain, name)
    })
}

async fn schtasks(operation: &'static str, args: &[&str]) -> Result<(), BridgeError> {
    let mut command = tokio::process::Command::new("schtasks.exe");
    command
        .args(args)
        .creation_flags(CREATE_NO_WINDOW)
        .kill_on_drop(true);

    let output = tokio::time::timeout(SCHTASKS_TIMEOUT, command.output())
        .await
        .map_err(|_| BridgeError::Scheduler {
            operation,
            code: -1,
            output: "timed out".to_string(),
        })??;

    if output.status.success() {
        return Ok(());
    }

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    Err(BridgeError::Scheduler {
        operation,
        code: output.status.code().unwrap_or(-1),
        output: text.trim().to_string(),
    })
}
