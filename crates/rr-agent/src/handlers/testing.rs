//! Session host double for desktop handler tests

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use rr_core::config::BridgeConfig;

use super::DesktopAccess;
use crate::bridge::{BridgeError, SessionBridge, SessionHost, JOB_PREFIX};

type Job = Box<dyn Fn(&str) -> i32 + Send + Sync>;

/// Runs each job by handing its command line to a closure
///
/// The closure's return value becomes the job's exit code.
pub(crate) struct ScriptedHost {
    staging_dir: PathBuf,
    session: Option<u32>,
    command_line: Mutex<String>,
    job: Job,
}

impl ScriptedHost {
    pub(crate) fn new(
        staging_dir: &Path,
        session: Option<u32>,
        job: impl Fn(&str) -> i32 + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            staging_dir: staging_dir.to_path_buf(),
            session,
            command_line: Mutex::new(String::new()),
            job: Box::new(job),
        })
    }
}

#[async_trait]
impl SessionHost for ScriptedHost {
    fn active_session(&self) -> Option<u32> {
        self.session
    }

    fn session_user(&self, _session_id: u32) -> Option<String> {
        Some("DESK\\alice".to_string())
    }

    fn wrapper_extension(&self) -> &'static str {
        "vbs"
    }

    fn render_wrapper(&self, command_line: &str, _exit_code_file: &Path) -> Vec<u8> {
        *self.command_line.lock().unwrap() = command_line.to_string();
        Vec::new()
    }

    fn render_job(&self, _user: &str, _wrapper: &Path, _time_limit_secs: u64) -> Vec<u8> {
        Vec::new()
    }

    async fn register_job(&self, _name: &str, _definition: &Path) -> Result<(), BridgeError> {
        Ok(())
    }

    async fn run_job(&self, name: &str) -> Result<(), BridgeError> {
        let command_line = self.command_line.lock().unwrap().clone();
        let code = (self.job)(&command_line);

        let id = name.trim_start_matches(JOB_PREFIX);
        std::fs::write(
            self.staging_dir.join(format!("{}_exit.txt", id)),
            code.to_string(),
        )?;
        Ok(())
    }

    async fn delete_job(&self, _name: &str) -> Result<(), BridgeError> {
        Ok(())
    }
}

/// Bridged access through `host`, staging in `dir`
pub(crate) fn bridged(host: Arc<ScriptedHost>, dir: &Path) -> DesktopAccess {
    let config = BridgeConfig {
        enabled: Some(true),
        staging_dir: dir.to_path_buf(),
        job_timeout: Duration::from_secs(2),
        grace_period: Duration::from_secs(1),
        poll_interval: Duration::from_millis(10),
    };
    DesktopAccess::Bridged(Arc::new(SessionBridge::new(
        host,
        config,
        CancellationToken::new(),
    )))
}

/// The last quoted argument of a bridged command line
pub(crate) fn last_quoted(command_line: &str) -> &str {
    command_line.rsplit('"').nth(1).unwrap_or_default()
}
