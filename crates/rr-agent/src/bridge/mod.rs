//! Session bridge
//!
//! An agent hosted as a background service has no desktop of its own. Commands
//! that need one (screenshots, locking the workstation) are handed to the
//! logged-in user's session as a one-shot scheduled job:
//!
//! 1. Resolve the active interactive session and the account signed in to it.
//!    Either missing is a terminal outcome, not an error to retry.
//! 2. Stage a wrapper script and job definition under unique names.
//! 3. Register the job for that account and trigger it.
//! 4. Poll for the exit-code file the wrapper writes, up to the job timeout
//!    plus a grace period.
//! 5. Delete the job and every staged file, whatever happened above.

pub mod script;
#[cfg(windows)]
mod windows;

#[cfg(windows)]
pub use self::windows::WindowsSessionHost;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use rr_core::config::BridgeConfig;

/// Prefix of every scheduled job the bridge registers
pub const JOB_PREFIX: &str = "RR_";

/// Session bridge errors
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Staging files could not be written
    #[error("Failed to stage job: {0}")]
    Io(#[from] std::io::Error),

    /// The scheduler refused an operation
    #[error("Scheduler {operation} failed (exit {code}): {output}")]
    Scheduler {
        operation: &'static str,
        code: i32,
        output: String,
    },
}

impl BridgeError {
    /// Whether the scheduler reported that the job does not exist
    pub fn is_job_missing(&self) -> bool {
        match self {
            BridgeError::Scheduler { output, .. } => {
                let output = output.to_ascii_lowercase();
                output.contains("cannot find") || output.contains("does not exist")
            }
            BridgeError::Io(_) => false,
        }
    }
}

/// How a bridged execution ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeOutcome {
    /// The job ran and reported this exit code
    Exited(i32),
    /// Nobody is logged in interactively
    NoActiveSession,
    /// The session's account could not be resolved
    NoSessionUser,
    /// No exit code appeared before the deadline
    Timeout,
    /// The agent is shutting down
    Cancelled,
}

impl BridgeOutcome {
    /// Exit code reserved for a missing session or session user
    pub const NO_SESSION_EXIT_CODE: i32 = -1;
    /// Exit code reserved for a job that never reported back
    pub const TIMEOUT_EXIT_CODE: i32 = -2;
    /// Exit code reserved for a job abandoned on shutdown
    pub const CANCELLED_EXIT_CODE: i32 = -3;

    /// Numeric form of the outcome
    pub fn exit_code(self) -> i32 {
        match self {
            BridgeOutcome::Exited(code) => code,
            BridgeOutcome::NoActiveSession | BridgeOutcome::NoSessionUser => {
                Self::NO_SESSION_EXIT_CODE
            }
            BridgeOutcome::Timeout => Self::TIMEOUT_EXIT_CODE,
            BridgeOutcome::Cancelled => Self::CANCELLED_EXIT_CODE,
        }
    }

    /// Whether the job ran and exited with code 0
    pub fn is_success(self) -> bool {
        self == BridgeOutcome::Exited(0)
    }
}

/// Operating-system side of the bridge
#[async_trait]
pub trait SessionHost: Send + Sync {
    /// ID of the active interactive session, if any
    fn active_session(&self) -> Option<u32>;

    /// Account (`DOMAIN\user`) signed in to `session_id`
    fn session_user(&self, session_id: u32) -> Option<String>;

    /// File extension of the wrapper script, without the dot
    fn wrapper_extension(&self) -> &'static str;

    /// Wrapper that runs `command_line` and writes its exit code to `exit_code_file`
    fn render_wrapper(&self, command_line: &str, exit_code_file: &Path) -> Vec<u8>;

    /// Job definition running `wrapper` once as `user`
    fn render_job(&self, user: &str, wrapper: &Path, time_limit_secs: u64) -> Vec<u8>;

    /// Register a job from a definition file
    async fn register_job(&self, name: &str, definition: &Path) -> Result<(), BridgeError>;

    /// Start a registered job now
    async fn run_job(&self, name: &str) -> Result<(), BridgeError>;

    /// Remove a registered job
    async fn delete_job(&self, name: &str) -> Result<(), BridgeError>;
}

/// Runs commands in the interactive user's session
pub struct SessionBridge {
    host: Arc<dyn SessionHost>,
    config: BridgeConfig,
    /// Cancelled on agent shutdown
    cancel: CancellationToken,
}

impl SessionBridge {
    /// Create a bridge over `host`
    pub fn new(host: Arc<dyn SessionHost>, config: BridgeConfig, cancel: CancellationToken) -> Self {
        Self {
            host,
            config,
            cancel,
        }
    }

    /// Directory staged files are written to
    pub fn staging_dir(&self) -> &Path {
        &self.config.staging_dir
    }

    /// How long a bridged job may run
    pub fn job_timeout(&self) -> std::time::Duration {
        self.config.job_timeout
    }

    /// Run `program` with `arguments` in the interactive session
    ///
    /// Returns `Err` only for staging or scheduler failures; missing sessions,
    /// timeouts and cancellation are reported as outcomes.
    pub async fn run(&self, program: &str, arguments: &str) -> Result<BridgeOutcome, BridgeError> {
        let session_id = match self.host.active_session() {
            Some(id) => id,
            None => {
                tracing::warn!("No active user session for {}", program);
                return Ok(BridgeOutcome::NoActiveSession);
            }
        };

        let user = match self.host.session_user(session_id) {
            Some(user) => user,
            None => {
                tracing::warn!("Could not resolve the user of session {}", session_id);
                return Ok(BridgeOutcome::NoSessionUser);
            }
        };

        tokio::fs::create_dir_all(&self.config.staging_dir).await?;
        let mut job = StagedJob::new(
            Arc::clone(&self.host),
            &self.config.staging_dir,
            self.host.wrapper_extension(),
        );
        tracing::debug!(
            "Bridging {} into session {} as {} ({})",
            program,
            session_id,
            user,
            job.name
        );

        let result = self
            .submit_and_wait(&mut job, &user, &script::command_line(program, arguments))
            .await;
        job.cleanup().await;

        match &result {
            Ok(outcome) => tracing::debug!("{} finished: {:?}", job.name, outcome),
            Err(e) => tracing::warn!("{} failed: {}", job.name, e),
        }
        result
    }

    async fn submit_and_wait(
        &self,
        job: &mut StagedJob,
        user: &str,
        command_line: &str,
    ) -> Result<BridgeOutcome, BridgeError> {
        let wrapper = self.host.render_wrapper(command_line, &job.exit_code_file);
        tokio::fs::write(&job.wrapper, wrapper).await?;

        let definition =
            self.host
                .render_job(user, &job.wrapper, self.config.job_timeout.as_secs());
        tokio::fs::write(&job.definition, definition).await?;

        // A create that times out may still have registered the job
        job.registered = true;
        self.host.register_job(&job.name, &job.definition).await?;

        self.host.run_job(&job.name).await?;

        let deadline = Instant::now() + self.config.job_timeout + self.config.grace_period;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(BridgeOutcome::Cancelled),
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }

            if let Some(code) = read_exit_code(&job.exit_code_file).await {
                return Ok(BridgeOutcome::Exited(code));
            }

            if Instant::now() >= deadline {
                return Ok(BridgeOutcome::Timeout);
            }
        }
    }
}

/// Exit code written by a finished wrapper
///
/// A file that is missing, or still being written, reads as `None`.
async fn read_exit_code(path: &Path) -> Option<i32> {
    let content = tokio::fs::read_to_string(path).await.ok()?;
    content.trim().parse().ok()
}

/// Artifacts of one bridged execution
struct StagedJob {
    host: Arc<dyn SessionHost>,
    name: String,
    wrapper: PathBuf,
    definition: PathBuf,
    exit_code_file: PathBuf,
    registered: bool,
    cleaned: bool,
}

impl StagedJob {
    fn new(host: Arc<dyn SessionHost>, staging_dir: &Path, wrapper_extension: &str) -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string();
        Self {
            host,
            name: format!("{}{}", JOB_PREFIX, id),
            wrapper: staging_dir.join(format!("{}.{}", id, wrapper_extension)),
            definition: staging_dir.join(format!("{}.xml", id)),
            exit_code_file: staging_dir.join(format!("{}_exit.txt", id)),
            registered: false,
            cleaned: false,
        }
    }

    /// Delete the job and staged files
    async fn cleanup(&mut self) {
        if self.registered {
            match self.host.delete_job(&self.name).await {
                Ok(()) => {}
                Err(e) if e.is_job_missing() => {
                    tracing::debug!("Job {} was never created", self.name)
                }
                Err(e) => tracing::warn!("Failed to delete job {}: {}", self.name, e),
            }
            self.registered = false;
        }
        self.remove_files();
        self.cleaned = true;
    }

    fn remove_files(&self) {
        for path in [&self.wrapper, &self.definition, &self.exit_code_file] {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!("Failed to remove {:?}: {}", path, e),
            }
        }
    }
}

// Covers a bridged run whose future was dropped before `cleanup` ran.
impl Drop for StagedJob {
    fn drop(&mut self) {
        if self.cleaned {
            return;
        }
        self.remove_files();
        if self.registered {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                let host = Arc::clone(&self.host);
                let name = std::mem::take(&mut self.name);
                runtime.spawn(async move {
                    let _ = host.delete_job(&name).await;
                });
            }
        }
    }
}

/// The platform's session host, where one exists
pub fn platform_host() -> Option<Arc<dyn SessionHost>> {
    #[cfg(windows)]
    {
        Some(Arc::new(WindowsSessionHost::new()))
    }

    #[cfg(not(windows))]
    {
        None
    }
}

/// Whether this process runs outside any interactive session
pub fn running_without_desktop() -> bool {
    #[cfg(windows)]
    {
        windows::current_process_session() == Some(0)
    }

    #[cfg(not(windows))]
    {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Clone, Copy)]
    enum JobBehavior {
        /// The job writes this exit code when run
        Exit(i32),
        /// The job never reports back
        Hang,
        /// Registration is refused
        RejectRegister,
        /// Registration times out after the scheduler created the job
        RegisterTimesOut,
    }

    struct FakeHost {
        session: Option<u32>,
        user: Option<String>,
        behavior: JobBehavior,
        staging_dir: PathBuf,
        calls: Mutex<Vec<String>>,
    }

    impl FakeHost {
        fn new(staging_dir: &Path, behavior: JobBehavior) -> Self {
            Self {
                session: Some(1),
                user: Some("DESK\\alice".to_string()),
                behavior,
                staging_dir: staging_dir.to_path_buf(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SessionHost for FakeHost {
        fn active_session(&self) -> Option<u32> {
            self.session
        }

        fn session_user(&self, _session_id: u32) -> Option<String> {
            self.user.clone()
        }

        fn wrapper_extension(&self) -> &'static str {
            "cmd"
        }

        fn render_wrapper(&self, command_line: &str, _exit_code_file: &Path) -> Vec<u8> {
            command_line.as_bytes().to_vec()
        }

        fn render_job(&self, user: &str, _wrapper: &Path, time_limit_secs: u64) -> Vec<u8> {
            format!("{} {}", user, time_limit_secs).into_bytes()
        }

        async fn register_job(&self, name: &str, definition: &Path) -> Result<(), BridgeError> {
            assert!(definition.exists());
            self.calls.lock().unwrap().push(format!("register {}", name));
            match self.behavior {
                JobBehavior::RejectRegister => Err(BridgeError::Scheduler {
                    operation: "create",
                    code: 1,
                    output: "Access is denied.".to_string(),
                }),
                JobBehavior::RegisterTimesOut => Err(BridgeError::Scheduler {
                    operation: "create",
                    code: -1,
                    output: "timed out".to_string(),
                }),
                _ => Ok(()),
            }
        }

        async fn run_job(&self, name: &str) -> Result<(), BridgeError> {
            self.calls.lock().unwrap().push(format!("run {}", name));
            if let JobBehavior::Exit(code) = self.behavior {
                let id = name.trim_start_matches(JOB_PREFIX);
                let exit_file = self.staging_dir.join(format!("{}_exit.txt", id));
                std::fs::write(exit_file, code.to_string())?;
            }
            Ok(())
        }

        async fn delete_job(&self, name: &str) -> Result<(), BridgeError> {
            self.calls.lock().unwrap().push(format!("delete {}", name));
            match self.behavior {
                JobBehavior::RejectRegister => Err(BridgeError::Scheduler {
                    operation: "delete",
                    code: 1,
                    output: "ERROR: The system cannot find the file specified.".to_string(),
                }),
                _ => Ok(()),
            }
        }
    }

    fn config(staging_dir: &Path) -> BridgeConfig {
        BridgeConfig {
            enabled: Some(true),
            staging_dir: staging_dir.to_path_buf(),
            job_timeout: Duration::from_secs(15),
            grace_period: Duration::from_secs(5),
            poll_interval: Duration::from_millis(300),
        }
    }

    fn bridge(host: &Arc<FakeHost>, staging_dir: &Path) -> SessionBridge {
        let host: Arc<dyn SessionHost> = Arc::clone(host) as Arc<dyn SessionHost>;
        SessionBridge::new(host, config(staging_dir), CancellationToken::new())
    }

    fn staged_files(dir: &Path) -> usize {
        std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
    }

    #[tokio::test]
    async fn test_job_exit_code_is_collected() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(FakeHost::new(dir.path(), JobBehavior::Exit(0)));

        let outcome = bridge(&host, dir.path()).run("powershell.exe", "-File x.ps1").await;
        assert_eq!(outcome.unwrap(), BridgeOutcome::Exited(0));
        assert_eq!(staged_files(dir.path()), 0);

        let calls = host.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls[0].starts_with("register RR_"));
        assert!(calls[2].starts_with("delete RR_"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_not_success() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(FakeHost::new(dir.path(), JobBehavior::Exit(5)));

        let outcome = bridge(&host, dir.path()).run("tool.exe", "").await.unwrap();
        assert_eq!(outcome, BridgeOutcome::Exited(5));
        assert!(!outcome.is_success());
        assert_eq!(outcome.exit_code(), 5);
    }

    #[tokio::test]
    async fn test_no_session_stages_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut fake = FakeHost::new(dir.path(), JobBehavior::Exit(0));
        fake.session = None;
        let host = Arc::new(fake);

        let outcome = bridge(&host, dir.path()).run("x.exe", "").await.unwrap();
        assert_eq!(outcome, BridgeOutcome::NoActiveSession);
        assert_eq!(outcome.exit_code(), BridgeOutcome::NO_SESSION_EXIT_CODE);
        assert!(host.calls().is_empty());
    }

    #[tokio::test]
    async fn test_no_session_user_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let mut fake = FakeHost::new(dir.path(), JobBehavior::Exit(0));
        fake.user = None;
        let host = Arc::new(fake);

        let outcome = bridge(&host, dir.path()).run("x.exe", "").await.unwrap();
        assert_eq!(outcome, BridgeOutcome::NoSessionUser);
        assert!(host.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(FakeHost::new(dir.path(), JobBehavior::Hang));

        let outcome = bridge(&host, dir.path()).run("x.exe", "").await.unwrap();
        assert_eq!(outcome, BridgeOutcome::Timeout);
        assert_eq!(outcome.exit_code(), BridgeOutcome::TIMEOUT_EXIT_CODE);
        assert_eq!(staged_files(dir.path()), 0);
        assert!(host.calls().last().unwrap().starts_with("delete "));
    }

    #[tokio::test]
    async fn test_register_failure_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(FakeHost::new(dir.path(), JobBehavior::RejectRegister));

        let result = bridge(&host, dir.path()).run("x.exe", "").await;
        assert!(matches!(result, Err(BridgeError::Scheduler { .. })));
        assert_eq!(staged_files(dir.path()), 0);
        // Delete is still attempted; the scheduler's "not found" is fine
        let calls = host.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[1].starts_with("delete RR_"));
    }

    #[tokio::test]
    async fn test_register_timeout_still_deletes_job() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(FakeHost::new(dir.path(), JobBehavior::RegisterTimesOut));

        let result = bridge(&host, dir.path()).run("x.exe", "").await;
        assert!(matches!(result, Err(BridgeError::Scheduler { .. })));
        assert_eq!(staged_files(dir.path()), 0);

        let calls = host.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].starts_with("register RR_"));
        assert_eq!(calls[1], calls[0].replacen("register", "delete", 1));
    }

    #[test]
    fn test_job_missing_detection() {
        let missing = BridgeError::Scheduler {
            operation: "delete",
            code: 1,
            output: "ERROR: The system cannot find the file specified.".to_string(),
        };
        assert!(missing.is_job_missing());

        let denied = BridgeError::Scheduler {
            operation: "delete",
            code: 1,
            output: "ERROR: Access is denied.".to_string(),
        };
        assert!(!denied.is_job_missing());
        assert!(!BridgeError::Io(std::io::Error::other("disk")).is_job_missing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(FakeHost::new(dir.path(), JobBehavior::Hang));
        let cancel = CancellationToken::new();
        let bridge = SessionBridge::new(
            Arc::clone(&host) as Arc<dyn SessionHost>,
            config(dir.path()),
            cancel.clone(),
        );

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            cancel.cancel();
        });

        let outcome = bridge.run("x.exe", "").await.unwrap();
        canceller.await.unwrap();
        assert_eq!(outcome, BridgeOutcome::Cancelled);
        assert_eq!(outcome.exit_code(), BridgeOutcome::CANCELLED_EXIT_CODE);
        assert_eq!(staged_files(dir.path()), 0);
        assert!(host.calls().last().unwrap().starts_with("delete "));
    }

    #[tokio::test]
    async fn test_concurrent_runs_use_distinct_names() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(FakeHost::new(dir.path(), JobBehavior::Exit(0)));
        let bridge = Arc::new(bridge(&host, dir.path()));

        let runs: Vec<_> = (0..4)
            .map(|_| {
                let bridge = Arc::clone(&bridge);
                tokio::spawn(async move { bridge.run("x.exe", "").await.unwrap() })
            })
            .collect();
        for run in runs {
            assert_eq!(run.await.unwrap(), BridgeOutcome::Exited(0));
        }

        let mut registered: Vec<_> = host
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("register "))
            .collect();
        registered.sort();
        registered.dedup();
        assert_eq!(registered.len(), 4);
        assert_eq!(staged_files(dir.path()), 0);
    }
}
