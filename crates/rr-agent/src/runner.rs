//! Connection lifecycle
//!
//! Connect, serve the session, and reconnect with backoff until shutdown.
//! On shutdown, in-flight commands get a bounded window to finish so bridged
//! jobs are deleted before the process exits.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::executor::CommandExecutor;
use crate::state::AgentState;
use crate::tunnel::{
    run_session, ConnectionError, DisconnectReason, ExponentialBackoff, TunnelConnector,
};

/// Keeps the agent connected to its broker
pub struct AgentRunner {
    state: Arc<AgentState>,
    executor: Arc<CommandExecutor>,
    /// Command tasks, across sessions
    tasks: TaskTracker,
}

impl AgentRunner {
    pub fn new(state: Arc<AgentState>, executor: CommandExecutor) -> Self {
        Self {
            state,
            executor: Arc::new(executor),
            tasks: TaskTracker::new(),
        }
    }

    /// Run until `shutdown` fires
    ///
    /// Only a missing credential ends the loop with an error; every
    /// transport failure is retried.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), ConnectionError> {
        let result = self.connection_loop(&shutdown).await;
        let drain = self.state.config().await.bridge.grace_period;
        self.drain(drain).await;
        result
    }

    async fn connection_loop(&self, shutdown: &CancellationToken) -> Result<(), ConnectionError> {
        let connector = TunnelConnector::new(Arc::clone(&self.state));
        let mut backoff = ExponentialBackoff::from_config(&self.state.config().await.backoff);

        loop {
            let tunnel = match connector.connect_with_retry(&mut backoff, shutdown).await {
                Ok(tunnel) => tunnel,
                Err(ConnectionError::Cancelled) => return Ok(()),
                Err(e) => return Err(e),
            };

            let connected_at = tunnel.connected_at;
            let reason = run_session(
                tunnel,
                Arc::clone(&self.state),
                Arc::clone(&self.executor),
                self.tasks.clone(),
                shutdown.clone(),
            )
            .await;
            if let DisconnectReason::Shutdown = reason {
                return Ok(());
            }
            tracing::warn!("Disconnected: {:?}", reason);

            // A session that outlived the whole schedule starts it over
            if connected_at.elapsed() > backoff.ceiling() {
                backoff.reset();
            }
            let delay = backoff.next_delay();
            tracing::info!("Reconnecting in {:?}", delay);

            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Wait up to `limit` for in-flight commands to finish
    async fn drain(&self, limit: Duration) {
        self.tasks.close();
        if self.tasks.is_empty() {
            return;
        }

        tracing::info!("Waiting for {} running command(s)", self.tasks.len());
        if tokio::time::timeout(limit, self.tasks.wait()).await.is_err() {
            tracing::warn!(
                "{} command(s) still running after {:?}; exiting anyway",
                self.tasks.len(),
                limit
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use futures::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio_util::codec::Framed;

    use rr_core::config::{AgentConfig, BridgeConfig};
    use rr_protocol::{AgentCommand, CommandType, CorrelationId, FrameCodec, Message};

    use crate::bridge::{BridgeError, SessionBridge, SessionHost};
    use crate::handlers::{default_executor, DesktopAccess};

    /// A session whose jobs never finish and whose deletes take a while
    #[derive(Default)]
    struct SlowDeleteHost {
        registered: AtomicUsize,
        deleted: AtomicUsize,
    }

    #[async_trait]
    impl SessionHost for SlowDeleteHost {
        fn active_session(&self) -> Option<u32> {
            Some(1)
        }

        fn session_user(&self, _session_id: u32) -> Option<String> {
            Some("DESK\\alice".to_string())
        }

        fn wrapper_extension(&self) -> &'static str {
            "cmd"
        }

        fn render_wrapper(&self, command_line: &str, _exit_code_file: &Path) -> Vec<u8> {
            command_line.as_bytes().to_vec()
        }

        fn render_job(&self, user: &str, _wrapper: &Path, _time_limit_secs: u64) -> Vec<u8> {
            user.as_bytes().to_vec()
        }

        async fn register_job(&self, _name: &str, _definition: &Path) -> Result<(), BridgeError> {
            self.registered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn run_job(&self, _name: &str) -> Result<(), BridgeError> {
            Ok(())
        }

        async fn delete_job(&self, _name: &str) -> Result<(), BridgeError> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.deleted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_bridged_cleanup() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let staging = tempfile::tempdir().unwrap();

        let bridge_config = BridgeConfig {
            enabled: Some(true),
            staging_dir: staging.path().to_path_buf(),
            job_timeout: Duration::from_secs(30),
            grace_period: Duration::from_secs(5),
            poll_interval: Duration::from_millis(20),
        };
        let config = AgentConfig {
            broker_address: address,
            pairing_code: Some("ABC234".to_string()),
            bridge: bridge_config.clone(),
            ..Default::default()
        };

        let shutdown = CancellationToken::new();
        let host = Arc::new(SlowDeleteHost::default());
        let bridge = SessionBridge::new(
            Arc::clone(&host) as Arc<dyn SessionHost>,
            bridge_config,
            shutdown.child_token(),
        );
        let executor = default_executor(&config, DesktopAccess::Bridged(Arc::new(bridge)));
        let runner = AgentRunner::new(Arc::new(AgentState::new(config, None)), executor);

        // Broker side: accept, then hand over a desktop command
        let broker = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(socket, FrameCodec::new());
            assert!(matches!(
                framed.next().await,
                Some(Ok(Message::Register { .. }))
            ));
            framed
                .send(Message::Execute(AgentCommand::new(
                    CorrelationId::generate(),
                    CommandType::Lock,
                )))
                .await
                .unwrap();
            framed
        });

        let trigger = shutdown.clone();
        let observed = Arc::clone(&host);
        tokio::spawn(async move {
            while observed.registered.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            trigger.cancel();
        });

        runner.run(shutdown).await.unwrap();

        // The job was deleted before `run` returned, not after
        assert_eq!(host.registered.load(Ordering::SeqCst), 1);
        assert_eq!(host.deleted.load(Ordering::SeqCst), 1);
        assert_eq!(std::fs::read_dir(staging.path()).unwrap().count(), 0);
        drop(broker);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_is_bounded() {
        let runner = AgentRunner::new(
            Arc::new(AgentState::new(AgentConfig::default(), None)),
            CommandExecutor::new(),
        );
        runner
            .tasks
            .spawn(tokio::time::sleep(Duration::from_secs(3600)));

        let started = tokio::time::Instant::now();
        runner.drain(Duration::from_secs(5)).await;
        assert!(started.elapsed() < Duration::from_secs(6));
        assert_eq!(runner.tasks.len(), 1);
    }
}
