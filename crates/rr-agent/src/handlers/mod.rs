//! Built-in command handlers

pub mod desktop;
pub mod files;
pub mod power;
pub mod services;
pub mod shell;
pub mod system;
pub mod window;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use rr_core::config::AgentConfig;
use rr_protocol::CommandType;

use crate::executor::CommandExecutor;

pub use desktop::DesktopAccess;

/// Executor with every built-in handler registered
pub fn default_executor(config: &AgentConfig, desktop: DesktopAccess) -> CommandExecutor {
    let mut executor = CommandExecutor::new();

    executor.register(CommandType::Ping, Arc::new(system::PingHandler));
    executor.register(CommandType::Status, Arc::new(system::StatusHandler));
    executor.register(CommandType::Uptime, Arc::new(system::UptimeHandler));
    executor.register(CommandType::Processes, Arc::new(system::ProcessesHandler));
    executor.register(CommandType::Kill, Arc::new(system::KillHandler));
    executor.register(CommandType::Drives, Arc::new(system::DrivesHandler));
    executor.register(CommandType::Ip, Arc::new(system::IpHandler));
    executor.register(CommandType::Monitor, Arc::new(system::MonitorHandler));

    executor.register(
        CommandType::Cmd,
        Arc::new(shell::ShellHandler::new(shell::Shell::Cmd, config.shell_timeout)),
    );
    executor.register(
        CommandType::PowerShell,
        Arc::new(shell::ShellHandler::new(
            shell::Shell::PowerShell,
            config.shell_timeout,
        )),
    );

    let desktop_timeout = config.bridge.job_timeout;
    executor.register(
        CommandType::Screenshot,
        Arc::new(desktop::ScreenshotHandler::new(
            desktop.clone(),
            config.bridge.staging_dir.clone(),
            desktop_timeout,
        )),
    );
    executor.register(
        CommandType::Lock,
        Arc::new(desktop::LockHandler::new(desktop.clone(), desktop_timeout)),
    );
    executor.register(
        CommandType::WindowsList,
        Arc::new(window::WindowsListHandler::new(
            desktop.clone(),
            config.bridge.staging_dir.clone(),
            desktop_timeout,
        )),
    );
    executor.register(
        CommandType::WindowAction,
        Arc::new(window::WindowActionHandler::new(
            desktop.clone(),
            config.bridge.staging_dir.clone(),
            desktop_timeout,
        )),
    );
    executor.register(
        CommandType::WindowScreenshot,
        Arc::new(window::WindowScreenshotHandler::new(
            desktop,
            config.bridge.staging_dir.clone(),
            desktop_timeout,
        )),
    );

    for (command_type, action) in [
        (CommandType::Shutdown, power::PowerAction::Shutdown),
        (CommandType::Restart, power::PowerAction::Restart),
        (CommandType::Sleep, power::PowerAction::Sleep),
        (CommandType::Hibernate, power::PowerAction::Hibernate),
    ] {
        executor.register(command_type, Arc::new(power::PowerHandler::new(action)));
    }

    executor.register(CommandType::Services, Arc::new(services::ServicesHandler));
    executor.register(
        CommandType::ServiceAction,
        Arc::new(services::ServiceActionHandler),
    );

    let files = files::FileContext::new(config.files.clone());
    executor.register(
        CommandType::FileList,
        Arc::new(files::FileListHandler::new(Arc::clone(&files))),
    );
    executor.register(
        CommandType::FileDownload,
        Arc::new(files::FileDownloadHandler::new(Arc::clone(&files))),
    );
    executor.register(
        CommandType::FilePreview,
        Arc::new(files::FilePreviewHandler::new(files)),
    );

    executor
}
