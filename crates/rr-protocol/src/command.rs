//! Command and response payloads carried by `Execute` and `Respond`

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::correlation::CorrelationId;
use crate::message::PROTOCOL_VERSION;

/// Every kind of command an agent may be asked to run
///
/// The set is closed: agents register one handler per kind and answer
/// anything they lack a handler for with an error response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    Status,
    Processes,
    Drives,
    Ip,
    Monitor,
    Uptime,
    Screenshot,
    WindowsList,
    WindowAction,
    WindowScreenshot,
    Cmd,
    PowerShell,
    Kill,
    Lock,
    Services,
    ServiceAction,
    Shutdown,
    Restart,
    Sleep,
    Hibernate,
    FileList,
    FileDownload,
    FilePreview,
    Ping,
}

impl CommandType {
    /// All command kinds, in declaration order
    pub const ALL: [CommandType; 24] = [
        CommandType::Status,
        CommandType::Processes,
        CommandType::Drives,
        CommandType::Ip,
        CommandType::Monitor,
        CommandType::Uptime,
        CommandType::Screenshot,
        CommandType::WindowsList,
        CommandType::WindowAction,
        CommandType::WindowScreenshot,
        CommandType::Cmd,
        CommandType::PowerShell,
        CommandType::Kill,
        CommandType::Lock,
        CommandType::Services,
        CommandType::ServiceAction,
        CommandType::Shutdown,
        CommandType::Restart,
        CommandType::Sleep,
        CommandType::Hibernate,
        CommandType::FileList,
        CommandType::FileDownload,
        CommandType::FilePreview,
        CommandType::Ping,
    ];

    /// Stable lowercase name, identical to the serialized form
    pub fn as_str(self) -> &'static str {
        match self {
            CommandType::Status => "status",
            CommandType::Processes => "processes",
            CommandType::Drives => "drives",
            CommandType::Ip => "ip",
            CommandType::Monitor => "monitor",
            CommandType::Uptime => "uptime",
            CommandType::Screenshot => "screenshot",
            CommandType::WindowsList => "windows_list",
            CommandType::WindowAction => "window_action",
            CommandType::WindowScreenshot => "window_screenshot",
            CommandType::Cmd => "cmd",
            CommandType::PowerShell => "power_shell",
            CommandType::Kill => "kill",
            CommandType::Lock => "lock",
            CommandType::Services => "services",
            CommandType::ServiceAction => "service_action",
            CommandType::Shutdown => "shutdown",
            CommandType::Restart => "restart",
            CommandType::Sleep => "sleep",
            CommandType::Hibernate => "hibernate",
            CommandType::FileList => "file_list",
            CommandType::FileDownload => "file_download",
            CommandType::FilePreview => "file_preview",
            CommandType::Ping => "ping",
        }
    }

    /// Whether the command needs the interactive user's desktop
    ///
    /// An agent hosted as a background service has to route these through
    /// its session bridge.
    pub fn requires_desktop(self) -> bool {
        matches!(
            self,
            CommandType::Screenshot
                | CommandType::Lock
                | CommandType::WindowsList
                | CommandType::WindowAction
                | CommandType::WindowScreenshot
        )
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the caller should render a response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseKind {
    /// `text` is populated
    Text,
    /// `data` holds an image, `file_name` names it
    Photo,
    /// `data` holds a file, `file_name` names it
    Document,
    /// `json_payload` holds a JSON document
    StructuredJson,
    /// `error_message` is populated
    Error,
}

/// What an agent reports about itself on register and heartbeat
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    /// Host name of the machine
    pub machine_name: String,
    /// Operator-chosen display name
    pub friendly_name: Option<String>,
    /// Human-readable OS description
    pub os_version: Option<String>,
    /// Account the agent process runs as
    pub user_name: Option<String>,
    /// Agent build version
    pub agent_version: Option<String>,
    /// Protocol version spoken by the agent
    pub protocol_version: String,
}

impl AgentInfo {
    /// Create info with only the machine name filled in
    pub fn new(machine_name: impl Into<String>) -> Self {
        Self {
            machine_name: machine_name.into(),
            friendly_name: None,
            os_version: None,
            user_name: None,
            agent_version: None,
            protocol_version: PROTOCOL_VERSION.to_string(),
        }
    }
}

/// A command addressed to one agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentCommand {
    /// Links this command to its eventual response
    pub correlation_id: CorrelationId,
    /// What to run
    pub command_type: CommandType,
    /// Free-form argument text (e.g. a shell command line)
    pub arguments: Option<String>,
    /// Named parameters (e.g. `path`, `pid`)
    pub parameters: HashMap<String, String>,
}

impl AgentCommand {
    /// Create a command with no arguments
    pub fn new(correlation_id: CorrelationId, command_type: CommandType) -> Self {
        Self {
            correlation_id,
            command_type,
            arguments: None,
            parameters: HashMap::new(),
        }
    }

    /// Set the argument text
    pub fn with_arguments(mut self, arguments: impl Into<String>) -> Self {
        self.arguments = Some(arguments.into());
        self
    }

    /// Add a named parameter
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Look up a parameter, ignoring blank values
    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    /// Argument text, ignoring blank values
    pub fn arguments(&self) -> Option<&str> {
        self.arguments.as_deref().filter(|v| !v.trim().is_empty())
    }
}

/// An agent's answer to one command
///
/// Exactly one payload field is populated, as dictated by `kind`. Use the
/// constructors rather than building the struct by hand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentResponse {
    /// Correlation ID copied from the command
    pub correlation_id: CorrelationId,
    /// Whether the command succeeded
    pub success: bool,
    /// How to render the payload
    pub kind: ResponseKind,
    /// Text output
    pub text: Option<String>,
    /// Failure description
    pub error_message: Option<String>,
    /// Binary payload for photos and documents
    pub data: Option<Bytes>,
    /// File name for binary payloads
    pub file_name: Option<String>,
    /// JSON document for structured responses
    pub json_payload: Option<String>,
}

impl AgentResponse {
    fn empty(correlation_id: CorrelationId, success: bool, kind: ResponseKind) -> Self {
        Self {
            correlation_id,
            success,
            kind,
            text: None,
            error_message: None,
            data: None,
            file_name: None,
            json_payload: None,
        }
    }

    /// Successful text response
    pub fn text(correlation_id: CorrelationId, text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::empty(correlation_id, true, ResponseKind::Text)
        }
    }

    /// Successful image response
    pub fn photo(
        correlation_id: CorrelationId,
        data: impl Into<Bytes>,
        file_name: impl Into<String>,
    ) -> Self {
        Self {
            data: Some(data.into()),
            file_name: Some(file_name.into()),
            ..Self::empty(correlation_id, true, ResponseKind::Photo)
        }
    }

    /// Successful file response
    pub fn document(
        correlation_id: CorrelationId,
        data: impl Into<Bytes>,
        file_name: impl Into<String>,
    ) -> Self {
        Self {
            data: Some(data.into()),
            file_name: Some(file_name.into()),
            ..Self::empty(correlation_id, true, ResponseKind::Document)
        }
    }

    /// Successful structured response
    pub fn structured(correlation_id: CorrelationId, json: impl Into<String>) -> Self {
        Self {
            json_payload: Some(json.into()),
            ..Self::empty(correlation_id, true, ResponseKind::StructuredJson)
        }
    }

    /// Failed command
    pub fn error(correlation_id: CorrelationId, message: impl Into<String>) -> Self {
        Self {
            error_message: Some(message.into()),
            ..Self::empty(correlation_id, false, ResponseKind::Error)
        }
    }
}
