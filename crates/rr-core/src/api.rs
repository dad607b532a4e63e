//! Caller-facing API between the front end and the broker
//!
//! Uses newline-delimited JSON messages over TCP on localhost (127.0.0.1).
//! Each request line gets exactly one response line. Requests on one
//! connection are served concurrently, so responses may arrive out of order;
//! a request's `id` is echoed on its response.

use std::collections::HashMap;

use rr_protocol::{AgentResponse, CommandType, ResponseKind};
use serde::{Deserialize, Serialize};

use crate::types::{AgentId, UserId};

/// Default API port
pub const DEFAULT_API_PORT: u16 = 22241;

/// Request from the front end to the broker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApiRequest {
    /// Present the shared API key
    Authenticate { api_key: String },

    /// Run a command on the user's selected device
    ExecuteCommand {
        user_id: UserId,
        command_type: CommandType,
        #[serde(default)]
        arguments: Option<String>,
        #[serde(default)]
        parameters: HashMap<String, String>,
    },

    /// List the devices a user owns
    ListDevices { user_id: UserId },

    /// Choose the device future commands go to
    SelectDevice { user_id: UserId, agent_id: AgentId },

    /// Get the currently selected device, if any
    GetSelectedDevice { user_id: UserId },

    /// Create a one-time pairing code for a new device
    GeneratePairingCode { user_id: UserId },

    /// Change a device's display name
    RenameDevice {
        user_id: UserId,
        agent_id: AgentId,
        friendly_name: Option<String>,
    },

    /// Get broker status
    GetStatus,

    /// Ping (for keepalive)
    Ping,
}

/// A request line: the request plus the caller's correlation id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiRequestFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(flatten)]
    pub request: ApiRequest,
}

impl ApiRequestFrame {
    pub fn new(id: u64, request: ApiRequest) -> Self {
        Self {
            id: Some(id),
            request,
        }
    }
}

/// A response line, carrying the `id` of the request it answers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponseFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(flatten)]
    pub response: ApiResponse,
}

/// Response from the broker to the front end
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApiResponse {
    /// Outcome of `ExecuteCommand`
    CommandResult(CommandResult),

    /// Devices owned by the user
    Devices { devices: Vec<DeviceInfo> },

    /// Selected device (absent when nothing is selected)
    SelectedDevice { device: Option<DeviceInfo> },

    /// Outcome of `SelectDevice`
    Selection { outcome: SelectionOutcome },

    /// Freshly generated pairing code
    PairingCode(PairingCodeInfo),

    /// Broker status
    Status(BrokerStatus),

    /// Generic success
    Ok,

    /// Error response
    Error { message: String },

    /// Pong response
    Pong,
}

/// Why a dispatched command produced no agent answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchFailure {
    /// The user has not selected a device
    NoDeviceSelected,
    /// The selected device does not exist or belongs to someone else
    DeviceNotFound,
    /// The selected device is not connected
    DeviceOffline,
    /// The agent did not answer in time
    Timeout,
    /// The agent's connection failed while the command was in flight
    TransportFailure,
    /// The broker is shutting down
    Cancelled,
}

/// Result of `ExecuteCommand`
///
/// Agent-reported failures have `success = false` and no `failure`; a
/// `failure` means the agent never answered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub success: bool,
    pub response_kind: ResponseKind,
    pub text: Option<String>,
    pub error_message: Option<String>,
    pub binary_payload: Option<Vec<u8>>,
    pub file_name: Option<String>,
    pub structured_payload: Option<String>,
    pub failure: Option<DispatchFailure>,
}

impl CommandResult {
    /// A result for a command that never reached (or never came back from) an agent
    pub fn failed(failure: DispatchFailure, message: impl Into<String>) -> Self {
        Self {
            success: false,
            response_kind: ResponseKind::Error,
            text: None,
            error_message: Some(message.into()),
            binary_payload: None,
            file_name: None,
            structured_payload: None,
            failure: Some(failure),
        }
    }
}

impl From<AgentResponse> for CommandResult {
    fn from(response: AgentResponse) -> Self {
        Self {
            success: response.success,
            response_kind: response.kind,
            text: response.text,
            error_message: response.error_message,
            binary_payload: response.data.map(|b| b.to_vec()),
            file_name: response.file_name,
            structured_payload: response.json_payload,
            failure: None,
        }
    }
}

/// Device as shown to its owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub agent_id: AgentId,
    pub machine_name: String,
    pub friendly_name: Option<String>,
    pub is_online: bool,
    /// Unix milliseconds of the last heartbeat seen by this broker
    pub last_seen: Option<u64>,
    pub os_version: Option<String>,
    pub user_name: Option<String>,
    pub is_selected: bool,
}

/// Outcome of `SelectDevice`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionOutcome {
    Selected,
    NotFound,
    Forbidden,
}

/// Pairing code handed to the operator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingCodeInfo {
    pub code: String,
    /// Unix seconds
    pub expires_at: i64,
}

/// Broker status information
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerStatus {
    pub running: bool,
    pub uptime_secs: u64,
    pub connected_agents: usize,
    pub pending_requests: usize,
    pub version: String,
    pub bind_address: String,
}
