//! Newline-delimited JSON wire types.
//!
//! Requests are `{"action": ..., "payload": {...}}`, replies are either
//! `{"result": ...}` or `{"error": ..., "kind": ..., "retryable": ...}`.
//! Host lifecycle signals travel on the same socket as `{"event": ...}`
//! lines.

use serde::{Deserialize, Serialize};

use crate::error::SpaceError;
use crate::model::{ClosedSpace, HostWindow, PermanentId, Space, WindowId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "payload", rename_all = "camelCase")]
pub enum Request {
    GetAllSpaces,
    #[serde(rename_all = "camelCase")]
    GetSpace { space_id: PermanentId },
    #[serde(rename_all = "camelCase")]
    RenameSpace {
        window_id: WindowId,
        name: String,
        #[serde(default)]
        expected_version: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    CloseSpace {
        window_id: WindowId,
        #[serde(default)]
        expected_version: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    RestoreSpace {
        space_id: PermanentId,
        #[serde(default)]
        expected_version: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    RemoveClosedSpace {
        space_id: PermanentId,
        #[serde(default)]
        expected_version: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    SwitchToSpace { window_id: WindowId },
    GetStatus,
    Subscribe,
    /// Turns the connection into the host's command channel.
    AttachHost,
}

impl Request {
    pub fn action(&self) -> &'static str {
        match self {
            Request::GetAllSpaces => "getAllSpaces",
            Request::GetSpace { .. } => "getSpace",
            Request::RenameSpace { .. } => "renameSpace",
            Request::CloseSpace { .. } => "closeSpace",
            Request::RestoreSpace { .. } => "restoreSpace",
            Request::RemoveClosedSpace { .. } => "removeClosedSpace",
            Request::SwitchToSpace { .. } => "switchToSpace",
            Request::GetStatus => "getStatus",
            Request::Subscribe => "subscribe",
            Request::AttachHost => "attachHost",
        }
    }
}

/// Host window/tab signals. They trigger reconciliation or tab refreshes
/// and are never taken as the truth about window state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum HostEvent {
    #[serde(rename_all = "camelCase")]
    WindowCreated {
        window_id: WindowId,
        #[serde(default)]
        tab_urls: Vec<String>,
        /// Set when the window was opened for an `openWindow` command.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    WindowRemoved { window_id: WindowId },
    #[serde(rename_all = "camelCase")]
    WindowFocusChanged { window_id: WindowId },
    #[serde(rename_all = "camelCase")]
    TabCreated {
        window_id: WindowId,
        tab_urls: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    TabUpdated {
        window_id: WindowId,
        tab_urls: Vec<String>,
    },
    /// The host (re)started; carries its full window table when known.
    #[serde(rename_all = "camelCase")]
    Startup {
        #[serde(default)]
        windows: Vec<HostWindow>,
    },
    Suspend,
}

/// Work the engine asks the attached host to carry out. The host confirms
/// with the matching window events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum HostCommand {
    /// Answered by `windowCreated` carrying the same `requestId`.
    #[serde(rename_all = "camelCase")]
    OpenWindow {
        request_id: u64,
        tab_urls: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    FocusWindow { window_id: WindowId },
    #[serde(rename_all = "camelCase")]
    CloseWindow { window_id: WindowId },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostCommandType {
    #[default]
    #[serde(rename = "host-command")]
    HostCommand,
}

/// A command as written to the host's connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostCommandMessage {
    #[serde(rename = "type")]
    pub kind: HostCommandType,
    #[serde(flatten)]
    pub command: HostCommand,
}

impl From<HostCommand> for HostCommandMessage {
    fn from(command: HostCommand) -> Self {
        Self {
            kind: HostCommandType::HostCommand,
            command,
        }
    }
}

/// One line received on the socket.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Inbound {
    Request(Request),
    Event(HostEvent),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Response {
    Ok {
        result: serde_json::Value,
    },
    Err {
        error: String,
        kind: String,
        retryable: bool,
    },
}

impl Response {
    pub fn success(result: serde_json::Value) -> Self {
        Response::Ok { result }
    }

    pub fn failure(error: &SpaceError) -> Self {
        Response::Err {
            error: error.to_string(),
            kind: error.kind().to_string(),
            retryable: error.is_retryable(),
        }
    }

    /// A line that could not be parsed as any request.
    pub fn invalid(message: impl Into<String>) -> Self {
        Response::Err {
            error: message.into(),
            kind: "validation".to_string(),
            retryable: false,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Response::Ok { .. })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BroadcastType {
    #[default]
    #[serde(rename = "spaces-updated")]
    SpacesUpdated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BroadcastAction {
    Created,
    Closed,
    Renamed,
    Initialized,
    Restored,
    Removed,
    Updated,
}

/// Fire-and-forget change notification sent to every subscribed surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastMessage {
    #[serde(rename = "type")]
    pub kind: BroadcastType,
    pub action: BroadcastAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_id: Option<WindowId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub space_id: Option<PermanentId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

impl BroadcastMessage {
    pub fn new(action: BroadcastAction) -> Self {
        Self {
            kind: BroadcastType::SpacesUpdated,
            action,
            window_id: None,
            space_id: None,
            version: None,
        }
    }

    pub fn initialized() -> Self {
        Self::new(BroadcastAction::Initialized)
    }
}

/// Reply to `getAllSpaces`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllSpaces {
    pub spaces: Vec<Space>,
    pub closed_spaces: Vec<ClosedSpace>,
}

/// Reply to `getStatus`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub initialized: bool,
    pub active_spaces: usize,
    pub closed_spaces: usize,
    pub commit_seq: u64,
    pub persisted_seq: u64,
    pub pending_mutations: usize,
    pub pending_broadcasts: usize,
    pub subscribers: usize,
    pub consecutive_flush_failures: u32,
    pub degraded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_flush_error: Option<String>,
}
