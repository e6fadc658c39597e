//! Frames exchanged over a project channel.
//!
//! Every frame is `{"event": "<name>", "data": {...}}`. Clients subscribe to
//! all events for the project they joined.

use serde::{Deserialize, Serialize};

use crate::directive::CommandSpec;
use crate::tree::FileTree;

/// Participant id used for messages authored by the AI persona.
pub const AI_SENDER_ID: &str = "ai";

/// Who sent a message, as rendered by clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderInfo {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl SenderInfo {
    pub fn ai() -> Self {
        Self {
            id: AI_SENDER_ID.to_string(),
            email: Some("AI".to_string()),
        }
    }

    pub fn is_ai(&self) -> bool {
        self.id == AI_SENDER_ID
    }
}

/// A chat message as delivered to every channel member.
///
/// For AI senders `message` is a serialised [`crate::Directive`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectMessage {
    /// ULID message id.
    pub id: String,
    /// Per-channel sequence number, strictly increasing in delivery order.
    pub seq: u64,
    pub sender: SenderInfo,
    pub message: String,
    /// Unix milliseconds when the bus accepted the message.
    pub timestamp: i64,
}

/// Sandbox lifecycle notifications republished to the channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SandboxStatus {
    StateChanged { state: String },
    PreviewReady { port: u16, url: String },
    BuildFailed { code: Option<i32> },
    ProcessExited { code: Option<i32> },
    RunFailed { error: String },
}

/// Server → client frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
#[serde(rename_all_fields = "camelCase")]
pub enum ServerEvent {
    ProjectMessage(ProjectMessage),
    /// An AI turn failed; the conversation continues.
    AiError { reply_to: String, error: String },
    /// A collaborator replaced the project's file tree.
    FileTree {
        file_tree: FileTree,
        updated_by: SenderInfo,
    },
    SandboxStatus(SandboxStatus),
    /// Request-level failure reported to the originating connection only.
    Error { message: String },
}

/// Client → server frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
#[serde(rename_all_fields = "camelCase")]
pub enum ClientEvent {
    ProjectMessage {
        message: String,
    },
    Run {
        #[serde(default)]
        build_command: Option<CommandSpec>,
        #[serde(default)]
        start_command: Option<CommandSpec>,
    },
    UpdateFileTree {
        file_tree: FileTree,
    },
}

impl ServerEvent {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
