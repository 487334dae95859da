// WebSocket frames for the chat channel at /ws/chat/{conversation_id}/.

use serde::{Deserialize, Serialize};

use crate::types::{ChatMessage, MessageId};

/// Server -> Client events pushed to every session of a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// A message was persisted. The sender receives it too.
    ChatMessage { message: ChatMessage },

    /// A message was removed by its sender.
    DeleteMessage { message_id: MessageId },
}

/// Client -> Server: post a chat line.
///
/// Unknown fields (including a `type` discriminator) are ignored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientFrame {
    #[serde(default)]
    pub message: Option<String>,
}

pub fn decode_client_frame(raw: &str) -> Result<ClientFrame, serde_json::Error> {
    serde_json::from_str::<ClientFrame>(raw)
}

pub fn encode_server_event(event: &ServerEvent) -> Result<String, serde_json::Error> {
    serde_json::to_string(event)
}
