// Core domain types shared between the gateway and its clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type UserId = i64;
pub type ConversationId = i64;
pub type MessageId = i64;

/// Platform role as stored on the user record.
///
/// `user` is the patient role; doctors and counselors are both providers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[serde(rename = "user")]
    Patient,
    Doctor,
    Counselor,
    Admin,
}

impl Role {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Patient => "user",
            Self::Doctor => "doctor",
            Self::Counselor => "counselor",
            Self::Admin => "admin",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "user" | "patient" => Some(Self::Patient),
            "doctor" => Some(Self::Doctor),
            "counselor" => Some(Self::Counselor),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }

    pub const fn is_patient(self) -> bool {
        matches!(self, Self::Patient)
    }

    pub const fn is_provider(self) -> bool {
        matches!(self, Self::Doctor | Self::Counselor)
    }
}

/// Public view of a user, embedded in messages and contact entries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserSummary {
    pub id: UserId,
    pub username: String,
    pub display_name: String,
    pub role: Role,
}

/// A patient/provider pair. At most one exists per pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conversation {
    pub id: ConversationId,
    pub patient_id: UserId,
    pub provider_id: UserId,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    pub fn has_participant(&self, user_id: UserId) -> bool {
        self.patient_id == user_id || self.provider_id == user_id
    }

    /// The participant on the other side of `user_id`, if `user_id` takes part.
    pub fn counterpart_of(&self, user_id: UserId) -> Option<UserId> {
        if self.patient_id == user_id {
            Some(self.provider_id)
        } else if self.provider_id == user_id {
            Some(self.patient_id)
        } else {
            None
        }
    }
}

/// A persisted chat line as delivered to clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: MessageId,
    pub conversation: ConversationId,
    pub sender: UserSummary,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub is_read: bool,
}

/// One entry of a caller's contact list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationSummary {
    pub id: ConversationId,
    pub other_user: UserSummary,
    pub last_message: Option<ChatMessage>,
    pub unread_count: i64,
}
