// Chat persistence: users, appointments, conversations, and messages.
//
// Every operation dispatches to a Postgres implementation or to an
// in-memory one used by unit and end-to-end tests.

pub mod memory;
mod postgres;

use std::sync::Arc;

use carechat_common::types::{
    ChatMessage, Conversation, ConversationId, MessageId, Role, UserId, UserSummary,
};
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::RwLock;

pub use memory::MemoryChatStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("user {0} not found")]
    UserNotFound(UserId),
    #[error("conversation {0} not found")]
    ConversationNotFound(ConversationId),
    #[error("message {0} not found")]
    MessageNotFound(MessageId),
    #[error("user {user_id} is not a participant of conversation {conversation_id}")]
    NotParticipant { user_id: UserId, conversation_id: ConversationId },
    #[error("conversation requires a patient and a provider (got {patient_role} and {provider_role})")]
    InvalidPair { patient_role: &'static str, provider_role: &'static str },
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

#[derive(Clone)]
pub enum ChatStore {
    Postgres(PgPool),
    #[cfg_attr(not(test), allow(dead_code))]
    Memory(Arc<RwLock<MemoryChatStore>>),
}

impl ChatStore {
    pub fn memory(store: MemoryChatStore) -> Self {
        Self::Memory(Arc::new(RwLock::new(store)))
    }

    pub async fn user(&self, user_id: UserId) -> Result<Option<UserSummary>, StoreError> {
        match self {
            Self::Postgres(pool) => postgres::user_pg(pool, user_id).await,
            Self::Memory(store) => memory::user_memory(store, user_id).await,
        }
    }

    pub async fn conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Option<Conversation>, StoreError> {
        match self {
            Self::Postgres(pool) => postgres::conversation_pg(pool, conversation_id).await,
            Self::Memory(store) => memory::conversation_memory(store, conversation_id).await,
        }
    }

    /// Returns the single conversation for the pair, creating it on first use.
    ///
    /// Fails with [`StoreError::InvalidPair`] unless `patient_id` is a patient
    /// and `provider_id` is a doctor or counselor.
    pub async fn get_or_create_conversation(
        &self,
        patient_id: UserId,
        provider_id: UserId,
    ) -> Result<Conversation, StoreError> {
        match self {
            Self::Postgres(pool) => {
                postgres::get_or_create_conversation_pg(pool, patient_id, provider_id).await
            }
            Self::Memory(store) => {
                memory::get_or_create_conversation_memory(store, patient_id, provider_id).await
            }
        }
    }

    /// Counterparts the user shares at least one appointment with.
    pub async fn appointment_counterparts(
        &self,
        user_id: UserId,
        role: Role,
    ) -> Result<Vec<UserId>, StoreError> {
        match self {
            Self::Postgres(pool) => postgres::appointment_counterparts_pg(pool, user_id, role).await,
            Self::Memory(store) => {
                memory::appointment_counterparts_memory(store, user_id, role).await
            }
        }
    }

    /// Every conversation the user takes part in, oldest first.
    pub async fn conversations_for(
        &self,
        user_id: UserId,
    ) -> Result<Vec<Conversation>, StoreError> {
        match self {
            Self::Postgres(pool) => postgres::conversations_for_pg(pool, user_id).await,
            Self::Memory(store) => memory::conversations_for_memory(store, user_id).await,
        }
    }

    pub async fn last_message(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Option<ChatMessage>, StoreError> {
        match self {
            Self::Postgres(pool) => postgres::last_message_pg(pool, conversation_id).await,
            Self::Memory(store) => memory::last_message_memory(store, conversation_id).await,
        }
    }

    /// Unread messages in the conversation sent by someone other than `reader_id`.
    pub async fn unread_count(
        &self,
        conversation_id: ConversationId,
        reader_id: UserId,
    ) -> Result<i64, StoreError> {
        match self {
            Self::Postgres(pool) => postgres::unread_count_pg(pool, conversation_id, reader_id).await,
            Self::Memory(store) => {
                memory::unread_count_memory(store, conversation_id, reader_id).await
            }
        }
    }

    /// Persists a message atomically and returns it with its assigned id and timestamp.
    ///
    /// Timestamps are strictly increasing within a conversation.
    pub async fn append(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        content: &str,
    ) -> Result<ChatMessage, StoreError> {
        match self {
            Self::Postgres(pool) => {
                postgres::append_pg(pool, conversation_id, sender_id, content).await
            }
            Self::Memory(store) => {
                memory::append_memory(store, conversation_id, sender_id, content).await
            }
        }
    }

    /// Marks the counterpart's messages read and appends the sender's reply as
    /// one write: if the append fails, nothing was marked read either.
    pub async fn mark_read_and_append(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        content: &str,
    ) -> Result<ChatMessage, StoreError> {
        match self {
            Self::Postgres(pool) => {
                postgres::mark_read_and_append_pg(pool, conversation_id, sender_id, content).await
            }
            Self::Memory(store) => {
                memory::mark_read_and_append_memory(store, conversation_id, sender_id, content)
                    .await
            }
        }
    }

    /// Marks every message not sent by `reader_id` as read. Idempotent.
    pub async fn mark_read_except(
        &self,
        conversation_id: ConversationId,
        reader_id: UserId,
    ) -> Result<u64, StoreError> {
        match self {
            Self::Postgres(pool) => {
                postgres::mark_read_except_pg(pool, conversation_id, reader_id).await
            }
            Self::Memory(store) => {
                memory::mark_read_except_memory(store, conversation_id, reader_id).await
            }
        }
    }

    pub async fn message(&self, message_id: MessageId) -> Result<Option<ChatMessage>, StoreError> {
        match self {
            Self::Postgres(pool) => postgres::message_pg(pool, message_id).await,
            Self::Memory(store) => memory::message_memory(store, message_id).await,
        }
    }

    /// Deletes the message and returns the conversation it belonged to.
    pub async fn delete(&self, message_id: MessageId) -> Result<ConversationId, StoreError> {
        match self {
            Self::Postgres(pool) => postgres::delete_pg(pool, message_id).await,
            Self::Memory(store) => memory::delete_memory(store, message_id).await,
        }
    }

    /// All messages of the conversation ordered by (timestamp, id) ascending.
    pub async fn history(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        match self {
            Self::Postgres(pool) => postgres::history_pg(pool, conversation_id).await,
            Self::Memory(store) => memory::history_memory(store, conversation_id).await,
        }
    }
}

pub(crate) fn ensure_valid_pair(patient: &UserSummary, provider: &UserSummary) -> Result<(), StoreError> {
    if patient.role.is_patient() && provider.role.is_provider() {
        Ok(())
    } else {
        Err(StoreError::InvalidPair {
            patient_role: patient.role.as_str(),
            provider_role: provider.role.as_str(),
        })
    }
}
