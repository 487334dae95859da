use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::anyhow;
use carechat_common::types::{
    ChatMessage, Conversation, ConversationId, MessageId, Role, UserId, UserSummary,
};
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;

use super::{ensure_valid_pair, StoreError};

#[derive(Default)]
pub struct MemoryChatStore {
    users: HashMap<UserId, UserSummary>,
    appointments: Vec<(UserId, UserId)>,
    conversations: BTreeMap<ConversationId, Conversation>,
    messages: BTreeMap<MessageId, MemoryMessage>,
    last_ids: LastIds,
    fail_writes: bool,
}

#[derive(Default)]
struct LastIds {
    user: i64,
    conversation: i64,
    message: i64,
}

#[derive(Clone)]
struct MemoryMessage {
    id: MessageId,
    conversation_id: ConversationId,
    sender_id: UserId,
    content: String,
    created_at: DateTime<Utc>,
    is_read: bool,
}

impl MemoryChatStore {
    pub fn add_user(&mut self, username: &str, display_name: &str, role: Role) -> UserSummary {
        self.last_ids.user += 1;
        let user = UserSummary {
            id: self.last_ids.user,
            username: username.to_owned(),
            display_name: display_name.to_owned(),
            role,
        };
        self.users.insert(user.id, user.clone());
        user
    }

    pub fn add_appointment(&mut self, patient_id: UserId, provider_id: UserId) {
        self.appointments.push((patient_id, provider_id));
    }

    /// Drops every appointment between the pair. Conversations stay.
    pub fn remove_appointments(&mut self, patient_id: UserId, provider_id: UserId) {
        self.appointments.retain(|&pair| pair != (patient_id, provider_id));
    }

    /// Inserts a conversation without role checks.
    pub fn add_conversation(&mut self, patient_id: UserId, provider_id: UserId) -> Conversation {
        self.last_ids.conversation += 1;
        let conversation = Conversation {
            id: self.last_ids.conversation,
            patient_id,
            provider_id,
            created_at: Utc::now(),
        };
        self.conversations.insert(conversation.id, conversation.clone());
        conversation
    }

    /// Makes every subsequent write fail with a backend error.
    pub fn set_fail_writes(&mut self, fail_writes: bool) {
        self.fail_writes = fail_writes;
    }

    fn ensure_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes {
            return Err(StoreError::Backend(anyhow!("memory store rejected write")));
        }
        Ok(())
    }

    fn to_chat_message(&self, message: &MemoryMessage) -> Result<ChatMessage, StoreError> {
        let sender = self
            .users
            .get(&message.sender_id)
            .cloned()
            .ok_or(StoreError::UserNotFound(message.sender_id))?;

        Ok(ChatMessage {
            id: message.id,
            conversation: message.conversation_id,
            sender,
            content: message.content.clone(),
            timestamp: message.created_at,
            is_read: message.is_read,
        })
    }

    fn mark_read(&mut self, conversation_id: ConversationId, reader_id: UserId) -> u64 {
        let mut updated = 0;
        for message in self.messages.values_mut() {
            if message.conversation_id == conversation_id
                && message.sender_id != reader_id
                && !message.is_read
            {
                message.is_read = true;
                updated += 1;
            }
        }
        updated
    }

    fn conversation_messages(
        &self,
        conversation_id: ConversationId,
    ) -> impl Iterator<Item = &MemoryMessage> {
        self.messages.values().filter(move |message| message.conversation_id == conversation_id)
    }
}

pub(super) async fn user_memory(
    store: &Arc<RwLock<MemoryChatStore>>,
    user_id: UserId,
) -> Result<Option<UserSummary>, StoreError> {
    Ok(store.read().await.users.get(&user_id).cloned())
}

pub(super) async fn conversation_memory(
    store: &Arc<RwLock<MemoryChatStore>>,
    conversation_id: ConversationId,
) -> Result<Option<Conversation>, StoreError> {
    Ok(store.read().await.conversations.get(&conversation_id).cloned())
}

pub(super) async fn get_or_create_conversation_memory(
    store: &Arc<RwLock<MemoryChatStore>>,
    patient_id: UserId,
    provider_id: UserId,
) -> Result<Conversation, StoreError> {
    let mut state = store.write().await;

    let patient =
        state.users.get(&patient_id).cloned().ok_or(StoreError::UserNotFound(patient_id))?;
    let provider =
        state.users.get(&provider_id).cloned().ok_or(StoreError::UserNotFound(provider_id))?;
    ensure_valid_pair(&patient, &provider)?;

    if let Some(existing) = state.conversations.values().find(|conversation| {
        conversation.patient_id == patient_id && conversation.provider_id == provider_id
    }) {
        return Ok(existing.clone());
    }

    state.ensure_writable()?;
    Ok(state.add_conversation(patient_id, provider_id))
}

pub(super) async fn appointment_counterparts_memory(
    store: &Arc<RwLock<MemoryChatStore>>,
    user_id: UserId,
    role: Role,
) -> Result<Vec<UserId>, StoreError> {
    let state = store.read().await;

    let mut ids: Vec<UserId> = state
        .appointments
        .iter()
        .filter_map(|&(patient_id, provider_id)| match role {
            Role::Patient if patient_id == user_id => Some(provider_id),
            Role::Doctor | Role::Counselor if provider_id == user_id => Some(patient_id),
            _ => None,
        })
        .collect();
    ids.sort_unstable();
    ids.dedup();

    Ok(ids)
}

pub(super) async fn conversations_for_memory(
    store: &Arc<RwLock<MemoryChatStore>>,
    user_id: UserId,
) -> Result<Vec<Conversation>, StoreError> {
    let state = store.read().await;
    Ok(state
        .conversations
        .values()
        .filter(|conversation| conversation.has_participant(user_id))
        .cloned()
        .collect())
}

pub(super) async fn last_message_memory(
    store: &Arc<RwLock<MemoryChatStore>>,
    conversation_id: ConversationId,
) -> Result<Option<ChatMessage>, StoreError> {
    let state = store.read().await;
    state
        .conversation_messages(conversation_id)
        .max_by_key(|message| (message.created_at, message.id))
        .map(|message| state.to_chat_message(message))
        .transpose()
}

pub(super) async fn unread_count_memory(
    store: &Arc<RwLock<MemoryChatStore>>,
    conversation_id: ConversationId,
    reader_id: UserId,
) -> Result<i64, StoreError> {
    let state = store.read().await;
    let count = state
        .conversation_messages(conversation_id)
        .filter(|message| message.sender_id != reader_id && !message.is_read)
        .count();

    Ok(count as i64)
}

pub(super) async fn append_memory(
    store: &Arc<RwLock<MemoryChatStore>>,
    conversation_id: ConversationId,
    sender_id: UserId,
    content: &str,
) -> Result<ChatMessage, StoreError> {
    append_locked(&mut *store.write().await, conversation_id, sender_id, content, false)
}

pub(super) async fn mark_read_and_append_memory(
    store: &Arc<RwLock<MemoryChatStore>>,
    conversation_id: ConversationId,
    sender_id: UserId,
    content: &str,
) -> Result<ChatMessage, StoreError> {
    append_locked(&mut *store.write().await, conversation_id, sender_id, content, true)
}

/// Every check runs before the first mutation, so a failure changes nothing.
fn append_locked(
    state: &mut MemoryChatStore,
    conversation_id: ConversationId,
    sender_id: UserId,
    content: &str,
    mark_read: bool,
) -> Result<ChatMessage, StoreError> {
    state.ensure_writable()?;

    let conversation = state
        .conversations
        .get(&conversation_id)
        .ok_or(StoreError::ConversationNotFound(conversation_id))?;
    if !conversation.has_participant(sender_id) {
        return Err(StoreError::NotParticipant { user_id: sender_id, conversation_id });
    }

    let now = Utc::now();
    let created_at = match state.conversation_messages(conversation_id).map(|m| m.created_at).max()
    {
        Some(previous) if previous >= now => previous + Duration::microseconds(1),
        _ => now,
    };

    let message = MemoryMessage {
        id: state.last_ids.message + 1,
        conversation_id,
        sender_id,
        content: content.to_owned(),
        created_at,
        is_read: false,
    };
    let chat_message = state.to_chat_message(&message)?;

    if mark_read {
        state.mark_read(conversation_id, sender_id);
    }
    state.last_ids.message = message.id;
    state.messages.insert(message.id, message);

    Ok(chat_message)
}

pub(super) async fn mark_read_except_memory(
    store: &Arc<RwLock<MemoryChatStore>>,
    conversation_id: ConversationId,
    reader_id: UserId,
) -> Result<u64, StoreError> {
    let mut state = store.write().await;
    state.ensure_writable()?;
    Ok(state.mark_read(conversation_id, reader_id))
}

pub(super) async fn message_memory(
    store: &Arc<RwLock<MemoryChatStore>>,
    message_id: MessageId,
) -> Result<Option<ChatMessage>, StoreError> {
    let state = store.read().await;
    state.messages.get(&message_id).map(|message| state.to_chat_message(message)).transpose()
}

pub(super) async fn delete_memory(
    store: &Arc<RwLock<MemoryChatStore>>,
    message_id: MessageId,
) -> Result<ConversationId, StoreError> {
    let mut state = store.write().await;
    state.ensure_writable()?;

    state
        .messages
        .remove(&message_id)
        .map(|message| message.conversation_id)
        .ok_or(StoreError::MessageNotFound(message_id))
}

pub(super) async fn history_memory(
    store: &Arc<RwLock<MemoryChatStore>>,
    conversation_id: ConversationId,
) -> Result<Vec<ChatMessage>, StoreError> {
    let state = store.read().await;
    let mut messages: Vec<&MemoryMessage> = state.conversation_messages(conversation_id).collect();
    messages.sort_by_key(|message| (message.created_at, message.id));

    messages.into_iter().map(|message| state.to_chat_message(message)).collect()
}
