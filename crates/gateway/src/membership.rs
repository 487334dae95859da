// Conversation membership checks backed by the chat store.

use carechat_common::types::{Conversation, ConversationId, UserId};

use crate::store::{ChatStore, StoreError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Membership {
    Participant(Conversation),
    NotParticipant,
    UnknownConversation,
}

#[derive(Clone)]
pub struct MembershipAuthority {
    store: ChatStore,
}

impl MembershipAuthority {
    pub fn new(store: ChatStore) -> Self {
        Self { store }
    }

    pub async fn check(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
    ) -> Result<Membership, StoreError> {
        let membership = match self.store.conversation(conversation_id).await? {
            Some(conversation) if conversation.has_participant(user_id) => {
                Membership::Participant(conversation)
            }
            Some(_) => Membership::NotParticipant,
            None => Membership::UnknownConversation,
        };

        Ok(membership)
    }

    /// True only if the conversation exists and `user_id` is its patient or provider.
    pub async fn is_participant(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
    ) -> Result<bool, StoreError> {
        Ok(matches!(self.check(user_id, conversation_id).await?, Membership::Participant(_)))
    }
}
