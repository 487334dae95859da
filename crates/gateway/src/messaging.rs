// The send and delete pipelines shared by the socket and REST surfaces.

use carechat_common::{
    content::{validate_content, ContentError},
    protocol::ws::ServerEvent,
    types::{ChatMessage, ConversationId, MessageId, UserId},
};
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    metrics,
    registry::ConversationRegistry,
    store::{ChatStore, StoreError},
};

#[derive(Debug, Error)]
pub enum SendError {
    #[error(transparent)]
    Invalid(#[from] ContentError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum DeleteError {
    #[error("message {0} not found")]
    NotFound(MessageId),
    #[error("only the sender may delete message {0}")]
    NotSender(MessageId),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Where a send originated, used as a metrics label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendSource {
    Socket,
    Rest,
}

impl SendSource {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Socket => "ws",
            Self::Rest => "rest",
        }
    }
}

/// Validates, marks the counterpart's messages read, persists, then fans out.
///
/// Read marking and the append commit together. Nothing is broadcast unless
/// they did. Broadcast itself never fails the send.
pub async fn send_message(
    store: &ChatStore,
    registry: &ConversationRegistry,
    conversation_id: ConversationId,
    sender_id: UserId,
    raw_content: &str,
    source: SendSource,
) -> Result<ChatMessage, SendError> {
    let content = validate_content(raw_content)?;

    let message = store.mark_read_and_append(conversation_id, sender_id, content).await?;
    metrics::record_message_persisted(source.as_str());

    let report =
        registry.broadcast(conversation_id, ServerEvent::ChatMessage { message: message.clone() });
    metrics::record_broadcast(report.delivered, report.dropped);
    debug!(
        conversation_id,
        user_id = sender_id,
        message_id = message.id,
        delivered = report.delivered,
        dropped = report.dropped,
        "chat message broadcast"
    );

    Ok(message)
}

/// Deletes a message on behalf of its sender and tells every live session.
pub async fn delete_message(
    store: &ChatStore,
    registry: &ConversationRegistry,
    requester_id: UserId,
    message_id: MessageId,
) -> Result<ConversationId, DeleteError> {
    let message = store.message(message_id).await?.ok_or(DeleteError::NotFound(message_id))?;
    if message.sender.id != requester_id {
        return Err(DeleteError::NotSender(message_id));
    }

    let conversation_id = match store.delete(message_id).await {
        Ok(conversation_id) => conversation_id,
        Err(StoreError::MessageNotFound(_)) => return Err(DeleteError::NotFound(message_id)),
        Err(error) => return Err(error.into()),
    };
    metrics::record_message_deleted();

    let report = registry.broadcast(conversation_id, ServerEvent::DeleteMessage { message_id });
    metrics::record_broadcast(report.delivered, report.dropped);
    info!(
        conversation_id,
        user_id = requester_id,
        message_id,
        delivered = report.delivered,
        "chat message deleted"
    );

    Ok(conversation_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Outbound, SessionHandle};
    use crate::store::MemoryChatStore;
    use carechat_common::types::{Conversation, Role, UserSummary};

    struct Fixture {
        store: ChatStore,
        registry: ConversationRegistry,
        patient: UserSummary,
        doctor: UserSummary,
        conversation: Conversation,
    }

    fn fixture() -> Fixture {
        let mut memory = MemoryChatStore::default();
        let patient = memory.add_user("pat", "Pat", Role::Patient);
        let doctor = memory.add_user("doc", "Doc", Role::Doctor);
        let conversation = memory.add_conversation(patient.id, doctor.id);
        Fixture {
            store: ChatStore::memory(memory),
            registry: ConversationRegistry::default(),
            patient,
            doctor,
            conversation,
        }
    }

    #[tokio::test]
    async fn send_persists_and_broadcasts_to_sender_too() {
        let fx = fixture();
        let (handle, mut rx) = SessionHandle::new(fx.patient.id);
        fx.registry.join(fx.conversation.id, handle);

        let message = send_message(
            &fx.store,
            &fx.registry,
            fx.conversation.id,
            fx.patient.id,
            "hello",
            SendSource::Socket,
        )
        .await
        .expect("send should succeed");

        assert_eq!(message.content, "hello");
        match rx.try_recv().expect("sender should get its own message") {
            Outbound::Event(event) => {
                assert_eq!(*event, ServerEvent::ChatMessage { message: message.clone() })
            }
            Outbound::Close => panic!("unexpected close"),
        }
        let history = fx.store.history(fx.conversation.id).await.expect("history");
        assert_eq!(history, vec![message]);
    }

    #[tokio::test]
    async fn send_marks_counterpart_messages_read_first() {
        let fx = fixture();
        fx.store.append(fx.conversation.id, fx.doctor.id, "how are you?").await.expect("append");

        let reply = send_message(
            &fx.store,
            &fx.registry,
            fx.conversation.id,
            fx.patient.id,
            "fine",
            SendSource::Rest,
        )
        .await
        .expect("send should succeed");

        assert!(!reply.is_read);
        let history = fx.store.history(fx.conversation.id).await.expect("history");
        assert!(history[0].is_read);
        assert!(!history[1].is_read);
    }

    #[tokio::test]
    async fn invalid_content_is_neither_persisted_nor_broadcast() {
        let fx = fixture();
        let (handle, mut rx) = SessionHandle::new(fx.patient.id);
        fx.registry.join(fx.conversation.id, handle);

        let too_long = "x".repeat(4_001);
        for raw in ["", "   ", too_long.as_str()] {
            let error = send_message(
                &fx.store,
                &fx.registry,
                fx.conversation.id,
                fx.patient.id,
                raw,
                SendSource::Socket,
            )
            .await
            .expect_err("invalid content should be rejected");
            assert!(matches!(error, SendError::Invalid(_)));
        }

        assert!(rx.try_recv().is_err());
        assert!(fx.store.history(fx.conversation.id).await.expect("history").is_empty());
    }

    #[tokio::test]
    async fn store_failure_broadcasts_nothing() {
        let mut memory = MemoryChatStore::default();
        let patient = memory.add_user("pat", "Pat", Role::Patient);
        let doctor = memory.add_user("doc", "Doc", Role::Doctor);
        let conversation = memory.add_conversation(patient.id, doctor.id);
        memory.set_fail_writes(true);
        let store = ChatStore::memory(memory);
        let registry = ConversationRegistry::default();
        let (handle, mut rx) = SessionHandle::new(doctor.id);
        registry.join(conversation.id, handle);

        let error =
            send_message(&store, &registry, conversation.id, patient.id, "hi", SendSource::Socket)
                .await
                .expect_err("send should fail");

        assert!(matches!(error, SendError::Store(StoreError::Backend(_))));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn rejected_send_leaves_read_state_untouched() {
        let mut memory = MemoryChatStore::default();
        let patient = memory.add_user("pat", "Pat", Role::Patient);
        let doctor = memory.add_user("doc", "Doc", Role::Doctor);
        let stranger = memory.add_user("sam", "Sam", Role::Patient);
        let conversation = memory.add_conversation(patient.id, doctor.id);
        let store = ChatStore::memory(memory);
        let registry = ConversationRegistry::default();
        store.append(conversation.id, patient.id, "are you there?").await.expect("append");
        store.append(conversation.id, doctor.id, "yes").await.expect("append");

        let error =
            send_message(&store, &registry, conversation.id, stranger.id, "hi", SendSource::Rest)
                .await
                .expect_err("non-participant send should fail");

        assert!(matches!(error, SendError::Store(StoreError::NotParticipant { .. })));
        let history = store.history(conversation.id).await.expect("history");
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|message| !message.is_read));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_sends_from_both_sides_are_all_stored_in_order() {
        const PER_SIDE: usize = 25;
        let fx = fixture();

        let mut tasks = Vec::new();
        for n in 0..PER_SIDE {
            for sender_id in [fx.patient.id, fx.doctor.id] {
                let store = fx.store.clone();
                let registry = fx.registry.clone();
                let conversation_id = fx.conversation.id;
                tasks.push(tokio::spawn(async move {
                    send_message(
                        &store,
                        &registry,
                        conversation_id,
                        sender_id,
                        &format!("{sender_id}:{n}"),
                        SendSource::Socket,
                    )
                    .await
                    .expect("concurrent send should succeed")
                }));
            }
        }
        let mut sent = Vec::new();
        for task in tasks {
            sent.push(task.await.expect("send task should finish"));
        }

        let history = fx.store.history(fx.conversation.id).await.expect("history");
        assert_eq!(history.len(), 2 * PER_SIDE);
        for pair in history.windows(2) {
            assert!(
                (pair[0].timestamp, pair[0].id) < (pair[1].timestamp, pair[1].id),
                "history must be strictly ordered"
            );
            // Ids are assigned in completion order, so storage order matches it.
            assert!(pair[0].id < pair[1].id);
            assert!(pair[0].timestamp < pair[1].timestamp);
        }

        let mut stored_ids: Vec<_> = history.iter().map(|message| message.id).collect();
        let mut sent_ids: Vec<_> = sent.iter().map(|message| message.id).collect();
        stored_ids.sort_unstable();
        sent_ids.sort_unstable();
        assert_eq!(stored_ids, sent_ids);
    }

    #[tokio::test]
    async fn delete_requires_sender_and_broadcasts_once() {
        let fx = fixture();
        let message =
            fx.store.append(fx.conversation.id, fx.patient.id, "oops").await.expect("append");
        let (handle, mut rx) = SessionHandle::new(fx.doctor.id);
        fx.registry.join(fx.conversation.id, handle);

        let error = delete_message(&fx.store, &fx.registry, fx.doctor.id, message.id)
            .await
            .expect_err("non-sender delete should fail");
        assert!(matches!(error, DeleteError::NotSender(_)));
        assert!(rx.try_recv().is_err());

        let conversation_id = delete_message(&fx.store, &fx.registry, fx.patient.id, message.id)
            .await
            .expect("sender delete should succeed");
        assert_eq!(conversation_id, fx.conversation.id);
        match rx.try_recv().expect("peer should be told") {
            Outbound::Event(event) => {
                assert_eq!(*event, ServerEvent::DeleteMessage { message_id: message.id })
            }
            Outbound::Close => panic!("unexpected close"),
        }
        assert!(rx.try_recv().is_err());

        let error = delete_message(&fx.store, &fx.registry, fx.patient.id, message.id)
            .await
            .expect_err("second delete should fail");
        assert!(matches!(error, DeleteError::NotFound(_)));
    }
}
