// Per-conversation groups of live chat sessions.
//
// Each session owns an unbounded outbox; the registry only holds the
// sending half. Broadcast snapshots the group under its shard lock and
// sends after the lock is released, so a slow or dead peer never blocks
// joins, leaves, or other conversations.

use std::{collections::HashMap, sync::Arc, time::Duration};

use carechat_common::{
    protocol::ws::ServerEvent,
    types::{ConversationId, UserId},
};
use dashmap::{mapref::entry::Entry, DashMap};
use tokio::sync::{mpsc, Notify};
use tracing::debug;
use uuid::Uuid;

pub type SessionId = Uuid;

/// What a session actor pulls from its outbox.
#[derive(Debug, Clone)]
pub enum Outbound {
    Event(Arc<ServerEvent>),
    /// Server is shutting down; close with 1001.
    Close,
}

#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub session_id: SessionId,
    pub user_id: UserId,
    sender: mpsc::UnboundedSender<Outbound>,
}

impl SessionHandle {
    pub fn new(user_id: UserId) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { session_id: Uuid::new_v4(), user_id, sender }, receiver)
    }

    fn deliver(&self, outbound: Outbound) -> bool {
        self.sender.send(outbound).is_ok()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ConversationRegistry {
    groups: Arc<DashMap<ConversationId, HashMap<SessionId, SessionHandle>>>,
    /// Notified whenever a leave empties the whole registry.
    emptied: Arc<Notify>,
}

impl ConversationRegistry {
    pub fn join(&self, conversation_id: ConversationId, handle: SessionHandle) {
        debug!(
            conversation_id,
            session_id = %handle.session_id,
            user_id = handle.user_id,
            "session joined conversation group"
        );
        self.groups.entry(conversation_id).or_default().insert(handle.session_id, handle);
    }

    /// Removes the session and drops the group once it is empty.
    ///
    /// Returns false if the session was not registered.
    pub fn leave(&self, conversation_id: ConversationId, session_id: SessionId) -> bool {
        // The entry guard holds the shard lock; release it before `is_empty`.
        let removed = {
            let Entry::Occupied(mut group) = self.groups.entry(conversation_id) else {
                return false;
            };
            let removed = group.get_mut().remove(&session_id).is_some();
            if group.get().is_empty() {
                group.remove();
            }
            removed
        };

        if removed {
            debug!(conversation_id, session_id = %session_id, "session left conversation group");
            if self.groups.is_empty() {
                self.emptied.notify_waiters();
            }
        }
        removed
    }

    /// Delivers `event` to every session currently in the group.
    ///
    /// Sessions whose actor already exited are counted as dropped; they
    /// leave the group on their own.
    pub fn broadcast(&self, conversation_id: ConversationId, event: ServerEvent) -> BroadcastReport {
        let recipients: Vec<SessionHandle> = self
            .groups
            .get(&conversation_id)
            .map(|group| group.values().cloned().collect())
            .unwrap_or_default();

        let event = Arc::new(event);
        let mut report = BroadcastReport::default();
        for recipient in recipients {
            if recipient.deliver(Outbound::Event(Arc::clone(&event))) {
                report.delivered += 1;
            } else {
                report.dropped += 1;
                debug!(
                    conversation_id,
                    session_id = %recipient.session_id,
                    "dropping event for closed session"
                );
            }
        }

        report
    }

    pub fn group_size(&self, conversation_id: ConversationId) -> usize {
        self.groups.get(&conversation_id).map(|group| group.len()).unwrap_or(0)
    }

    pub fn session_count(&self) -> usize {
        self.groups.iter().map(|group| group.len()).sum()
    }

    /// Asks every registered session to close. Returns how many were signalled.
    pub fn close_all(&self) -> usize {
        let handles: Vec<SessionHandle> =
            self.groups.iter().flat_map(|group| group.values().cloned().collect::<Vec<_>>()).collect();

        handles.iter().filter(|handle| handle.deliver(Outbound::Close)).count()
    }

    /// Waits for every session to leave. Returns false if some are still
    /// registered after `timeout`.
    pub async fn wait_until_empty(&self, timeout: Duration) -> bool {
        let drained = async {
            loop {
                let notified = self.emptied.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.groups.is_empty() {
                    return;
                }
                notified.await;
            }
        };

        tokio::time::timeout(timeout, drained).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delete_event(message_id: i64) -> ServerEvent {
        ServerEvent::DeleteMessage { message_id }
    }

    #[tokio::test]
    async fn broadcast_reaches_every_session_in_group_only() {
        let registry = ConversationRegistry::default();
        let (a, mut a_rx) = SessionHandle::new(1);
        let (b, mut b_rx) = SessionHandle::new(2);
        let (other, mut other_rx) = SessionHandle::new(3);
        registry.join(10, a);
        registry.join(10, b);
        registry.join(11, other);

        let report = registry.broadcast(10, delete_event(5));
        assert_eq!(report, BroadcastReport { delivered: 2, dropped: 0 });

        for rx in [&mut a_rx, &mut b_rx] {
            match rx.try_recv().expect("member should receive event") {
                Outbound::Event(event) => assert_eq!(*event, delete_event(5)),
                Outbound::Close => panic!("unexpected close"),
            }
        }
        assert!(other_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_to_unknown_group_is_a_noop() {
        let registry = ConversationRegistry::default();
        assert_eq!(registry.broadcast(99, delete_event(1)), BroadcastReport::default());
    }

    #[tokio::test]
    async fn closed_outbox_does_not_stop_other_deliveries() {
        let registry = ConversationRegistry::default();
        let (gone, gone_rx) = SessionHandle::new(1);
        let (alive, mut alive_rx) = SessionHandle::new(2);
        registry.join(10, gone);
        registry.join(10, alive);
        drop(gone_rx);

        let report = registry.broadcast(10, delete_event(7));
        assert_eq!(report, BroadcastReport { delivered: 1, dropped: 1 });
        assert!(matches!(alive_rx.try_recv(), Ok(Outbound::Event(_))));
    }

    #[tokio::test]
    async fn leave_removes_session_and_empty_group() {
        let registry = ConversationRegistry::default();
        let (a, _a_rx) = SessionHandle::new(1);
        let (b, _b_rx) = SessionHandle::new(1);
        let (a_id, b_id) = (a.session_id, b.session_id);
        registry.join(10, a);
        registry.join(10, b);
        assert_eq!(registry.group_size(10), 2);

        assert!(registry.leave(10, a_id));
        assert!(!registry.leave(10, a_id));
        assert_eq!(registry.group_size(10), 1);

        assert!(registry.leave(10, b_id));
        assert_eq!(registry.group_size(10), 0);
        assert!(registry.groups.get(&10).is_none());
        assert!(!registry.leave(10, b_id));
    }

    #[tokio::test]
    async fn close_all_signals_every_session() {
        let registry = ConversationRegistry::default();
        let (a, mut a_rx) = SessionHandle::new(1);
        let (b, mut b_rx) = SessionHandle::new(2);
        registry.join(10, a);
        registry.join(11, b);
        assert_eq!(registry.session_count(), 2);

        assert_eq!(registry.close_all(), 2);
        assert!(matches!(a_rx.try_recv(), Ok(Outbound::Close)));
        assert!(matches!(b_rx.try_recv(), Ok(Outbound::Close)));
    }

    #[tokio::test]
    async fn wait_until_empty_resolves_once_closed_sessions_leave() {
        let registry = ConversationRegistry::default();
        assert!(registry.wait_until_empty(Duration::from_millis(10)).await);

        for (conversation_id, user_id) in [(10, 1), (11, 2)] {
            let (handle, mut rx) = SessionHandle::new(user_id);
            let session_id = handle.session_id;
            registry.join(conversation_id, handle);
            let registry = registry.clone();
            tokio::spawn(async move {
                while let Some(outbound) = rx.recv().await {
                    if matches!(outbound, Outbound::Close) {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        registry.leave(conversation_id, session_id);
                        break;
                    }
                }
            });
        }

        assert_eq!(registry.close_all(), 2);
        assert!(registry.wait_until_empty(Duration::from_secs(5)).await);
        assert_eq!(registry.session_count(), 0);
    }

    #[tokio::test]
    async fn wait_until_empty_times_out_while_a_session_lingers() {
        let registry = ConversationRegistry::default();
        let (handle, _rx) = SessionHandle::new(1);
        registry.join(10, handle);

        registry.close_all();
        assert!(!registry.wait_until_empty(Duration::from_millis(50)).await);
        assert_eq!(registry.session_count(), 1);
    }

    #[tokio::test]
    async fn concurrent_joins_and_leaves_settle_to_empty() {
        let registry = ConversationRegistry::default();
        let mut tasks = Vec::new();
        for user_id in 0..32 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let (handle, _rx) = SessionHandle::new(user_id);
                let session_id = handle.session_id;
                registry.join(1, handle);
                tokio::task::yield_now().await;
                registry.broadcast(1, ServerEvent::DeleteMessage { message_id: user_id });
                assert!(registry.leave(1, session_id));
            }));
        }
        for task in tasks {
            task.await.expect("task should finish");
        }

        assert_eq!(registry.group_size(1), 0);
        assert_eq!(registry.session_count(), 0);
    }
}
