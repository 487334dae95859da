// Per-connection chat session actor.
//
// One task per socket multiplexes the heartbeat, the session's outbox,
// and inbound frames. It is the only writer to its socket. Every write is
// bounded by the heartbeat timeout, so a peer that stops reading is closed
// like one that stops answering pings. Whatever ends the loop, the session
// leaves its conversation group exactly once.

use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use carechat_common::{
    protocol::ws::{decode_client_frame, encode_server_event, ServerEvent},
    types::ConversationId,
};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::{
    auth::identity::Identity,
    messaging::{send_message, SendError, SendSource},
    metrics,
    registry::{ConversationRegistry, Outbound, SessionHandle},
    store::ChatStore,
};

pub(crate) const HEARTBEAT_INTERVAL_MS: u64 = 15_000;
pub(crate) const HEARTBEAT_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    /// How long to wait for a pong after a ping before closing.
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(HEARTBEAT_INTERVAL_MS),
            timeout: Duration::from_millis(HEARTBEAT_TIMEOUT_MS),
        }
    }
}

/// Connecting -> Authenticated -> Joined -> Active -> Closed.
///
/// Any phase may move to Closed; nothing leaves Closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Connecting,
    Authenticated,
    Joined,
    Active,
    Closed,
}

impl SessionPhase {
    pub const fn can_advance_to(self, next: SessionPhase) -> bool {
        matches!(
            (self, next),
            (Self::Connecting, Self::Authenticated)
                | (Self::Authenticated, Self::Joined)
                | (Self::Joined, Self::Active)
                | (Self::Connecting | Self::Authenticated | Self::Joined | Self::Active, Self::Closed)
        )
    }
}

#[derive(Debug)]
pub(crate) struct SessionLifecycle {
    phase: SessionPhase,
}

impl SessionLifecycle {
    pub(crate) fn new() -> Self {
        Self { phase: SessionPhase::Connecting }
    }

    pub(crate) fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub(crate) fn advance(&mut self, next: SessionPhase) -> bool {
        if !self.phase.can_advance_to(next) {
            debug!(from = ?self.phase, to = ?next, "ignoring invalid session transition");
            return false;
        }
        self.phase = next;
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    ClientClosed,
    TransportError,
    HeartbeatTimeout,
    SendFailed,
    ServerShutdown,
}

impl CloseReason {
    const fn as_str(self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::TransportError => "transport_error",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::SendFailed => "send_failed",
            Self::ServerShutdown => "server_shutdown",
        }
    }
}

pub(crate) struct SessionContext {
    pub(crate) store: ChatStore,
    pub(crate) registry: ConversationRegistry,
    pub(crate) identity: Identity,
    pub(crate) conversation_id: ConversationId,
    pub(crate) heartbeat: HeartbeatConfig,
}

pub(crate) async fn run_session(
    context: SessionContext,
    mut lifecycle: SessionLifecycle,
    mut socket: WebSocket,
) {
    let SessionContext { store, registry, identity, conversation_id, heartbeat } = context;
    let user_id = identity.user_id;

    let (handle, mut outbound) = SessionHandle::new(user_id);
    let session_id = handle.session_id;
    registry.join(conversation_id, handle);
    lifecycle.advance(SessionPhase::Joined);
    metrics::session_opened();
    info!(conversation_id, user_id, session_id = %session_id, "chat session joined");

    lifecycle.advance(SessionPhase::Active);

    let mut heartbeat_interval = tokio::time::interval(heartbeat.interval);
    heartbeat_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    heartbeat_interval.reset(); // skip immediate first tick
    let mut pong_deadline: Option<Instant> = None;

    let reason = loop {
        let pong_timeout = async move {
            match pong_deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = pong_timeout => {
                warn!(conversation_id, user_id, session_id = %session_id, "heartbeat timeout, disconnecting");
                break CloseReason::HeartbeatTimeout;
            }
            _ = heartbeat_interval.tick() => {
                if pong_deadline.is_none() {
                    pong_deadline = Some(Instant::now() + heartbeat.timeout);
                }
                if send_within(&mut socket, Message::Ping(vec![].into()), heartbeat.timeout)
                    .await
                    .is_err()
                {
                    break CloseReason::SendFailed;
                }
            }
            maybe_outbound = outbound.recv() => {
                match maybe_outbound {
                    Some(Outbound::Event(event)) => {
                        if send_event(&mut socket, &event, heartbeat.timeout).await.is_err() {
                            warn!(
                                conversation_id,
                                user_id,
                                session_id = %session_id,
                                "outbound write failed or stalled, disconnecting"
                            );
                            break CloseReason::SendFailed;
                        }
                    }
                    Some(Outbound::Close) | None => {
                        let going_away = Message::Close(Some(CloseFrame {
                            code: close_code::AWAY,
                            reason: "server shutting down".into(),
                        }));
                        let _ = send_within(&mut socket, going_away, heartbeat.timeout).await;
                        break CloseReason::ServerShutdown;
                    }
                }
            }
            maybe_message = socket.recv() => {
                let Some(message) = maybe_message else {
                    break CloseReason::ClientClosed;
                };

                match message {
                    Ok(Message::Text(raw_message)) => {
                        if lifecycle.phase() == SessionPhase::Active {
                            handle_text_frame(
                                &store,
                                &registry,
                                &identity,
                                conversation_id,
                                raw_message.as_str(),
                            )
                            .await;
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        if send_within(&mut socket, Message::Pong(payload), heartbeat.timeout)
                            .await
                            .is_err()
                        {
                            break CloseReason::SendFailed;
                        }
                    }
                    Ok(Message::Pong(_)) => {
                        pong_deadline = None;
                    }
                    Ok(Message::Close(_)) => break CloseReason::ClientClosed,
                    Ok(Message::Binary(_)) => {
                        debug!(conversation_id, session_id = %session_id, "ignoring binary frame");
                    }
                    Err(error) => {
                        debug!(conversation_id, session_id = %session_id, error = %error, "socket read failed");
                        break CloseReason::TransportError;
                    }
                }
            }
        }
    };

    registry.leave(conversation_id, session_id);
    lifecycle.advance(SessionPhase::Closed);
    metrics::session_closed();
    info!(
        conversation_id,
        user_id,
        session_id = %session_id,
        reason = reason.as_str(),
        "chat session closed"
    );
}

/// Invalid and empty frames are dropped without a reply.
async fn handle_text_frame(
    store: &ChatStore,
    registry: &ConversationRegistry,
    identity: &Identity,
    conversation_id: ConversationId,
    raw_message: &str,
) {
    let frame = match decode_client_frame(raw_message) {
        Ok(frame) => frame,
        Err(error) => {
            debug!(conversation_id, error = %error, "dropping undecodable frame");
            return;
        }
    };

    let Some(content) = frame.message else {
        debug!(conversation_id, "dropping frame without message");
        return;
    };

    match send_message(
        store,
        registry,
        conversation_id,
        identity.user_id,
        &content,
        SendSource::Socket,
    )
    .await
    {
        Ok(_) => {}
        Err(SendError::Invalid(error)) => {
            debug!(conversation_id, user_id = identity.user_id, error = %error, "dropping invalid message");
        }
        Err(SendError::Store(error)) => {
            warn!(
                conversation_id,
                user_id = identity.user_id,
                error = %error,
                "failed to persist chat message"
            );
        }
    }
}

async fn send_event(
    socket: &mut WebSocket,
    event: &ServerEvent,
    deadline: Duration,
) -> Result<(), ()> {
    let encoded = encode_server_event(event).map_err(|_| ())?;
    send_within(socket, Message::Text(encoded.into()), deadline).await
}

/// A write that has not completed by `deadline` counts as failed.
async fn send_within(
    socket: &mut WebSocket,
    message: Message,
    deadline: Duration,
) -> Result<(), ()> {
    match tokio::time::timeout(deadline, socket.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) | Err(_) => Err(()),
    }
}
