// Chat socket endpoint: /ws/chat/{conversation_id}/?token=<access token>
//
// Authentication and membership are settled before the upgrade is
// accepted, so a rejected client never joins a conversation group.

mod session;

use axum::{
    extract::{ws::WebSocketUpgrade, Path, Query, State},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use carechat_common::types::ConversationId;
use serde::Deserialize;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::{
    auth::{
        identity::{AuthError, IdentityResolver},
        middleware::auth_error_response,
    },
    error::{current_request_id, with_request_id_scope, ErrorCode, GatewayError},
    membership::{Membership, MembershipAuthority},
    metrics::{self, HandshakeOutcome},
    registry::ConversationRegistry,
    store::ChatStore,
    validation::MAX_WS_FRAME_BYTES,
    GatewayServices,
};

pub use session::{HeartbeatConfig, SessionPhase};
use session::{run_session, SessionContext, SessionLifecycle};

#[derive(Clone)]
pub struct ChatSocketState {
    resolver: IdentityResolver,
    membership: MembershipAuthority,
    store: ChatStore,
    registry: ConversationRegistry,
    heartbeat: HeartbeatConfig,
}

impl ChatSocketState {
    pub(crate) fn new(services: &GatewayServices) -> Self {
        Self {
            resolver: services.resolver.clone(),
            membership: MembershipAuthority::new(services.store.clone()),
            store: services.store.clone(),
            registry: services.registry.clone(),
            heartbeat: services.heartbeat,
        }
    }
}

pub fn router(state: ChatSocketState) -> Router {
    Router::new()
        .route("/ws/chat/{conversation_id}/", get(ws_upgrade))
        .route("/ws/chat/{conversation_id}", get(ws_upgrade))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    token: Option<String>,
}

pub async fn ws_upgrade(
    Path(conversation_id): Path<ConversationId>,
    Query(query): Query<ConnectQuery>,
    State(state): State<ChatSocketState>,
    ws: WebSocketUpgrade,
) -> Response {
    let mut lifecycle = SessionLifecycle::new();

    let identity = match state.resolver.resolve(query.token.as_deref()).await {
        Ok(identity) => identity,
        Err(error) => {
            lifecycle.advance(SessionPhase::Closed);
            let outcome = match error {
                AuthError::Unavailable(_) => HandshakeOutcome::Error,
                _ => HandshakeOutcome::AuthFailed,
            };
            metrics::record_ws_handshake(outcome);
            debug!(conversation_id, error = %error, "chat socket rejected: authentication failed");
            return auth_error_response(&error);
        }
    };
    lifecycle.advance(SessionPhase::Authenticated);

    match state.membership.check(identity.user_id, conversation_id).await {
        Ok(Membership::Participant(_)) => {}
        Ok(Membership::NotParticipant | Membership::UnknownConversation) => {
            lifecycle.advance(SessionPhase::Closed);
            metrics::record_ws_handshake(HandshakeOutcome::NotParticipant);
            warn!(
                conversation_id,
                user_id = identity.user_id,
                "chat socket rejected: caller is not a participant"
            );
            return GatewayError::from_code(ErrorCode::AuthForbidden).into_response();
        }
        Err(store_error) => {
            lifecycle.advance(SessionPhase::Closed);
            metrics::record_ws_handshake(HandshakeOutcome::Error);
            error!(
                conversation_id,
                user_id = identity.user_id,
                error = %store_error,
                "membership lookup failed"
            );
            return GatewayError::from_code(ErrorCode::InternalError).into_response();
        }
    }
    metrics::record_ws_handshake(HandshakeOutcome::Accepted);

    let request_id = current_request_id().unwrap_or_else(|| Uuid::new_v4().to_string());
    let context = SessionContext {
        store: state.store.clone(),
        registry: state.registry.clone(),
        identity,
        conversation_id,
        heartbeat: state.heartbeat,
    };

    ws.max_frame_size(MAX_WS_FRAME_BYTES)
        .max_message_size(MAX_WS_FRAME_BYTES)
        .on_upgrade(move |socket| async move {
            with_request_id_scope(request_id, run_session(context, lifecycle, socket)).await;
        })
}
