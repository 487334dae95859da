// REST surface for chat collaborators: contact list, history, and the
// message send/read/delete fallbacks. Every route requires a bearer token.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::get,
    Extension, Json, Router,
};
use carechat_common::types::{
    ChatMessage, Conversation, ConversationId, ConversationSummary, MessageId,
};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::{
    auth::{identity::Identity, middleware::require_bearer_auth},
    error::{ErrorCode, GatewayError},
    membership::{Membership, MembershipAuthority},
    messaging::{delete_message, send_message, SendSource},
    registry::ConversationRegistry,
    store::{ChatStore, StoreError},
    validation::ValidatedJson,
    GatewayServices,
};

#[derive(Clone)]
struct ApiState {
    store: ChatStore,
    registry: ConversationRegistry,
    membership: MembershipAuthority,
}

#[derive(Debug, Deserialize)]
struct PostMessageRequest {
    message: String,
}

pub fn router(services: &GatewayServices) -> Router {
    let state = ApiState {
        store: services.store.clone(),
        registry: services.registry.clone(),
        membership: MembershipAuthority::new(services.store.clone()),
    };

    Router::new()
        .route("/v1/chat/contacts", get(list_contacts))
        .route("/v1/chat/conversations/{id}/messages", get(list_messages).post(post_message))
        .route("/v1/chat/messages/{id}", get(get_message).delete(remove_message))
        .with_state(state)
        .route_layer(middleware::from_fn_with_state(services.resolver.clone(), require_bearer_auth))
}

/// Creates conversations for new appointment counterparts, then lists every
/// conversation the caller takes part in, including ones whose appointments
/// are gone.
async fn list_contacts(
    State(state): State<ApiState>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<Vec<ConversationSummary>>, GatewayError> {
    let counterparts =
        state.store.appointment_counterparts(identity.user_id, identity.role).await?;
    for counterpart_id in counterparts {
        let (patient_id, provider_id) = if identity.role.is_patient() {
            (identity.user_id, counterpart_id)
        } else {
            (counterpart_id, identity.user_id)
        };

        match state.store.get_or_create_conversation(patient_id, provider_id).await {
            Ok(_) => {}
            Err(error @ (StoreError::InvalidPair { .. } | StoreError::UserNotFound(_))) => {
                debug!(user_id = identity.user_id, counterpart_id, error = %error, "skipping contact");
            }
            Err(error) => return Err(error.into()),
        }
    }

    let conversations = state.store.conversations_for(identity.user_id).await?;
    let mut contacts = Vec::with_capacity(conversations.len());
    for conversation in conversations {
        let Some(other_id) = conversation.counterpart_of(identity.user_id) else {
            continue;
        };
        let Some(other_user) = state.store.user(other_id).await? else {
            continue;
        };

        let last_message = state.store.last_message(conversation.id).await?;
        let unread_count = state.store.unread_count(conversation.id, identity.user_id).await?;
        contacts.push(ConversationSummary {
            id: conversation.id,
            other_user,
            last_message,
            unread_count,
        });
    }

    Ok(Json(contacts))
}

async fn list_messages(
    State(state): State<ApiState>,
    Extension(identity): Extension<Identity>,
    Path(conversation_id): Path<ConversationId>,
) -> Result<Json<Vec<ChatMessage>>, GatewayError> {
    require_participant(&state, &identity, conversation_id).await?;

    state.store.mark_read_except(conversation_id, identity.user_id).await?;
    let history = state.store.history(conversation_id).await?;

    Ok(Json(history))
}

async fn post_message(
    State(state): State<ApiState>,
    Extension(identity): Extension<Identity>,
    Path(conversation_id): Path<ConversationId>,
    ValidatedJson(payload): ValidatedJson<PostMessageRequest>,
) -> Result<impl IntoResponse, GatewayError> {
    require_participant(&state, &identity, conversation_id).await?;

    let message = send_message(
        &state.store,
        &state.registry,
        conversation_id,
        identity.user_id,
        &payload.message,
        SendSource::Rest,
    )
    .await?;

    Ok((StatusCode::CREATED, Json(message)))
}

async fn get_message(
    State(state): State<ApiState>,
    Extension(identity): Extension<Identity>,
    Path(message_id): Path<MessageId>,
) -> Result<Json<ChatMessage>, GatewayError> {
    let message = state
        .store
        .message(message_id)
        .await?
        .ok_or_else(|| GatewayError::new(ErrorCode::NotFound, "message does not exist"))?;
    if message.sender.id != identity.user_id {
        warn!(message_id, user_id = identity.user_id, "caller is not the sender");
        return Err(GatewayError::new(
            ErrorCode::AuthForbidden,
            "only the sender may read this message",
        ));
    }

    Ok(Json(message))
}

async fn remove_message(
    State(state): State<ApiState>,
    Extension(identity): Extension<Identity>,
    Path(message_id): Path<MessageId>,
) -> Result<StatusCode, GatewayError> {
    delete_message(&state.store, &state.registry, identity.user_id, message_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn require_participant(
    state: &ApiState,
    identity: &Identity,
    conversation_id: ConversationId,
) -> Result<Conversation, GatewayError> {
    match state.membership.check(identity.user_id, conversation_id).await? {
        Membership::Participant(conversation) => Ok(conversation),
        Membership::NotParticipant => {
            warn!(conversation_id, user_id = identity.user_id, "caller is not a participant");
            Err(GatewayError::new(ErrorCode::AuthForbidden, "caller is not a participant"))
        }
        Membership::UnknownConversation => {
            Err(GatewayError::new(ErrorCode::NotFound, "conversation does not exist"))
        }
    }
}
