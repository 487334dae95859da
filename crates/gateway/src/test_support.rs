// Shared fixtures for router and end-to-end socket tests.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::Router;
use carechat_common::{
    protocol::ws::ServerEvent,
    types::{Conversation, ConversationId, Role, UserId, UserSummary},
};
use futures_util::{SinkExt, StreamExt};
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{protocol::CloseFrame, Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};

use crate::{
    auth::jwt::JwtAccessTokenService,
    build_router,
    registry::ConversationRegistry,
    store::{ChatStore, MemoryChatStore},
    ws::HeartbeatConfig,
    GatewayServices,
};

pub(crate) const TEST_JWT_SECRET: &str = "carechat_test_secret_that_is_definitely_long_enough";
const READ_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) type TestSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// A patient and a doctor sharing an appointment and a conversation, plus a
/// second patient with no relationship to either.
pub(crate) struct TestFixture {
    pub(crate) jwt: Arc<JwtAccessTokenService>,
    pub(crate) patient: UserSummary,
    pub(crate) doctor: UserSummary,
    pub(crate) outsider: UserSummary,
    pub(crate) conversation: Conversation,
}

impl TestFixture {
    pub(crate) fn token(&self, user_id: UserId) -> String {
        self.jwt.issue_access_token(user_id).expect("test token should be issued")
    }
}

pub(crate) fn test_services() -> (GatewayServices, TestFixture) {
    let mut memory = MemoryChatStore::default();
    let patient = memory.add_user("pat", "Pat Patient", Role::Patient);
    let doctor = memory.add_user("dana", "Dr. Dana", Role::Doctor);
    let outsider = memory.add_user("olive", "Olive Outsider", Role::Patient);
    memory.add_appointment(patient.id, doctor.id);
    let conversation = memory.add_conversation(patient.id, doctor.id);

    let jwt = Arc::new(
        JwtAccessTokenService::new(TEST_JWT_SECRET).expect("test jwt service should initialize"),
    );
    let services = GatewayServices::new(ChatStore::memory(memory), Arc::clone(&jwt));

    (services, TestFixture { jwt, patient, doctor, outsider, conversation })
}

/// The full gateway served on an ephemeral local port.
pub(crate) struct TestGateway {
    pub(crate) addr: SocketAddr,
    pub(crate) store: ChatStore,
    pub(crate) registry: ConversationRegistry,
    pub(crate) patient: UserSummary,
    pub(crate) doctor: UserSummary,
    pub(crate) conversation: Conversation,
    services: GatewayServices,
    fixture: TestFixture,
    server: JoinHandle<()>,
}

impl TestGateway {
    pub(crate) async fn spawn() -> Self {
        Self::spawn_with_heartbeat(HeartbeatConfig::default()).await
    }

    pub(crate) async fn spawn_with_heartbeat(heartbeat: HeartbeatConfig) -> Self {
        let (mut services, fixture) = test_services();
        services.heartbeat = heartbeat;
        let app = build_router(&services, None);

        let listener =
            TcpListener::bind("127.0.0.1:0").await.expect("test listener should bind");
        let addr = listener.local_addr().expect("test listener should have an address");
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("test server should run");
        });

        Self {
            addr,
            store: services.store.clone(),
            registry: services.registry.clone(),
            patient: fixture.patient.clone(),
            doctor: fixture.doctor.clone(),
            conversation: fixture.conversation.clone(),
            services,
            fixture,
            server,
        }
    }

    /// A router over the same store and registry as the served gateway.
    pub(crate) fn rest_router(&self) -> Router {
        build_router(&self.services, None)
    }

    pub(crate) fn patient_token(&self) -> String {
        self.fixture.token(self.patient.id)
    }

    pub(crate) fn doctor_token(&self) -> String {
        self.fixture.token(self.doctor.id)
    }

    pub(crate) fn outsider_token(&self) -> String {
        self.fixture.token(self.fixture.outsider.id)
    }

    fn socket_url(&self, token: Option<&str>, conversation_id: ConversationId) -> String {
        match token {
            Some(token) => {
                format!("ws://{}/ws/chat/{conversation_id}/?token={token}", self.addr)
            }
            None => format!("ws://{}/ws/chat/{conversation_id}/", self.addr),
        }
    }
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        self.server.abort();
    }
}

pub(crate) async fn connect(
    gateway: &TestGateway,
    token: String,
    conversation_id: ConversationId,
) -> TestSocket {
    let (socket, _) = connect_async(gateway.socket_url(Some(&token), conversation_id))
        .await
        .expect("chat socket handshake should succeed");
    socket
}

/// HTTP status of a handshake the gateway is expected to reject.
pub(crate) async fn connect_error_status(
    gateway: &TestGateway,
    token: Option<&str>,
    conversation_id: ConversationId,
) -> u16 {
    match connect_async(gateway.socket_url(token, conversation_id)).await {
        Err(WsError::Http(response)) => response.status().as_u16(),
        Err(error) => panic!("unexpected handshake error: {error}"),
        Ok(_) => panic!("handshake should have been rejected"),
    }
}

pub(crate) async fn ws_send_text(socket: &mut TestSocket, text: &str) {
    socket.send(Message::Text(text.to_owned().into())).await.expect("frame should send");
}

/// Next server event, skipping control frames.
pub(crate) async fn ws_recv_event(socket: &mut TestSocket) -> ServerEvent {
    loop {
        let next = tokio::time::timeout(READ_TIMEOUT, socket.next())
            .await
            .expect("server event should arrive in time");
        match next {
            Some(Ok(Message::Text(raw))) => {
                return serde_json::from_str(raw.as_str()).expect("server event should decode");
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(other)) => panic!("unexpected frame: {other:?}"),
            Some(Err(error)) => panic!("socket read failed: {error}"),
            None => panic!("socket closed before an event arrived"),
        }
    }
}

/// Reads until the server's close frame.
pub(crate) async fn ws_close_frame(socket: &mut TestSocket) -> Option<CloseFrame> {
    loop {
        let next = tokio::time::timeout(READ_TIMEOUT, socket.next())
            .await
            .expect("close frame should arrive in time");
        match next {
            Some(Ok(Message::Close(frame))) => return frame,
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => return None,
        }
    }
}

pub(crate) async fn wait_for_group_size(
    registry: &ConversationRegistry,
    conversation_id: ConversationId,
    expected: usize,
) {
    let waited = tokio::time::timeout(READ_TIMEOUT, async {
        while registry.group_size(conversation_id) != expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;

    assert!(
        waited.is_ok(),
        "conversation {conversation_id} should reach {expected} sessions, has {}",
        registry.group_size(conversation_id)
    );
}
