use carechat_common::protocol::ws::{decode_client_frame, encode_server_event, ServerEvent};
use carechat_common::types::{ChatMessage, Role, UserSummary};
use chrono::{TimeZone, Utc};
use serde_json::Value;

fn sample_message() -> ChatMessage {
    ChatMessage {
        id: 42,
        conversation: 7,
        sender: UserSummary {
            id: 3,
            username: "pat".to_string(),
            display_name: "Pat Patient".to_string(),
            role: Role::Patient,
        },
        content: "hello".to_string(),
        timestamp: Utc.with_ymd_and_hms(2026, 2, 7, 12, 30, 0).unwrap(),
        is_read: false,
    }
}

fn keys(value: &Value) -> Vec<String> {
    let mut keys: Vec<String> =
        value.as_object().expect("value should be an object").keys().cloned().collect();
    keys.sort();
    keys
}

#[test]
fn chat_message_event_shape() {
    let raw = encode_server_event(&ServerEvent::ChatMessage { message: sample_message() })
        .expect("event should encode");
    let value: Value = serde_json::from_str(&raw).expect("event should be json");

    assert_eq!(value["type"], "chat_message");
    assert_eq!(keys(&value), vec!["message", "type"]);
    assert_eq!(
        keys(&value["message"]),
        vec!["content", "conversation", "id", "is_read", "sender", "timestamp"]
    );
    assert_eq!(keys(&value["message"]["sender"]), vec!["display_name", "id", "role", "username"]);
    assert_eq!(value["message"]["sender"]["role"], "user");
    assert_eq!(value["message"]["timestamp"], "2026-02-07T12:30:00Z");
}

#[test]
fn delete_message_event_shape() {
    let raw = encode_server_event(&ServerEvent::DeleteMessage { message_id: 123 })
        .expect("event should encode");
    let value: Value = serde_json::from_str(&raw).expect("event should be json");

    assert_eq!(keys(&value), vec!["message_id", "type"]);
    assert_eq!(value["type"], "delete_message");
    assert_eq!(value["message_id"], 123);
}

#[test]
fn server_events_decode_back_from_wire() {
    let event = ServerEvent::ChatMessage { message: sample_message() };
    let raw = encode_server_event(&event).expect("event should encode");
    let decoded: ServerEvent = serde_json::from_str(&raw).expect("event should decode");
    assert_eq!(decoded, event);
}

#[test]
fn client_frame_is_a_bare_message_object() {
    let frame = decode_client_frame(r#"{"message":"hello"}"#).expect("frame should decode");
    assert_eq!(frame.message.as_deref(), Some("hello"));

    assert!(decode_client_frame("not json").is_err());
    assert!(decode_client_frame(r#"{"message":42}"#).is_err());
}
