// ABOUTME: Wire-level tests for HttpHomeserver against a wiremock Client-Server API.
// ABOUTME: Checks request shapes and how status codes and errcodes are classified.

use serde_json::json;
use std::time::Duration;
use tether_core::error::TransportError;
use tether_core::event::{Event, RoomSection};
use tether_core::testing::{mock_alias, mock_room};
use tether_core::transport::{Homeserver, HttpHomeserver, SyncRequest};
use wiremock::matchers::{body_partial_json, header, method, path, path_regex, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn server() -> (MockServer, HttpHomeserver) {
    let server = MockServer::start().await;
    let client = HttpHomeserver::new(&server.uri()).unwrap();
    (server, client)
}

fn sync_request(since: Option<&str>) -> SyncRequest {
    SyncRequest {
        since: since.map(str::to_string),
        timeout: Duration::from_millis(0),
        timeline_limit: None,
    }
}

#[tokio::test]
async fn test_login_sends_password_identifier() {
    let (server, client) = server().await;
    Mock::given(method("POST"))
        .and(path("/_matrix/client/v3/login"))
        .and(body_partial_json(json!({
            "type": "m.login.password",
            "identifier": {"type": "m.id.user", "user": "bot"},
            "password": "secret",
            "initial_device_display_name": "mcp-server",
            "device_id": "DEVICE1",
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "user_id": "@bot:example.org",
            "access_token": "abc123",
            "device_id": "DEVICE1",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let login = client
        .login("bot", "secret", "mcp-server", Some("DEVICE1"))
        .await
        .unwrap();
    assert_eq!(login.user_id.as_str(), "@bot:example.org");
    assert_eq!(login.access_token, "abc123");
    assert_eq!(login.device_id, "DEVICE1");
}

#[tokio::test]
async fn test_login_bad_password_is_forbidden() {
    let (server, client) = server().await;
    Mock::given(method("POST"))
        .and(path("/_matrix/client/v3/login"))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({
            "errcode": "M_FORBIDDEN",
            "error": "Invalid username or password",
        })))
        .mount(&server)
        .await;

    let err = client.login("bot", "wrong", "mcp-server", None).await.unwrap_err();
    assert!(matches!(err, TransportError::Forbidden(ref msg) if msg.contains("Invalid username")));
    assert!(!err.is_transient());
}

#[tokio::test]
async fn test_sync_parses_rooms_and_passes_cursor() {
    let (server, client) = server().await;
    Mock::given(method("GET"))
        .and(path("/_matrix/client/v3/sync"))
        .and(query_param("since", "s41"))
        .and(header("authorization", "Bearer tok"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "next_batch": "s42",
            "rooms": {
                "join": {
                    "!ops:example.org": {
                        "state": {"events": [
                            {"type": "m.room.name", "sender": "@alice:example.org",
                             "state_key": "", "content": {"name": "Operations"}}
                        ]},
                        "timeline": {"events": [
                            {"type": "m.room.message", "sender": "@alice:example.org",
                             "event_id": "$e1", "origin_server_ts": 1_700_000_000_000i64,
                             "content": {"msgtype": "m.text", "body": "deploy done"}},
                            {"type": "m.room.message", "sender": "not a user",
                             "event_id": "$bad", "content": {"body": "dropped"}}
                        ]}
                    }
                },
                "leave": {
                    "!old:example.org": {}
                }
            }
        })))
        .mount(&server)
        .await;

    let batch = client.sync("tok", &sync_request(Some("s41"))).await.unwrap();
    assert_eq!(batch.next_batch, "s42");
    assert_eq!(batch.rooms.len(), 2);

    let ops = &batch.rooms[0];
    assert_eq!(ops.room_id, mock_room("!ops:example.org"));
    assert_eq!(ops.section, RoomSection::Joined);
    assert_eq!(ops.display_name.as_deref(), Some("Operations"));
    assert_eq!(ops.events.len(), 1);
    assert!(matches!(&ops.events[0], Event::Message(m) if m.body == "deploy done"));

    assert_eq!(batch.rooms[1].section, RoomSection::Left);
}

#[tokio::test]
async fn test_initial_sync_carries_timeline_filter() {
    let (server, client) = server().await;
    Mock::given(method("GET"))
        .and(path("/_matrix/client/v3/sync"))
        .and(query_param("filter", r#"{"room":{"timeline":{"limit":20}}}"#))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"next_batch": "s1"})))
        .expect(1)
        .mount(&server)
        .await;

    let request = SyncRequest {
        timeline_limit: Some(20),
        ..sync_request(None)
    };
    let batch = client.sync("tok", &request).await.unwrap();
    assert_eq!(batch.next_batch, "s1");
    assert!(batch.rooms.is_empty());
}

#[tokio::test]
async fn test_sync_with_unknown_token_is_unauthorized() {
    let (server, client) = server().await;
    Mock::given(method("GET"))
        .and(path("/_matrix/client/v3/sync"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "errcode": "M_UNKNOWN_TOKEN",
            "error": "Access token has expired",
            "soft_logout": true,
        })))
        .mount(&server)
        .await;

    let err = client.sync("stale", &sync_request(None)).await.unwrap_err();
    assert!(matches!(err, TransportError::Unauthorized { soft_logout: true, .. }));
    assert!(err.is_unauthorized());
}

#[tokio::test]
async fn test_malformed_sync_body_is_protocol_error() {
    let (server, client) = server().await;
    Mock::given(method("GET"))
        .and(path("/_matrix/client/v3/sync"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>gateway</html>"))
        .mount(&server)
        .await;

    let err = client.sync("tok", &sync_request(None)).await.unwrap_err();
    assert!(matches!(err, TransportError::Protocol(_)));
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_rate_limit_carries_retry_after() {
    let (server, client) = server().await;
    Mock::given(method("GET"))
        .and(path("/_matrix/client/v3/sync"))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({
            "errcode": "M_LIMIT_EXCEEDED",
            "error": "Too many requests",
            "retry_after_ms": 2500,
        })))
        .mount(&server)
        .await;

    let err = client.sync("tok", &sync_request(None)).await.unwrap_err();
    assert_eq!(err.retry_after(), Some(Duration::from_millis(2500)));
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_server_error_is_transient_network() {
    let (server, client) = server().await;
    Mock::given(method("GET"))
        .and(path("/_matrix/client/v3/sync"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    let err = client.sync("tok", &sync_request(None)).await.unwrap_err();
    assert!(matches!(err, TransportError::Network(ref msg) if msg == "HTTP 502"));
}

#[tokio::test]
async fn test_resolve_alias() {
    let (server, client) = server().await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/_matrix/client/v3/directory/room/(%23|#)ops:example\.org$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "room_id": "!ops:example.org",
            "servers": ["example.org"],
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/_matrix/client/v3/directory/room/(%23|#)missing:example\.org$"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "errcode": "M_NOT_FOUND",
            "error": "Room alias not found",
        })))
        .mount(&server)
        .await;

    let room_id = client
        .resolve_alias("tok", &mock_alias("#ops:example.org"))
        .await
        .unwrap();
    assert_eq!(room_id.as_str(), "!ops:example.org");

    let err = client
        .resolve_alias("tok", &mock_alias("#missing:example.org"))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::NotFound(_)));
}

#[tokio::test]
async fn test_join_and_forbidden_join() {
    let (server, client) = server().await;
    Mock::given(method("POST"))
        .and(path_regex(r"^/_matrix/client/v3/rooms/!ops:example\.org/join$"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"room_id": "!ops:example.org"})),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path_regex(r"^/_matrix/client/v3/rooms/!private:example\.org/join$"))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({
            "errcode": "M_FORBIDDEN",
            "error": "You are not invited to this room.",
        })))
        .mount(&server)
        .await;

    let joined = client.join("tok", &mock_room("!ops:example.org")).await.unwrap();
    assert_eq!(joined.as_str(), "!ops:example.org");

    let err = client
        .join("tok", &mock_room("!private:example.org"))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Forbidden(ref msg) if msg.contains("not invited")));
}

#[tokio::test]
async fn test_send_text_puts_message_under_txn_id() {
    let (server, client) = server().await;
    Mock::given(method("PUT"))
        .and(path_regex(
            r"^/_matrix/client/v3/rooms/!ops:example\.org/send/m\.room\.message/txn-1$",
        ))
        .and(header("authorization", "Bearer tok"))
        .and(body_partial_json(json!({"msgtype": "m.text", "body": "hello"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"event_id": "$sent1"})))
        .expect(1)
        .mount(&server)
        .await;

    let event_id = client
        .send_text("tok", &mock_room("!ops:example.org"), "txn-1", "hello")
        .await
        .unwrap();
    assert_eq!(event_id.as_str(), "$sent1");
}

#[tokio::test]
async fn test_unreachable_server_is_network_error() {
    let client = HttpHomeserver::new("http://127.0.0.1:9").unwrap();
    let err = client.login("bot", "secret", "mcp-server", None).await.unwrap_err();
    assert!(matches!(err, TransportError::Network(_)));
}
