// ABOUTME: End-to-end tests of the engine's boundary operations against the MockHomeserver.
// ABOUTME: Covers send, send-then-wait correlation, room listing and the stop lifecycle.

use std::sync::Arc;
use std::time::Duration;
use tether_core::backoff::BackoffConfig;
use tether_core::error::{Error, ErrorKind, TransportError};
use tether_core::testing::MockHomeserver;
use tether_core::{Config, Engine, Homeserver};
use tokio::time::Instant;

const ROOM: &str = "!ops:example.org";
const OTHER_ROOM: &str = "!lobby:example.org";

fn config() -> Config {
    let mut config = Config::default();
    config.matrix.username = "@bot:example.org".to_string();
    config.matrix.password = "secret".to_string();
    config.sync.timeout_ms = 100;
    config.sync.grace_ms = 0;
    config.retry = BackoffConfig {
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(100),
        multiplier: 2,
        max_retries: 3,
    };
    config
}

async fn started() -> (Arc<MockHomeserver>, Arc<Engine>) {
    let mock = Arc::new(MockHomeserver::new("@bot:example.org", "secret"));
    mock.add_joined_room(ROOM);
    mock.add_alias("#lobby:example.org", OTHER_ROOM);
    let transport: Arc<dyn Homeserver> = mock.clone();
    let engine = Arc::new(Engine::connect(config(), transport).await.unwrap());
    engine.start().unwrap();
    while engine.sync_progress().batches < 1 {
        engine.next_sync().await.unwrap();
    }
    (mock, engine)
}

#[tokio::test]
async fn test_connect_rejects_bad_credentials() {
    let mock = Arc::new(MockHomeserver::new("@bot:example.org", "other"));
    let transport: Arc<dyn Homeserver> = mock.clone();
    let err = Engine::connect(config(), transport).await.err().unwrap();
    assert_eq!(err.kind(), ErrorKind::Auth);
}

#[tokio::test]
async fn test_send_message_to_joined_room() {
    let (mock, engine) = started().await;
    let sent = engine
        .send_message(ROOM, "Deploy finished", false)
        .await
        .unwrap();

    assert_eq!(sent.room_id.as_str(), ROOM);
    let records = mock.sent();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].body, "Deploy finished");
    assert_eq!(records[0].event_id, sent.event_id);
    engine.stop().await;
}

#[tokio::test]
async fn test_send_without_join_permission_transmits_nothing() {
    let (mock, engine) = started().await;
    let err = engine
        .send_message(OTHER_ROOM, "hello?", false)
        .await
        .unwrap_err();

    assert_eq!(err, Error::NotJoined(OTHER_ROOM.to_string()));
    assert_eq!(mock.send_attempts(), 0);
    assert_eq!(mock.join_count(), 0);
    engine.stop().await;
}

#[tokio::test]
async fn test_empty_message_rejected_before_network() {
    let (mock, engine) = started().await;
    let err = engine.send_message(ROOM, "   ", true).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert_eq!(mock.send_attempts(), 0);
    engine.stop().await;
}

#[tokio::test]
async fn test_send_via_alias_joins_and_lists_after_sync() {
    let (mock, engine) = started().await;
    let sent = engine
        .send_message("#lobby:example.org", "hi all", true)
        .await
        .unwrap();
    assert_eq!(sent.room_id.as_str(), OTHER_ROOM);
    assert_eq!(mock.join_count(), 1);

    // the join is confirmed by a later batch
    while engine.list_rooms().len() < 2 {
        engine.next_sync().await.unwrap();
    }
    let listed: Vec<_> = engine
        .list_rooms()
        .into_iter()
        .map(|r| r.room_id.to_string())
        .collect();
    assert_eq!(listed, vec![OTHER_ROOM.to_string(), ROOM.to_string()]);
    engine.stop().await;
}

#[tokio::test]
async fn test_send_survives_token_expiry() {
    let (mock, engine) = started().await;
    mock.expire_token();

    engine.send_message(ROOM, "still here", false).await.unwrap();
    assert_eq!(mock.sent().len(), 1);
    assert!(mock.login_count() >= 2);
    engine.stop().await;
}

#[tokio::test]
async fn test_transient_send_failure_reuses_transaction() {
    let (mock, engine) = started().await;
    mock.fail_next_send(TransportError::Network("connection reset".into()));

    engine.send_message(ROOM, "retry me", false).await.unwrap();
    assert_eq!(mock.send_attempts(), 2);
    assert_eq!(mock.sent().len(), 1);
    engine.stop().await;
}

#[tokio::test]
async fn test_wait_for_response_returns_reply() {
    let (mock, engine) = started().await;

    let waiter = Arc::clone(&engine);
    let task = tokio::spawn(async move {
        waiter
            .wait_for_response(ROOM, "Ship it?", Duration::from_secs(5), None)
            .await
    });

    mock.wait_for_sends(1).await;
    mock.push_message(ROOM, "@alice:example.org", "yes, ship it");

    let reply = task.await.unwrap().unwrap();
    assert_eq!(reply.body, "yes, ship it");
    assert_eq!(reply.sender.as_str(), "@alice:example.org");
    assert_eq!(reply.room_id.as_str(), ROOM);
    engine.stop().await;
}

#[tokio::test]
async fn test_wait_for_response_honors_sender_filter() {
    let (mock, engine) = started().await;

    let waiter = Arc::clone(&engine);
    let task = tokio::spawn(async move {
        waiter
            .wait_for_response(
                ROOM,
                "Approve?",
                Duration::from_secs(5),
                Some("@admin:example.org"),
            )
            .await
    });

    mock.wait_for_sends(1).await;
    mock.push_message(ROOM, "@random:example.org", "sure why not");
    mock.push_message(ROOM, "@admin:example.org", "approved");

    let reply = task.await.unwrap().unwrap();
    assert_eq!(reply.body, "approved");
    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_wait_for_response_times_out() {
    let (_mock, engine) = started().await;
    let start = Instant::now();

    let err = engine
        .wait_for_response(ROOM, "Anyone?", Duration::from_secs(30), None)
        .await
        .unwrap_err();

    assert_eq!(err, Error::Timeout(Duration::from_secs(30)));
    assert!(start.elapsed() >= Duration::from_secs(30));
    engine.stop().await;
}

#[tokio::test]
async fn test_invalid_wait_arguments() {
    let (mock, engine) = started().await;
    let err = engine
        .wait_for_response(ROOM, "hi", Duration::ZERO, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let err = engine
        .wait_for_response(ROOM, "hi", Duration::from_secs(1), Some("not-a-user"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert_eq!(mock.send_attempts(), 0);
    engine.stop().await;
}

#[tokio::test]
async fn test_second_wait_on_busy_room_rejected() {
    let (_mock, engine) = started().await;
    let first = engine
        .register_wait(ROOM, None, Duration::from_secs(5))
        .await
        .unwrap();

    let err = engine
        .register_wait(ROOM, None, Duration::from_secs(5))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InProgress);

    drop(first);
    assert!(engine
        .register_wait(ROOM, None, Duration::from_secs(5))
        .await
        .is_ok());
    engine.stop().await;
}

#[tokio::test]
async fn test_wait_for_response_on_busy_room_sends_nothing() {
    let (mock, engine) = started().await;
    let _first = engine
        .register_wait(ROOM, None, Duration::from_secs(5))
        .await
        .unwrap();

    let err = engine
        .wait_for_response(ROOM, "anyone there?", Duration::from_secs(5), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InProgress);
    assert!(mock.sent().is_empty());
    assert_eq!(mock.send_attempts(), 0);
    engine.stop().await;
}

#[tokio::test]
async fn test_unrepresentable_timeout_rejected_before_send() {
    let (mock, engine) = started().await;
    let err = engine
        .wait_for_response(ROOM, "hi", Duration::from_secs(u64::MAX), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert_eq!(mock.send_attempts(), 0);
    assert!(engine
        .register_wait(ROOM, None, Duration::from_secs(5))
        .await
        .is_ok());
    engine.stop().await;
}

#[tokio::test]
async fn test_failed_send_releases_room() {
    let (mock, engine) = started().await;
    mock.fail_next_send(TransportError::Forbidden("M_FORBIDDEN: muted".into()));

    assert!(engine
        .wait_for_response(ROOM, "ping", Duration::from_secs(5), None)
        .await
        .is_err());
    assert!(engine
        .register_wait(ROOM, None, Duration::from_secs(5))
        .await
        .is_ok());
    engine.stop().await;
}

#[tokio::test]
async fn test_stop_fails_pending_waits_and_logs_out() {
    let (mock, engine) = started().await;
    let handle = engine
        .register_wait(ROOM, None, Duration::from_secs(60))
        .await
        .unwrap();

    engine.stop().await;

    assert_eq!(handle.wait().await, Err(Error::Shutdown));
    assert_eq!(engine.closed().await, Ok(()));
    assert_eq!(mock.logout_count(), 1);
    assert!(matches!(
        engine.send_message(ROOM, "late", false).await,
        Err(Error::Shutdown)
    ));
    assert!(matches!(engine.start(), Err(Error::Shutdown)));
}
