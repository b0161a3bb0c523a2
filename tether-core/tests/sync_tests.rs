// ABOUTME: Tests for the sync loop: backlog suppression, token renewal mid-stream, backoff and fatal exhaustion.
// ABOUTME: Drives a full Engine against the in-memory MockHomeserver.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tether_core::backoff::BackoffConfig;
use tether_core::error::{Error, TransportError};
use tether_core::event::{Event, RoomUpdate};
use tether_core::testing::{message_event, mock_event_id, mock_room, MockHomeserver};
use tether_core::{Config, Engine, EventHandler, Homeserver};

const ROOM: &str = "!ops:example.org";

#[derive(Default)]
struct Recorder {
    bodies: Mutex<Vec<String>>,
}

impl Recorder {
    fn bodies(&self) -> Vec<String> {
        self.bodies.lock().clone()
    }
}

impl EventHandler for Recorder {
    fn handle(&self, event: &Event) {
        if let Event::Message(msg) = event {
            self.bodies.lock().push(msg.body.clone());
        }
    }
}

fn config(grace_ms: u64) -> Config {
    let mut config = Config::default();
    config.matrix.username = "@bot:example.org".to_string();
    config.matrix.password = "secret".to_string();
    config.sync.timeout_ms = 100;
    config.sync.grace_ms = grace_ms;
    config.retry = BackoffConfig {
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(100),
        multiplier: 2,
        max_retries: 3,
    };
    config
}

async fn engine(grace_ms: u64) -> (Arc<MockHomeserver>, Arc<Engine>, Arc<Recorder>) {
    let mock = Arc::new(MockHomeserver::new("@bot:example.org", "secret"));
    mock.add_joined_room(ROOM);
    let transport: Arc<dyn Homeserver> = mock.clone();
    let engine = Arc::new(Engine::connect(config(grace_ms), transport).await.unwrap());
    let recorder = Arc::new(Recorder::default());
    engine.add_handler(recorder.clone());
    (mock, engine, recorder)
}

async fn wait_for_batches(engine: &Engine, count: u64) {
    while engine.sync_progress().batches < count {
        engine.next_sync().await.unwrap();
    }
}

#[tokio::test]
async fn test_initial_batch_is_backlog() {
    let (mock, engine, recorder) = engine(0).await;
    let mut backlog = RoomUpdate::joined(mock_room(ROOM));
    backlog.events.push(message_event(
        &mock_room(ROOM),
        &mock_event_id("old"),
        "@alice:example.org",
        "from yesterday",
    ));
    mock.add_initial_update(backlog);

    engine.start().unwrap();
    wait_for_batches(&engine, 1).await;
    assert!(recorder.bodies().is_empty());
    // room state from the backlog still lands in the cache
    assert_eq!(engine.list_rooms().len(), 1);

    mock.push_message(ROOM, "@alice:example.org", "live now");
    wait_for_batches(&engine, 2).await;
    assert_eq!(recorder.bodies(), vec!["live now".to_string()]);

    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_grace_window_suppresses_early_batches() {
    let (mock, engine, recorder) = engine(1_000).await;
    engine.start().unwrap();
    wait_for_batches(&engine, 1).await;

    mock.push_message(ROOM, "@alice:example.org", "too early");
    wait_for_batches(&engine, 2).await;
    assert!(recorder.bodies().is_empty());

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    mock.push_message(ROOM, "@alice:example.org", "on time");
    let seen = engine.sync_progress().batches;
    wait_for_batches(&engine, seen + 1).await;
    assert_eq!(recorder.bodies(), vec!["on time".to_string()]);

    engine.stop().await;
}

#[tokio::test]
async fn test_resumes_from_cursor_after_token_expiry() {
    let (mock, engine, _recorder) = engine(0).await;
    engine.start().unwrap();
    wait_for_batches(&engine, 1).await;

    mock.expire_token();
    let seen = engine.sync_progress().batches;
    wait_for_batches(&engine, seen + 3).await;

    assert_eq!(mock.login_count(), 2);
    let requests = mock.sync_requests();
    assert_eq!(requests[0], None);
    assert!(
        requests.iter().skip(1).all(Option::is_some),
        "sync restarted from scratch: {:?}",
        requests
    );
    assert!(engine.is_running());

    engine.stop().await;
}

#[tokio::test]
async fn test_malformed_batch_is_retried() {
    let (mock, engine, recorder) = engine(0).await;
    engine.start().unwrap();
    wait_for_batches(&engine, 1).await;

    mock.fail_next_sync(TransportError::Protocol("invalid JSON body".into()));
    mock.push_message(ROOM, "@alice:example.org", "after the hiccup");
    let seen = engine.sync_progress().batches;
    wait_for_batches(&engine, seen + 1).await;

    assert_eq!(recorder.bodies(), vec!["after the hiccup".to_string()]);
    assert!(engine.is_running());
    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_backoff_is_fatal_and_fails_waits() {
    let (mock, engine, _recorder) = engine(0).await;
    let handle = engine
        .register_wait(ROOM, None, Duration::from_secs(60))
        .await
        .unwrap();

    for _ in 0..4 {
        mock.fail_next_sync(TransportError::Network("502 Bad Gateway".into()));
    }
    engine.start().unwrap();

    let err = engine.closed().await.unwrap_err();
    assert!(matches!(err, Error::Network(ref msg) if msg.contains("sync failed after 4 attempts")));
    assert_eq!(handle.wait().await, Err(Error::Shutdown));
    assert!(!engine.is_running());
    assert!(matches!(
        engine.send_message(ROOM, "anyone?", true).await,
        Err(Error::Shutdown)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_permanent_renewal_failure_is_fatal() {
    let (mock, engine, _recorder) = engine(0).await;
    engine.start().unwrap();
    wait_for_batches(&engine, 1).await;

    mock.set_password("rotated");
    mock.expire_token();

    let err = engine.closed().await.unwrap_err();
    assert!(matches!(err, Error::Auth { retryable: false, .. }));
}

#[tokio::test(start_paused = true)]
async fn test_repeated_token_rejection_is_fatal() {
    let (mock, engine, _recorder) = engine(0).await;
    for _ in 0..4 {
        mock.fail_next_sync(TransportError::Unauthorized {
            message: "M_UNKNOWN_TOKEN: Invalid access token".into(),
            soft_logout: false,
        });
    }
    engine.start().unwrap();

    let err = engine.closed().await.unwrap_err();
    assert!(matches!(
        err,
        Error::Auth { retryable: false, ref message } if message.contains("rejected 4 times in a row")
    ));
    // the initial login plus one renewal per tolerated rejection
    assert_eq!(mock.login_count(), 4);
    assert!(!engine.is_running());
}
