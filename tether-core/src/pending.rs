// ABOUTME: Pending-response registry correlating incoming room messages to outstanding waits.
// ABOUTME: One mutex guards register/offer/expire/cancel; each wait owns a deadline timer task.

use crate::error::{Error, Result};
use crate::event::MessageEvent;
use chrono::{DateTime, Utc};
use matrix_sdk::ruma::{OwnedEventId, OwnedRoomId, OwnedUserId};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Messages remembered per room for anchored registration
pub const RECENT_WINDOW: usize = 64;

/// The message that resolved a wait
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub sender: OwnedUserId,
    pub body: String,
    pub timestamp: DateTime<Utc>,
    pub event_id: OwnedEventId,
    pub room_id: OwnedRoomId,
}

impl From<&MessageEvent> for Reply {
    fn from(event: &MessageEvent) -> Self {
        Self {
            sender: event.sender.clone(),
            body: event.body.clone(),
            timestamp: event.timestamp,
            event_id: event.event_id.clone(),
            room_id: event.room_id.clone(),
        }
    }
}

struct PendingWait {
    id: u64,
    sender_filter: Option<OwnedUserId>,
    /// Event id whose echo must be seen before replies count
    anchor: Option<OwnedEventId>,
    armed: bool,
    timeout: Duration,
    reply: oneshot::Sender<Result<Reply>>,
    cancel: CancellationToken,
}

impl PendingWait {
    fn accepts(&self, event: &MessageEvent, own_user: &OwnedUserId) -> bool {
        self.armed
            && event.sender != *own_user
            && self
                .sender_filter
                .as_ref()
                .map_or(true, |wanted| *wanted == event.sender)
    }
}

struct RecentMessage {
    event: MessageEvent,
    /// False for backlog: may arm an anchored wait but never resolves one
    live: bool,
}

struct RegistryInner {
    waits: HashMap<OwnedRoomId, PendingWait>,
    recent: HashMap<OwnedRoomId, VecDeque<RecentMessage>>,
    next_id: u64,
    closed: bool,
}

impl RegistryInner {
    fn remember(&mut self, event: &MessageEvent, live: bool) {
        let window = self.recent.entry(event.room_id.clone()).or_default();
        if window.len() == RECENT_WINDOW {
            window.pop_front();
        }
        window.push_back(RecentMessage {
            event: event.clone(),
            live,
        });
    }
}

/// Registry of outstanding waits, at most one per room.
#[derive(Clone)]
pub struct PendingRegistry {
    own_user: OwnedUserId,
    inner: Arc<Mutex<RegistryInner>>,
}

impl PendingRegistry {
    /// `own_user` messages never resolve a wait.
    pub fn new(own_user: OwnedUserId) -> Self {
        Self {
            own_user,
            inner: Arc::new(Mutex::new(RegistryInner {
                waits: HashMap::new(),
                recent: HashMap::new(),
                next_id: 0,
                closed: false,
            })),
        }
    }

    /// Register a wait for the next reply in `room_id`.
    ///
    /// With an `anchor`, only messages after that event's echo count; if the
    /// echo already went by, the remembered messages after it are checked now.
    pub fn register(
        &self,
        room_id: OwnedRoomId,
        sender_filter: Option<OwnedUserId>,
        timeout: Duration,
        anchor: Option<OwnedEventId>,
    ) -> Result<WaitHandle> {
        let deadline = deadline_after(timeout)?;
        let armed = anchor.is_none();
        let handle = self.insert(room_id, sender_filter, timeout, anchor, armed)?;
        {
            let mut inner = self.inner.lock();
            self.settle_from_window(&mut inner, &handle.room_id);
        }
        handle.start_timer(deadline);
        Ok(handle)
    }

    /// Claim `room_id` for a reply to a message that is not sent yet.
    ///
    /// Nothing resolves the wait and its timer does not run until
    /// [`WaitHandle::set_anchor`] names the sent event. Dropping the handle
    /// before that releases the room.
    pub fn reserve(
        &self,
        room_id: OwnedRoomId,
        sender_filter: Option<OwnedUserId>,
        timeout: Duration,
    ) -> Result<WaitHandle> {
        deadline_after(timeout)?;
        self.insert(room_id, sender_filter, timeout, None, false)
    }

    fn insert(
        &self,
        room_id: OwnedRoomId,
        sender_filter: Option<OwnedUserId>,
        timeout: Duration,
        anchor: Option<OwnedEventId>,
        armed: bool,
    ) -> Result<WaitHandle> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let cancel = CancellationToken::new();

        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(Error::Shutdown);
        }
        if inner.waits.contains_key(&room_id) {
            return Err(Error::InProgress(room_id.to_string()));
        }
        inner.next_id += 1;
        let id = inner.next_id;

        tracing::debug!(
            room_id = %room_id,
            armed,
            timeout_secs = timeout.as_secs_f64(),
            "Registered pending wait"
        );
        inner.waits.insert(
            room_id.clone(),
            PendingWait {
                id,
                sender_filter,
                anchor,
                armed,
                timeout,
                reply: reply_tx,
                cancel: cancel.clone(),
            },
        );

        Ok(WaitHandle {
            registry: self.clone(),
            room_id,
            id,
            timeout,
            reply: Some(reply_rx),
            cancel,
        })
    }

    /// Point wait `id` at `anchor` and settle it against the remembered window
    fn attach_anchor(&self, room_id: &OwnedRoomId, id: u64, anchor: OwnedEventId) {
        let mut inner = self.inner.lock();
        match inner.waits.get_mut(room_id) {
            Some(wait) if wait.id == id => wait.anchor = Some(anchor),
            _ => return,
        }
        self.settle_from_window(&mut inner, room_id);
    }

    /// Arm the room's wait if its anchor echo already went by, resolving it
    /// when a live reply followed the echo.
    fn settle_from_window(&self, inner: &mut RegistryInner, room_id: &OwnedRoomId) {
        let RegistryInner { waits, recent, .. } = inner;
        let Some(wait) = waits.get_mut(room_id) else {
            return;
        };
        let (Some(anchor), Some(window)) = (wait.anchor.clone(), recent.get(room_id)) else {
            return;
        };
        let Some(pos) = window.iter().position(|m| m.event.event_id == anchor) else {
            return;
        };

        wait.armed = true;
        let early = window
            .iter()
            .skip(pos + 1)
            .find(|m| m.live && wait.accepts(&m.event, &self.own_user))
            .map(|m| Reply::from(&m.event));
        if let Some(reply) = early {
            if let Some(wait) = waits.remove(room_id) {
                tracing::debug!(room_id = %room_id, sender = %reply.sender, "Reply arrived before registration");
                wait.cancel.cancel();
                let _ = wait.reply.send(Ok(reply));
            }
        }
    }

    /// Offer a live message; resolves the room's wait if it matches.
    pub fn offer(&self, event: &MessageEvent) {
        let mut inner = self.inner.lock();
        inner.remember(event, true);

        let Some(wait) = inner.waits.get_mut(&event.room_id) else {
            return;
        };
        if !wait.armed {
            if wait.anchor.as_ref() == Some(&event.event_id) {
                tracing::trace!(room_id = %event.room_id, "Anchor echo seen, wait armed");
                wait.armed = true;
            }
            return;
        }
        if !wait.accepts(event, &self.own_user) {
            return;
        }

        if let Some(wait) = inner.waits.remove(&event.room_id) {
            tracing::info!(
                room_id = %event.room_id,
                sender = %event.sender,
                "Pending wait resolved"
            );
            wait.cancel.cancel();
            let _ = wait.reply.send(Ok(Reply::from(event)));
        }
    }

    /// Record a backlog message: it can arm an anchored wait but never resolves one.
    pub fn observe(&self, event: &MessageEvent) {
        let mut inner = self.inner.lock();
        inner.remember(event, false);
        if let Some(wait) = inner.waits.get_mut(&event.room_id) {
            if !wait.armed && wait.anchor.as_ref() == Some(&event.event_id) {
                wait.armed = true;
            }
        }
    }

    /// Whether a wait is outstanding for `room_id`
    pub fn is_waiting(&self, room_id: &OwnedRoomId) -> bool {
        self.inner.lock().waits.contains_key(room_id)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().waits.len()
    }

    /// Fail every outstanding wait with [`Error::Shutdown`] and refuse new ones.
    pub fn close_all(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        let drained: Vec<_> = inner.waits.drain().collect();
        drop(inner);

        if !drained.is_empty() {
            tracing::info!(count = drained.len(), "Failing pending waits on shutdown");
        }
        for (_, wait) in drained {
            wait.cancel.cancel();
            let _ = wait.reply.send(Err(Error::Shutdown));
        }
    }

    /// Terminate wait `id` in `room_id` with `outcome` if it is still pending
    fn finish(&self, room_id: &OwnedRoomId, id: u64, outcome: Result<Reply>) {
        let mut inner = self.inner.lock();
        if inner.waits.get(room_id).map(|w| w.id) != Some(id) {
            return;
        }
        if let Some(wait) = inner.waits.remove(room_id) {
            match &outcome {
                Err(Error::Timeout(_)) => {
                    tracing::info!(room_id = %room_id, timeout_secs = wait.timeout.as_secs_f64(), "Pending wait expired");
                }
                _ => tracing::debug!(room_id = %room_id, "Pending wait released"),
            }
            wait.cancel.cancel();
            let _ = wait.reply.send(outcome);
        }
    }
}

/// Caller's side of a registered wait. Dropping it cancels the wait.
pub struct WaitHandle {
    registry: PendingRegistry,
    room_id: OwnedRoomId,
    id: u64,
    timeout: Duration,
    reply: Option<oneshot::Receiver<Result<Reply>>>,
    cancel: CancellationToken,
}

impl WaitHandle {
    pub fn room_id(&self) -> &OwnedRoomId {
        &self.room_id
    }

    /// Token that cancels this wait from another task
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Name the sent event a reserved wait answers to and start its deadline.
    pub fn set_anchor(&self, anchor: OwnedEventId) -> Result<()> {
        let deadline = deadline_after(self.timeout)?;
        self.registry.attach_anchor(&self.room_id, self.id, anchor);
        self.start_timer(deadline);
        Ok(())
    }

    fn start_timer(&self, deadline: Instant) {
        let registry = self.registry.clone();
        let room_id = self.room_id.clone();
        let id = self.id;
        let timeout = self.timeout;
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    registry.finish(&room_id, id, Err(Error::Cancelled));
                }
                _ = tokio::time::sleep_until(deadline) => {
                    registry.finish(&room_id, id, Err(Error::Timeout(timeout)));
                }
            }
        });
    }

    /// Cancel the wait if it is still pending. Idempotent.
    pub fn cancel(&self) {
        self.registry
            .finish(&self.room_id, self.id, Err(Error::Cancelled));
    }

    /// Await the outcome: a reply, [`Error::Timeout`], [`Error::Cancelled`] or [`Error::Shutdown`].
    pub async fn wait(mut self) -> Result<Reply> {
        match self.reply.take() {
            Some(rx) => rx.await.unwrap_or(Err(Error::Shutdown)),
            None => Err(Error::Cancelled),
        }
    }
}

impl Drop for WaitHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Instant `timeout` from now; rejects zero and durations past the clock's range
fn deadline_after(timeout: Duration) -> Result<Instant> {
    if timeout.is_zero() {
        return Err(Error::InvalidArgument("timeout must be positive".to_string()));
    }
    Instant::now()
        .checked_add(timeout)
        .ok_or_else(|| Error::InvalidArgument(format!("timeout too large: {:?}", timeout)))
}

impl std::fmt::Debug for WaitHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitHandle")
            .field("room_id", &self.room_id)
            .field("id", &self.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(name: &str) -> OwnedUserId {
        format!("@{}:example.org", name).parse().unwrap()
    }

    fn room() -> OwnedRoomId {
        "!room:example.org".parse().unwrap()
    }

    fn message(id: &str, sender: &str, body: &str) -> MessageEvent {
        MessageEvent {
            room_id: room(),
            event_id: format!("${}", id).parse().unwrap(),
            sender: user(sender),
            timestamp: Utc::now(),
            msgtype: "m.text".to_string(),
            body: body.to_string(),
        }
    }

    #[tokio::test]
    async fn test_window_is_bounded() {
        let registry = PendingRegistry::new(user("bot"));
        for i in 0..(RECENT_WINDOW + 10) {
            registry.offer(&message(&format!("e{}", i), "alice", "x"));
        }
        let inner = registry.inner.lock();
        let window = inner.recent.get(&room()).unwrap();
        assert_eq!(window.len(), RECENT_WINDOW);
        assert_eq!(window.front().unwrap().event.event_id.as_str(), "$e10");
    }

    #[tokio::test]
    async fn test_backlog_arms_but_does_not_resolve() {
        let registry = PendingRegistry::new(user("bot"));
        let anchor: OwnedEventId = "$sent".parse().unwrap();
        let handle = registry
            .register(room(), None, Duration::from_secs(5), Some(anchor))
            .unwrap();

        registry.observe(&message("sent", "bot", "question"));
        registry.observe(&message("old", "alice", "stale"));
        assert!(registry.is_waiting(&room()));

        registry.offer(&message("live", "alice", "fresh"));
        let reply = handle.wait().await.unwrap();
        assert_eq!(reply.body, "fresh");
    }

    #[tokio::test]
    async fn test_zero_timeout_rejected() {
        let registry = PendingRegistry::new(user("bot"));
        assert!(matches!(
            registry.register(room(), None, Duration::ZERO, None),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_unrepresentable_timeout_rejected() {
        let registry = PendingRegistry::new(user("bot"));
        let huge = Duration::from_secs(u64::MAX);
        assert!(matches!(
            registry.register(room(), None, huge, None),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            registry.reserve(room(), None, huge),
            Err(Error::InvalidArgument(_))
        ));
        assert!(!registry.is_waiting(&room()));
    }

    #[tokio::test]
    async fn test_reserved_wait_ignores_messages_until_anchored() {
        let registry = PendingRegistry::new(user("bot"));
        let handle = registry.reserve(room(), None, Duration::from_secs(5)).unwrap();

        registry.offer(&message("early", "alice", "too soon"));
        assert!(registry.is_waiting(&room()));

        registry.offer(&message("sent", "bot", "question"));
        registry.offer(&message("answer", "alice", "here"));
        handle.set_anchor("$sent".parse().unwrap()).unwrap();

        let reply = handle.wait().await.unwrap();
        assert_eq!(reply.body, "here");
    }

    #[tokio::test]
    async fn test_dropped_reservation_frees_room() {
        let registry = PendingRegistry::new(user("bot"));
        let handle = registry.reserve(room(), None, Duration::from_secs(5)).unwrap();
        assert!(matches!(
            registry.reserve(room(), None, Duration::from_secs(5)),
            Err(Error::InProgress(_))
        ));
        drop(handle);
        assert!(!registry.is_waiting(&room()));
    }
}
