// ABOUTME: Scriptable in-memory homeserver for tests: logins, aliases, joins, sends and a sync stream.
// ABOUTME: Tests inject room updates and failures; sends are recorded and echoed back through sync.

use crate::error::TransportError;
use crate::event::{
    Event, Membership, MembershipEvent, MessageEvent, RoomSection, RoomUpdate, SyncBatch,
};
use crate::transport::{Homeserver, LoginResponse, SyncRequest};
use async_trait::async_trait;
use chrono::Utc;
use matrix_sdk::ruma::{
    OwnedEventId, OwnedRoomAliasId, OwnedRoomId, OwnedUserId, RoomAliasId, RoomId, UserId,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

/// One message accepted by [`MockHomeserver::send_text`]
#[derive(Debug, Clone, PartialEq)]
pub struct SentRecord {
    pub room_id: OwnedRoomId,
    pub txn_id: String,
    pub body: String,
    pub event_id: OwnedEventId,
}

enum SyncStep {
    Rooms(Vec<RoomUpdate>),
    Fail(TransportError),
}

struct MockState {
    user_id: OwnedUserId,
    password: String,
    token: Option<String>,
    issued_tokens: u64,
    login_count: usize,
    login_devices: Vec<Option<String>>,
    login_failures: VecDeque<TransportError>,
    login_delay: Duration,
    logout_count: usize,
    aliases: HashMap<OwnedRoomAliasId, OwnedRoomId>,
    alias_queries: usize,
    joined: HashSet<OwnedRoomId>,
    forbidden: HashSet<OwnedRoomId>,
    join_count: usize,
    join_failures: VecDeque<TransportError>,
    sent: Vec<SentRecord>,
    send_attempts: usize,
    send_failures: VecDeque<TransportError>,
    transactions: HashMap<(OwnedRoomId, String), OwnedEventId>,
    echo: bool,
    initial: Vec<RoomUpdate>,
    sync_requests: Vec<Option<String>>,
    next_event: u64,
    next_batch: u64,
}

impl MockState {
    fn check_token(&self, token: &str) -> Result<(), TransportError> {
        match &self.token {
            Some(current) if current == token => Ok(()),
            _ => Err(TransportError::Unauthorized {
                message: "M_UNKNOWN_TOKEN: Unrecognised access token".to_string(),
                soft_logout: false,
            }),
        }
    }

    fn mint_event_id(&mut self) -> OwnedEventId {
        self.next_event += 1;
        mock_event_id(&format!("m{}", self.next_event))
    }

    fn cursor(&mut self) -> String {
        self.next_batch += 1;
        format!("s{}", self.next_batch)
    }
}

/// In-memory [`Homeserver`] whose behavior is scripted by the test.
pub struct MockHomeserver {
    state: Mutex<MockState>,
    inbound_tx: mpsc::UnboundedSender<SyncStep>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<SyncStep>>,
    sends: Notify,
}

impl MockHomeserver {
    /// Server for `user_id` accepting `password`
    pub fn new(user_id: &str, password: &str) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            state: Mutex::new(MockState {
                user_id: mock_user(user_id),
                password: password.to_string(),
                token: None,
                issued_tokens: 0,
                login_count: 0,
                login_devices: Vec::new(),
                login_failures: VecDeque::new(),
                login_delay: Duration::ZERO,
                logout_count: 0,
                aliases: HashMap::new(),
                alias_queries: 0,
                joined: HashSet::new(),
                forbidden: HashSet::new(),
                join_count: 0,
                join_failures: VecDeque::new(),
                sent: Vec::new(),
                send_attempts: 0,
                send_failures: VecDeque::new(),
                transactions: HashMap::new(),
                echo: true,
                initial: Vec::new(),
                sync_requests: Vec::new(),
                next_event: 0,
                next_batch: 0,
            }),
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            sends: Notify::new(),
        }
    }

    pub fn user_id(&self) -> OwnedUserId {
        self.state.lock().user_id.clone()
    }

    // ─── scripting ─────────────────────────────────────────────────

    /// Invalidate the current access token; the next authed call gets 401
    pub fn expire_token(&self) {
        self.state.lock().token = None;
    }

    pub fn set_password(&self, password: &str) {
        self.state.lock().password = password.to_string();
    }

    pub fn set_login_delay(&self, delay: Duration) {
        self.state.lock().login_delay = delay;
    }

    pub fn fail_next_login(&self, err: TransportError) {
        self.state.lock().login_failures.push_back(err);
    }

    pub fn add_alias(&self, alias: &str, room_id: &str) {
        self.state
            .lock()
            .aliases
            .insert(mock_alias(alias), mock_room(room_id));
    }

    /// Room the account is already in; reported by the initial sync
    pub fn add_joined_room(&self, room_id: &str) {
        let room_id = mock_room(room_id);
        let mut state = self.state.lock();
        state.joined.insert(room_id.clone());
        state.initial.push(RoomUpdate::joined(room_id));
    }

    /// Extra room updates returned by the initial sync
    pub fn add_initial_update(&self, update: RoomUpdate) {
        self.state.lock().initial.push(update);
    }

    /// Joins to `room_id` are rejected with 403
    pub fn forbid_join(&self, room_id: &str) {
        self.state.lock().forbidden.insert(mock_room(room_id));
    }

    pub fn fail_next_join(&self, err: TransportError) {
        self.state.lock().join_failures.push_back(err);
    }

    pub fn fail_next_send(&self, err: TransportError) {
        self.state.lock().send_failures.push_back(err);
    }

    /// Whether sends are echoed into the sync stream (default on)
    pub fn set_echo(&self, echo: bool) {
        self.state.lock().echo = echo;
    }

    /// Deliver one batch with these updates on the next long-poll
    pub fn push_batch(&self, rooms: Vec<RoomUpdate>) {
        let _ = self.inbound_tx.send(SyncStep::Rooms(rooms));
    }

    pub fn push_update(&self, update: RoomUpdate) {
        self.push_batch(vec![update]);
    }

    /// Deliver a text message from `sender`; returns its event id
    pub fn push_message(&self, room_id: &str, sender: &str, body: &str) -> OwnedEventId {
        let event_id = self.state.lock().mint_event_id();
        let room_id = mock_room(room_id);
        let mut update = RoomUpdate::joined(room_id.clone());
        update
            .events
            .push(message_event(&room_id, &event_id, sender, body));
        self.push_update(update);
        event_id
    }

    /// Fail the next long-poll with `err`
    pub fn fail_next_sync(&self, err: TransportError) {
        let _ = self.inbound_tx.send(SyncStep::Fail(err));
    }

    // ─── inspection ────────────────────────────────────────────────

    pub fn login_count(&self) -> usize {
        self.state.lock().login_count
    }

    /// Device id passed to each login, in order
    pub fn login_devices(&self) -> Vec<Option<String>> {
        self.state.lock().login_devices.clone()
    }

    pub fn logout_count(&self) -> usize {
        self.state.lock().logout_count
    }

    pub fn alias_queries(&self) -> usize {
        self.state.lock().alias_queries
    }

    pub fn join_count(&self) -> usize {
        self.state.lock().join_count
    }

    pub fn sent(&self) -> Vec<SentRecord> {
        self.state.lock().sent.clone()
    }

    /// Send requests received, including rejected and retried ones
    pub fn send_attempts(&self) -> usize {
        self.state.lock().send_attempts
    }

    /// `since` cursor of every sync request, in order
    pub fn sync_requests(&self) -> Vec<Option<String>> {
        self.state.lock().sync_requests.clone()
    }

    /// Wait until at least `count` messages have been accepted
    pub async fn wait_for_sends(&self, count: usize) {
        loop {
            let notified = self.sends.notified();
            if self.state.lock().sent.len() >= count {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl Homeserver for MockHomeserver {
    async fn login(
        &self,
        user: &str,
        password: &str,
        _device_name: &str,
        device_id: Option<&str>,
    ) -> Result<LoginResponse, TransportError> {
        let delay = self.state.lock().login_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        state.login_count += 1;
        state.login_devices.push(device_id.map(str::to_string));
        if let Some(err) = state.login_failures.pop_front() {
            return Err(err);
        }

        let user_matches = user == state.user_id.as_str() || user == state.user_id.localpart();
        if !user_matches || password != state.password {
            return Err(TransportError::Forbidden(
                "M_FORBIDDEN: Invalid username or password".to_string(),
            ));
        }

        state.issued_tokens += 1;
        let token = format!("token-{}", state.issued_tokens);
        state.token = Some(token.clone());
        Ok(LoginResponse {
            user_id: state.user_id.clone(),
            access_token: token,
            device_id: device_id.unwrap_or("MOCKDEVICE").to_string(),
        })
    }

    async fn logout(&self, token: &str) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.check_token(token)?;
        state.token = None;
        state.logout_count += 1;
        Ok(())
    }

    async fn sync(
        &self,
        token: &str,
        request: &SyncRequest,
    ) -> Result<SyncBatch, TransportError> {
        {
            let mut state = self.state.lock();
            state.check_token(token)?;
            state.sync_requests.push(request.since.clone());
            if request.since.is_none() {
                let rooms = state.initial.clone();
                let next_batch = state.cursor();
                return Ok(SyncBatch { next_batch, rooms });
            }
        }

        let mut inbound = self.inbound_rx.lock().await;
        let first = tokio::select! {
            step = inbound.recv() => step,
            _ = tokio::time::sleep(request.timeout) => None,
        };

        let rooms = match first {
            Some(SyncStep::Fail(err)) => return Err(err),
            Some(SyncStep::Rooms(updates)) => updates,
            None => Vec::new(),
        };
        drop(inbound);

        let next_batch = self.state.lock().cursor();
        Ok(SyncBatch { next_batch, rooms })
    }

    async fn resolve_alias(
        &self,
        token: &str,
        alias: &RoomAliasId,
    ) -> Result<OwnedRoomId, TransportError> {
        let mut state = self.state.lock();
        state.check_token(token)?;
        state.alias_queries += 1;
        state
            .aliases
            .get(alias)
            .cloned()
            .ok_or_else(|| TransportError::NotFound(format!("M_NOT_FOUND: Room alias {} not found", alias)))
    }

    async fn join(&self, token: &str, room_id: &RoomId) -> Result<OwnedRoomId, TransportError> {
        let room_id = room_id.to_owned();
        {
            let mut state = self.state.lock();
            state.check_token(token)?;
            state.join_count += 1;
            if let Some(err) = state.join_failures.pop_front() {
                return Err(err);
            }
            if state.forbidden.contains(&room_id) {
                return Err(TransportError::Forbidden(
                    "M_FORBIDDEN: You are not invited to this room".to_string(),
                ));
            }
            state.joined.insert(room_id.clone());
        }

        let own_user = self.user_id();
        let mut update = RoomUpdate::joined(room_id.clone());
        update
            .events
            .push(membership_event(&room_id, own_user.as_str(), Membership::Join));
        self.push_update(update);
        Ok(room_id)
    }

    async fn send_text(
        &self,
        token: &str,
        room_id: &RoomId,
        txn_id: &str,
        body: &str,
    ) -> Result<OwnedEventId, TransportError> {
        let room_id = room_id.to_owned();
        let (event_id, echo) = {
            let mut state = self.state.lock();
            state.check_token(token)?;
            state.send_attempts += 1;
            if let Some(err) = state.send_failures.pop_front() {
                return Err(err);
            }
            if !state.joined.contains(&room_id) {
                return Err(TransportError::Forbidden(format!(
                    "M_FORBIDDEN: User {} not in room {}",
                    state.user_id, room_id
                )));
            }
            let key = (room_id.clone(), txn_id.to_string());
            if let Some(existing) = state.transactions.get(&key) {
                return Ok(existing.clone());
            }

            let event_id = state.mint_event_id();
            state.transactions.insert(key, event_id.clone());
            state.sent.push(SentRecord {
                room_id: room_id.clone(),
                txn_id: txn_id.to_string(),
                body: body.to_string(),
                event_id: event_id.clone(),
            });
            let echo = state.echo.then(|| {
                let mut update = RoomUpdate::joined(room_id.clone());
                update.events.push(message_event(
                    &room_id,
                    &event_id,
                    state.user_id.as_str(),
                    body,
                ));
                update
            });
            (event_id, echo)
        };

        if let Some(update) = echo {
            self.push_update(update);
        }
        self.sends.notify_waiters();
        Ok(event_id)
    }
}

// ─── event helpers ─────────────────────────────────────────────────

/// Parse helpers that panic on malformed ids; test inputs are literals.
pub fn mock_room(room_id: &str) -> OwnedRoomId {
    RoomId::parse(room_id).unwrap_or_else(|e| panic!("bad room id {room_id}: {e}"))
}

pub fn mock_user(user_id: &str) -> OwnedUserId {
    UserId::parse(user_id).unwrap_or_else(|e| panic!("bad user id {user_id}: {e}"))
}

pub fn mock_alias(alias: &str) -> OwnedRoomAliasId {
    RoomAliasId::parse(alias).unwrap_or_else(|e| panic!("bad alias {alias}: {e}"))
}

/// `id` without the leading `$`
pub fn mock_event_id(id: &str) -> OwnedEventId {
    format!("${}", id.trim_start_matches('$'))
        .parse()
        .unwrap_or_else(|e| panic!("bad event id {id}: {e}"))
}

pub fn message_event(room_id: &RoomId, event_id: &OwnedEventId, sender: &str, body: &str) -> Event {
    Event::Message(MessageEvent {
        room_id: room_id.to_owned(),
        event_id: event_id.clone(),
        sender: mock_user(sender),
        timestamp: Utc::now(),
        msgtype: "m.text".to_string(),
        body: body.to_string(),
    })
}

pub fn membership_event(room_id: &RoomId, target: &str, membership: Membership) -> Event {
    let target = mock_user(target);
    Event::Membership(MembershipEvent {
        room_id: room_id.to_owned(),
        event_id: None,
        sender: target.clone(),
        target,
        membership,
        timestamp: Utc::now(),
    })
}

/// Room update placing `room_id` in the `leave` section
pub fn left_update(room_id: &str) -> RoomUpdate {
    RoomUpdate {
        section: RoomSection::Left,
        ..RoomUpdate::joined(mock_room(room_id))
    }
}
