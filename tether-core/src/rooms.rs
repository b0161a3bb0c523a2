// ABOUTME: Room state cache: joined rooms, display names, alias resolution and join coordination.
// ABOUTME: Sync batches are authoritative for membership; joins are serialized per room.

use crate::backoff::{Backoff, BackoffConfig};
use crate::error::{Error, Result, TransportError};
use crate::event::{Membership, MembershipEvent, RoomSection, RoomUpdate};
use crate::session::SessionManager;
use crate::transport::Homeserver;
use matrix_sdk::ruma::{OwnedRoomAliasId, OwnedRoomId, OwnedUserId, RoomAliasId, RoomId};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Allowance per join attempt on top of the backoff sleeps when waiting on another caller's join
const JOIN_ATTEMPT_ALLOWANCE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipState {
    NotJoined,
    JoinPending,
    Joined,
}

/// Cached view of one room
#[derive(Debug, Clone)]
pub struct Room {
    pub room_id: OwnedRoomId,
    pub aliases: BTreeSet<OwnedRoomAliasId>,
    pub display_name: Option<String>,
    pub canonical_alias: Option<OwnedRoomAliasId>,
    pub membership: MembershipState,
    /// Set once a sync batch has reported the room as joined
    pub sync_confirmed: bool,
    last_join_error: Option<Error>,
}

impl Room {
    fn new(room_id: OwnedRoomId) -> Self {
        Self {
            room_id,
            aliases: BTreeSet::new(),
            display_name: None,
            canonical_alias: None,
            membership: MembershipState::NotJoined,
            sync_confirmed: false,
            last_join_error: None,
        }
    }
}

/// Entry returned by [`RoomCache::list_joined`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSummary {
    pub room_id: OwnedRoomId,
    pub canonical_alias: Option<OwnedRoomAliasId>,
    pub display_name: Option<String>,
}

pub struct RoomCache {
    session: Arc<SessionManager>,
    transport: Arc<dyn Homeserver>,
    retry: BackoffConfig,
    own_user: OwnedUserId,
    rooms: RwLock<HashMap<OwnedRoomId, Room>>,
    aliases: RwLock<HashMap<OwnedRoomAliasId, OwnedRoomId>>,
    /// Bumped whenever a membership changes; wakes callers waiting on another join
    changes: watch::Sender<u64>,
}

impl RoomCache {
    pub fn new(
        session: Arc<SessionManager>,
        transport: Arc<dyn Homeserver>,
        retry: BackoffConfig,
        own_user: OwnedUserId,
    ) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            session,
            transport,
            retry,
            own_user,
            rooms: RwLock::new(HashMap::new()),
            aliases: RwLock::new(HashMap::new()),
            changes,
        }
    }

    /// Resolve a room id (`!...`) or alias (`#...`) to a room id.
    ///
    /// Aliases are queried at most once; later calls are served from the cache.
    pub async fn resolve(&self, room: &str) -> Result<OwnedRoomId> {
        let room = room.trim();
        if room.starts_with('!') {
            return OwnedRoomId::try_from(room)
                .map_err(|e| Error::RoomNotFound(format!("invalid room id '{}': {}", room, e)));
        }
        if !room.starts_with('#') {
            return Err(Error::RoomNotFound(format!(
                "'{}' is neither a room id (!...) nor an alias (#...)",
                room
            )));
        }

        let alias = OwnedRoomAliasId::try_from(room)
            .map_err(|e| Error::RoomNotFound(format!("invalid room alias '{}': {}", room, e)))?;
        if let Some(room_id) = self.aliases.read().get(&alias) {
            return Ok(room_id.clone());
        }

        let room_id = Backoff::new(&self.retry).retry("resolve alias", || self.query_alias(&alias)).await?;
        tracing::debug!(alias = %alias, room_id = %room_id, "Resolved room alias");
        self.remember_alias(alias, room_id.clone());
        Ok(room_id)
    }

    async fn query_alias(&self, alias: &RoomAliasId) -> Result<OwnedRoomId> {
        self.session
            .call_mapped(
                |token| {
                    let transport = Arc::clone(&self.transport);
                    let alias = alias.to_owned();
                    async move { transport.resolve_alias(&token, &alias).await }
                },
                |err| match err {
                    TransportError::NotFound(_) => Error::RoomNotFound(alias.to_string()),
                    other => other.into(),
                },
            )
            .await
    }

    fn remember_alias(&self, alias: OwnedRoomAliasId, room_id: OwnedRoomId) {
        self.aliases.write().insert(alias.clone(), room_id.clone());
        self.rooms
            .write()
            .entry(room_id.clone())
            .or_insert_with(|| Room::new(room_id))
            .aliases
            .insert(alias);
    }

    /// Make sure the account is joined to `room_id`.
    ///
    /// Without `allow_join` a room that is not joined fails with
    /// [`Error::NotJoined`] and nothing is sent. A join already in flight from
    /// another caller is awaited rather than duplicated.
    pub async fn ensure_joined(&self, room_id: &RoomId, allow_join: bool) -> Result<()> {
        let mut changes = self.changes.subscribe();
        let deadline = tokio::time::Instant::now() + self.join_wait_budget();
        let mut waited = false;

        loop {
            let must_join = {
                let mut rooms = self.rooms.write();
                let state = rooms
                    .get(room_id)
                    .map(|r| r.membership)
                    .unwrap_or(MembershipState::NotJoined);
                match state {
                    MembershipState::Joined => return Ok(()),
                    MembershipState::NotJoined if waited => {
                        let err = rooms
                            .get(room_id)
                            .and_then(|r| r.last_join_error.clone())
                            .unwrap_or_else(|| Error::NotJoined(room_id.to_string()));
                        return Err(err);
                    }
                    MembershipState::NotJoined if !allow_join => {
                        return Err(Error::NotJoined(room_id.to_string()));
                    }
                    MembershipState::NotJoined => {
                        let room = rooms
                            .entry(room_id.to_owned())
                            .or_insert_with(|| Room::new(room_id.to_owned()));
                        room.membership = MembershipState::JoinPending;
                        room.last_join_error = None;
                        true
                    }
                    MembershipState::JoinPending => false,
                }
            };

            if must_join {
                return self.join(room_id).await;
            }

            tracing::debug!(room_id = %room_id, "Join already in progress, waiting for its outcome");
            match tokio::time::timeout_at(deadline, changes.changed()).await {
                Ok(Ok(())) => waited = true,
                Ok(Err(_)) => return Err(Error::Shutdown),
                Err(_) => {
                    return Err(Error::Network(format!(
                        "timed out waiting for join of {}",
                        room_id
                    )));
                }
            }
        }
    }

    fn join_wait_budget(&self) -> Duration {
        self.retry.total_delay() + JOIN_ATTEMPT_ALLOWANCE * (self.retry.max_retries + 1)
    }

    async fn join(&self, room_id: &RoomId) -> Result<()> {
        tracing::info!(room_id = %room_id, "Joining room");
        let result = Backoff::new(&self.retry).retry("join room", || self.request_join(room_id)).await;

        let outcome = {
            let mut rooms = self.rooms.write();
            let room = rooms
                .entry(room_id.to_owned())
                .or_insert_with(|| Room::new(room_id.to_owned()));
            match result {
                Ok(_) => {
                    // acknowledged; sync_confirmed waits for the next batch
                    room.membership = MembershipState::Joined;
                    tracing::info!(room_id = %room_id, "Joined room");
                    Ok(())
                }
                // sync already reported the join while the request was failing
                Err(_) if room.membership == MembershipState::Joined => Ok(()),
                Err(err) => {
                    tracing::warn!(room_id = %room_id, error = %err, "Join failed");
                    room.membership = MembershipState::NotJoined;
                    room.last_join_error = Some(err.clone());
                    Err(err)
                }
            }
        };
        self.notify();
        outcome
    }

    async fn request_join(&self, room_id: &RoomId) -> Result<OwnedRoomId> {
        self.session
            .call_mapped(
                |token| {
                    let transport = Arc::clone(&self.transport);
                    let room_id = room_id.to_owned();
                    async move { transport.join(&token, &room_id).await }
                },
                |err| match err {
                    TransportError::Forbidden(reason) => Error::JoinForbidden {
                        room: room_id.to_string(),
                        reason,
                    },
                    TransportError::NotFound(_) => Error::RoomNotFound(room_id.to_string()),
                    other => other.into(),
                },
            )
            .await
    }

    /// Rooms that are joined and confirmed by sync, sorted by room id.
    pub fn list_joined(&self) -> Vec<RoomSummary> {
        let rooms = self.rooms.read();
        let mut joined: Vec<RoomSummary> = rooms
            .values()
            .filter(|r| r.membership == MembershipState::Joined && r.sync_confirmed)
            .map(|r| RoomSummary {
                room_id: r.room_id.clone(),
                canonical_alias: r.canonical_alias.clone(),
                display_name: r.display_name.clone(),
            })
            .collect();
        joined.sort_by(|a, b| a.room_id.cmp(&b.room_id));
        joined
    }

    pub fn membership(&self, room_id: &RoomId) -> MembershipState {
        self.rooms
            .read()
            .get(room_id)
            .map(|r| r.membership)
            .unwrap_or(MembershipState::NotJoined)
    }

    /// Snapshot of a cached room
    pub fn room(&self, room_id: &RoomId) -> Option<Room> {
        self.rooms.read().get(room_id).cloned()
    }

    /// Apply the room-level part of a sync batch.
    pub fn apply_room_update(&self, update: &RoomUpdate) {
        let changed = {
            let mut rooms = self.rooms.write();
            let room = rooms
                .entry(update.room_id.clone())
                .or_insert_with(|| Room::new(update.room_id.clone()));
            let before = room.membership;

            match update.section {
                RoomSection::Joined => {
                    room.membership = MembershipState::Joined;
                    room.sync_confirmed = true;
                }
                RoomSection::Left => {
                    room.membership = MembershipState::NotJoined;
                    room.sync_confirmed = false;
                }
                RoomSection::Invited => {
                    tracing::debug!(room_id = %update.room_id, "Invited to room");
                }
            }
            if let Some(name) = &update.display_name {
                room.display_name = Some(name.clone());
            }
            if let Some(alias) = &update.canonical_alias {
                room.canonical_alias = Some(alias.clone());
                room.aliases.insert(alias.clone());
            }
            before != room.membership
        };

        if let Some(alias) = &update.canonical_alias {
            self.aliases
                .write()
                .insert(alias.clone(), update.room_id.clone());
        }
        if changed {
            self.notify();
        }
    }

    /// Apply a membership event; only changes of the engine's own user matter.
    pub fn apply_membership(&self, event: &MembershipEvent) {
        if event.target != self.own_user {
            return;
        }
        let changed = {
            let mut rooms = self.rooms.write();
            let room = rooms
                .entry(event.room_id.clone())
                .or_insert_with(|| Room::new(event.room_id.clone()));
            let before = room.membership;
            match event.membership {
                Membership::Join => room.membership = MembershipState::Joined,
                Membership::Leave | Membership::Ban => {
                    tracing::info!(room_id = %event.room_id, membership = ?event.membership, "No longer in room");
                    room.membership = MembershipState::NotJoined;
                    room.sync_confirmed = false;
                }
                _ => {}
            }
            before != room.membership
        };
        if changed {
            self.notify();
        }
    }

    fn notify(&self) {
        self.changes.send_modify(|version| *version += 1);
    }
}
