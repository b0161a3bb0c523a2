// ABOUTME: Exhaustive event model delivered by the sync loop, plus sync batch parsing.
// ABOUTME: Raw Client-Server JSON becomes Message/Membership/Other; malformed events are skipped.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use matrix_sdk::ruma::{OwnedEventId, OwnedRoomAliasId, OwnedRoomId, OwnedUserId};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// A text message posted to a room
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEvent {
    pub room_id: OwnedRoomId,
    pub event_id: OwnedEventId,
    pub sender: OwnedUserId,
    pub timestamp: DateTime<Utc>,
    /// `m.text`, `m.notice`, `m.emote`, ...
    pub msgtype: String,
    pub body: String,
}

/// Membership value carried by an `m.room.member` event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Membership {
    Join,
    Leave,
    Invite,
    Ban,
    Knock,
    Other(String),
}

impl Membership {
    pub fn parse(value: &str) -> Self {
        match value {
            "join" => Self::Join,
            "leave" => Self::Leave,
            "invite" => Self::Invite,
            "ban" => Self::Ban,
            "knock" => Self::Knock,
            other => Self::Other(other.to_string()),
        }
    }
}

/// A membership change of `target` in a room
#[derive(Debug, Clone, PartialEq)]
pub struct MembershipEvent {
    pub room_id: OwnedRoomId,
    pub event_id: Option<OwnedEventId>,
    pub sender: OwnedUserId,
    pub target: OwnedUserId,
    pub membership: Membership,
    pub timestamp: DateTime<Utc>,
}

/// Anything else; only logged
#[derive(Debug, Clone, PartialEq)]
pub struct OtherEvent {
    pub room_id: OwnedRoomId,
    pub event_id: Option<OwnedEventId>,
    pub sender: OwnedUserId,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Message(MessageEvent),
    Membership(MembershipEvent),
    Other(OtherEvent),
}

impl Event {
    pub fn room_id(&self) -> &OwnedRoomId {
        match self {
            Self::Message(e) => &e.room_id,
            Self::Membership(e) => &e.room_id,
            Self::Other(e) => &e.room_id,
        }
    }

    pub fn sender(&self) -> &OwnedUserId {
        match self {
            Self::Message(e) => &e.sender,
            Self::Membership(e) => &e.sender,
            Self::Other(e) => &e.sender,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Message(e) => e.timestamp,
            Self::Membership(e) => e.timestamp,
            Self::Other(e) => e.timestamp,
        }
    }

    /// Parse one raw timeline/state event belonging to `room_id`.
    pub fn from_raw(room_id: &OwnedRoomId, raw: &Value) -> Result<Self> {
        let raw: RawEvent = serde_json::from_value(raw.clone())
            .map_err(|e| Error::Protocol(format!("undecodable event: {}", e)))?;

        let sender: OwnedUserId = raw
            .sender
            .parse()
            .map_err(|e| Error::Protocol(format!("invalid sender '{}': {}", raw.sender, e)))?;
        let event_id = match raw.event_id.as_deref() {
            Some(id) => Some(
                id.parse::<OwnedEventId>()
                    .map_err(|e| Error::Protocol(format!("invalid event id '{}': {}", id, e)))?,
            ),
            None => None,
        };
        let timestamp = raw
            .origin_server_ts
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or_else(Utc::now);

        match raw.event_type.as_str() {
            "m.room.message" => {
                let body = raw.content.get("body").and_then(Value::as_str);
                match (body, event_id) {
                    (Some(body), Some(event_id)) => Ok(Self::Message(MessageEvent {
                        room_id: room_id.clone(),
                        event_id,
                        sender,
                        timestamp,
                        msgtype: raw
                            .content
                            .get("msgtype")
                            .and_then(Value::as_str)
                            .unwrap_or("m.text")
                            .to_string(),
                        body: body.to_string(),
                    })),
                    (None, event_id) => {
                        // redacted or non-text payload
                        Ok(Self::Other(OtherEvent {
                            room_id: room_id.clone(),
                            event_id,
                            sender,
                            event_type: raw.event_type.clone(),
                            timestamp,
                        }))
                    }
                    (Some(_), None) => Err(Error::Protocol(
                        "m.room.message without event_id".to_string(),
                    )),
                }
            }
            "m.room.member" => {
                let state_key = raw.state_key.as_deref().ok_or_else(|| {
                    Error::Protocol("m.room.member without state_key".to_string())
                })?;
                let target: OwnedUserId = state_key.parse().map_err(|e| {
                    Error::Protocol(format!("invalid member state_key '{}': {}", state_key, e))
                })?;
                let membership = raw
                    .content
                    .get("membership")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        Error::Protocol("m.room.member without membership".to_string())
                    })?;
                Ok(Self::Membership(MembershipEvent {
                    room_id: room_id.clone(),
                    event_id,
                    sender,
                    target,
                    membership: Membership::parse(membership),
                    timestamp,
                }))
            }
            _ => Ok(Self::Other(OtherEvent {
                room_id: room_id.clone(),
                event_id,
                sender,
                event_type: raw.event_type.clone(),
                timestamp,
            })),
        }
    }
}

/// Which section of a sync response a room appeared in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomSection {
    Joined,
    Left,
    Invited,
}

/// Everything one sync batch says about a single room
#[derive(Debug, Clone, PartialEq)]
pub struct RoomUpdate {
    pub room_id: OwnedRoomId,
    pub section: RoomSection,
    pub display_name: Option<String>,
    pub canonical_alias: Option<OwnedRoomAliasId>,
    /// Timeline events in server order
    pub events: Vec<Event>,
}

impl RoomUpdate {
    pub fn joined(room_id: OwnedRoomId) -> Self {
        Self {
            room_id,
            section: RoomSection::Joined,
            display_name: None,
            canonical_alias: None,
            events: Vec::new(),
        }
    }
}

/// One long-poll result: the next cursor plus per-room updates
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncBatch {
    pub next_batch: String,
    pub rooms: Vec<RoomUpdate>,
}

impl SyncBatch {
    /// Total number of timeline events across rooms
    pub fn event_count(&self) -> usize {
        self.rooms.iter().map(|r| r.events.len()).sum()
    }

    /// Decode a `/sync` response body. Malformed individual events and rooms are
    /// logged and dropped; only an undecodable envelope is an error.
    pub fn parse(body: Value) -> Result<Self> {
        let raw: RawSync = serde_json::from_value(body)
            .map_err(|e| Error::Protocol(format!("undecodable sync response: {}", e)))?;

        let mut rooms = Vec::new();
        let sections = [
            (RoomSection::Joined, raw.rooms.join),
            (RoomSection::Left, raw.rooms.leave),
        ];
        for (section, entries) in sections {
            for (room_id, room) in entries {
                let Ok(room_id) = room_id.parse::<OwnedRoomId>() else {
                    tracing::warn!(room_id = %room_id, "Skipping room with malformed id");
                    continue;
                };
                rooms.push(parse_room(room_id, section, room));
            }
        }
        for room_id in raw.rooms.invite.into_keys() {
            match room_id.parse::<OwnedRoomId>() {
                Ok(room_id) => rooms.push(RoomUpdate {
                    section: RoomSection::Invited,
                    ..RoomUpdate::joined(room_id)
                }),
                Err(_) => tracing::warn!(room_id = %room_id, "Skipping invite with malformed id"),
            }
        }

        Ok(Self {
            next_batch: raw.next_batch,
            rooms,
        })
    }
}

fn parse_room(room_id: OwnedRoomId, section: RoomSection, room: RawRoom) -> RoomUpdate {
    let mut update = RoomUpdate {
        section,
        ..RoomUpdate::joined(room_id)
    };

    // state first, timeline second: later values win
    for raw in room.state.events.iter().chain(room.timeline.events.iter()) {
        apply_room_state(&mut update, raw);
    }

    for raw in &room.timeline.events {
        match Event::from_raw(&update.room_id, raw) {
            Ok(event) => update.events.push(event),
            Err(e) => {
                tracing::warn!(room_id = %update.room_id, error = %e, "Skipping malformed event");
            }
        }
    }

    update
}

fn apply_room_state(update: &mut RoomUpdate, raw: &Value) {
    let event_type = raw.get("type").and_then(Value::as_str);
    let content = raw.get("content");
    match event_type {
        Some("m.room.name") => {
            update.display_name = content
                .and_then(|c| c.get("name"))
                .and_then(Value::as_str)
                .filter(|name| !name.is_empty())
                .map(str::to_string);
        }
        Some("m.room.canonical_alias") => {
            update.canonical_alias = content
                .and_then(|c| c.get("alias"))
                .and_then(Value::as_str)
                .and_then(|alias| alias.parse().ok());
        }
        _ => {}
    }
}

#[derive(Debug, Deserialize)]
struct RawSync {
    next_batch: String,
    #[serde(default)]
    rooms: RawRooms,
}

#[derive(Debug, Default, Deserialize)]
struct RawRooms {
    #[serde(default)]
    join: BTreeMap<String, RawRoom>,
    #[serde(default)]
    leave: BTreeMap<String, RawRoom>,
    #[serde(default)]
    invite: BTreeMap<String, Value>,
}

#[derive(Debug, Default, Deserialize)]
struct RawRoom {
    #[serde(default)]
    state: RawEvents,
    #[serde(default)]
    timeline: RawEvents,
}

#[derive(Debug, Default, Deserialize)]
struct RawEvents {
    #[serde(default)]
    events: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    event_type: String,
    sender: String,
    #[serde(default)]
    event_id: Option<String>,
    #[serde(default)]
    origin_server_ts: Option<i64>,
    #[serde(default)]
    state_key: Option<String>,
    #[serde(default)]
    content: Value,
}
