// ABOUTME: Homeserver trait: the seam between the engine and the Client-Server API.
// ABOUTME: Every authenticated call takes the current access token explicitly.

pub mod http;

use crate::error::TransportError;
use crate::event::SyncBatch;
use async_trait::async_trait;
use matrix_sdk::ruma::{OwnedEventId, OwnedRoomId, OwnedUserId, RoomAliasId, RoomId};
use std::time::Duration;

pub use http::HttpHomeserver;

/// Result of a successful password login
#[derive(Debug, Clone, PartialEq)]
pub struct LoginResponse {
    pub user_id: OwnedUserId,
    pub access_token: String,
    pub device_id: String,
}

/// Parameters for one long-poll
#[derive(Debug, Clone, PartialEq)]
pub struct SyncRequest {
    /// Cursor from the previous batch; `None` for the initial sync
    pub since: Option<String>,
    /// How long the server may hold the request open
    pub timeout: Duration,
    /// Per-room timeline cap applied on the initial sync
    pub timeline_limit: Option<u32>,
}

/// Operations the engine needs from a homeserver.
///
/// Implementations classify failures into [`TransportError`]; retry and
/// reauthentication policy lives above this trait.
#[async_trait]
pub trait Homeserver: Send + Sync {
    /// Exchange a password for an access token. `device_id` is reused on renewal.
    async fn login(
        &self,
        user: &str,
        password: &str,
        device_name: &str,
        device_id: Option<&str>,
    ) -> Result<LoginResponse, TransportError>;

    async fn logout(&self, token: &str) -> Result<(), TransportError>;

    async fn sync(&self, token: &str, request: &SyncRequest)
        -> Result<SyncBatch, TransportError>;

    async fn resolve_alias(
        &self,
        token: &str,
        alias: &RoomAliasId,
    ) -> Result<OwnedRoomId, TransportError>;

    async fn join(&self, token: &str, room_id: &RoomId) -> Result<OwnedRoomId, TransportError>;

    /// Send an `m.text` message. `txn_id` makes retries idempotent.
    async fn send_text(
        &self,
        token: &str,
        room_id: &RoomId,
        txn_id: &str,
        body: &str,
    ) -> Result<OwnedEventId, TransportError>;
}
