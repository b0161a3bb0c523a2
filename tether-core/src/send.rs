// ABOUTME: Send pipeline: resolve the target room, ensure membership, transmit a text message.
// ABOUTME: One transaction id per message makes transport retries idempotent.

use crate::backoff::{Backoff, BackoffConfig};
use crate::error::{Error, Result, TransportError};
use crate::rooms::RoomCache;
use crate::session::SessionManager;
use crate::transport::Homeserver;
use chrono::{DateTime, Utc};
use matrix_sdk::ruma::{OwnedEventId, OwnedRoomId, RoomId};
use std::sync::Arc;
use uuid::Uuid;

/// Acknowledgment of a transmitted message
#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub event_id: OwnedEventId,
    pub room_id: OwnedRoomId,
    pub timestamp: DateTime<Utc>,
}

pub struct SendPipeline {
    session: Arc<SessionManager>,
    transport: Arc<dyn Homeserver>,
    rooms: Arc<RoomCache>,
    retry: BackoffConfig,
}

impl SendPipeline {
    pub fn new(
        session: Arc<SessionManager>,
        transport: Arc<dyn Homeserver>,
        rooms: Arc<RoomCache>,
        retry: BackoffConfig,
    ) -> Self {
        Self {
            session,
            transport,
            rooms,
            retry,
        }
    }

    /// Send `text` to `room` (id or alias), joining first when `join_if_needed`.
    pub async fn send(&self, room: &str, text: &str, join_if_needed: bool) -> Result<SentMessage> {
        if text.trim().is_empty() {
            return Err(Error::InvalidArgument("message must not be empty".to_string()));
        }

        let room_id = self.rooms.resolve(room).await?;
        self.rooms.ensure_joined(&room_id, join_if_needed).await?;

        let txn_id = Uuid::new_v4().to_string();
        let event_id = Backoff::new(&self.retry).retry("send message", || {
            self.transmit(&room_id, &txn_id, text)
        })
        .await?;

        tracing::info!(room_id = %room_id, event_id = %event_id, "Message sent");
        Ok(SentMessage {
            event_id,
            room_id,
            timestamp: Utc::now(),
        })
    }

    async fn transmit(&self, room_id: &RoomId, txn_id: &str, text: &str) -> Result<OwnedEventId> {
        self.session
            .call_mapped(
                |token| {
                    let transport = Arc::clone(&self.transport);
                    let room_id = room_id.to_owned();
                    let txn_id = txn_id.to_string();
                    let text = text.to_string();
                    async move { transport.send_text(&token, &room_id, &txn_id, &text).await }
                },
                |err| match err {
                    // typically M_FORBIDDEN "not in room"
                    TransportError::Forbidden(_) => Error::NotJoined(room_id.to_string()),
                    TransportError::NotFound(_) => Error::RoomNotFound(room_id.to_string()),
                    other => other.into(),
                },
            )
            .await
    }
}
