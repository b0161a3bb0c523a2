// ABOUTME: Event dispatcher routing sync events to the room cache, the pending registry and observers.
// ABOUTME: Runs inline on the sync task; handlers must not block.

use crate::event::{Event, SyncBatch};
use crate::pending::PendingRegistry;
use crate::rooms::RoomCache;
use parking_lot::RwLock;
use std::sync::Arc;

/// Observer of live events. Called on the sync task, so slow work belongs in `tokio::spawn`.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &Event);
}

/// Logs every live message at info level
#[derive(Debug, Default)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &Event) {
        if let Event::Message(msg) = event {
            tracing::info!(
                room_id = %msg.room_id,
                sender = %msg.sender,
                body = %msg.body,
                "Message received"
            );
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    pub rooms: usize,
    pub events: usize,
    /// Events routed as live traffic
    pub dispatched: usize,
}

pub struct Dispatcher {
    rooms: Arc<RoomCache>,
    registry: PendingRegistry,
    observers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl Dispatcher {
    pub fn new(rooms: Arc<RoomCache>, registry: PendingRegistry) -> Self {
        Self {
            rooms,
            registry,
            observers: RwLock::new(Vec::new()),
        }
    }

    /// Observers run after built-in handling, in registration order
    pub fn add_handler(&self, handler: Arc<dyn EventHandler>) {
        self.observers.write().push(handler);
    }

    /// Apply a batch. Room state always reaches the cache; events are routed as
    /// live traffic only when `live` is set.
    pub fn dispatch_batch(&self, batch: &SyncBatch, live: bool) -> DispatchStats {
        let mut stats = DispatchStats {
            rooms: batch.rooms.len(),
            ..DispatchStats::default()
        };

        for update in &batch.rooms {
            self.rooms.apply_room_update(update);
            for event in &update.events {
                stats.events += 1;
                if live {
                    self.dispatch(event);
                    stats.dispatched += 1;
                } else {
                    self.absorb_backlog(event);
                }
            }
        }
        stats
    }

    /// Route one live event.
    pub fn dispatch(&self, event: &Event) {
        match event {
            Event::Message(msg) => self.registry.offer(msg),
            Event::Membership(change) => self.rooms.apply_membership(change),
            Event::Other(other) => {
                tracing::trace!(
                    room_id = %other.room_id,
                    event_type = %other.event_type,
                    "Ignoring event"
                );
            }
        }

        let observers = self.observers.read().clone();
        for observer in observers {
            observer.handle(event);
        }
    }

    fn absorb_backlog(&self, event: &Event) {
        match event {
            Event::Message(msg) => self.registry.observe(msg),
            Event::Membership(change) => self.rooms.apply_membership(change),
            Event::Other(_) => {}
        }
    }
}
