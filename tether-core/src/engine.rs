// ABOUTME: Engine owning session, room cache, registry, dispatcher, send pipeline and sync task.
// ABOUTME: Exposes send/wait/list operations and an explicit start/stop lifecycle.

use crate::config::Config;
use crate::dispatch::{Dispatcher, EventHandler};
use crate::error::{Error, Result};
use crate::pending::{PendingRegistry, Reply, WaitHandle};
use crate::rooms::{RoomCache, RoomSummary};
use crate::send::{SendPipeline, SentMessage};
use crate::session::SessionManager;
use crate::sync::{SyncLoop, SyncProgress};
use crate::transport::Homeserver;
use matrix_sdk::ruma::{OwnedUserId, UserId};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Steps of a send-then-wait exchange, traced for diagnosis
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExchangePhase {
    Sent,
    Waiting,
    Resolved,
    TimedOut,
    Cancelled,
    Failed,
}

impl ExchangePhase {
    fn terminal(outcome: &Result<Reply>) -> Self {
        match outcome {
            Ok(_) => Self::Resolved,
            Err(Error::Timeout(_)) => Self::TimedOut,
            Err(Error::Cancelled) => Self::Cancelled,
            Err(_) => Self::Failed,
        }
    }
}

enum Lifecycle {
    Idle,
    Running(JoinHandle<()>),
    Stopped,
}

/// Outcome of the engine run; `None` while it has not ended
type Closed = Option<std::result::Result<(), Error>>;

pub struct Engine {
    config: Config,
    own_user: OwnedUserId,
    session: Arc<SessionManager>,
    rooms: Arc<RoomCache>,
    registry: PendingRegistry,
    dispatcher: Arc<Dispatcher>,
    sender: SendPipeline,
    sync: Arc<SyncLoop>,
    lifecycle: Mutex<Lifecycle>,
    shutdown: CancellationToken,
    closed: Arc<watch::Sender<Closed>>,
}

impl Engine {
    /// Authenticate and assemble the engine. The sync task is not running until [`Engine::start`].
    pub async fn connect(config: Config, transport: Arc<dyn Homeserver>) -> Result<Self> {
        let session = Arc::new(SessionManager::new(
            Arc::clone(&transport),
            config.credentials(),
        ));
        let own_user = session.authenticate().await?;

        let rooms = Arc::new(RoomCache::new(
            Arc::clone(&session),
            Arc::clone(&transport),
            config.retry.clone(),
            own_user.clone(),
        ));
        let registry = PendingRegistry::new(own_user.clone());
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&rooms), registry.clone()));
        let sender = SendPipeline::new(
            Arc::clone(&session),
            Arc::clone(&transport),
            Arc::clone(&rooms),
            config.retry.clone(),
        );
        let sync = Arc::new(SyncLoop::new(
            Arc::clone(&session),
            transport,
            Arc::clone(&dispatcher),
            config.sync.clone(),
            config.retry.clone(),
        ));
        let (closed, _) = watch::channel(None);

        Ok(Self {
            config,
            own_user,
            session,
            rooms,
            registry,
            dispatcher,
            sender,
            sync,
            lifecycle: Mutex::new(Lifecycle::Idle),
            shutdown: CancellationToken::new(),
            closed: Arc::new(closed),
        })
    }

    /// Spawn the sync task. Calling it again while running is a no-op.
    pub fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        match *lifecycle {
            Lifecycle::Running(_) => return Ok(()),
            Lifecycle::Stopped => return Err(Error::Shutdown),
            Lifecycle::Idle => {}
        }

        let sync = Arc::clone(&self.sync);
        let shutdown = self.shutdown.clone();
        let registry = self.registry.clone();
        let closed = Arc::clone(&self.closed);
        let handle = tokio::spawn(async move {
            let result = sync.run(shutdown.clone()).await;
            match &result {
                Ok(()) => tracing::info!("Sync loop stopped"),
                Err(e) => tracing::error!(error = %e, "Sync loop failed, engine stopping"),
            }
            shutdown.cancel();
            registry.close_all();
            closed.send_if_modified(|state| {
                if state.is_none() {
                    *state = Some(result);
                    true
                } else {
                    false
                }
            });
        });

        *lifecycle = Lifecycle::Running(handle);
        tracing::info!(user_id = %self.user_id(), "Engine started");
        Ok(())
    }

    /// Stop syncing, fail outstanding waits with [`Error::Shutdown`], and log out.
    pub async fn stop(&self) {
        let previous = std::mem::replace(&mut *self.lifecycle.lock(), Lifecycle::Stopped);
        if matches!(previous, Lifecycle::Stopped) {
            return;
        }

        self.shutdown.cancel();
        if let Lifecycle::Running(handle) = previous {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Sync task ended abnormally");
            }
        }
        self.registry.close_all();
        self.session.logout().await;
        self.closed.send_if_modified(|state| {
            if state.is_none() {
                *state = Some(Ok(()));
                true
            } else {
                false
            }
        });
        tracing::info!("Engine stopped");
    }

    /// Resolves when the engine has stopped: Ok after [`Engine::stop`], Err on a fatal sync failure.
    pub async fn closed(&self) -> Result<()> {
        let mut rx = self.closed.subscribe();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(state) => (*state).clone(),
            Err(_) => None,
        };
        outcome.unwrap_or(Err(Error::Shutdown))
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.lifecycle.lock(), Lifecycle::Running(_)) && !self.shutdown.is_cancelled()
    }

    /// Wait for the next sync batch processed after this call.
    pub async fn next_sync(&self) -> Result<SyncProgress> {
        let mut rx = self.sync.subscribe();
        tokio::select! {
            changed = rx.changed() => {
                changed.map_err(|_| Error::Shutdown)?;
                Ok(rx.borrow_and_update().clone())
            }
            _ = self.shutdown.cancelled() => Err(Error::Shutdown),
        }
    }

    pub fn sync_progress(&self) -> SyncProgress {
        self.sync.progress()
    }

    /// Post `message` to `room` (id or alias).
    pub async fn send_message(
        &self,
        room: &str,
        message: &str,
        join_if_needed: bool,
    ) -> Result<SentMessage> {
        self.ensure_open()?;
        self.sender.send(room, message, join_if_needed).await
    }

    /// Send `message`, then wait for the first reply in the same room.
    ///
    /// Only replies that follow the sent message count. `response_from`
    /// restricts which sender may answer.
    pub async fn wait_for_response(
        &self,
        room: &str,
        message: &str,
        timeout: Duration,
        response_from: Option<&str>,
    ) -> Result<Reply> {
        self.ensure_open()?;
        let filter = parse_sender(response_from)?;
        // Claim the room before sending so a busy room never gets the message.
        // A failed send drops the handle, which releases the claim.
        let room_id = self.rooms.resolve(room).await?;
        let handle = self.registry.reserve(room_id.clone(), filter, timeout)?;

        let sent = self.sender.send(room_id.as_str(), message, true).await?;
        tracing::debug!(room_id = %sent.room_id, event_id = %sent.event_id, phase = ?ExchangePhase::Sent, "Exchange advanced");

        handle.set_anchor(sent.event_id.clone())?;
        tracing::debug!(room_id = %sent.room_id, phase = ?ExchangePhase::Waiting, "Exchange advanced");

        let outcome = handle.wait().await;
        tracing::debug!(room_id = %sent.room_id, phase = ?ExchangePhase::terminal(&outcome), "Exchange finished");
        outcome
    }

    /// Register a wait on `room` without sending anything first.
    pub async fn register_wait(
        &self,
        room: &str,
        response_from: Option<&str>,
        timeout: Duration,
    ) -> Result<WaitHandle> {
        self.ensure_open()?;
        let filter = parse_sender(response_from)?;
        let room_id = self.rooms.resolve(room).await?;
        self.registry.register(room_id, filter, timeout, None)
    }

    /// Joined rooms confirmed by sync
    pub fn list_rooms(&self) -> Vec<RoomSummary> {
        self.rooms.list_joined()
    }

    /// Add an observer for live events
    pub fn add_handler(&self, handler: Arc<dyn EventHandler>) {
        self.dispatcher.add_handler(handler);
    }

    pub fn user_id(&self) -> &OwnedUserId {
        &self.own_user
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn default_room(&self) -> Option<&str> {
        self.config.matrix.default_room.as_deref()
    }

    pub fn default_timeout(&self) -> Duration {
        self.config.wait.default_timeout()
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub fn rooms(&self) -> &RoomCache {
        &self.rooms
    }

    fn ensure_open(&self) -> Result<()> {
        if self.shutdown.is_cancelled() || matches!(*self.lifecycle.lock(), Lifecycle::Stopped) {
            return Err(Error::Shutdown);
        }
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn parse_sender(sender: Option<&str>) -> Result<Option<OwnedUserId>> {
    sender
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            UserId::parse(s)
                .map_err(|e| Error::InvalidArgument(format!("invalid user id '{}': {}", s, e)))
        })
        .transpose()
}
