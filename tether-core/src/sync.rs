// ABOUTME: Transport sync loop: long-polls the homeserver and feeds batches to the dispatcher.
// ABOUTME: Suppresses startup backlog, renews expired tokens, and backs off on transient failures.

use crate::backoff::{Backoff, BackoffConfig};
use crate::config::SyncConfig;
use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use crate::session::SessionManager;
use crate::transport::{Homeserver, SyncRequest};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Published after every processed batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncProgress {
    pub batches: u64,
    pub cursor: Option<String>,
}

pub struct SyncLoop {
    session: Arc<SessionManager>,
    transport: Arc<dyn Homeserver>,
    dispatcher: Arc<Dispatcher>,
    config: SyncConfig,
    retry: BackoffConfig,
    progress: watch::Sender<SyncProgress>,
}

impl SyncLoop {
    pub fn new(
        session: Arc<SessionManager>,
        transport: Arc<dyn Homeserver>,
        dispatcher: Arc<Dispatcher>,
        config: SyncConfig,
        retry: BackoffConfig,
    ) -> Self {
        let (progress, _) = watch::channel(SyncProgress::default());
        Self {
            session,
            transport,
            dispatcher,
            config,
            retry,
            progress,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncProgress> {
        self.progress.subscribe()
    }

    pub fn progress(&self) -> SyncProgress {
        self.progress.borrow().clone()
    }

    /// Run until `shutdown` fires (Ok) or a failure cannot be recovered (Err).
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let started = Instant::now();
        let mut cursor: Option<String> = None;
        let mut batches: u64 = 0;
        let mut backoff = Backoff::new(&self.retry);

        tracing::info!(
            timeout_ms = self.config.timeout_ms,
            grace_ms = self.config.grace_ms,
            "Sync loop started"
        );

        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }

            let lease = match self.session.ensure_valid().await {
                Ok(lease) => lease,
                Err(Error::Auth {
                    message,
                    retryable: true,
                }) => {
                    let delay = backoff.fail().ok_or_else(|| Error::Auth {
                        message: message.clone(),
                        retryable: false,
                    })?;
                    tracing::warn!(error = %message, delay_ms = delay.as_millis() as u64, "Session renewal failed, retrying");
                    if !sleep_or_shutdown(delay, &shutdown).await {
                        return Ok(());
                    }
                    continue;
                }
                Err(err) => {
                    tracing::error!(error = %err, "Session unusable, stopping sync");
                    return Err(err);
                }
            };

            let request = SyncRequest {
                since: cursor.clone(),
                timeout: self.config.timeout(),
                timeline_limit: cursor
                    .is_none()
                    .then_some(self.config.initial_timeline_limit),
            };

            let result = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                result = self.transport.sync(&lease.token, &request) => result,
            };

            match result {
                Ok(batch) => {
                    backoff.reset();
                    let live = batches > 0 && started.elapsed() >= self.config.grace();
                    let stats = self.dispatcher.dispatch_batch(&batch, live);
                    batches += 1;
                    cursor = Some(batch.next_batch);
                    tracing::debug!(
                        batch = batches,
                        rooms = stats.rooms,
                        events = stats.events,
                        live,
                        "Sync batch processed"
                    );
                    self.progress.send_replace(SyncProgress {
                        batches,
                        cursor: cursor.clone(),
                    });
                }
                Err(err) if err.is_unauthorized() => {
                    self.session.mark_expired(lease.generation);
                    // A server that rejects every fresh token would otherwise spin on login.
                    let Some(delay) = backoff.fail() else {
                        tracing::error!(error = %err, "Sync token rejected after every renewal");
                        return Err(Error::Auth {
                            message: format!(
                                "sync token rejected {} times in a row: {}",
                                backoff.failures(),
                                err
                            ),
                            retryable: false,
                        });
                    };
                    tracing::warn!(
                        error = %err,
                        attempt = backoff.failures(),
                        delay_ms = delay.as_millis() as u64,
                        "Sync token rejected, renewing session"
                    );
                    if !sleep_or_shutdown(delay, &shutdown).await {
                        return Ok(());
                    }
                }
                Err(err) => {
                    let Some(delay) = backoff.fail() else {
                        tracing::error!(error = %err, "Sync retries exhausted");
                        return Err(Error::Network(format!(
                            "sync failed after {} attempts: {}",
                            backoff.failures(),
                            err
                        )));
                    };
                    let delay = err.retry_after().unwrap_or(delay);
                    tracing::warn!(
                        error = %err,
                        attempt = backoff.failures(),
                        delay_ms = delay.as_millis() as u64,
                        "Sync failed, backing off"
                    );
                    if !sleep_or_shutdown(delay, &shutdown).await {
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Sleep for `delay`; false if shutdown fired first
async fn sleep_or_shutdown(delay: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
