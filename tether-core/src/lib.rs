// ABOUTME: Session and event engine for a Matrix account: auth lifecycle, sync loop, room cache.
// ABOUTME: Bridges the asynchronous event stream to send and request-then-wait operations.

pub mod backoff;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod event;
pub mod pending;
pub mod rooms;
pub mod send;
pub mod session;
pub mod sync;
pub mod testing;
pub mod transport;

pub use backoff::BackoffConfig;
pub use config::Config;
pub use dispatch::{EventHandler, LoggingHandler};
pub use engine::Engine;
pub use error::{Error, ErrorKind, Result, TransportError};
pub use event::{Event, MembershipEvent, MessageEvent, SyncBatch};
pub use pending::{Reply, WaitHandle};
pub use rooms::{MembershipState, RoomSummary};
pub use send::SentMessage;
pub use session::{Credentials, SessionState};
pub use sync::SyncProgress;
pub use transport::{Homeserver, HttpHomeserver};
