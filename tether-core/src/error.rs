// ABOUTME: Error taxonomy for the engine and the transport beneath it.
// ABOUTME: Error carries a stable kind/code for callers; TransportError classifies wire failures.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias used throughout the engine
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by engine operations.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum Error {
    /// Credentials were rejected or the token could not be renewed.
    /// `retryable` distinguishes a transient renewal failure from a permanent rejection.
    #[error("authentication failed: {message}")]
    Auth { message: String, retryable: bool },

    /// Transport failure that survived local retries
    #[error("network error: {0}")]
    Network(String),

    #[error("room not found: {0}")]
    RoomNotFound(String),

    #[error("join forbidden for {room}: {reason}")]
    JoinForbidden { room: String, reason: String },

    #[error("not joined to room {0}")]
    NotJoined(String),

    #[error("no response received within {} seconds", .0.as_secs_f64())]
    Timeout(Duration),

    #[error("a wait is already in progress for room {0}")]
    InProgress(String),

    /// Malformed payload from the server
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("wait cancelled")]
    Cancelled,

    #[error("engine is shut down")]
    Shutdown,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Coarse error classes callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Auth,
    Network,
    Room,
    NotJoined,
    Timeout,
    InProgress,
    Protocol,
    Cancelled,
    Shutdown,
    InvalidArgument,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Auth { .. } => ErrorKind::Auth,
            Self::Network(_) => ErrorKind::Network,
            Self::RoomNotFound(_) | Self::JoinForbidden { .. } => ErrorKind::Room,
            Self::NotJoined(_) => ErrorKind::NotJoined,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::InProgress(_) => ErrorKind::InProgress,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Shutdown => ErrorKind::Shutdown,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
        }
    }

    /// Static error code string, stable across releases.
    #[inline]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Auth { .. } => "auth_error",
            Self::Network(_) => "network_error",
            Self::RoomNotFound(_) => "room_not_found",
            Self::JoinForbidden { .. } => "join_forbidden",
            Self::NotJoined(_) => "not_joined",
            Self::Timeout(_) => "timeout",
            Self::InProgress(_) => "in_progress",
            Self::Protocol(_) => "protocol_error",
            Self::Cancelled => "cancelled",
            Self::Shutdown => "shutdown",
            Self::InvalidArgument(_) => "invalid_argument",
        }
    }

    /// Whether a local retry with backoff may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}

/// Failures reported by a [`crate::transport::Homeserver`] implementation.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    /// Access token missing, unknown or expired (401 / M_UNKNOWN_TOKEN)
    #[error("unauthorized: {message}")]
    Unauthorized { message: String, soft_logout: bool },

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Any other 4xx; retrying will not help
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("network: {0}")]
    Network(String),

    #[error("malformed response: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Failures that a bounded retry may clear
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::RateLimited { .. } | Self::Protocol(_)
        )
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized { .. })
    }

    /// Server-requested delay before the next attempt, if any
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Unauthorized { message, .. } => Error::Auth {
                message,
                retryable: true,
            },
            TransportError::Forbidden(msg) => Error::Auth {
                message: msg,
                retryable: false,
            },
            TransportError::NotFound(msg) => Error::RoomNotFound(msg),
            TransportError::Rejected(msg) => Error::Protocol(msg),
            TransportError::RateLimited { .. } => Error::Network("rate limited".to_string()),
            TransportError::Network(msg) => Error::Network(msg),
            TransportError::Protocol(msg) => Error::Protocol(msg),
        }
    }
}
