//! Error types for lock negotiation and session management.
//!
//! [`ServiceError`] is what a coordination-service backend reports for a
//! single call. [`LockError`] is what callers of [`Connection`] see; it wraps
//! service errors and adds the connection-level failures (timeouts, session
//! loss, unknown locks).
//!
//! Both are `Clone`: a single session failure is delivered to every caller
//! waiting on the same connection.
//!
//! [`Connection`]: crate::connection::Connection

use std::time::Duration;

use thiserror::Error;

/// Why a session became unusable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionFailure {
    /// The server only granted a read-only session; locking needs writes.
    ReadOnly,
    /// The session expired on the server; its ephemeral nodes are gone.
    Expired,
    /// Authentication against the cluster failed.
    AuthenticationFailed,
}

impl std::fmt::Display for SessionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionFailure::ReadOnly => f.write_str("connected read-only"),
            SessionFailure::Expired => f.write_str("session expired"),
            SessionFailure::AuthenticationFailed => f.write_str("authentication failed"),
        }
    }
}

/// A failed call against the coordination service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    /// The node does not exist.
    #[error("no node: {0}")]
    NoNode(String),

    /// The node already exists.
    #[error("node exists: {0}")]
    NodeExists(String),

    /// The parent of the node to create does not exist.
    #[error("parent missing for: {0}")]
    NoParent(String),

    /// The session handle is not connected (never connected, or closed).
    #[error("connection loss: {0}")]
    ConnectionLoss(String),

    /// The session expired while the call was in flight.
    #[error("session expired")]
    SessionExpired,

    /// Any other backend failure.
    #[error("{0}")]
    Other(String),
}

/// Top-level error type for lock operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    /// The lock name is not an absolute coordination-service path.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Waiting for the connection exceeded its deadline. Poisons the connection.
    #[error("timed out after {0:?} waiting for connection")]
    ConnectionTimeout(Duration),

    /// The session reported a terminal condition. Poisons the connection.
    #[error("session error: {0}")]
    Session(SessionFailure),

    /// The connection left CONNECTED between steps of an operation.
    #[error("not connected while attempting to {0}")]
    NotConnected(String),

    /// The coordination service rejected a call; propagated verbatim.
    #[error("coordination service error: {0}")]
    Service(#[from] ServiceError),

    /// `unlock` for a name this connection does not hold.
    #[error("lock not held: {0}")]
    NoSuchLock(String),
}

impl LockError {
    /// Returns true for failures that poison the connection until it reconnects.
    pub fn is_session_failure(&self) -> bool {
        matches!(
            self,
            LockError::Session(_) | LockError::ConnectionTimeout(_)
        )
    }

    /// Returns true if this error is a connection timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, LockError::ConnectionTimeout(_))
    }

    /// Returns true if calling `lock`/`unlock` again may succeed: the
    /// next call reconnects a poisoned connection.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LockError::ConnectionTimeout(_)
                | LockError::Session(_)
                | LockError::NotConnected(_)
                | LockError::Service(ServiceError::ConnectionLoss(_))
                | LockError::Service(ServiceError::SessionExpired)
        )
    }
}

/// Shorthand result alias for backend calls.
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Shorthand result alias for lock operations.
pub type LockResult<T> = Result<T, LockError>;
