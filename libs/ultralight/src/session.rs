//! The coordination-service collaborator.
//!
//! A [`Session`] is one client session against a cluster: node CRUD,
//! children listing, one-shot existence watches and a lifecycle event
//! stream. Backends implement [`SessionFactory`] to hand out fresh sessions;
//! the lock engine never talks to a cluster any other way.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::error::ServiceResult;

/// Lifecycle events emitted by a session after [`Session::connect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// The session is established and writable.
    Connected,
    /// The transport dropped; the server may still hold the session.
    Disconnected,
    /// Connected, but only to a read-only server.
    ConnectedReadOnly,
    /// The server expired the session.
    Expired,
    /// Credentials were rejected.
    AuthenticationFailed,
}

/// Receiving half of a session's lifecycle event stream.
pub type SessionEvents = mpsc::UnboundedReceiver<SessionEvent>;

/// How a node is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    Ephemeral,
    PersistentSequential,
    EphemeralSequential,
}

impl CreateMode {
    /// Removed automatically when the owning session ends.
    pub fn is_ephemeral(self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }

    /// The service appends a zero-padded sequence suffix to the name.
    pub fn is_sequential(self) -> bool {
        matches!(
            self,
            CreateMode::PersistentSequential | CreateMode::EphemeralSequential
        )
    }
}

/// The change that fired a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchedEvent {
    NodeCreated,
    NodeDeleted,
    NodeDataChanged,
    /// The session that installed the watch ended before any change.
    SessionClosed,
}

/// A one-shot watch on a single path.
#[derive(Debug)]
pub struct Watch {
    rx: oneshot::Receiver<WatchedEvent>,
}

impl Watch {
    /// Wrap the receiving end handed out by a backend.
    pub fn new(rx: oneshot::Receiver<WatchedEvent>) -> Self {
        Self { rx }
    }

    /// Resolves on the next change to the watched path. A backend that drops
    /// the sender without firing is reported as [`WatchedEvent::SessionClosed`].
    pub async fn changed(self) -> WatchedEvent {
        self.rx.await.unwrap_or(WatchedEvent::SessionClosed)
    }
}

/// The subset of node metadata the tree-walk utilities need.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeStat {
    /// Session id owning an ephemeral node, `0` for persistent nodes.
    pub ephemeral_owner: i64,
    pub num_children: usize,
}

impl NodeStat {
    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral_owner != 0
    }
}

/// One session against a coordination-service cluster.
///
/// `connect` and `close` only start the transition; the outcome arrives on the
/// [`SessionEvents`] stream handed out with the session.
#[async_trait]
pub trait Session: Send + Sync + fmt::Debug {
    /// Begin connecting. Emits [`SessionEvent::Connected`] on success.
    fn connect(&self);

    /// Tear the session down. Ephemeral nodes it owns are removed by the
    /// service.
    fn close(&self);

    /// Create every missing segment of `path` as a persistent node.
    async fn mkdir_all(&self, path: &str) -> ServiceResult<()>;

    /// Create a node and return the path actually created (which differs from
    /// `path` for sequential modes).
    async fn create(&self, path: &str, payload: &[u8], mode: CreateMode) -> ServiceResult<String>;

    /// Names (not paths) of the children of `path`.
    async fn get_children(&self, path: &str) -> ServiceResult<Vec<String>>;

    /// Children of `path` together with the node's own stat.
    async fn children_with_stat(&self, path: &str) -> ServiceResult<(Vec<String>, NodeStat)>;

    /// Whether `path` exists now, plus a watch firing on its next change.
    async fn exists(&self, path: &str) -> ServiceResult<(bool, Watch)>;

    /// Delete a node regardless of version.
    async fn remove(&self, path: &str) -> ServiceResult<()>;
}

/// Creates fresh, unconnected sessions for a cluster.
pub trait SessionFactory: Send + Sync + fmt::Debug {
    /// `servers` is the canonical comma-joined address list.
    fn create_session(
        &self,
        servers: &str,
        session_timeout: Option<Duration>,
    ) -> (Arc<dyn Session>, SessionEvents);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_watch_fires_with_event() {
        let (tx, rx) = oneshot::channel();
        let watch = Watch::new(rx);
        tx.send(WatchedEvent::NodeDeleted).unwrap();
        assert_eq!(watch.changed().await, WatchedEvent::NodeDeleted);
    }

    #[tokio::test]
    async fn test_watch_dropped_sender_is_session_closed() {
        let (tx, rx) = oneshot::channel::<WatchedEvent>();
        drop(tx);
        assert_eq!(Watch::new(rx).changed().await, WatchedEvent::SessionClosed);
    }

    #[test]
    fn test_create_mode_flags() {
        assert!(CreateMode::EphemeralSequential.is_ephemeral());
        assert!(CreateMode::EphemeralSequential.is_sequential());
        assert!(!CreateMode::Persistent.is_ephemeral());
        assert!(!CreateMode::Ephemeral.is_sequential());
        assert!(CreateMode::PersistentSequential.is_sequential());
    }
}
