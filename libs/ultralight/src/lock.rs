//! Lock negotiation over sequential ephemeral nodes.
//!
//! A lock named `/critical/section` is negotiated among siblings of the lock
//! node rather than children of it, so the lock path itself never has to
//! exist as a node: every contender creates `/critical/section<seq>` in
//! ephemeral-sequential mode and the lowest sequence number holds the lock.
//! Everyone else watches only the contender immediately ahead of it, so an
//! unlock wakes exactly one waiter.

use std::fmt;

use bytes::Bytes;
use tokio::sync::watch;
use tracing::{debug, error, trace, warn};

use crate::connection::{Connection, ConnectionState};
use crate::error::{LockError, LockResult, ServiceError};
use crate::session::CreateMode;

/// Identifies the holder of a lock. Written as the lock node's payload so an
/// operator can see who holds what; plays no part in ordering.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OwnerToken(Bytes);

impl OwnerToken {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for OwnerToken {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for OwnerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl From<Bytes> for OwnerToken {
    fn from(value: Bytes) -> Self {
        Self(value)
    }
}

impl From<Vec<u8>> for OwnerToken {
    fn from(value: Vec<u8>) -> Self {
        Self(Bytes::from(value))
    }
}

impl From<&[u8]> for OwnerToken {
    fn from(value: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(value))
    }
}

impl<const N: usize> From<&[u8; N]> for OwnerToken {
    fn from(value: &[u8; N]) -> Self {
        Self(Bytes::copy_from_slice(value))
    }
}

impl From<String> for OwnerToken {
    fn from(value: String) -> Self {
        Self(Bytes::from(value))
    }
}

impl From<&str> for OwnerToken {
    fn from(value: &str) -> Self {
        Self(Bytes::copy_from_slice(value.as_bytes()))
    }
}

/// A lock name split into the directory its contenders live in and the base
/// name they share.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPath<'a> {
    name: &'a str,
    /// directory including the trailing `/`
    dir: &'a str,
    base: &'a str,
}

impl<'a> LockPath<'a> {
    /// Validate a lock name: absolute, with a non-empty final segment.
    pub fn parse(name: &'a str) -> LockResult<Self> {
        if !name.starts_with('/') {
            return Err(LockError::InvalidArgument(format!(
                "lock name must begin with \"/\": {name:?}"
            )));
        }
        // starts with '/', so there is always a slash
        let split = name.rfind('/').unwrap_or(0);
        let (dir, base) = (&name[..=split], &name[split + 1..]);
        if base.is_empty() {
            return Err(LockError::InvalidArgument(format!(
                "lock name must not end with \"/\": {name:?}"
            )));
        }
        Ok(Self { name, dir, base })
    }

    /// The full lock name.
    pub fn name(&self) -> &'a str {
        self.name
    }

    /// The final path segment contenders are created with.
    pub fn base(&self) -> &'a str {
        self.base
    }

    /// The node whose children are the contenders, without trailing `/`
    /// (except for the root).
    pub fn parent(&self) -> &'a str {
        if self.dir.len() <= 1 {
            self.dir
        } else {
            &self.dir[..self.dir.len() - 1]
        }
    }

    /// Sequence suffix of a node created for this lock, if it is one.
    pub fn rank_of<'n>(&self, node: &'n str) -> Option<&'n str> {
        node.strip_prefix(self.dir)?
            .strip_prefix(self.base)
            .filter(|rank| is_sequence(rank))
    }

    /// Sequence suffixes of the children belonging to this lock, ascending.
    ///
    /// Suffixes are zero-padded to equal width, so string order is numeric
    /// order.
    pub fn sibling_ranks<'c>(&self, children: &'c [String]) -> Vec<&'c str> {
        let mut ranks: Vec<&str> = children
            .iter()
            .filter_map(|child| child.strip_prefix(self.base))
            .filter(|rank| is_sequence(rank))
            .collect();
        ranks.sort_unstable();
        ranks
    }

    /// Full path of the contender with sequence suffix `rank`.
    pub fn node_path(&self, rank: &str) -> String {
        format!("{}{}{rank}", self.dir, self.base)
    }
}

/// Resolves once the connection is no longer CONNECTED.
async fn until_disconnected(state: &mut watch::Receiver<ConnectionState>) {
    loop {
        if *state.borrow_and_update() != ConnectionState::Connected {
            return;
        }
        if state.changed().await.is_err() {
            return;
        }
    }
}

fn is_sequence(rank: &str) -> bool {
    !rank.is_empty() && rank.bytes().all(|b| b.is_ascii_digit())
}

impl Connection {
    /// Acquire the lock `name`, waiting behind every earlier contender.
    ///
    /// Returns the path of the node now holding the lock. Waits indefinitely
    /// while earlier contenders hold it; fails as soon as the session leaves
    /// CONNECTED. Requests for the same name on one connection queue behind
    /// each other like requests from different processes.
    pub async fn lock(&self, name: &str, owner: impl Into<OwnerToken>) -> LockResult<String> {
        let path = LockPath::parse(name)?;
        let owner = owner.into();
        debug!(lock = name, %owner, "lock requested");

        self.wait_connected().await?;

        let session = self.connected_session("create lock path").await?;
        session.mkdir_all(path.parent()).await?;

        let session = self.connected_session("create lock node").await?;
        let node = session
            .create(name, owner.as_bytes(), CreateMode::EphemeralSequential)
            .await?;
        trace!(lock = name, node, "created lock node");

        match self.negotiate(&path, &node).await {
            Ok(()) => {
                debug!(lock = name, node, %owner, "locked");
                Ok(node)
            }
            Err(err) => {
                self.abandon(&node).await;
                Err(err)
            }
        }
    }

    /// Loop until `node` has the lowest sequence number among the lock's
    /// contenders, parking on the immediate predecessor between rounds.
    async fn negotiate(&self, path: &LockPath<'_>, node: &str) -> LockResult<()> {
        let own = path.rank_of(node).ok_or_else(|| {
            ServiceError::Other(format!("created node {node} is not a contender for {}", path.name()))
        })?;
        let mut state = self.subscribe_state();

        loop {
            let session = self.connected_session("list lock contenders").await?;
            let children = session.get_children(path.parent()).await.map_err(|err| {
                error!(%err, parent = path.parent(), lock = path.base(), "error obtaining children");
                err
            })?;
            if self.state() != ConnectionState::Connected {
                return Err(LockError::NotConnected("list lock contenders".into()));
            }

            let ranks = path.sibling_ranks(&children);
            let predecessor = match ranks.binary_search(&own) {
                Ok(0) => {
                    self.record_held(path.name(), node).await;
                    return Ok(());
                }
                Ok(position) => path.node_path(ranks[position - 1]),
                Err(_) => {
                    // our own node is gone: deleted externally or with the session
                    return Err(ServiceError::NoNode(node.to_string()).into());
                }
            };

            let session = self.connected_session("watch lock predecessor").await?;
            let (exists, predecessor_watch) = session.exists(&predecessor).await?;
            if !exists {
                continue;
            }
            trace!(node, predecessor, "waiting on predecessor");
            tokio::select! {
                event = predecessor_watch.changed() => {
                    trace!(node, predecessor, ?event, "predecessor changed");
                }
                _ = until_disconnected(&mut state) => {
                    return Err(LockError::NotConnected("wait for lock predecessor".into()));
                }
            }
        }
    }

    /// Remove a node whose negotiation failed so it does not block later
    /// contenders for the rest of the session.
    async fn abandon(&self, node: &str) {
        let Ok(session) = self.connected_session("abandon lock node").await else {
            return;
        };
        if let Err(err) = session.remove(node).await {
            debug!(node, %err, "failed to remove abandoned lock node");
        }
    }

    async fn record_held(&self, name: &str, node: &str) {
        let mut inner = self.shared.inner.lock().await;
        if let Some(stale) = inner.locks.insert(name.to_string(), node.to_string()) {
            warn!(lock = name, stale, node, "replaced stale lock table entry");
        }
    }

    /// Release the lock `name` held through this connection.
    ///
    /// The lock table entry is dropped even if the delete fails: an
    /// ephemeral node that could not be deleted goes away with its session.
    pub async fn unlock(&self, name: &str) -> LockResult<()> {
        debug!(lock = name, "unlock requested");
        self.wait_connected().await?;

        let (session, node) = {
            let mut inner = self.shared.inner.lock().await;
            let session = inner
                .connected_session()
                .ok_or_else(|| LockError::NotConnected(format!("unlock {name}")))?;
            let node = inner
                .locks
                .remove(name)
                .ok_or_else(|| LockError::NoSuchLock(name.to_string()))?;
            (session, node)
        };

        match session.remove(&node).await {
            Ok(()) => {
                debug!(lock = name, node, "unlocked");
                Ok(())
            }
            Err(err) => {
                warn!(lock = name, node, %err, "error deleting lock node");
                Err(err.into())
            }
        }
    }

    /// The node currently held for `name`, if any.
    pub async fn held(&self, name: &str) -> Option<String> {
        self.shared.inner.lock().await.locks.get(name).cloned()
    }
}
