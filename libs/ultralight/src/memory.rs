//! In-process coordination service.
//!
//! [`MemoryCluster`] keeps a node tree, sessions and one-shot watches in
//! memory and hands out [`Session`]s that behave like a single-server
//! ZooKeeper ensemble: sequential names get a 10-digit zero-padded suffix from
//! a per-parent counter, ephemeral nodes disappear with their session, and
//! watches fire once on the next change to their path.
//!
//! It also exposes the fault hooks the tests use to expire sessions, refuse
//! connections or fail a single call.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::error::{ServiceError, ServiceResult};
use crate::session::{
    CreateMode, NodeStat, Session, SessionEvent, SessionEvents, SessionFactory, Watch,
    WatchedEvent,
};

/// A call that fault injection can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    MkdirAll,
    Create,
    GetChildren,
    Exists,
    Remove,
}

#[derive(Debug)]
struct Node {
    data: Bytes,
    ephemeral_owner: i64,
    /// next suffix handed to a sequential child
    next_sequence: u32,
}

impl Node {
    fn new(data: Bytes, ephemeral_owner: i64) -> Self {
        Self {
            data,
            ephemeral_owner,
            next_sequence: 0,
        }
    }
}

#[derive(Debug)]
struct SessionEntry {
    events: mpsc::UnboundedSender<SessionEvent>,
    live: bool,
}

#[derive(Debug)]
struct ClusterState {
    nodes: BTreeMap<String, Node>,
    sessions: HashMap<i64, SessionEntry>,
    watches: HashMap<String, Vec<(i64, oneshot::Sender<WatchedEvent>)>>,
    next_session_id: i64,
    sessions_created: usize,
    refuse_connections: bool,
    faults: HashMap<Operation, ServiceError>,
}

impl ClusterState {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node::new(Bytes::new(), 0));
        Self {
            nodes,
            sessions: HashMap::new(),
            watches: HashMap::new(),
            next_session_id: 1,
            sessions_created: 0,
            refuse_connections: false,
            faults: HashMap::new(),
        }
    }

    fn check_live(&self, session: i64) -> ServiceResult<()> {
        match self.sessions.get(&session) {
            Some(entry) if entry.live => Ok(()),
            _ => Err(ServiceError::ConnectionLoss(format!(
                "session 0x{session:x} is not connected"
            ))),
        }
    }

    fn take_fault(&mut self, op: Operation) -> ServiceResult<()> {
        match self.faults.remove(&op) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn fire(&mut self, path: &str, event: WatchedEvent) {
        if let Some(watches) = self.watches.remove(path) {
            trace!(path, ?event, count = watches.len(), "firing watches");
            for (_, tx) in watches {
                let _ = tx.send(event);
            }
        }
    }

    fn children(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        self.nodes
            .range(prefix.clone()..)
            .map(|(key, _)| key)
            .take_while(|key| key.starts_with(&prefix))
            .filter_map(|key| key.strip_prefix(&prefix))
            .filter(|rest| !rest.is_empty() && !rest.contains('/'))
            .map(str::to_string)
            .collect()
    }

    fn create(
        &mut self,
        path: &str,
        data: Bytes,
        mode: CreateMode,
        session: i64,
    ) -> ServiceResult<String> {
        let parent = parent_of(path)
            .ok_or_else(|| ServiceError::Other(format!("invalid path {path:?}")))?;
        let parent_node = self
            .nodes
            .get_mut(parent)
            .ok_or_else(|| ServiceError::NoParent(path.to_string()))?;
        if parent_node.ephemeral_owner != 0 {
            return Err(ServiceError::Other(format!(
                "ephemeral node {parent} cannot have children"
            )));
        }
        let sequence = parent_node.next_sequence;
        parent_node.next_sequence += 1;

        let created = if mode.is_sequential() {
            format!("{path}{sequence:010}")
        } else {
            path.to_string()
        };
        if self.nodes.contains_key(&created) {
            return Err(ServiceError::NodeExists(created));
        }
        let owner = if mode.is_ephemeral() { session } else { 0 };
        self.nodes.insert(created.clone(), Node::new(data, owner));
        self.fire(&created, WatchedEvent::NodeCreated);
        Ok(created)
    }

    fn remove(&mut self, path: &str) -> ServiceResult<()> {
        if !self.nodes.contains_key(path) || path == "/" {
            return Err(ServiceError::NoNode(path.to_string()));
        }
        if !self.children(path).is_empty() {
            return Err(ServiceError::Other(format!("node not empty: {path}")));
        }
        self.nodes.remove(path);
        self.fire(path, WatchedEvent::NodeDeleted);
        Ok(())
    }

    /// Drop a session's ephemeral nodes and watches.
    fn end_session(&mut self, session: i64) {
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.ephemeral_owner == session)
            .map(|(path, _)| path.clone())
            .collect();
        for path in owned {
            self.nodes.remove(&path);
            self.fire(&path, WatchedEvent::NodeDeleted);
        }
        for watches in self.watches.values_mut() {
            // dropping the sender reports SessionClosed
            watches.retain(|(owner, _)| *owner != session);
        }
        self.watches.retain(|_, watches| !watches.is_empty());
    }
}

/// Parent path of `path`, `None` for the root or a relative path.
fn parent_of(path: &str) -> Option<&str> {
    match path.rfind('/') {
        Some(0) if path.len() > 1 => Some("/"),
        Some(0) | None => None,
        Some(idx) => Some(&path[..idx]),
    }
}

/// A simulated cluster shared by every session it creates.
#[derive(Debug, Clone)]
pub struct MemoryCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCluster {
    /// An empty cluster holding only `/`.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ClusterState::new())),
        }
    }

    fn state(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// While set, `connect` never emits `Connected`.
    pub fn set_refuse_connections(&self, refuse: bool) {
        self.state().refuse_connections = refuse;
    }

    /// Fail the next call of `op` (on any session) with `err`.
    pub fn fail_next(&self, op: Operation, err: ServiceError) {
        self.state().faults.insert(op, err);
    }

    /// Number of sessions ever created against this cluster.
    pub fn sessions_created(&self) -> usize {
        self.state().sessions_created
    }

    /// Id of the most recently created session that has not been closed.
    pub fn latest_session_id(&self) -> Option<i64> {
        self.state().sessions.keys().max().copied()
    }

    /// Deliver a raw lifecycle event to a session's owner.
    pub fn emit(&self, session: i64, event: SessionEvent) {
        if let Some(entry) = self.state().sessions.get(&session) {
            let _ = entry.events.send(event);
        }
    }

    /// Expire a session on the "server": its ephemeral nodes and watches go
    /// away and its owner sees `Expired`.
    pub fn expire_session(&self, session: i64) {
        let mut state = self.state();
        debug!(session = format_args!("0x{session:x}"), "expiring session");
        state.end_session(session);
        if let Some(entry) = state.sessions.get_mut(&session) {
            entry.live = false;
            let _ = entry.events.send(SessionEvent::Expired);
        }
    }

    /// Drop a session's transport. The session (and its ephemerals) survive,
    /// but calls fail until it is replaced.
    pub fn disconnect_session(&self, session: i64) {
        let mut state = self.state();
        if let Some(entry) = state.sessions.get_mut(&session) {
            entry.live = false;
            let _ = entry.events.send(SessionEvent::Disconnected);
        }
    }

    /// Child names of `path`, sorted; empty if the node doesn't exist.
    pub fn children(&self, path: &str) -> Vec<String> {
        self.state().children(path)
    }

    /// Payload of `path`.
    pub fn data(&self, path: &str) -> Option<Bytes> {
        self.state().nodes.get(path).map(|node| node.data.clone())
    }

    pub fn contains(&self, path: &str) -> bool {
        self.state().nodes.contains_key(path)
    }
}

impl SessionFactory for MemoryCluster {
    fn create_session(
        &self,
        servers: &str,
        session_timeout: Option<Duration>,
    ) -> (Arc<dyn Session>, SessionEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state();
        let id = state.next_session_id;
        state.next_session_id += 1;
        state.sessions_created += 1;
        state.sessions.insert(
            id,
            SessionEntry {
                events: tx,
                live: false,
            },
        );
        trace!(servers, ?session_timeout, session = id, "created memory session");
        let session = MemorySession {
            cluster: self.clone(),
            id,
        };
        (Arc::new(session), rx)
    }
}

/// A session against a [`MemoryCluster`].
#[derive(Debug)]
pub struct MemorySession {
    cluster: MemoryCluster,
    id: i64,
}

impl MemorySession {
    /// Runs `f` against the cluster after a suspension point, failing if the
    /// session is not connected or a fault is armed for `op`.
    async fn call<T>(
        &self,
        op: Operation,
        f: impl FnOnce(&mut ClusterState) -> ServiceResult<T>,
    ) -> ServiceResult<T> {
        tokio::task::yield_now().await;
        let mut state = self.cluster.state();
        state.check_live(self.id)?;
        state.take_fault(op)?;
        f(&mut state)
    }
}

#[async_trait]
impl Session for MemorySession {
    fn connect(&self) {
        let mut state = self.cluster.state();
        if state.refuse_connections {
            debug!(session = self.id, "refusing connection");
            return;
        }
        if let Some(entry) = state.sessions.get_mut(&self.id) {
            entry.live = true;
            let _ = entry.events.send(SessionEvent::Connected);
        }
    }

    fn close(&self) {
        let mut state = self.cluster.state();
        state.end_session(self.id);
        state.sessions.remove(&self.id);
    }

    async fn mkdir_all(&self, path: &str) -> ServiceResult<()> {
        self.call(Operation::MkdirAll, |state| {
            let mut current = String::new();
            for segment in path.split('/').filter(|s| !s.is_empty()) {
                current.push('/');
                current.push_str(segment);
                if !state.nodes.contains_key(&current) {
                    state.create(&current, Bytes::new(), CreateMode::Persistent, 0)?;
                }
            }
            Ok(())
        })
        .await
    }

    async fn create(&self, path: &str, payload: &[u8], mode: CreateMode) -> ServiceResult<String> {
        let id = self.id;
        self.call(Operation::Create, |state| {
            state.create(path, Bytes::copy_from_slice(payload), mode, id)
        })
        .await
    }

    async fn get_children(&self, path: &str) -> ServiceResult<Vec<String>> {
        self.call(Operation::GetChildren, |state| {
            if !state.nodes.contains_key(path) {
                return Err(ServiceError::NoNode(path.to_string()));
            }
            Ok(state.children(path))
        })
        .await
    }

    async fn children_with_stat(&self, path: &str) -> ServiceResult<(Vec<String>, NodeStat)> {
        self.call(Operation::GetChildren, |state| {
            let owner = state
                .nodes
                .get(path)
                .map(|node| node.ephemeral_owner)
                .ok_or_else(|| ServiceError::NoNode(path.to_string()))?;
            let children = state.children(path);
            let stat = NodeStat {
                ephemeral_owner: owner,
                num_children: children.len(),
            };
            Ok((children, stat))
        })
        .await
    }

    async fn exists(&self, path: &str) -> ServiceResult<(bool, Watch)> {
        let id = self.id;
        self.call(Operation::Exists, |state| {
            let (tx, rx) = oneshot::channel();
            state
                .watches
                .entry(path.to_string())
                .or_default()
                .push((id, tx));
            Ok((state.nodes.contains_key(path), Watch::new(rx)))
        })
        .await
    }

    async fn remove(&self, path: &str) -> ServiceResult<()> {
        self.call(Operation::Remove, |state| state.remove(path)).await
    }
}
