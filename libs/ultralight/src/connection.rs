//! Connection lifecycle state machine.
//!
//! A [`Connection`] supervises one session against a cluster. Callers never
//! connect explicitly: [`Connection::wait_connected`] starts a session when
//! the connection is CLOSED or in ERROR and parks the caller on a one-shot
//! completion until the next CONNECTED or ERROR transition. Every caller
//! waiting at the same time shares that single connect attempt.

use std::{
    collections::HashMap,
    sync::{Arc, Weak},
    time::Duration,
};

use tokio::{
    sync::{Mutex, oneshot, watch},
    task::JoinHandle,
};
use tracing::{debug, trace, warn};

use crate::error::{LockError, LockResult, SessionFailure};
use crate::session::{Session, SessionEvent, SessionEvents, SessionFactory};

/// Default time a caller waits for the connection to become usable.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(16);

/// Observable state of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No usable session. Initial state.
    Closed,
    /// A session was created and is connecting.
    Connecting,
    /// The session is established and writable.
    Connected,
    /// The session failed or a wait timed out; the next caller reconnects.
    Error,
}

/// Per-connection settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// Session timeout requested from the cluster; backend default when `None`.
    pub session_timeout: Option<Duration>,
    /// How long [`Connection::wait_connected`] waits before failing.
    pub connect_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            session_timeout: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl ConnectionOptions {
    /// Use `timeout` both as the session timeout and as the connect deadline.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            session_timeout: Some(timeout),
            connect_timeout: timeout,
        }
    }
}

type Waiter = oneshot::Sender<LockResult<()>>;

/// Mutable state, guarded by the connection mutex. Never held across an await.
pub(crate) struct ConnectionInner {
    state: ConnectionState,
    session: Option<Arc<dyn Session>>,
    /// forwards session events into state changes
    pump: Option<JoinHandle<()>>,
    /// bumped on every new session so a stale pump can't touch the state
    generation: u64,
    waiters: Vec<Waiter>,
    /// lock name -> node path held for it
    pub(crate) locks: HashMap<String, String>,
}

impl ConnectionInner {
    /// The live session, only while CONNECTED.
    pub(crate) fn connected_session(&self) -> Option<Arc<dyn Session>> {
        match self.state {
            ConnectionState::Connected => self.session.clone(),
            _ => None,
        }
    }

    /// Close and forget the current session, if any.
    fn teardown(&mut self) -> bool {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        match self.session.take() {
            Some(session) => {
                session.close();
                true
            }
            None => false,
        }
    }
}

pub(crate) struct Shared {
    servers: String,
    options: ConnectionOptions,
    factory: Arc<dyn SessionFactory>,
    pub(crate) inner: Mutex<ConnectionInner>,
    state_tx: watch::Sender<ConnectionState>,
}

impl Shared {
    /// Transition to `to`, resolving waiters on CONNECTED and ERROR.
    ///
    /// Repeating the current state is a no-op, except ERROR: every error is
    /// delivered.
    fn change_state(
        &self,
        inner: &mut ConnectionInner,
        to: ConnectionState,
        error: Option<LockError>,
    ) {
        if inner.state == to && to != ConnectionState::Error {
            return;
        }
        debug!(
            servers = %self.servers,
            from = ?inner.state,
            ?to,
            ?error,
            "connection state change"
        );
        inner.state = to;
        self.state_tx.send_replace(to);

        match to {
            ConnectionState::Connected => {
                for waiter in inner.waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
            }
            ConnectionState::Error => {
                let error =
                    error.unwrap_or_else(|| LockError::NotConnected("use the connection".into()));
                for waiter in inner.waiters.drain(..) {
                    let _ = waiter.send(Err(error.clone()));
                }
            }
            ConnectionState::Closed | ConnectionState::Connecting => {}
        }
    }

    /// Start a new session. Only valid from CLOSED or ERROR.
    fn connect(self: &Arc<Self>, inner: &mut ConnectionInner) {
        match inner.state {
            ConnectionState::Closed | ConnectionState::Error => {}
            ConnectionState::Connecting | ConnectionState::Connected => {
                warn!(
                    servers = %self.servers,
                    state = ?inner.state,
                    "unexpected state in connect, ignoring"
                );
                return;
            }
        }

        if inner.teardown() {
            trace!(servers = %self.servers, "closed previous session before reconnecting");
        }
        let (session, events) = self
            .factory
            .create_session(&self.servers, self.options.session_timeout);
        inner.generation += 1;
        inner.pump = Some(tokio::spawn(pump_events(
            Arc::downgrade(self),
            inner.generation,
            events,
        )));
        inner.session = Some(Arc::clone(&session));

        self.change_state(inner, ConnectionState::Connecting, None);
        session.connect();
    }
}

/// Map session lifecycle events onto state transitions until the session is
/// replaced or the connection is dropped.
async fn pump_events(shared: Weak<Shared>, generation: u64, mut events: SessionEvents) {
    while let Some(event) = events.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        let mut inner = shared.inner.lock().await;
        if inner.generation != generation {
            break;
        }
        let (to, error) = match event {
            SessionEvent::Connected => (ConnectionState::Connected, None),
            SessionEvent::Disconnected => (ConnectionState::Closed, None),
            SessionEvent::ConnectedReadOnly => (
                ConnectionState::Error,
                Some(LockError::Session(SessionFailure::ReadOnly)),
            ),
            SessionEvent::Expired => (
                ConnectionState::Error,
                Some(LockError::Session(SessionFailure::Expired)),
            ),
            SessionEvent::AuthenticationFailed => (
                ConnectionState::Error,
                Some(LockError::Session(SessionFailure::AuthenticationFailed)),
            ),
        };
        trace!(?event, "session event");
        shared.change_state(&mut inner, to, error);
    }
}

/// One logical session to a coordination-service cluster, plus the locks held
/// through it.
///
/// Cheap to clone; clones share the session and the lock table.
#[derive(Clone)]
pub struct Connection {
    pub(crate) shared: Arc<Shared>,
}

impl Connection {
    /// Create a CLOSED connection. Nothing is contacted until first use.
    pub fn new(
        servers: impl Into<String>,
        options: ConnectionOptions,
        factory: Arc<dyn SessionFactory>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Closed);
        Self {
            shared: Arc::new(Shared {
                servers: servers.into(),
                options,
                factory,
                inner: Mutex::new(ConnectionInner {
                    state: ConnectionState::Closed,
                    session: None,
                    pump: None,
                    generation: 0,
                    waiters: Vec::new(),
                    locks: HashMap::new(),
                }),
                state_tx,
            }),
        }
    }

    /// The comma-joined server list this connection talks to.
    pub fn servers(&self) -> &str {
        &self.shared.servers
    }

    /// Timeouts this connection was created with.
    pub fn options(&self) -> ConnectionOptions {
        self.shared.options
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    /// Subscribe to state transitions.
    pub(crate) fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Wait until the connection is CONNECTED, connecting if needed.
    ///
    /// Fails with the session error if the session reports one first, or with
    /// [`LockError::ConnectionTimeout`] once the connect timeout elapses. A
    /// timeout forces the connection into ERROR, failing every other caller
    /// waiting with it.
    pub async fn wait_connected(&self) -> LockResult<()> {
        let rx = {
            let mut inner = self.shared.inner.lock().await;
            match inner.state {
                ConnectionState::Connected => None,
                ConnectionState::Closed | ConnectionState::Error => {
                    self.shared.connect(&mut inner);
                    Some(Self::register_waiter(&mut inner))
                }
                ConnectionState::Connecting => Some(Self::register_waiter(&mut inner)),
            }
        };

        let Some(rx) = rx else {
            // resolve asynchronously either way
            tokio::task::yield_now().await;
            return Ok(());
        };

        let timeout = self.shared.options.connect_timeout;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => {
                if let Err(err) = &result {
                    debug!(servers = %self.shared.servers, %err, "error while waiting for connection");
                }
                result
            }
            Ok(Err(_)) => Err(LockError::NotConnected("wait for connection".into())),
            Err(_) => {
                let mut inner = self.shared.inner.lock().await;
                if inner.state == ConnectionState::Connected {
                    // the session came up while we waited for the lock
                    return Ok(());
                }
                let err = LockError::ConnectionTimeout(timeout);
                warn!(servers = %self.shared.servers, ?timeout, "timed out waiting for connection");
                match inner.state {
                    ConnectionState::Connecting => self.shared.change_state(
                        &mut inner,
                        ConnectionState::Error,
                        Some(err.clone()),
                    ),
                    ConnectionState::Connected
                    | ConnectionState::Closed
                    | ConnectionState::Error => {}
                }
                Err(err)
            }
        }
    }

    fn register_waiter(inner: &mut ConnectionInner) -> oneshot::Receiver<LockResult<()>> {
        let (tx, rx) = oneshot::channel();
        inner.waiters.push(tx);
        rx
    }

    /// Start a session if CLOSED or ERROR; a warning no-op otherwise.
    pub(crate) async fn connect(&self) {
        let mut inner = self.shared.inner.lock().await;
        self.shared.connect(&mut inner);
    }

    /// The live session handle, re-checking CONNECTED at the moment of the
    /// call. `action` names what the caller was about to do, for the error.
    pub(crate) async fn connected_session(&self, action: &str) -> LockResult<Arc<dyn Session>> {
        self.shared
            .inner
            .lock()
            .await
            .connected_session()
            .ok_or_else(|| LockError::NotConnected(action.to_string()))
    }

    /// The live session, for tools that walk the node tree directly.
    pub async fn session(&self) -> LockResult<Arc<dyn Session>> {
        self.connected_session("use the session").await
    }

    /// Close the session and move to CLOSED. Always succeeds.
    ///
    /// Callers still waiting for the connection are failed. The lock table is
    /// kept; the service drops the ephemeral nodes with the session.
    pub async fn close(&self) -> LockResult<()> {
        let mut inner = self.shared.inner.lock().await;
        debug!(servers = %self.shared.servers, state = ?inner.state, "closing connection");
        let had_session = inner.teardown();
        match inner.state {
            ConnectionState::Connected | ConnectionState::Connecting | ConnectionState::Error => {
                self.shared
                    .change_state(&mut inner, ConnectionState::Closed, None);
            }
            ConnectionState::Closed => {
                if had_session {
                    // a disconnect event raced the close
                    trace!(servers = %self.shared.servers, "closed lingering session");
                }
            }
        }
        for waiter in inner.waiters.drain(..) {
            let _ = waiter.send(Err(LockError::NotConnected("wait for connection".into())));
        }
        Ok(())
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("servers", &self.shared.servers)
            .field("options", &self.shared.options)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryCluster;
    use tracing_test::traced_test;

    fn connection(cluster: &MemoryCluster) -> Connection {
        Connection::new(
            "127.0.0.1:2181",
            ConnectionOptions::default(),
            Arc::new(cluster.clone()),
        )
    }

    async fn live_session(cxn: &Connection) -> Option<Arc<dyn Session>> {
        cxn.shared.inner.lock().await.session.clone()
    }

    #[test]
    fn test_options_default() {
        let opts = ConnectionOptions::default();
        assert_eq!(opts.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(opts.session_timeout, None);

        let opts = ConnectionOptions::with_timeout(Duration::from_secs(3));
        assert_eq!(opts.connect_timeout, Duration::from_secs(3));
        assert_eq!(opts.session_timeout, Some(Duration::from_secs(3)));
    }

    #[tokio::test]
    async fn test_initial_state_closed() {
        let cluster = MemoryCluster::new();
        let cxn = connection(&cluster);
        assert_eq!(cxn.state(), ConnectionState::Closed);
        assert!(live_session(&cxn).await.is_none());
        assert_eq!(cluster.sessions_created(), 0);
        assert!(matches!(
            cxn.session().await,
            Err(LockError::NotConnected(_))
        ));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_wait_connected_connects() {
        let cluster = MemoryCluster::new();
        let cxn = connection(&cluster);
        cxn.wait_connected().await.unwrap();
        assert_eq!(cxn.state(), ConnectionState::Connected);
        assert_eq!(cluster.sessions_created(), 1);

        // already connected: no new session
        cxn.wait_connected().await.unwrap();
        assert_eq!(cluster.sessions_created(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_waiters_share_connect() {
        let cluster = MemoryCluster::new();
        let cxn = connection(&cluster);
        let (a, b, c) = tokio::join!(
            cxn.wait_connected(),
            cxn.wait_connected(),
            cxn.wait_connected()
        );
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(cluster.sessions_created(), 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_reentrant_connect_is_noop() {
        let cluster = MemoryCluster::new();
        let cxn = connection(&cluster);

        // CONNECTING: refuse so the session stays pending
        cluster.set_refuse_connections(true);
        cxn.connect().await;
        assert_eq!(cxn.state(), ConnectionState::Connecting);
        let before = live_session(&cxn).await.unwrap();
        cxn.connect().await;
        let after = live_session(&cxn).await.unwrap();
        assert!(Arc::ptr_eq(&before, &after));
        assert!(logs_contain("unexpected state in connect"));
        cxn.close().await.unwrap();

        // CONNECTED
        cluster.set_refuse_connections(false);
        cxn.wait_connected().await.unwrap();
        let before = live_session(&cxn).await.unwrap();
        cxn.connect().await;
        let after = live_session(&cxn).await.unwrap();
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(cxn.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_connected_timeout_forces_error() {
        let cluster = MemoryCluster::new();
        cluster.set_refuse_connections(true);
        let cxn = Connection::new(
            "10.0.0.1:2181",
            ConnectionOptions::with_timeout(Duration::from_secs(2)),
            Arc::new(cluster.clone()),
        );

        let err = cxn.wait_connected().await.unwrap_err();
        assert_eq!(err, LockError::ConnectionTimeout(Duration::from_secs(2)));
        assert_eq!(cxn.state(), ConnectionState::Error);

        // next wait reconnects with a fresh session
        cluster.set_refuse_connections(false);
        cxn.wait_connected().await.unwrap();
        assert_eq!(cluster.sessions_created(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_poisons_other_waiters() {
        let cluster = MemoryCluster::new();
        cluster.set_refuse_connections(true);
        let cxn = Connection::new(
            "10.0.0.1:2181",
            ConnectionOptions::with_timeout(Duration::from_secs(1)),
            Arc::new(cluster.clone()),
        );
        let early = cxn.clone();
        let early = tokio::spawn(async move { early.wait_connected().await });
        tokio::time::sleep(Duration::from_millis(500)).await;
        let late = cxn.clone();
        let late = tokio::spawn(async move { late.wait_connected().await });

        let early = early.await.unwrap();
        let late = late.await.unwrap();
        assert!(early.unwrap_err().is_timeout());
        // the late waiter got the early waiter's timeout, not its own
        assert_eq!(
            late.unwrap_err(),
            LockError::ConnectionTimeout(Duration::from_secs(1))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_connect_beats_timeout() {
        let cluster = MemoryCluster::new();
        cluster.set_refuse_connections(true);
        let cxn = Connection::new(
            "10.0.0.1:2181",
            ConnectionOptions::with_timeout(Duration::from_secs(1)),
            Arc::new(cluster.clone()),
        );
        let waiter = cxn.clone();
        let waiter = tokio::spawn(async move { waiter.wait_connected().await });
        while cluster.sessions_created() == 0 {
            tokio::task::yield_now().await;
        }

        // the deadline passes while the state lock is held, and the session
        // comes up before the timed-out waiter gets the lock
        let mut inner = cxn.shared.inner.lock().await;
        tokio::time::sleep(Duration::from_millis(1500)).await;
        cxn.shared
            .change_state(&mut inner, ConnectionState::Connected, None);
        drop(inner);

        waiter.await.unwrap().unwrap();
        assert_eq!(cxn.state(), ConnectionState::Connected);
        assert!(live_session(&cxn).await.is_some());
    }

    #[tokio::test]
    async fn test_session_failures_map_to_error() {
        for (event, failure) in [
            (SessionEvent::Expired, SessionFailure::Expired),
            (SessionEvent::ConnectedReadOnly, SessionFailure::ReadOnly),
            (
                SessionEvent::AuthenticationFailed,
                SessionFailure::AuthenticationFailed,
            ),
        ] {
            let cluster = MemoryCluster::new();
            cluster.set_refuse_connections(true);
            let cxn = connection(&cluster);
            let waiter = cxn.clone();
            let waiter = tokio::spawn(async move { waiter.wait_connected().await });
            while cluster.sessions_created() == 0 {
                tokio::task::yield_now().await;
            }
            cluster.emit(cluster.latest_session_id().unwrap(), event);
            let err = waiter.await.unwrap().unwrap_err();
            assert_eq!(err, LockError::Session(failure));
            assert_eq!(cxn.state(), ConnectionState::Error);
        }
    }

    #[tokio::test]
    async fn test_disconnect_moves_to_closed() {
        let cluster = MemoryCluster::new();
        let cxn = connection(&cluster);
        cxn.wait_connected().await.unwrap();
        let mut state = cxn.subscribe_state();
        cluster.disconnect_session(cluster.latest_session_id().unwrap());
        state
            .wait_for(|s| *s == ConnectionState::Closed)
            .await
            .unwrap();

        // CLOSED with a lingering handle: close still succeeds and drops it
        assert!(live_session(&cxn).await.is_some());
        cxn.close().await.unwrap();
        assert!(live_session(&cxn).await.is_none());
        assert_eq!(cxn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_close_from_every_state() {
        let cluster = MemoryCluster::new();
        let cxn = connection(&cluster);

        // CLOSED, nothing to close
        cxn.close().await.unwrap();
        assert_eq!(cxn.state(), ConnectionState::Closed);

        // CONNECTED
        cxn.wait_connected().await.unwrap();
        cxn.close().await.unwrap();
        assert_eq!(cxn.state(), ConnectionState::Closed);
        assert!(live_session(&cxn).await.is_none());

        // CONNECTING
        cluster.set_refuse_connections(true);
        cxn.connect().await;
        assert_eq!(cxn.state(), ConnectionState::Connecting);
        cxn.close().await.unwrap();
        assert_eq!(cxn.state(), ConnectionState::Closed);

        // ERROR
        cluster.set_refuse_connections(false);
        cxn.wait_connected().await.unwrap();
        let mut state = cxn.subscribe_state();
        cluster.expire_session(cluster.latest_session_id().unwrap());
        state
            .wait_for(|s| *s == ConnectionState::Error)
            .await
            .unwrap();
        cxn.close().await.unwrap();
        assert_eq!(cxn.state(), ConnectionState::Closed);
        assert!(live_session(&cxn).await.is_none());
    }

    #[tokio::test]
    async fn test_close_fails_pending_waiters() {
        let cluster = MemoryCluster::new();
        cluster.set_refuse_connections(true);
        let cxn = connection(&cluster);
        let waiter = cxn.clone();
        let waiter = tokio::spawn(async move { waiter.wait_connected().await });
        while cluster.sessions_created() == 0 {
            tokio::task::yield_now().await;
        }
        cxn.close().await.unwrap();
        assert!(matches!(
            waiter.await.unwrap(),
            Err(LockError::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn test_events_from_replaced_session_ignored() {
        let cluster = MemoryCluster::new();
        let cxn = connection(&cluster);
        cxn.wait_connected().await.unwrap();
        let first = cluster.latest_session_id().unwrap();
        cxn.close().await.unwrap();
        cxn.wait_connected().await.unwrap();

        // the old session is gone; its events can't reach the new state
        cluster.emit(first, SessionEvent::Expired);
        tokio::task::yield_now().await;
        assert_eq!(cxn.state(), ConnectionState::Connected);
    }
}
