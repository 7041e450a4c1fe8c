//! ZooKeeper sessions via `zookeeper-client`.

use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, warn};
use zookeeper_client as zk;

use crate::error::{ServiceError, ServiceResult};
use crate::session::{
    CreateMode, NodeStat, Session, SessionEvent, SessionEvents, SessionFactory, Watch,
    WatchedEvent,
};

/// Creates sessions against a real ZooKeeper ensemble.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZooKeeperFactory;

impl SessionFactory for ZooKeeperFactory {
    fn create_session(
        &self,
        servers: &str,
        session_timeout: Option<Duration>,
    ) -> (Arc<dyn Session>, SessionEvents) {
        let (events, rx) = mpsc::unbounded_channel();
        let session = ZooKeeperSession {
            servers: servers.to_string(),
            session_timeout,
            events,
            client: Arc::new(Mutex::new(None)),
            task: Mutex::new(None),
        };
        (Arc::new(session), rx)
    }
}

type ClientSlot = Arc<Mutex<Option<zk::Client>>>;

struct ZooKeeperSession {
    servers: String,
    session_timeout: Option<Duration>,
    events: mpsc::UnboundedSender<SessionEvent>,
    client: ClientSlot,
    /// connects, then forwards session state changes
    task: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for ZooKeeperSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZooKeeperSession")
            .field("servers", &self.servers)
            .field("session_timeout", &self.session_timeout)
            .finish_non_exhaustive()
    }
}

fn service_error(path: &str, err: zk::Error) -> ServiceError {
    match err {
        zk::Error::NoNode => ServiceError::NoNode(path.to_string()),
        zk::Error::NodeExists => ServiceError::NodeExists(path.to_string()),
        zk::Error::ConnectionLoss => ServiceError::ConnectionLoss(path.to_string()),
        zk::Error::SessionExpired => ServiceError::SessionExpired,
        other => ServiceError::Other(format!("{path}: {other}")),
    }
}

fn create_mode(mode: CreateMode) -> zk::CreateMode {
    match mode {
        CreateMode::Persistent => zk::CreateMode::Persistent,
        CreateMode::Ephemeral => zk::CreateMode::Ephemeral,
        CreateMode::PersistentSequential => zk::CreateMode::PersistentSequential,
        CreateMode::EphemeralSequential => zk::CreateMode::EphemeralSequential,
    }
}

async fn run_session(
    servers: String,
    session_timeout: Option<Duration>,
    events: mpsc::UnboundedSender<SessionEvent>,
    slot: ClientSlot,
) {
    let mut connector = zk::Client::connector();
    if let Some(timeout) = session_timeout {
        connector.session_timeout(timeout);
    }
    let client = match connector.connect(&servers).await {
        Ok(client) => client,
        Err(zk::Error::AuthFailed) => {
            let _ = events.send(SessionEvent::AuthenticationFailed);
            return;
        }
        Err(err) => {
            warn!(servers, %err, "zookeeper connect failed");
            let _ = events.send(SessionEvent::Disconnected);
            return;
        }
    };
    let mut watcher = client.state_watcher();
    *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(client);
    let _ = events.send(SessionEvent::Connected);

    loop {
        let event = match watcher.changed().await {
            zk::SessionState::SyncConnected => SessionEvent::Connected,
            zk::SessionState::Disconnected => SessionEvent::Disconnected,
            zk::SessionState::ConnectedReadOnly => SessionEvent::ConnectedReadOnly,
            zk::SessionState::Expired => SessionEvent::Expired,
            zk::SessionState::AuthFailed => SessionEvent::AuthenticationFailed,
            state => {
                debug!(servers, ?state, "zookeeper session finished");
                break;
            }
        };
        if events.send(event).is_err() {
            break;
        }
        if matches!(
            event,
            SessionEvent::Expired | SessionEvent::AuthenticationFailed
        ) {
            break;
        }
    }
}

impl ZooKeeperSession {
    fn client(&self, path: &str) -> ServiceResult<zk::Client> {
        self.client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| ServiceError::ConnectionLoss(path.to_string()))
    }
}

#[async_trait]
impl Session for ZooKeeperSession {
    fn connect(&self) {
        let task = tokio::spawn(run_session(
            self.servers.clone(),
            self.session_timeout,
            self.events.clone(),
            Arc::clone(&self.client),
        ));
        if let Some(previous) = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task)
        {
            previous.abort();
        }
    }

    fn close(&self) {
        if let Some(task) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
        // dropping the last client handle closes the session
        self.client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    async fn mkdir_all(&self, path: &str) -> ServiceResult<()> {
        let client = self.client(path)?;
        let options = zk::CreateMode::Persistent.with_acls(zk::Acls::anyone_all());
        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            match client.create(&current, &[], &options).await {
                Ok(_) | Err(zk::Error::NodeExists) => {}
                Err(err) => return Err(service_error(&current, err)),
            }
        }
        Ok(())
    }

    async fn create(&self, path: &str, payload: &[u8], mode: CreateMode) -> ServiceResult<String> {
        let client = self.client(path)?;
        let options = create_mode(mode).with_acls(zk::Acls::anyone_all());
        let (_, sequence) = client
            .create(path, payload, &options)
            .await
            .map_err(|err| service_error(path, err))?;
        if mode.is_sequential() {
            Ok(format!("{path}{:010}", sequence.into_i64()))
        } else {
            Ok(path.to_string())
        }
    }

    async fn get_children(&self, path: &str) -> ServiceResult<Vec<String>> {
        let client = self.client(path)?;
        client
            .list_children(path)
            .await
            .map_err(|err| service_error(path, err))
    }

    async fn children_with_stat(&self, path: &str) -> ServiceResult<(Vec<String>, NodeStat)> {
        let client = self.client(path)?;
        let (children, stat) = client
            .get_children(path)
            .await
            .map_err(|err| service_error(path, err))?;
        let stat = NodeStat {
            ephemeral_owner: stat.ephemeral_owner,
            num_children: usize::try_from(stat.num_children).unwrap_or_default(),
        };
        Ok((children, stat))
    }

    async fn exists(&self, path: &str) -> ServiceResult<(bool, Watch)> {
        let client = self.client(path)?;
        let (stat, watcher) = client
            .check_and_watch_stat(path)
            .await
            .map_err(|err| service_error(path, err))?;
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let event = match watcher.changed().await.event_type {
                zk::EventType::NodeCreated => WatchedEvent::NodeCreated,
                zk::EventType::NodeDeleted => WatchedEvent::NodeDeleted,
                zk::EventType::NodeDataChanged => WatchedEvent::NodeDataChanged,
                _ => WatchedEvent::SessionClosed,
            };
            let _ = tx.send(event);
        });
        Ok((stat.is_some(), Watch::new(rx)))
    }

    async fn remove(&self, path: &str) -> ServiceResult<()> {
        let client = self.client(path)?;
        client
            .delete(path, None)
            .await
            .map_err(|err| service_error(path, err))
    }
}
