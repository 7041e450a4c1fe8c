//! Shared connections keyed by cluster.
//!
//! Owned by the application's composition root. Lock requests against the
//! same server list reuse one [`Connection`] (and so one session);
//! [`ConnectionRegistry::shutdown`] closes them all before exit.

use std::{collections::HashMap, sync::Arc};

use futures::future::join_all;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::connection::{Connection, ConnectionOptions};
use crate::session::SessionFactory;

/// Canonical cache key for a server list.
pub fn cluster_key<S: AsRef<str>>(servers: &[S]) -> String {
    servers
        .iter()
        .map(|server| server.as_ref())
        .collect::<Vec<&str>>()
        .join(",")
}

/// Cache of [`Connection`]s, one per server list.
#[derive(Debug, Clone)]
pub struct ConnectionRegistry {
    factory: Arc<dyn SessionFactory>,
    connections: Arc<Mutex<HashMap<String, Connection>>>,
}

impl ConnectionRegistry {
    /// Registry whose connections create sessions with `factory`.
    pub fn new(factory: Arc<dyn SessionFactory>) -> Self {
        Self {
            factory,
            connections: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The connection for `servers`, created CLOSED on first request.
    ///
    /// `options` only apply when the connection is created; later calls get
    /// the cached connection unchanged.
    pub async fn get<S: AsRef<str>>(&self, servers: &[S], options: ConnectionOptions) -> Connection {
        let key = cluster_key(servers);
        let mut connections = self.connections.lock().await;
        connections
            .entry(key)
            .or_insert_with_key(|key| {
                debug!(servers = %key, ?options, "creating connection");
                Connection::new(key.clone(), options, Arc::clone(&self.factory))
            })
            .clone()
    }

    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.lock().await.is_empty()
    }

    /// Empty the registry and close every connection it held, concurrently.
    ///
    /// Close errors are logged and swallowed.
    pub async fn shutdown(&self) {
        let drained = std::mem::take(&mut *self.connections.lock().await);
        debug!(count = drained.len(), "shutting down connections");
        join_all(drained.into_values().map(|cxn| async move {
            if let Err(err) = cxn.close().await {
                trace!(servers = cxn.servers(), %err, "error observed mid-shutdown");
            }
        }))
        .await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::connection::ConnectionState;
    use crate::memory::MemoryCluster;

    fn registry(cluster: &MemoryCluster) -> ConnectionRegistry {
        ConnectionRegistry::new(Arc::new(cluster.clone()))
    }

    #[test]
    fn test_cluster_key() {
        assert_eq!(cluster_key(&["127.0.0.1:2181"]), "127.0.0.1:2181");
        assert_eq!(
            cluster_key(&["a:2181".to_string(), "b:2181".to_string()]),
            "a:2181,b:2181"
        );
    }

    #[tokio::test]
    async fn test_get_reuses_connection() {
        let cluster = MemoryCluster::new();
        let registry = registry(&cluster);
        let a = registry
            .get(&["a:2181", "b:2181"], ConnectionOptions::default())
            .await;
        let b = registry
            .get(
                &["a:2181", "b:2181"],
                ConnectionOptions::with_timeout(Duration::from_secs(1)),
            )
            .await;
        assert!(Arc::ptr_eq(&a.shared, &b.shared));
        // first options win
        assert_eq!(b.options(), ConnectionOptions::default());
        assert_eq!(a.state(), ConnectionState::Closed);

        let other = registry.get(&["c:2181"], ConnectionOptions::default()).await;
        assert!(!Arc::ptr_eq(&a.shared, &other.shared));
        assert_eq!(registry.len().await, 2);
        // lookup never connects
        assert_eq!(cluster.sessions_created(), 0);
    }

    #[tokio::test]
    async fn test_shared_connection_shares_session() {
        let cluster = MemoryCluster::new();
        let registry = registry(&cluster);
        let first = registry.get(&["a:2181"], ConnectionOptions::default()).await;
        first.lock("/critical/one", "A").await.unwrap();
        let second = registry.get(&["a:2181"], ConnectionOptions::default()).await;
        second.lock("/critical/two", "B").await.unwrap();
        assert_eq!(cluster.sessions_created(), 1);
        // one lock table behind both handles
        assert!(first.held("/critical/two").await.is_some());
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let cluster = MemoryCluster::new();
        let registry = registry(&cluster);
        let a = registry.get(&["a:2181"], ConnectionOptions::default()).await;
        let b = registry.get(&["b:2181"], ConnectionOptions::default()).await;
        let never_used = registry.get(&["c:2181"], ConnectionOptions::default()).await;
        a.lock("/critical/section", "A").await.unwrap();
        b.wait_connected().await.unwrap();

        registry.shutdown().await;
        assert!(registry.is_empty().await);
        assert_eq!(a.state(), ConnectionState::Closed);
        assert_eq!(b.state(), ConnectionState::Closed);
        assert_eq!(never_used.state(), ConnectionState::Closed);
        // a's lock node went with its session
        assert!(cluster.children("/critical").is_empty());

        // a fresh lookup builds a new connection
        let again = registry.get(&["a:2181"], ConnectionOptions::default()).await;
        assert!(!Arc::ptr_eq(&a.shared, &again.shared));
    }
}
