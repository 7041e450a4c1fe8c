//! # zk-ultralight
//!
//! Fair, FIFO mutual-exclusion locks negotiated through a ZooKeeper-style
//! coordination service, using only create, list-children, exists-with-watch
//! and delete.
//!
//! This library provides:
//! - **Connection state machine** supervising one session per cluster and
//!   reconnecting on demand after errors or timeouts.
//! - **Connection registry** so lock requests against the same cluster share
//!   one session, with an explicit shutdown that drains it.
//! - **Lock negotiation** over sequential ephemeral nodes, watching only the
//!   immediate predecessor.
//! - **Session backends**: an in-memory cluster for tests and demos, and
//!   ZooKeeper behind the `zookeeper` feature.
//!
//! ```no_run
//! # async fn run() -> zk_ultralight::LockResult<()> {
//! use std::sync::Arc;
//! use zk_ultralight::{ConnectionOptions, ConnectionRegistry, MemoryCluster};
//!
//! let registry = ConnectionRegistry::new(Arc::new(MemoryCluster::new()));
//! let cxn = registry.get(&["127.0.0.1:2181"], ConnectionOptions::default()).await;
//! cxn.lock("/critical/section", "vroom").await?;
//! // ... critical section ...
//! cxn.unlock("/critical/section").await?;
//! registry.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod error;
pub mod lock;
pub mod memory;
pub mod registry;
pub mod session;
#[cfg(feature = "zookeeper")]
pub mod zookeeper;

pub use connection::{Connection, ConnectionOptions, ConnectionState, DEFAULT_CONNECT_TIMEOUT};
pub use error::{LockError, LockResult, ServiceError, ServiceResult, SessionFailure};
pub use lock::{LockPath, OwnerToken};
pub use memory::MemoryCluster;
pub use registry::ConnectionRegistry;
pub use session::{CreateMode, NodeStat, Session, SessionEvent, SessionFactory, Watch, WatchedEvent};
#[cfg(feature = "zookeeper")]
pub use zookeeper::ZooKeeperFactory;
