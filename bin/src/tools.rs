//! Node-tree utilities and the contention demo.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result, bail};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info};
use zk_ultralight::{ConnectionOptions, ConnectionRegistry, MemoryCluster, Session};

/// Which nodes a tree walk reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeFilter {
    /// nodes owned by a live session
    Ephemeral,
    /// persistent leaves, candidates for stale lock parents
    NonEphemeralLeaf,
}

fn child_path(parent: &str, child: &str) -> String {
    if parent.ends_with('/') {
        format!("{parent}{child}")
    } else {
        format!("{parent}/{child}")
    }
}

/// Depth-first walk from every root, skipping the service's own
/// `/zookeeper` subtree.
pub async fn walk(session: &dyn Session, roots: &[String], filter: NodeFilter) -> Result<Vec<String>> {
    let mut queue = roots.to_vec();
    let mut found = Vec::new();

    while let Some(node) = queue.pop() {
        if node.contains("/zookeeper") {
            continue;
        }
        let (children, stat) = session
            .children_with_stat(&node)
            .await
            .with_context(|| format!("failed to list {node}"))?;
        let keep = match filter {
            NodeFilter::Ephemeral => stat.is_ephemeral(),
            NodeFilter::NonEphemeralLeaf => children.is_empty() && !stat.is_ephemeral(),
        };
        queue.extend(children.iter().map(|child| child_path(&node, child)));
        if keep {
            found.push(node);
        }
    }

    debug!(?filter, found = found.len(), "tree walk finished");
    Ok(found)
}

/// Remove every path concurrently. Fails if any removal failed.
pub async fn remove_all(session: &dyn Session, paths: &[String]) -> Result<()> {
    let results = join_all(
        paths
            .iter()
            .map(|path| async move { (path, session.remove(path).await) }),
    )
    .await;

    let mut failed = 0;
    for (path, result) in results {
        if let Err(err) = result {
            error!(path, %err, "failed to remove node");
            failed += 1;
        }
    }
    if failed > 0 {
        bail!("failed to remove {failed} of {} nodes", paths.len());
    }
    info!(removed = paths.len(), "removed nodes");
    Ok(())
}

/// One step of the demo, in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DemoEvent {
    pub owner: String,
    pub action: &'static str,
    pub node: String,
}

/// Two "processes" with their own registries contend for `name` on an
/// in-memory cluster; the second only gets the lock after the first unlocks.
pub async fn demo(name: &str) -> Result<Vec<DemoEvent>> {
    let cluster = MemoryCluster::new();
    let servers = ["memory:2181"];
    let registry_a = ConnectionRegistry::new(Arc::new(cluster.clone()));
    let registry_b = ConnectionRegistry::new(Arc::new(cluster.clone()));
    let client_a = registry_a.get(&servers, ConnectionOptions::default()).await;
    let client_b = registry_b.get(&servers, ConnectionOptions::default()).await;
    let events = Arc::new(Mutex::new(Vec::new()));

    let node_a = client_a.lock(name, "A").await?;
    events.lock().await.push(DemoEvent {
        owner: "A".into(),
        action: "locked",
        node: node_a.clone(),
    });

    let waiter = {
        let events = Arc::clone(&events);
        let name = name.to_string();
        let client_b = client_b.clone();
        tokio::spawn(async move {
            let node = client_b.lock(&name, "B").await?;
            events.lock().await.push(DemoEvent {
                owner: "B".into(),
                action: "locked",
                node: node.clone(),
            });
            client_b.unlock(&name).await?;
            events.lock().await.push(DemoEvent {
                owner: "B".into(),
                action: "unlocked",
                node,
            });
            anyhow::Ok(())
        })
    };

    // give B time to queue behind A
    tokio::time::sleep(Duration::from_millis(50)).await;
    {
        // B records its lock only after A's unlock is on the log
        let mut log = events.lock().await;
        client_a.unlock(name).await?;
        log.push(DemoEvent {
            owner: "A".into(),
            action: "unlocked",
            node: node_a,
        });
    }
    waiter.await.context("demo contender panicked")??;

    registry_a.shutdown().await;
    registry_b.shutdown().await;
    let events = events.lock().await.clone();
    Ok(events)
}
