//! Watch system for cache update notifications.
//!
//! A watch is how an active xDS stream learns that the snapshot for its
//! node has been replaced. Watches are built on [`tokio::sync::watch`]
//! channels: a slow subscriber skips intermediate snapshots but always
//! observes the latest one, so the installed configuration and the streamed
//! configuration cannot diverge.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tracing::{debug, trace};

use crate::Snapshot;

/// A watch subscription receiving snapshot updates for one node.
///
/// Dropping the watch unsubscribes it.
#[derive(Debug)]
pub struct Watch {
    node_id: String,
    receiver: watch::Receiver<Arc<Snapshot>>,
}

impl Watch {
    /// Get the node ID this watch is subscribed to.
    #[inline]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Wait for the next snapshot update and return it.
    ///
    /// Intermediate snapshots that arrived while the caller was busy are
    /// skipped; only the most recent one is returned. Returns `None` once
    /// the watch manager has been dropped.
    pub async fn changed(&mut self) -> Option<Arc<Snapshot>> {
        self.receiver.changed().await.ok()?;
        Some(self.receiver.borrow_and_update().clone())
    }

    /// Return the most recent update without waiting, if one is pending.
    pub fn latest(&mut self) -> Option<Arc<Snapshot>> {
        if self.receiver.has_changed().unwrap_or(false) {
            Some(self.receiver.borrow_and_update().clone())
        } else {
            None
        }
    }
}

/// Manager for watch subscriptions, keyed by node ID.
///
/// One broadcast channel per node; every subscriber gets its own receiver.
/// Uses a `Mutex` internally but operations are fast (no I/O).
#[derive(Debug, Default)]
pub struct WatchManager {
    channels: Mutex<HashMap<String, watch::Sender<Arc<Snapshot>>>>,
}

impl WatchManager {
    /// Create a new watch manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new watch for a node.
    ///
    /// The watch observes snapshots installed after this call; the snapshot
    /// current at subscription time is not replayed (callers read it from
    /// the cache directly).
    pub fn create_watch(&self, node_id: &str) -> Watch {
        let mut channels = self.channels.lock().expect("watch lock poisoned");
        let sender = channels
            .entry(node_id.to_string())
            .or_insert_with(|| watch::channel(Arc::new(Snapshot::default())).0);

        debug!(node = %node_id, subscribers = sender.receiver_count() + 1, "created watch");

        Watch {
            node_id: node_id.to_string(),
            receiver: sender.subscribe(),
        }
    }

    /// Notify all watches for a node about a snapshot update.
    pub fn notify(&self, node_id: &str, snapshot: Arc<Snapshot>) {
        let channels = self.channels.lock().expect("watch lock poisoned");
        if let Some(sender) = channels.get(node_id) {
            // send_replace delivers even when no subscriber is currently
            // connected; a late subscriber reads the cache instead.
            sender.send_replace(snapshot);
            trace!(
                node = %node_id,
                watch_count = sender.receiver_count(),
                "notified watches of snapshot update"
            );
        }
    }

    /// Number of active watches for a node.
    pub fn watch_count(&self, node_id: &str) -> usize {
        let channels = self.channels.lock().expect("watch lock poisoned");
        channels
            .get(node_id)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_and_notify() {
        let manager = WatchManager::new();
        let mut watch = manager.create_watch("envoy-home");
        assert_eq!(manager.watch_count("envoy-home"), 1);

        manager.notify("envoy-home", Arc::new(Snapshot::new("v1")));

        let received = watch.changed().await.unwrap();
        assert_eq!(received.version(), "v1");
    }

    #[test]
    fn drop_unsubscribes() {
        let manager = WatchManager::new();
        let watch = manager.create_watch("envoy-home");
        drop(watch);
        assert_eq!(manager.watch_count("envoy-home"), 0);
    }

    #[tokio::test]
    async fn notify_targets_only_the_node() {
        let manager = WatchManager::new();
        let mut home = manager.create_watch("envoy-home");
        let mut edge = manager.create_watch("envoy-vps");

        manager.notify("envoy-home", Arc::new(Snapshot::new("v1")));

        assert_eq!(home.changed().await.unwrap().version(), "v1");
        assert!(edge.latest().is_none());
    }

    #[test]
    fn notify_without_watchers_is_a_noop() {
        let manager = WatchManager::new();
        manager.notify("nobody", Arc::new(Snapshot::new("v1")));
    }

    #[tokio::test]
    async fn slow_subscriber_observes_the_latest_snapshot() {
        let manager = WatchManager::new();
        let mut watch = manager.create_watch("envoy-home");

        manager.notify("envoy-home", Arc::new(Snapshot::new("v1")));
        manager.notify("envoy-home", Arc::new(Snapshot::new("v2")));
        manager.notify("envoy-home", Arc::new(Snapshot::new("v3")));

        // v1 and v2 are skipped; the last notification always wins.
        assert_eq!(watch.changed().await.unwrap().version(), "v3");
        assert!(watch.latest().is_none());
    }

    #[tokio::test]
    async fn multiple_subscribers_all_see_updates() {
        let manager = WatchManager::new();
        let mut a = manager.create_watch("envoy-home");
        let mut b = manager.create_watch("envoy-home");

        manager.notify("envoy-home", Arc::new(Snapshot::new("v5")));

        assert_eq!(a.changed().await.unwrap().version(), "v5");
        assert_eq!(b.changed().await.unwrap().version(), "v5");
    }
}
