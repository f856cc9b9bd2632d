//! Cache trait and the DashMap-backed snapshot cache.
//!
//! The cache stores one snapshot per node, keyed by the node ID string the
//! data plane presents when subscribing. It is the sole handoff between the
//! control side (registry + builder) and the transport side (gRPC streams).

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, trace};

use crate::snapshot::Snapshot;
use crate::watch::{Watch, WatchManager};

/// Trait for xDS snapshot caches.
pub trait Cache: Send + Sync {
    /// Get the current snapshot for a node.
    fn get_snapshot(&self, node_id: &str) -> Option<Arc<Snapshot>>;

    /// Install a snapshot for a node, replacing any previous one.
    ///
    /// Notifies any watches for this node.
    fn set_snapshot(&self, node_id: &str, snapshot: Snapshot);

    /// Remove the snapshot for a node.
    fn clear_snapshot(&self, node_id: &str);

    /// Number of cached snapshots.
    fn snapshot_count(&self) -> usize;
}

/// Concurrent snapshot cache keyed by node ID.
///
/// - `DashMap` gives lock-free reads for the stream handlers
/// - installing a snapshot reconciles per-type versions against the
///   previous snapshot, so types with unchanged content keep their version
///   and are not resent
/// - all map references are dropped before watch notification, so no
///   bucket lock is held across the handoff
#[derive(Debug, Default)]
pub struct SnapshotCache {
    snapshots: DashMap<String, Arc<Snapshot>>,
    watches: WatchManager,
}

impl SnapshotCache {
    /// Create a new empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a watch that receives snapshot updates for this node.
    #[inline]
    pub fn create_watch(&self, node_id: &str) -> Watch {
        self.watches.create_watch(node_id)
    }

    /// Number of active watches for a node.
    #[inline]
    pub fn watch_count(&self, node_id: &str) -> usize {
        self.watches.watch_count(node_id)
    }

    /// Check whether a snapshot exists for a node.
    pub fn has_snapshot(&self, node_id: &str) -> bool {
        self.snapshots.contains_key(node_id)
    }

    /// All node IDs currently in the cache.
    pub fn node_ids(&self) -> Vec<String> {
        self.snapshots.iter().map(|r| r.key().clone()).collect()
    }
}

impl Cache for SnapshotCache {
    fn get_snapshot(&self, node_id: &str) -> Option<Arc<Snapshot>> {
        // The Ref holds a shard read lock; clone the Arc and drop it.
        let result = self.snapshots.get(node_id).map(|r| Arc::clone(&*r));
        trace!(node = %node_id, hit = result.is_some(), "snapshot lookup");
        result
    }

    fn set_snapshot(&self, node_id: &str, mut snapshot: Snapshot) {
        if let Some(previous) = self.get_snapshot(node_id) {
            snapshot.reconcile_with(&previous);
        }
        let snapshot = Arc::new(snapshot);
        self.snapshots
            .insert(node_id.to_string(), Arc::clone(&snapshot));

        debug!(
            node = %node_id,
            version = %snapshot.version(),
            resources = snapshot.total_resources(),
            "set snapshot"
        );

        // No DashMap lock held here.
        self.watches.notify(node_id, snapshot);
    }

    fn clear_snapshot(&self, node_id: &str) {
        if self.snapshots.remove(node_id).is_some() {
            debug!(node = %node_id, "cleared snapshot");
        }
    }

    fn snapshot_count(&self) -> usize {
        self.snapshots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use envoyage_core::TypeUrl;

    fn any(name: &str) -> (String, prost_types::Any) {
        (
            name.to_string(),
            prost_types::Any {
                type_url: TypeUrl::CLUSTER.to_string(),
                value: name.as_bytes().to_vec(),
            },
        )
    }

    #[test]
    fn cache_basic_operations() {
        let cache = SnapshotCache::new();

        assert!(cache.get_snapshot("envoy-home").is_none());
        assert_eq!(cache.snapshot_count(), 0);

        cache.set_snapshot("envoy-home", Snapshot::new("v1"));
        assert!(cache.has_snapshot("envoy-home"));
        assert_eq!(cache.snapshot_count(), 1);
        assert_eq!(cache.get_snapshot("envoy-home").unwrap().version(), "v1");

        cache.clear_snapshot("envoy-home");
        assert!(!cache.has_snapshot("envoy-home"));
    }

    #[test]
    fn node_ids_are_exact_strings() {
        let cache = SnapshotCache::new();
        cache.set_snapshot("envoyage-envoy-home", Snapshot::new("v1"));
        cache.set_snapshot("envoyage-envoy-vps", Snapshot::new("v1"));

        let mut nodes = cache.node_ids();
        nodes.sort();
        assert_eq!(nodes, vec!["envoyage-envoy-home", "envoyage-envoy-vps"]);
    }

    #[tokio::test]
    async fn set_snapshot_notifies_watch() {
        let cache = SnapshotCache::new();
        let mut watch = cache.create_watch("envoy-home");

        cache.set_snapshot("envoy-home", Snapshot::new("v1"));

        let snapshot = watch.changed().await.unwrap();
        assert_eq!(snapshot.version(), "v1");
    }

    #[test]
    fn unchanged_types_keep_their_version_across_installs() {
        let cache = SnapshotCache::new();

        let first = Snapshot::new("v1")
            .with_resources(TypeUrl::CLUSTER.into(), vec![any("cluster_web")])
            .with_resources(TypeUrl::LISTENER.into(), vec![any("listener_http")]);
        cache.set_snapshot("envoy-home", first);

        let second = Snapshot::new("v2")
            .with_resources(TypeUrl::CLUSTER.into(), vec![any("cluster_web"), any("cluster_blog")])
            .with_resources(TypeUrl::LISTENER.into(), vec![any("listener_http")]);
        cache.set_snapshot("envoy-home", second);

        let installed = cache.get_snapshot("envoy-home").unwrap();
        assert_eq!(installed.version(), "v2");
        assert_eq!(installed.get_version(&TypeUrl::CLUSTER.into()), Some("v2"));
        assert_eq!(installed.get_version(&TypeUrl::LISTENER.into()), Some("v1"));
    }
}
