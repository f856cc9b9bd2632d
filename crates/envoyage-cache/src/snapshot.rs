//! Snapshot: immutable, versioned collection of xDS resources.
//!
//! A snapshot represents a consistent view of all resources for one node at
//! a specific registry version. Snapshots are:
//!
//! - **Immutable**: once created, a snapshot cannot be modified
//! - **Versioned**: each snapshot carries the global `v<N>` version string
//! - **Type-organized**: resources are grouped by their type URL
//!
//! Resources are stored pre-encoded as [`prost_types::Any`]; the transport
//! layer ships them without re-serialising.

use std::collections::HashMap;

use envoyage_core::TypeUrl;

/// Resources of a single type within a snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceSet {
    /// Version string for this resource type.
    version: String,
    /// Encoded resources keyed by name.
    resources: HashMap<String, prost_types::Any>,
}

impl ResourceSet {
    /// Create a new empty resource set.
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            resources: HashMap::new(),
        }
    }

    /// Get the version for this resource type.
    #[inline]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Get the number of resources.
    #[inline]
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Check if there are no resources.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Get a resource by name.
    #[inline]
    pub fn get(&self, name: &str) -> Option<&prost_types::Any> {
        self.resources.get(name)
    }

    /// Get all resource names.
    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.resources.keys()
    }

    /// Get all encoded resources as a vec.
    pub fn to_vec(&self) -> Vec<prost_types::Any> {
        self.resources.values().cloned().collect()
    }

    /// Whether this set holds the same resources as `other`, version aside.
    pub(crate) fn same_content(&self, other: &ResourceSet) -> bool {
        self.resources == other.resources
    }
}

/// An immutable snapshot of xDS resources for one node.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// Global version for this snapshot, `v<registry-version>`.
    version: String,
    /// Resources grouped by type URL.
    resources: HashMap<TypeUrl, ResourceSet>,
}

impl Snapshot {
    /// Create an empty snapshot with the given global version.
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            resources: HashMap::new(),
        }
    }

    /// Add resources of a specific type. The per-type version defaults to
    /// the global version.
    pub fn with_resources(
        mut self,
        type_url: TypeUrl,
        resources: impl IntoIterator<Item = (String, prost_types::Any)>,
    ) -> Self {
        let mut set = ResourceSet::new(self.version.clone());
        for (name, resource) in resources {
            set.resources.insert(name, resource);
        }
        self.resources.insert(type_url, set);
        self
    }

    /// Get the global version of this snapshot.
    #[inline]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Get resources for a specific type.
    #[inline]
    pub fn get_resources(&self, type_url: &TypeUrl) -> Option<&ResourceSet> {
        self.resources.get(type_url)
    }

    /// Get the version for a specific resource type.
    #[inline]
    pub fn get_version(&self, type_url: &TypeUrl) -> Option<&str> {
        self.resources.get(type_url).map(|r| r.version.as_str())
    }

    /// Check if this snapshot contains a specific resource type.
    #[inline]
    pub fn contains_type(&self, type_url: &TypeUrl) -> bool {
        self.resources.contains_key(type_url)
    }

    /// Get all type URLs present in this snapshot.
    pub fn type_urls(&self) -> impl Iterator<Item = &TypeUrl> {
        self.resources.keys()
    }

    /// Get the total number of resources across all types.
    pub fn total_resources(&self) -> usize {
        self.resources.values().map(|r| r.len()).sum()
    }

    /// Check if this snapshot holds no resources.
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty() || self.resources.values().all(|r| r.is_empty())
    }

    /// Carry per-type versions forward from `previous` for every type whose
    /// resource content is unchanged.
    ///
    /// A data plane that already ACKed version `vN` for a type is not sent
    /// the identical resources again under `vN+1`; the stale per-type
    /// version makes the transport skip it.
    pub(crate) fn reconcile_with(&mut self, previous: &Snapshot) {
        for (type_url, set) in self.resources.iter_mut() {
            if let Some(prev) = previous.resources.get(type_url) {
                if set.same_content(prev) {
                    set.version = prev.version.clone();
                }
            }
        }
    }
}
