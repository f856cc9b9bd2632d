//! Thread-safe service registry with change notification.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::debug;

use envoyage_core::{EnvoyageError, Result};

use crate::Service;

/// The registry's change hook. Invoked after every accepted mutation,
/// outside the write lock, on the mutating thread.
pub type ChangeHook = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Inner {
    services: HashMap<String, Service>,
    version: u64,
    // Invoked after every mutation, outside the write lock. The xDS server
    // hooks into this to push fresh snapshots to all Envoys. Only one
    // callback is supported - fan-out belongs in the hook body.
    on_change: Option<ChangeHook>,
}

/// Thread-safe, in-memory store for services.
///
/// Guarded by a single read-writer lock: many concurrent [`snapshot`]
/// readers, at most one mutator. The `version` counter increases by one on
/// every accepted mutation and never on reads or rejected mutations.
///
/// [`snapshot`]: ServiceRegistry::snapshot
#[derive(Default)]
pub struct ServiceRegistry {
    inner: RwLock<Inner>,
}

impl ServiceRegistry {
    /// Create an empty registry at version 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the function to be called after each registry mutation.
    ///
    /// Silently replaces any previously installed hook.
    pub fn on_change(&self, hook: impl Fn() + Send + Sync + 'static) {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        inner.on_change = Some(Arc::new(hook));
    }

    /// Insert a service. Fails with [`EnvoyageError::ServiceExists`] if the
    /// name is already registered.
    pub fn add(&self, svc: Service) -> Result<()> {
        let hook;
        {
            let mut inner = self.inner.write().expect("registry lock poisoned");
            if inner.services.contains_key(&svc.name) {
                return Err(EnvoyageError::ServiceExists { name: svc.name });
            }
            debug!(name = %svc.name, domain = %svc.domain, upstream = %svc.upstream, "service added");
            inner.services.insert(svc.name.clone(), svc);
            inner.version += 1;
            hook = inner.on_change.clone();
        }
        // Fire the hook AFTER releasing the lock. The hook triggers a
        // snapshot rebuild which needs a read lock; calling it under the
        // write lock would deadlock.
        if let Some(hook) = hook {
            hook();
        }
        Ok(())
    }

    /// Delete a service by name. Fails with
    /// [`EnvoyageError::ServiceNotFound`] if absent.
    pub fn remove(&self, name: &str) -> Result<()> {
        let hook;
        {
            let mut inner = self.inner.write().expect("registry lock poisoned");
            if inner.services.remove(name).is_none() {
                return Err(EnvoyageError::ServiceNotFound {
                    name: name.to_string(),
                });
            }
            debug!(name = %name, "service removed");
            inner.version += 1;
            hook = inner.on_change.clone();
        }
        if let Some(hook) = hook {
            hook();
        }
        Ok(())
    }

    /// Replace an existing service. Fails with
    /// [`EnvoyageError::ServiceNotFound`] if absent.
    ///
    /// Useful when Docker labels change or an agent re-registers with a
    /// different upstream.
    pub fn update(&self, svc: Service) -> Result<()> {
        let hook;
        {
            let mut inner = self.inner.write().expect("registry lock poisoned");
            if !inner.services.contains_key(&svc.name) {
                return Err(EnvoyageError::ServiceNotFound { name: svc.name });
            }
            debug!(name = %svc.name, upstream = %svc.upstream, "service updated");
            inner.services.insert(svc.name.clone(), svc);
            inner.version += 1;
            hook = inner.on_change.clone();
        }
        if let Some(hook) = hook {
            hook();
        }
        Ok(())
    }

    /// Return copies of all services and the current version counter,
    /// observed atomically.
    ///
    /// The version is monotonically increasing and is used for xDS snapshot
    /// versioning. The returned services are defensive copies sorted by
    /// name, so consumers see a stable order and need no further
    /// synchronisation.
    pub fn snapshot(&self) -> (Vec<Service>, u64) {
        let inner = self.inner.read().expect("registry lock poisoned");
        let mut services: Vec<Service> = inner.services.values().cloned().collect();
        services.sort_by(|a, b| a.name.cmp(&b.name));
        (services, inner.version)
    }

    /// Number of registered services.
    pub fn len(&self) -> usize {
        self.inner.read().expect("registry lock poisoned").services.len()
    }

    /// Whether the registry holds no services.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read().expect("registry lock poisoned");
        f.debug_struct("ServiceRegistry")
            .field("services", &inner.services.len())
            .field("version", &inner.version)
            .finish()
    }
}
