//! Registry of the replicas this server holds.
//!
//! Owned by the engine and handed to whoever needs lookups. Removing a
//! replica only drops the registry's reference; the replica flushes its
//! state when the last holder lets go.

use crate::dn::Dn;
use crate::error::ReplError;
use crate::replica::Replica;
use dashmap::DashSet;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

/// Replicas by name, with a guard against concurrent configuration of the
/// same root.
#[derive(Default)]
pub struct ReplicaRegistry {
    replicas: RwLock<HashMap<String, Arc<Replica>>>,
    configuring: DashSet<String>,
}

/// Held while a replica for `root` is being built; released on drop.
pub struct ConfigureGuard<'a> {
    registry: &'a ReplicaRegistry,
    root: String,
}

impl Drop for ConfigureGuard<'_> {
    fn drop(&mut self) {
        self.registry.configuring.remove(&self.root);
    }
}

impl ReplicaRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the right to configure the replica at `root`. Fails with
    /// `Busy` if someone else is configuring it.
    pub fn begin_configure(&self, root: &Dn) -> Result<ConfigureGuard<'_>, ReplError> {
        let key = root.normalized();
        if !self.configuring.insert(key.clone()) {
            return Err(ReplError::ReplicaBeingConfigured { root: key });
        }
        Ok(ConfigureGuard {
            registry: self,
            root: key,
        })
    }

    /// Register a replica. Names and roots must be unique.
    pub fn add_by_name(&self, replica: Arc<Replica>) -> Result<(), ReplError> {
        let mut replicas = self.replicas.write().map_err(|_| ReplError::poisoned("replica registry"))?;
        if replicas.contains_key(replica.name()) {
            return Err(ReplError::ReplicaExists {
                name: replica.name().to_string(),
            });
        }
        if let Some(other) = replicas.values().find(|r| r.root() == replica.root()) {
            return Err(ReplError::ReplicaExists {
                name: other.name().to_string(),
            });
        }
        info!(replica = %replica.name(), root = %replica.root(), "replica registered");
        replicas.insert(replica.name().to_string(), replica);
        Ok(())
    }

    /// Replica by name.
    pub fn get_by_name(&self, name: &str) -> Option<Arc<Replica>> {
        self.replicas.read().ok()?.get(name).cloned()
    }

    /// Replica whose root is exactly `root`.
    pub fn get_by_root(&self, root: &Dn) -> Option<Arc<Replica>> {
        self.replicas.read().ok()?.values().find(|r| r.root() == root).cloned()
    }

    /// Replica holding `dn`: the one with the deepest root at or above it.
    pub fn get_for_dn(&self, dn: &Dn) -> Option<Arc<Replica>> {
        self.replicas
            .read()
            .ok()?
            .values()
            .filter(|r| dn.is_within(r.root()))
            .max_by_key(|r| r.root().depth())
            .cloned()
    }

    /// Unregister a replica and hand back the registry's reference.
    pub fn delete_by_name(&self, name: &str) -> Result<Arc<Replica>, ReplError> {
        let mut replicas = self.replicas.write().map_err(|_| ReplError::poisoned("replica registry"))?;
        let replica = replicas.remove(name).ok_or_else(|| ReplError::ReplicaUnknown {
            name: name.to_string(),
        })?;
        info!(replica = %name, "replica unregistered");
        Ok(replica)
    }

    /// Every replica, ordered by name.
    pub fn enumerate(&self) -> Vec<Arc<Replica>> {
        let Ok(replicas) = self.replicas.read() else {
            return Vec::new();
        };
        let mut all: Vec<Arc<Replica>> = replicas.values().cloned().collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    /// Number of registered replicas.
    pub fn len(&self) -> usize {
        self.replicas.read().map(|r| r.len()).unwrap_or(0)
    }

    /// True if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flush and drop every replica.
    pub fn shutdown(&self) {
        let drained: Vec<Arc<Replica>> = match self.replicas.write() {
            Ok(mut replicas) => replicas.drain().map(|(_, r)| r).collect(),
            Err(_) => return,
        };
        for replica in drained {
            if let Err(e) = replica.flush() {
                warn!(replica = %replica.name(), error = %e, "failed to flush replica at shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csn::ReplicaId;
    use crate::ldap::LdapResultCode;
    use crate::replica::{ReplicaSettings, ReplicaType, DEFAULT_PURGE_DELAY};
    use crate::store::{MemoryEntryStore, MemoryStateStore};
    use crate::urp::UrpConfig;

    fn dn(s: &str) -> Dn {
        Dn::parse(s).unwrap()
    }

    fn replica(name: &str, root: &str, rid: ReplicaId) -> Arc<Replica> {
        let settings = ReplicaSettings {
            name: name.to_string(),
            root: dn(root),
            rid,
            replica_type: ReplicaType::Supplier,
            update_dns: Vec::new(),
            purge_delay: DEFAULT_PURGE_DELAY,
            max_clock_skew: crate::csn::DEFAULT_MAX_CLOCK_SKEW_SECS,
        };
        Arc::new(
            Replica::new(
                settings,
                Arc::new(MemoryEntryStore::new()),
                Arc::new(MemoryStateStore::new()),
                UrpConfig::default(),
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_add_and_lookup() {
        let registry = ReplicaRegistry::new();
        registry.add_by_name(replica("userroot", "dc=example", 1)).unwrap();
        registry.add_by_name(replica("people", "ou=people,dc=example", 1)).unwrap();
        assert!(registry.get_by_name("userroot").is_some());
        assert_eq!(registry.get_by_root(&dn("DC=Example")).unwrap().name(), "userroot");
        assert_eq!(
            registry.get_for_dn(&dn("cn=a,ou=people,dc=example")).unwrap().name(),
            "people"
        );
        assert_eq!(registry.get_for_dn(&dn("cn=a,dc=example")).unwrap().name(), "userroot");
        assert!(registry.get_for_dn(&dn("dc=other")).is_none());
        let names: Vec<String> = registry.enumerate().iter().map(|r| r.name().to_string()).collect();
        assert_eq!(names, ["people", "userroot"]);
    }

    #[test]
    fn test_duplicates_rejected() {
        let registry = ReplicaRegistry::new();
        registry.add_by_name(replica("userroot", "dc=example", 1)).unwrap();
        let err = registry.add_by_name(replica("userroot", "dc=other", 2)).unwrap_err();
        assert_eq!(err.result_code(), LdapResultCode::AlreadyExists);
        assert!(registry.add_by_name(replica("second", "dc=example", 2)).is_err());
    }

    #[test]
    fn test_delete_keeps_outstanding_references() {
        let registry = ReplicaRegistry::new();
        registry.add_by_name(replica("userroot", "dc=example", 1)).unwrap();
        let held = registry.get_by_name("userroot").unwrap();
        let removed = registry.delete_by_name("userroot").unwrap();
        assert!(Arc::ptr_eq(&held, &removed));
        assert!(registry.get_by_name("userroot").is_none());
        assert_eq!(held.rid(), 1);
        assert!(matches!(
            registry.delete_by_name("userroot"),
            Err(ReplError::ReplicaUnknown { .. })
        ));
    }

    #[test]
    fn test_configure_guard() {
        let registry = ReplicaRegistry::new();
        let guard = registry.begin_configure(&dn("dc=example")).unwrap();
        let err = registry.begin_configure(&dn("DC=EXAMPLE")).err().unwrap();
        assert_eq!(err.result_code(), LdapResultCode::Busy);
        drop(guard);
        assert!(registry.begin_configure(&dn("dc=example")).is_ok());
    }

    #[test]
    fn test_shutdown_empties() {
        let registry = ReplicaRegistry::new();
        registry.add_by_name(replica("userroot", "dc=example", 1)).unwrap();
        registry.shutdown();
        assert!(registry.is_empty());
    }
}
