//! Entry storage seen by the replication layers.
//!
//! The backend database is external; replication needs entry lookup by
//! unique id and DN, a few secondary indices and an atomic batch write.
//! `MemoryEntryStore` is the in-memory implementation used by tests and the
//! standalone binary. `Txn` buffers every write one replicated operation
//! makes so conflict resolution and the operation commit together.

use crate::csn::ReplicaId;
use crate::dn::Dn;
use crate::entry::{Entry, UniqueId};
use crate::error::ReplError;
use crate::ruv::Ruv;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

/// Entry storage backend.
pub trait EntryStore: Send + Sync {
    /// Entry by unique id, tombstones included.
    fn get(&self, id: &UniqueId) -> Result<Option<Entry>, ReplError>;

    /// Unique id of the entry currently at `dn`.
    fn lookup_dn(&self, dn: &Dn) -> Result<Option<UniqueId>, ReplError>;

    /// Unique ids of the entries directly below `parent`.
    fn children(&self, parent: &Dn) -> Result<Vec<UniqueId>, ReplError>;

    /// Unique ids of tombstones and cenotaphs whose live DN was `dn`.
    fn by_original_dn(&self, dn: &Dn) -> Result<Vec<UniqueId>, ReplError>;

    /// Every entry at or below `base`, parents before children.
    fn scan(&self, base: &Dn) -> Result<Vec<Entry>, ReplError>;

    /// Atomically apply a batch of writes.
    fn write_batch(&self, ops: Vec<StoreOp>) -> Result<(), ReplError>;
}

/// A single write in a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    /// Insert or replace an entry.
    Put(Entry),
    /// Remove an entry.
    Delete(UniqueId),
}

impl StoreOp {
    fn id(&self) -> &UniqueId {
        match self {
            Self::Put(entry) => entry.uniqueid(),
            Self::Delete(id) => id,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct StoreData {
    entries: HashMap<UniqueId, Entry>,
    by_dn: HashMap<Dn, UniqueId>,
    by_parent: HashMap<Dn, BTreeSet<UniqueId>>,
    by_origin: HashMap<Dn, BTreeSet<UniqueId>>,
}

impl StoreData {
    fn unindex(&mut self, id: &UniqueId) {
        let Some(old) = self.entries.remove(id) else {
            return;
        };
        if self.by_dn.get(old.dn()) == Some(id) {
            self.by_dn.remove(old.dn());
        }
        if let Some(parent) = old.dn().parent() {
            if let Some(set) = self.by_parent.get_mut(&parent) {
                set.remove(id);
            }
        }
        if let Some(origin) = old.original_dn() {
            if let Some(set) = self.by_origin.get_mut(&origin) {
                set.remove(id);
            }
        }
    }

    fn index(&mut self, entry: Entry) -> Result<(), ReplError> {
        let id = entry.uniqueid().clone();
        if let Some(other) = self.by_dn.get(entry.dn()) {
            if *other != id {
                return Err(ReplError::Store {
                    msg: format!("{} already holds {}", other, entry.dn()),
                });
            }
        }
        self.by_dn.insert(entry.dn().clone(), id.clone());
        if let Some(parent) = entry.dn().parent() {
            self.by_parent.entry(parent).or_default().insert(id.clone());
        }
        if !entry.is_live() {
            if let Some(origin) = entry.original_dn() {
                self.by_origin.entry(origin).or_default().insert(id.clone());
            }
        }
        self.entries.insert(id, entry);
        Ok(())
    }
}

/// In-memory entry store. Thread-safe via RwLock.
pub struct MemoryEntryStore {
    data: Arc<RwLock<StoreData>>,
}

impl MemoryEntryStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self {
            data: Arc::new(RwLock::new(StoreData::default())),
        }
    }

    /// Number of stored entries, tombstones included.
    pub fn len(&self) -> usize {
        self.data.read().map(|d| d.entries.len()).unwrap_or(0)
    }

    /// True if the store holds nothing.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryEntryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn store_err<E: std::fmt::Display>(e: E) -> ReplError {
    ReplError::Store { msg: e.to_string() }
}

impl EntryStore for MemoryEntryStore {
    fn get(&self, id: &UniqueId) -> Result<Option<Entry>, ReplError> {
        let data = self.data.read().map_err(store_err)?;
        Ok(data.entries.get(id).cloned())
    }

    fn lookup_dn(&self, dn: &Dn) -> Result<Option<UniqueId>, ReplError> {
        let data = self.data.read().map_err(store_err)?;
        Ok(data.by_dn.get(dn).cloned())
    }

    fn children(&self, parent: &Dn) -> Result<Vec<UniqueId>, ReplError> {
        let data = self.data.read().map_err(store_err)?;
        Ok(data
            .by_parent
            .get(parent)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn by_original_dn(&self, dn: &Dn) -> Result<Vec<UniqueId>, ReplError> {
        let data = self.data.read().map_err(store_err)?;
        Ok(data
            .by_origin
            .get(dn)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn scan(&self, base: &Dn) -> Result<Vec<Entry>, ReplError> {
        let data = self.data.read().map_err(store_err)?;
        let mut result: Vec<Entry> = data
            .entries
            .values()
            .filter(|e| e.dn().is_within(base))
            .cloned()
            .collect();
        result.sort_by(|a, b| {
            a.dn()
                .depth()
                .cmp(&b.dn().depth())
                .then_with(|| a.uniqueid().cmp(b.uniqueid()))
        });
        Ok(result)
    }

    fn write_batch(&self, ops: Vec<StoreOp>) -> Result<(), ReplError> {
        let mut data = self.data.write().map_err(store_err)?;
        let mut next = data.clone();
        for op in &ops {
            next.unindex(op.id());
        }
        for op in ops {
            if let StoreOp::Put(entry) = op {
                next.index(entry)?;
            }
        }
        *data = next;
        Ok(())
    }
}

/// Write buffer for one replicated operation. Reads see buffered writes.
pub struct Txn<'a> {
    store: &'a dyn EntryStore,
    writes: BTreeMap<UniqueId, Option<Entry>>,
}

impl<'a> Txn<'a> {
    /// Start a transaction against `store`.
    pub fn new(store: &'a dyn EntryStore) -> Self {
        Self {
            store,
            writes: BTreeMap::new(),
        }
    }

    /// Entry by unique id.
    pub fn get(&self, id: &UniqueId) -> Result<Option<Entry>, ReplError> {
        match self.writes.get(id) {
            Some(buffered) => Ok(buffered.clone()),
            None => self.store.get(id),
        }
    }

    /// Entry currently at `dn`.
    pub fn get_by_dn(&self, dn: &Dn) -> Result<Option<Entry>, ReplError> {
        if let Some(entry) = self.writes.values().flatten().find(|e| e.dn() == dn) {
            return Ok(Some(entry.clone()));
        }
        match self.store.lookup_dn(dn)? {
            Some(id) if !self.writes.contains_key(&id) => self.store.get(&id),
            _ => Ok(None),
        }
    }

    /// Entries directly below `parent`, tombstones excluded, sorted by unique id.
    pub fn children(&self, parent: &Dn) -> Result<Vec<Entry>, ReplError> {
        let mut result = Vec::new();
        for id in self.store.children(parent)? {
            if self.writes.contains_key(&id) {
                continue;
            }
            if let Some(entry) = self.store.get(&id)? {
                result.push(entry);
            }
        }
        result.extend(
            self.writes
                .values()
                .flatten()
                .filter(|e| e.dn().parent().as_ref() == Some(parent))
                .cloned(),
        );
        result.retain(Entry::is_live);
        result.sort_by(|a, b| a.uniqueid().cmp(b.uniqueid()));
        Ok(result)
    }

    /// Tombstones and cenotaphs whose live DN was `dn`.
    pub fn by_original_dn(&self, dn: &Dn) -> Result<Vec<Entry>, ReplError> {
        let mut result = Vec::new();
        for id in self.store.by_original_dn(dn)? {
            if self.writes.contains_key(&id) {
                continue;
            }
            if let Some(entry) = self.store.get(&id)? {
                result.push(entry);
            }
        }
        result.extend(
            self.writes
                .values()
                .flatten()
                .filter(|e| !e.is_live() && e.original_dn().as_ref() == Some(dn))
                .cloned(),
        );
        result.sort_by(|a, b| a.uniqueid().cmp(b.uniqueid()));
        Ok(result)
    }

    /// Buffer an insert or replace.
    pub fn put(&mut self, entry: Entry) {
        self.writes.insert(entry.uniqueid().clone(), Some(entry));
    }

    /// Buffer a removal.
    pub fn remove(&mut self, id: &UniqueId) {
        self.writes.insert(id.clone(), None);
    }

    /// Move `entry` to `new_dn`, rewriting the DNs of its whole subtree.
    pub fn move_subtree(&mut self, mut entry: Entry, new_dn: Dn) -> Result<(), ReplError> {
        let old_dn = entry.dn().clone();
        if old_dn != new_dn || old_dn.to_string() != new_dn.to_string() {
            let mut descendants = Vec::new();
            let mut pending = vec![old_dn.clone()];
            while let Some(dn) = pending.pop() {
                for child in self.children(&dn)? {
                    if child.uniqueid() == entry.uniqueid() {
                        continue;
                    }
                    pending.push(child.dn().clone());
                    descendants.push(child);
                }
            }
            for mut child in descendants {
                if let Some(moved) = child.dn().rebase(&old_dn, &new_dn) {
                    child.set_dn(moved);
                    self.put(child);
                }
            }
        }
        entry.set_dn(new_dn);
        self.put(entry);
        Ok(())
    }

    /// True if nothing was buffered.
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Buffered writes as a store batch.
    pub fn into_ops(self) -> Vec<StoreOp> {
        self.writes
            .into_iter()
            .map(|(id, entry)| match entry {
                Some(entry) => StoreOp::Put(entry),
                None => StoreOp::Delete(id),
            })
            .collect()
    }
}

/// Replica state flushed when the replica is released.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedReplicaState {
    /// Update vector.
    pub ruv: Ruv,
    /// Replica ids retired by CleanAllRUV.
    pub cleaned_rids: Vec<ReplicaId>,
}

/// Durable home of per-replica state.
pub trait ReplicaStateStore: Send + Sync {
    /// Persist the state of the replica rooted at `root`.
    fn save(&self, root: &Dn, state: &PersistedReplicaState) -> Result<(), ReplError>;

    /// Load previously saved state.
    fn load(&self, root: &Dn) -> Result<Option<PersistedReplicaState>, ReplError>;
}

/// In-memory state store; values are bincode-encoded as a disk backend would
/// store them.
#[derive(Default)]
pub struct MemoryStateStore {
    data: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryStateStore {
    /// Creates a new empty state store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReplicaStateStore for MemoryStateStore {
    fn save(&self, root: &Dn, state: &PersistedReplicaState) -> Result<(), ReplError> {
        let bytes = bincode::serialize(state)?;
        let mut data = self.data.write().map_err(store_err)?;
        data.insert(root.normalized(), bytes);
        Ok(())
    }

    fn load(&self, root: &Dn) -> Result<Option<PersistedReplicaState>, ReplError> {
        let data = self.data.read().map_err(store_err)?;
        match data.get(&root.normalized()) {
            Some(bytes) => Ok(Some(bincode::deserialize(bytes)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csn::Csn;

    fn dn(s: &str) -> Dn {
        Dn::parse(s).unwrap()
    }

    fn entry(d: &str, id: &str) -> Entry {
        let mut e = Entry::new(dn(d), UniqueId::new(id));
        e.add_rdn_values(None);
        e
    }

    mod memory_store {
        use super::*;

        #[test]
        fn test_put_and_lookup() {
            let store = MemoryEntryStore::new();
            store
                .write_batch(vec![StoreOp::Put(entry("dc=example", "root")), StoreOp::Put(entry("ou=a,dc=example", "a"))])
                .unwrap();
            assert_eq!(store.lookup_dn(&dn("OU=A,dc=example")).unwrap(), Some(UniqueId::new("a")));
            assert_eq!(store.children(&dn("dc=example")).unwrap(), vec![UniqueId::new("a")]);
            assert_eq!(store.len(), 2);
        }

        #[test]
        fn test_duplicate_dn_rejected_atomically() {
            let store = MemoryEntryStore::new();
            store.write_batch(vec![StoreOp::Put(entry("ou=a,dc=example", "a"))]).unwrap();
            let err = store.write_batch(vec![
                StoreOp::Put(entry("ou=b,dc=example", "b")),
                StoreOp::Put(entry("ou=a,dc=example", "c")),
            ]);
            assert!(err.is_err());
            assert!(store.get(&UniqueId::new("b")).unwrap().is_none());
        }

        #[test]
        fn test_swap_dns_in_one_batch() {
            let store = MemoryEntryStore::new();
            store
                .write_batch(vec![StoreOp::Put(entry("ou=a,dc=example", "a")), StoreOp::Put(entry("ou=b,dc=example", "b"))])
                .unwrap();
            let mut a = store.get(&UniqueId::new("a")).unwrap().unwrap();
            let mut b = store.get(&UniqueId::new("b")).unwrap().unwrap();
            a.set_dn(dn("ou=b,dc=example"));
            b.set_dn(dn("ou=a,dc=example"));
            store.write_batch(vec![StoreOp::Put(a), StoreOp::Put(b)]).unwrap();
            assert_eq!(store.lookup_dn(&dn("ou=a,dc=example")).unwrap(), Some(UniqueId::new("b")));
        }

        #[test]
        fn test_scan_parents_first() {
            let store = MemoryEntryStore::new();
            store
                .write_batch(vec![
                    StoreOp::Put(entry("cn=x,ou=a,dc=example", "x")),
                    StoreOp::Put(entry("dc=example", "root")),
                    StoreOp::Put(entry("ou=a,dc=example", "a")),
                    StoreOp::Put(entry("dc=other", "other")),
                ])
                .unwrap();
            let scanned = store.scan(&dn("dc=example")).unwrap();
            let ids: Vec<&str> = scanned.iter().map(|e| e.uniqueid().as_str()).collect();
            assert_eq!(ids, vec!["root", "a", "x"]);
        }
    }

    mod txn {
        use super::*;

        #[test]
        fn test_reads_see_buffered_writes() {
            let store = MemoryEntryStore::new();
            store.write_batch(vec![StoreOp::Put(entry("ou=a,dc=example", "a"))]).unwrap();
            let mut txn = Txn::new(&store);
            let mut a = txn.get(&UniqueId::new("a")).unwrap().unwrap();
            a.set_dn(dn("ou=b,dc=example"));
            txn.put(a);
            assert!(txn.get_by_dn(&dn("ou=a,dc=example")).unwrap().is_none());
            assert!(txn.get_by_dn(&dn("ou=b,dc=example")).unwrap().is_some());
            assert_eq!(txn.children(&dn("dc=example")).unwrap().len(), 1);
            assert!(store.lookup_dn(&dn("ou=b,dc=example")).unwrap().is_none());
        }

        #[test]
        fn test_move_subtree_rewrites_descendants() {
            let store = MemoryEntryStore::new();
            store
                .write_batch(vec![
                    StoreOp::Put(entry("ou=a,dc=example", "a")),
                    StoreOp::Put(entry("cn=x,ou=a,dc=example", "x")),
                    StoreOp::Put(entry("cn=y,cn=x,ou=a,dc=example", "y")),
                ])
                .unwrap();
            let mut txn = Txn::new(&store);
            let a = txn.get(&UniqueId::new("a")).unwrap().unwrap();
            txn.move_subtree(a, dn("ou=b,dc=example")).unwrap();
            store.write_batch(txn.into_ops()).unwrap();
            assert_eq!(store.lookup_dn(&dn("cn=y,cn=x,ou=b,dc=example")).unwrap(), Some(UniqueId::new("y")));
            assert!(store.lookup_dn(&dn("cn=x,ou=a,dc=example")).unwrap().is_none());
        }

        #[test]
        fn test_removed_entry_invisible() {
            let store = MemoryEntryStore::new();
            store.write_batch(vec![StoreOp::Put(entry("ou=a,dc=example", "a"))]).unwrap();
            let mut txn = Txn::new(&store);
            txn.remove(&UniqueId::new("a"));
            assert!(txn.get(&UniqueId::new("a")).unwrap().is_none());
            assert!(txn.get_by_dn(&dn("ou=a,dc=example")).unwrap().is_none());
            assert!(matches!(txn.into_ops().as_slice(), [StoreOp::Delete(_)]));
        }
    }

    mod state_store {
        use super::*;

        #[test]
        fn test_save_load() {
            let store = MemoryStateStore::new();
            let mut state = PersistedReplicaState::default();
            state.ruv.update(Csn::new(5, 0, 1, 0));
            state.cleaned_rids.push(7);
            store.save(&dn("dc=example"), &state).unwrap();
            assert_eq!(store.load(&dn("DC=Example")).unwrap(), Some(state));
            assert_eq!(store.load(&dn("dc=other")).unwrap(), None);
        }
    }
}
