//! The replica: one replicated subtree and everything needed to keep it in
//! step with its peers.
//!
//! Every write, local or replicated, goes through one pipeline: stamp a CSN,
//! resolve it with URP inside a store transaction, commit, then append to
//! the changelog and fold the CSN into the RUV under the replica lock so no
//! reader sees a changelog record the RUV does not cover.

use crate::changelog::Changelog;
use crate::cleanallruv::CleanedRids;
use crate::csn::{now_secs, Csn, CsnGenerator, ReplicaId, MAX_WRITABLE_REPLICA_ID, READ_ONLY_REPLICA_ID};
use crate::dn::Dn;
use crate::entry::{Entry, UniqueId};
use crate::error::ReplError;
use crate::ldap::LdapResultCode;
use crate::op::{AddOp, DeleteOp, Mod, ModRdnOp, ModifyOp, Operation, ReplicatedOp};
use crate::ruv::{PendingCsns, Ruv};
use crate::store::{EntryStore, PersistedReplicaState, ReplicaStateStore, StoreOp, Txn};
use crate::urp::{Resolution, Urp, UrpConfig, UrpDecision};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Replica id attribute of the replica configuration entry.
pub const ATTR_REPLICA_ID: &str = "nsds5replicaid";
/// Replica type attribute.
pub const ATTR_REPLICA_TYPE: &str = "nsds5replicatype";

/// Someone holds exclusive update access.
pub const STATE_IN_USE: u32 = 0x01;
/// An inbound incremental session is running.
pub const STATE_INCREMENTAL_IN_PROGRESS: u32 = 0x02;
/// An inbound total update is running.
pub const STATE_TOTAL_IN_PROGRESS: u32 = 0x04;
/// A total update is being sent from this replica.
pub const STATE_TOTAL_EXCL_SEND: u32 = 0x08;
/// A total update is being received into this replica.
pub const STATE_TOTAL_EXCL_RECV: u32 = 0x10;

/// Default tombstone and changelog retention.
pub const DEFAULT_PURGE_DELAY: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// DN of the configuration entry describing the replica rooted at `root`.
pub fn replica_config_dn(root: &Dn) -> String {
    format!("cn=replica,cn=\"{}\",cn=mapping tree,cn=config", root.normalized())
}

/// Whether local writes are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicaType {
    /// Writable; originates changes.
    #[default]
    Supplier,
    /// Read-only; only receives changes.
    Consumer,
}

/// Validated replica settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicaSettings {
    /// Registry name.
    pub name: String,
    /// Root of the replicated subtree.
    pub root: Dn,
    /// Replica id.
    pub rid: ReplicaId,
    /// Supplier or consumer.
    pub replica_type: ReplicaType,
    /// Identities allowed to send replicated updates here.
    pub update_dns: Vec<Dn>,
    /// How long tombstones and changelog records are kept.
    pub purge_delay: Duration,
    /// Clock skew tolerated from suppliers, in seconds.
    pub max_clock_skew: u32,
}

impl ReplicaSettings {
    /// Check the replica id against the type.
    pub fn validate(&self) -> Result<(), ReplError> {
        match self.replica_type {
            ReplicaType::Supplier if self.rid == READ_ONLY_REPLICA_ID || self.rid > MAX_WRITABLE_REPLICA_ID => {
                Err(ReplError::InvalidReplicaId {
                    rid: self.rid,
                    msg: format!("a supplier needs an id between 1 and {MAX_WRITABLE_REPLICA_ID}"),
                })
            }
            ReplicaType::Consumer if self.rid != READ_ONLY_REPLICA_ID => Err(ReplError::InvalidReplicaId {
                rid: self.rid,
                msg: format!("a read-only replica must use id {READ_ONLY_REPLICA_ID}"),
            }),
            _ => Ok(()),
        }
    }
}

/// A local write after it went through the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedOp {
    /// The operation as replicated to peers.
    pub op: ReplicatedOp,
    /// URP outcome.
    pub decision: UrpDecision,
}

struct ReplicaState {
    ruv: Ruv,
    pending: PendingCsns,
    bits: u32,
    holder: Option<String>,
}

/// One replicated subtree.
pub struct Replica {
    settings: ReplicaSettings,
    update_dns: RwLock<Vec<Dn>>,
    generator: CsnGenerator,
    store: Arc<dyn EntryStore>,
    changelog: Changelog,
    cleaned: Arc<CleanedRids>,
    state_store: Arc<dyn ReplicaStateStore>,
    urp: Urp,
    enabled: AtomicBool,
    apply_lock: Mutex<()>,
    state: Mutex<ReplicaState>,
}

impl Replica {
    /// Build a replica, restoring RUV and cleaned ids from `state_store`.
    pub fn new(
        settings: ReplicaSettings,
        store: Arc<dyn EntryStore>,
        state_store: Arc<dyn ReplicaStateStore>,
        urp: UrpConfig,
    ) -> Result<Self, ReplError> {
        settings.validate()?;
        let persisted = state_store.load(&settings.root)?.unwrap_or_default();
        let cleaned = Arc::new(CleanedRids::from_rids(persisted.cleaned_rids.iter().copied()));
        let mut ruv = persisted.ruv;
        if ruv.generation().is_none() && ruv.elements().is_empty() {
            ruv = Ruv::with_generation(format!("{:08x}{:04x}0000", now_secs(), settings.rid));
        }
        if settings.replica_type == ReplicaType::Supplier {
            ruv.add_replica(settings.rid, None);
        }
        info!(replica = %settings.name, root = %settings.root, rid = settings.rid, "replica created");
        Ok(Self {
            update_dns: RwLock::new(settings.update_dns.clone()),
            generator: CsnGenerator::with_max_skew(settings.rid, settings.max_clock_skew),
            changelog: Changelog::new(cleaned.clone()),
            cleaned,
            store,
            state_store,
            urp: Urp::new(urp),
            enabled: AtomicBool::new(true),
            apply_lock: Mutex::new(()),
            state: Mutex::new(ReplicaState {
                ruv,
                pending: PendingCsns::new(),
                bits: 0,
                holder: None,
            }),
            settings,
        })
    }

    /// Registry name.
    pub fn name(&self) -> &str {
        &self.settings.name
    }

    /// Root DN.
    pub fn root(&self) -> &Dn {
        &self.settings.root
    }

    /// Replica id.
    pub fn rid(&self) -> ReplicaId {
        self.settings.rid
    }

    /// Supplier or consumer.
    pub fn replica_type(&self) -> ReplicaType {
        self.settings.replica_type
    }

    /// Retention period.
    pub fn purge_delay(&self) -> Duration {
        self.settings.purge_delay
    }

    /// The changelog.
    pub fn changelog(&self) -> &Changelog {
        &self.changelog
    }

    /// Replica ids retired by CleanAllRUV.
    pub fn cleaned(&self) -> &Arc<CleanedRids> {
        &self.cleaned
    }

    /// Entry storage.
    pub fn store(&self) -> &Arc<dyn EntryStore> {
        &self.store
    }

    /// Accepts sessions and writes while enabled.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Enable or disable.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    fn lock_state(&self) -> Result<std::sync::MutexGuard<'_, ReplicaState>, ReplError> {
        self.state.lock().map_err(|_| ReplError::poisoned("replica state"))
    }

    /// Snapshot of the RUV.
    pub fn ruv(&self) -> Result<Ruv, ReplError> {
        Ok(self.lock_state()?.ruv.clone())
    }

    /// Current state bits.
    pub fn state_bits(&self) -> u32 {
        self.state.lock().map(|s| s.bits).unwrap_or(0)
    }

    /// A fresh CSN not tied to any write, e.g. for a session start request.
    pub fn new_csn(&self) -> Result<Csn, ReplError> {
        self.generator.new_csn()
    }

    /// Move the CSN generator past a supplier's clock.
    pub fn adjust_time(&self, remote: &Csn) -> Result<(), ReplError> {
        self.generator.adjust_time(remote)
    }

    /// True if `dn` may send replicated updates here.
    pub fn is_updatedn(&self, dn: &str) -> bool {
        let Ok(dn) = Dn::parse(dn) else {
            return false;
        };
        self.update_dns.read().map(|dns| dns.contains(&dn)).unwrap_or(false)
    }

    /// Replace the update DNs.
    pub fn set_update_dns(&self, dns: Vec<Dn>) {
        if let Ok(mut slot) = self.update_dns.write() {
            *slot = dns;
        }
    }

    fn busy(&self, holder: Option<&str>) -> ReplError {
        ReplError::ReplicaBusy {
            root: self.settings.root.to_string(),
            holder: holder.unwrap_or("a total update").to_string(),
        }
    }

    /// Claim exclusive update access for an inbound session.
    pub fn get_exclusive_access(&self, holder: &str, total: bool) -> Result<(), ReplError> {
        let mut state = self.lock_state()?;
        if state.bits & STATE_IN_USE != 0 {
            return Err(self.busy(state.holder.as_deref()));
        }
        if state.bits & (STATE_TOTAL_EXCL_RECV | STATE_TOTAL_EXCL_SEND) != 0 {
            return Err(self.busy(None));
        }
        state.bits |= STATE_IN_USE
            | if total {
                STATE_TOTAL_IN_PROGRESS
            } else {
                STATE_INCREMENTAL_IN_PROGRESS
            };
        state.holder = Some(holder.to_string());
        debug!(replica = %self.settings.name, holder, total, "exclusive access granted");
        Ok(())
    }

    /// Release access taken by `holder`. Returns false if `holder` did not hold it.
    pub fn relinquish_exclusive_access(&self, holder: &str) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        if state.holder.as_deref() != Some(holder) {
            return false;
        }
        state.bits &= !(STATE_IN_USE | STATE_INCREMENTAL_IN_PROGRESS | STATE_TOTAL_IN_PROGRESS);
        state.holder = None;
        debug!(replica = %self.settings.name, holder, "exclusive access released");
        true
    }

    fn test_and_set(&self, bit: u32, conflicts: u32) -> Result<(), ReplError> {
        let mut state = self.lock_state()?;
        if state.bits & (bit | conflicts) != 0 {
            return Err(self.busy(state.holder.as_deref()));
        }
        state.bits |= bit;
        Ok(())
    }

    fn clear_bit(&self, bit: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.bits &= !bit;
        }
    }

    /// Start sending a total update from this replica.
    pub fn begin_total_send(&self) -> Result<(), ReplError> {
        self.test_and_set(STATE_TOTAL_EXCL_SEND, STATE_TOTAL_EXCL_RECV)
    }

    /// Done sending a total update.
    pub fn end_total_send(&self) {
        self.clear_bit(STATE_TOTAL_EXCL_SEND);
    }

    /// Start receiving a total update into this replica.
    pub fn begin_total_recv(&self) -> Result<(), ReplError> {
        self.test_and_set(STATE_TOTAL_EXCL_RECV, STATE_TOTAL_EXCL_SEND)
    }

    /// Done receiving a total update.
    pub fn end_total_recv(&self) {
        self.clear_bit(STATE_TOTAL_EXCL_RECV);
    }

    /// False while the replica is being reinitialized.
    pub fn can_send_incremental(&self) -> bool {
        self.state_bits() & STATE_TOTAL_EXCL_RECV == 0
    }

    fn refuse(code: LdapResultCode, msg: impl Into<String>) -> ReplError {
        ReplError::Refused { code, msg: msg.into() }
    }

    fn check_local(&self, txn: &Txn<'_>, op: &Operation) -> Result<(), ReplError> {
        let root = &self.settings.root;
        if !op.dn().is_within(root) {
            return Err(Self::refuse(
                LdapResultCode::UnwillingToPerform,
                format!("{} is outside {}", op.dn(), root),
            ));
        }
        let live = |dn: &Dn| -> Result<Option<Entry>, ReplError> { Ok(txn.get_by_dn(dn)?.filter(Entry::is_live)) };
        match op {
            Operation::Add(add) => {
                if txn.get(&add.uniqueid)?.is_some() || txn.get_by_dn(&add.dn)?.is_some() {
                    return Err(Self::refuse(LdapResultCode::AlreadyExists, add.dn.to_string()));
                }
                if add.dn != *root {
                    let parent = add.dn.parent().unwrap_or_else(Dn::root);
                    if live(&parent)?.is_none() {
                        return Err(Self::refuse(LdapResultCode::NoSuchObject, format!("no parent {parent}")));
                    }
                }
            }
            Operation::Delete(del) => {
                if live(&del.dn)?.is_none() {
                    return Err(Self::refuse(LdapResultCode::NoSuchObject, del.dn.to_string()));
                }
                if !txn.children(&del.dn)?.is_empty() {
                    return Err(Self::refuse(LdapResultCode::NotAllowedOnNonLeaf, del.dn.to_string()));
                }
            }
            Operation::Modify(m) => {
                if live(&m.dn)?.is_none() {
                    return Err(Self::refuse(LdapResultCode::NoSuchObject, m.dn.to_string()));
                }
            }
            Operation::ModRdn(m) => {
                let Some(entry) = live(&m.dn)? else {
                    return Err(Self::refuse(LdapResultCode::NoSuchObject, m.dn.to_string()));
                };
                let parent = match &m.new_superior {
                    Some(sup) => {
                        if live(sup)?.is_none() {
                            return Err(Self::refuse(LdapResultCode::NoSuchObject, format!("no superior {sup}")));
                        }
                        sup.clone()
                    }
                    None => m.dn.parent().unwrap_or_else(Dn::root),
                };
                let target = parent.child(&m.new_rdn)?;
                if let Some(occupant) = txn.get_by_dn(&target)? {
                    if occupant.uniqueid() != entry.uniqueid() {
                        return Err(Self::refuse(LdapResultCode::AlreadyExists, target.to_string()));
                    }
                }
            }
        }
        Ok(())
    }

    fn resolve_and_commit(&self, op: &ReplicatedOp) -> Result<UrpDecision, ReplError> {
        let mut txn = Txn::new(self.store.as_ref());
        let decision = self.urp.resolve(&mut txn, &self.settings.root, op)?;
        if !txn.is_empty() {
            self.store.write_batch(txn.into_ops())?;
        }
        Ok(decision)
    }

    /// Apply a client write: validate, stamp, resolve, commit, log.
    pub fn apply_local(&self, op: Operation) -> Result<AppliedOp, ReplError> {
        let _apply = self.apply_lock.lock().map_err(|_| ReplError::poisoned("replica apply"))?;
        if self.settings.replica_type == ReplicaType::Consumer {
            return Err(Self::refuse(LdapResultCode::Referral, "replica is read-only"));
        }
        if !self.can_send_incremental() {
            return Err(Self::refuse(LdapResultCode::Busy, "replica is being initialized"));
        }
        self.check_local(&Txn::new(self.store.as_ref()), &op)?;
        let csn = self.generator.new_csn()?;
        self.lock_state()?.pending.insert(csn);
        let op = ReplicatedOp::new(csn, op);
        let decision = match self.resolve_and_commit(&op) {
            Ok(decision) => decision,
            Err(e) => {
                self.lock_state()?.pending.cancel(&csn);
                return Err(e);
            }
        };
        let mut state = self.lock_state()?;
        self.changelog.append(&op)?;
        if let Some(rolled) = state.pending.commit(csn) {
            state.ruv.update(rolled);
        }
        debug!(replica = %self.settings.name, csn = %csn, kind = %op.op.kind(), "local write applied");
        Ok(AppliedOp { op, decision })
    }

    /// Add a new entry.
    pub fn local_add(&self, dn: Dn, attrs: Vec<(String, Vec<String>)>) -> Result<AppliedOp, ReplError> {
        let parent_uniqueid = match dn.parent() {
            Some(parent) => self.store.lookup_dn(&parent)?,
            None => None,
        };
        self.apply_local(Operation::Add(AddOp {
            dn,
            uniqueid: UniqueId::generate(),
            parent_uniqueid,
            attrs,
        }))
    }

    fn uniqueid_of(&self, dn: &Dn) -> Result<UniqueId, ReplError> {
        self.store
            .lookup_dn(dn)?
            .ok_or_else(|| Self::refuse(LdapResultCode::NoSuchObject, dn.to_string()))
    }

    /// Delete the entry at `dn`.
    pub fn local_delete(&self, dn: Dn) -> Result<AppliedOp, ReplError> {
        let uniqueid = self.uniqueid_of(&dn)?;
        self.apply_local(Operation::Delete(DeleteOp { dn, uniqueid }))
    }

    /// Modify the entry at `dn`.
    pub fn local_modify(&self, dn: Dn, mods: Vec<Mod>) -> Result<AppliedOp, ReplError> {
        let uniqueid = self.uniqueid_of(&dn)?;
        self.apply_local(Operation::Modify(ModifyOp { dn, uniqueid, mods }))
    }

    /// Rename the entry at `dn`.
    pub fn local_rename(
        &self,
        dn: Dn,
        new_rdn: &str,
        new_superior: Option<Dn>,
        delete_old_rdn: bool,
    ) -> Result<AppliedOp, ReplError> {
        let uniqueid = self.uniqueid_of(&dn)?;
        let new_superior_uniqueid = match &new_superior {
            Some(sup) => self.store.lookup_dn(sup)?,
            None => None,
        };
        self.apply_local(Operation::ModRdn(ModRdnOp {
            dn,
            uniqueid,
            new_rdn: new_rdn.to_string(),
            new_superior,
            new_superior_uniqueid,
            delete_old_rdn,
            mods: Vec::new(),
        }))
    }

    /// Apply an update received from a supplier.
    pub fn apply_replicated(&self, op: &ReplicatedOp) -> Result<UrpDecision, ReplError> {
        let _apply = self.apply_lock.lock().map_err(|_| ReplError::poisoned("replica apply"))?;
        if self.lock_state()?.ruv.covers_csn(&op.csn) {
            debug!(replica = %self.settings.name, csn = %op.csn, "update already covered by RUV");
            return Ok(UrpDecision {
                resolution: Resolution::Discarded,
                code: LdapResultCode::AlreadyExists,
            });
        }
        if let Err(e) = self.generator.adjust_time(&op.csn) {
            warn!(replica = %self.settings.name, csn = %op.csn, error = %e, "could not adjust CSN generator");
        }
        let decision = self.resolve_and_commit(op)?;
        let mut state = self.lock_state()?;
        if decision.is_applied() {
            self.changelog.append(op)?;
        }
        if !self.cleaned.is_cleaned_rid(op.csn.rid()) {
            state.ruv.update(op.csn);
        }
        Ok(decision)
    }

    /// CSN before which tombstones and changelog records may go: the
    /// retention boundary, held back by in-progress CSNs.
    pub fn purge_csn(&self) -> Result<Option<Csn>, ReplError> {
        let delay = u32::try_from(self.settings.purge_delay.as_secs()).unwrap_or(u32::MAX);
        let Some(boundary) = now_secs().checked_sub(delay) else {
            return Ok(None);
        };
        let mut purge = Csn::new(boundary, 0, 0, 0);
        if let Some(pending) = self.lock_state()?.pending.min_pending() {
            purge = purge.min(pending);
        }
        Ok(Some(purge))
    }

    /// Trim the changelog and reap old tombstones and cenotaphs. Returns
    /// (changelog records, entries) removed.
    pub fn trim(&self) -> Result<(usize, usize), ReplError> {
        let Some(purge) = self.purge_csn()? else {
            return Ok((0, 0));
        };
        let _apply = self.apply_lock.lock().map_err(|_| ReplError::poisoned("replica apply"))?;
        let trimmed = self.changelog.trim_before(&purge)?;
        let reaped: Vec<StoreOp> = self
            .store
            .scan(&self.settings.root)?
            .into_iter()
            .filter(|e| {
                if e.is_cenotaph() {
                    e.cenotaph_window().map_or(false, |(_, to)| to < purge)
                } else if e.is_tombstone() {
                    e.deletion_csn().map_or(false, |csn| csn < purge)
                } else {
                    false
                }
            })
            .map(|e| StoreOp::Delete(e.uniqueid().clone()))
            .collect();
        let count = reaped.len();
        if count > 0 {
            self.store.write_batch(reaped)?;
        }
        debug!(replica = %self.settings.name, purge = %purge, trimmed, reaped = count, "purged replica history");
        Ok((trimmed, count))
    }

    /// Forget a retired replica id.
    pub fn purge_rid(&self, rid: ReplicaId) -> Result<(), ReplError> {
        let _apply = self.apply_lock.lock().map_err(|_| ReplError::poisoned("replica apply"))?;
        self.lock_state()?.ruv.delete_replica(rid);
        let removed = self.changelog.purge_rid(rid)?;
        info!(replica = %self.settings.name, rid, removed, "purged replica id");
        Ok(())
    }

    /// Every entry a total update sends, parents first.
    pub fn total_entries(&self) -> Result<Vec<Entry>, ReplError> {
        Ok(self
            .store
            .scan(&self.settings.root)?
            .into_iter()
            .filter(|e| !e.is_cenotaph())
            .collect())
    }

    /// Replace the whole subtree with a received total update and adopt the
    /// supplier's RUV.
    pub fn import_total(&self, entries: Vec<Entry>, supplier_ruv: Ruv) -> Result<usize, ReplError> {
        let _apply = self.apply_lock.lock().map_err(|_| ReplError::poisoned("replica apply"))?;
        let incoming: HashSet<UniqueId> = entries.iter().map(|e| e.uniqueid().clone()).collect();
        let mut ops: Vec<StoreOp> = self
            .store
            .scan(&self.settings.root)?
            .into_iter()
            .filter(|e| !incoming.contains(e.uniqueid()))
            .map(|e| StoreOp::Delete(e.uniqueid().clone()))
            .collect();
        let count = entries.len();
        ops.extend(entries.into_iter().map(StoreOp::Put));
        self.store.write_batch(ops)?;
        self.changelog.clear()?;
        let mut state = self.lock_state()?;
        let mut ruv = supplier_ruv;
        if self.settings.replica_type == ReplicaType::Supplier {
            ruv.add_replica(self.settings.rid, None);
        }
        state.ruv = ruv;
        state.pending = PendingCsns::new();
        drop(state);
        info!(replica = %self.settings.name, entries = count, "total update imported");
        self.flush()?;
        Ok(count)
    }

    /// Persist RUV and cleaned replica ids.
    pub fn flush(&self) -> Result<(), ReplError> {
        let state = PersistedReplicaState {
            ruv: self.ruv()?,
            cleaned_rids: self.cleaned.list(),
        };
        self.state_store.save(&self.settings.root, &state)
    }
}

impl Drop for Replica {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!(replica = %self.settings.name, error = %e, "failed to flush replica state");
        }
    }
}

impl fmt::Debug for Replica {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Replica")
            .field("name", &self.settings.name)
            .field("root", &self.settings.root)
            .field("rid", &self.settings.rid)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryEntryStore, MemoryStateStore};

    fn dn(s: &str) -> Dn {
        Dn::parse(s).unwrap()
    }

    fn settings(rid: ReplicaId) -> ReplicaSettings {
        ReplicaSettings {
            name: format!("r{rid}"),
            root: dn("dc=example"),
            rid,
            replica_type: ReplicaType::Supplier,
            update_dns: vec![dn("cn=replication manager,cn=config")],
            purge_delay: DEFAULT_PURGE_DELAY,
            max_clock_skew: crate::csn::DEFAULT_MAX_CLOCK_SKEW_SECS,
        }
    }

    fn replica_with(state_store: Arc<MemoryStateStore>, rid: ReplicaId) -> Replica {
        Replica::new(settings(rid), Arc::new(MemoryEntryStore::new()), state_store, UrpConfig::default()).unwrap()
    }

    fn replica(rid: ReplicaId) -> Replica {
        replica_with(Arc::new(MemoryStateStore::new()), rid)
    }

    fn attrs(pairs: &[(&str, &str)]) -> Vec<(String, Vec<String>)> {
        pairs.iter().map(|(a, v)| (a.to_string(), vec![v.to_string()])).collect()
    }

    fn seed(r: &Replica) {
        r.local_add(dn("dc=example"), attrs(&[("objectclass", "domain"), ("dc", "example")]))
            .unwrap();
    }

    mod settings_validation {
        use super::*;

        #[test]
        fn test_rid_ranges() {
            assert!(settings(1).validate().is_ok());
            assert!(settings(0).validate().is_err());
            assert!(settings(65535).validate().is_err());
            let mut consumer = settings(7);
            consumer.replica_type = ReplicaType::Consumer;
            assert!(consumer.validate().is_err());
            consumer.rid = READ_ONLY_REPLICA_ID;
            assert!(consumer.validate().is_ok());
        }

        #[test]
        fn test_config_dn() {
            assert_eq!(
                replica_config_dn(&dn("dc=Example")),
                "cn=replica,cn=\"dc=example\",cn=mapping tree,cn=config"
            );
        }
    }

    mod access {
        use super::*;

        #[test]
        fn test_exclusive_access() {
            let r = replica(1);
            r.get_exclusive_access("supplier-a", false).unwrap();
            assert!(r.state_bits() & STATE_INCREMENTAL_IN_PROGRESS != 0);
            assert_eq!(
                r.get_exclusive_access("supplier-b", false).unwrap_err().result_code(),
                LdapResultCode::Busy
            );
            assert!(!r.relinquish_exclusive_access("supplier-b"));
            assert!(r.relinquish_exclusive_access("supplier-a"));
            assert_eq!(r.state_bits(), 0);
        }

        #[test]
        fn test_total_bits_exclude_each_other() {
            let r = replica(1);
            r.begin_total_send().unwrap();
            assert!(r.begin_total_send().is_err());
            assert!(r.begin_total_recv().is_err());
            r.end_total_send();
            r.begin_total_recv().unwrap();
            assert!(!r.can_send_incremental());
            assert!(r.get_exclusive_access("x", false).is_err());
        }

        #[test]
        fn test_updatedn() {
            let r = replica(1);
            assert!(r.is_updatedn("CN=Replication Manager,cn=config"));
            assert!(!r.is_updatedn("cn=someone"));
        }
    }

    mod pipeline {
        use super::*;

        #[test]
        fn test_local_write_logs_and_advances_ruv() {
            let r = replica(1);
            seed(&r);
            let applied = r
                .local_add(dn("cn=a,dc=example"), attrs(&[("objectclass", "person"), ("cn", "a")]))
                .unwrap();
            assert!(applied.decision.is_applied());
            assert_eq!(r.changelog().len(), 2);
            assert_eq!(r.ruv().unwrap().max_csn(1), Some(applied.op.csn));
        }

        #[test]
        fn test_local_preconditions() {
            let r = replica(1);
            seed(&r);
            let err = r
                .local_add(dn("cn=a,ou=missing,dc=example"), attrs(&[("cn", "a")]))
                .unwrap_err();
            assert_eq!(err.result_code(), LdapResultCode::NoSuchObject);
            r.local_add(dn("ou=p,dc=example"), attrs(&[("ou", "p")])).unwrap();
            r.local_add(dn("cn=c,ou=p,dc=example"), attrs(&[("cn", "c")])).unwrap();
            assert_eq!(
                r.local_delete(dn("ou=p,dc=example")).unwrap_err().result_code(),
                LdapResultCode::NotAllowedOnNonLeaf
            );
            assert_eq!(
                r.local_add(dn("ou=p,dc=example"), attrs(&[("ou", "p")])).unwrap_err().result_code(),
                LdapResultCode::AlreadyExists
            );
            assert_eq!(r.changelog().len(), 3);
        }

        #[test]
        fn test_replicated_write_and_replay() {
            let a = replica(1);
            let b = replica(2);
            seed(&a);
            let op = a
                .local_add(dn("cn=x,dc=example"), attrs(&[("objectclass", "person"), ("cn", "x")]))
                .unwrap()
                .op;
            let root_op = a.changelog().changes_since(&Ruv::new(), 1).unwrap().remove(0);
            b.apply_replicated(&root_op).unwrap();
            assert!(b.apply_replicated(&op).unwrap().is_applied());
            let replay = b.apply_replicated(&op).unwrap();
            assert_eq!(replay.resolution, Resolution::Discarded);
            assert_eq!(b.ruv().unwrap().max_csn(1), Some(op.csn));
            assert_eq!(b.changelog().len(), 2);
        }

        #[test]
        fn test_cleaned_rid_not_logged() {
            let a = replica(1);
            let b = replica(2);
            seed(&a);
            let op = a.changelog().changes_since(&Ruv::new(), 1).unwrap().remove(0);
            b.cleaned().mark_cleaned(1);
            b.apply_replicated(&op).unwrap();
            assert!(b.changelog().is_empty());
        }

        #[test]
        fn test_consumer_refuses_local_writes() {
            let mut s = settings(READ_ONLY_REPLICA_ID);
            s.replica_type = ReplicaType::Consumer;
            let r = Replica::new(
                s,
                Arc::new(MemoryEntryStore::new()),
                Arc::new(MemoryStateStore::new()),
                UrpConfig::default(),
            )
            .unwrap();
            assert_eq!(
                r.local_add(dn("dc=example"), attrs(&[("dc", "example")])).unwrap_err().result_code(),
                LdapResultCode::Referral
            );
        }
    }

    mod lifecycle {
        use super::*;

        #[test]
        fn test_state_survives_drop() {
            let states = Arc::new(MemoryStateStore::new());
            let max = {
                let r = replica_with(states.clone(), 1);
                seed(&r);
                r.cleaned().mark_cleaned(9);
                r.ruv().unwrap().max_csn(1)
            };
            let r = replica_with(states, 1);
            assert_eq!(r.ruv().unwrap().max_csn(1), max);
            assert!(r.cleaned().is_cleaned_rid(9));
        }

        #[test]
        fn test_import_total_replaces_subtree() {
            let a = replica(1);
            let b = replica(2);
            seed(&a);
            a.local_add(dn("cn=x,dc=example"), attrs(&[("cn", "x")])).unwrap();
            seed(&b);
            b.local_add(dn("cn=stale,dc=example"), attrs(&[("cn", "stale")])).unwrap();
            let imported = b.import_total(a.total_entries().unwrap(), a.ruv().unwrap()).unwrap();
            assert_eq!(imported, 2);
            assert!(b.store().lookup_dn(&dn("cn=stale,dc=example")).unwrap().is_none());
            assert!(b.store().lookup_dn(&dn("cn=x,dc=example")).unwrap().is_some());
            assert!(b.changelog().is_empty());
            let ruv = b.ruv().unwrap();
            assert_eq!(ruv.max_csn(1), a.ruv().unwrap().max_csn(1));
            assert!(ruv.element(2).is_some());
        }

        #[test]
        fn test_purge_rid() {
            let a = replica(1);
            let b = replica(2);
            seed(&a);
            let op = a.changelog().changes_since(&Ruv::new(), 1).unwrap().remove(0);
            b.apply_replicated(&op).unwrap();
            b.purge_rid(1).unwrap();
            assert!(b.ruv().unwrap().element(1).is_none());
            assert!(b.changelog().is_empty());
        }

        #[test]
        fn test_trim_keeps_recent_history() {
            let r = replica(1);
            seed(&r);
            assert_eq!(r.trim().unwrap(), (0, 0));
            assert!(r.purge_csn().unwrap().is_some());
        }
    }
}
