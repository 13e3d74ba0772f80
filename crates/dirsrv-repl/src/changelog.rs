//! Replication changelog.
//!
//! Records are keyed by CSN and stored bincode-encoded. Writes from a
//! replica id retired by CleanAllRUV are dropped at append time.

use crate::cleanallruv::CleanedRids;
use crate::csn::{Csn, ReplicaId};
use crate::error::ReplError;
use crate::op::ReplicatedOp;
use crate::ruv::Ruv;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Ordered log of committed replicated operations.
pub struct Changelog {
    records: RwLock<BTreeMap<Csn, Vec<u8>>>,
    purged: RwLock<Ruv>,
    cleaned: Arc<CleanedRids>,
}

fn log_err<E: std::fmt::Display>(e: E) -> ReplError {
    ReplError::Changelog { msg: e.to_string() }
}

impl Changelog {
    /// Empty changelog sharing the cleaned replica id set.
    pub fn new(cleaned: Arc<CleanedRids>) -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
            purged: RwLock::new(Ruv::new()),
            cleaned,
        }
    }

    /// Append a record. Returns false if the record was dropped because its
    /// replica id has been cleaned.
    pub fn append(&self, op: &ReplicatedOp) -> Result<bool, ReplError> {
        if self.cleaned.is_cleaned_rid(op.csn.rid()) {
            debug!(csn = %op.csn, rid = op.csn.rid(), "dropping changelog write from cleaned replica id");
            return Ok(false);
        }
        let bytes = bincode::serialize(op)?;
        let mut records = self.records.write().map_err(log_err)?;
        records.insert(op.csn, bytes);
        Ok(true)
    }

    /// Record by CSN.
    pub fn get(&self, csn: &Csn) -> Result<Option<ReplicatedOp>, ReplError> {
        let records = self.records.read().map_err(log_err)?;
        match records.get(csn) {
            Some(bytes) => Ok(Some(bincode::deserialize(bytes)?)),
            None => Ok(None),
        }
    }

    /// Up to `limit` changes the consumer described by `consumer` has not
    /// seen, in CSN order. Cleaned replica ids are skipped.
    pub fn changes_since(&self, consumer: &Ruv, limit: usize) -> Result<Vec<ReplicatedOp>, ReplError> {
        let records = self.records.read().map_err(log_err)?;
        let mut changes = Vec::new();
        for (csn, bytes) in records.iter() {
            if changes.len() >= limit {
                break;
            }
            if consumer.covers_csn(csn) || self.cleaned.is_cleaned_rid(csn.rid()) {
                continue;
            }
            changes.push(bincode::deserialize(bytes)?);
        }
        Ok(changes)
    }

    /// True if the consumer is missing changes that were already trimmed,
    /// so it can only be brought up to date by a total update.
    pub fn is_below_purge_point(&self, consumer: &Ruv) -> Result<bool, ReplError> {
        let purged = self.purged.read().map_err(log_err)?;
        Ok(purged
            .elements()
            .iter()
            .filter(|e| !self.cleaned.is_cleaned_rid(e.rid))
            .filter_map(|e| e.csn_max)
            .any(|trimmed| !consumer.covers_csn(&trimmed)))
    }

    /// Remove records strictly older than `bound`. Returns how many went.
    pub fn trim_before(&self, bound: &Csn) -> Result<usize, ReplError> {
        let mut records = self.records.write().map_err(log_err)?;
        let keep = records.split_off(bound);
        let removed = std::mem::replace(&mut *records, keep);
        drop(records);
        let mut purged = self.purged.write().map_err(log_err)?;
        for csn in removed.keys() {
            purged.update(*csn);
        }
        if !removed.is_empty() {
            debug!(count = removed.len(), bound = %bound, "trimmed changelog");
        }
        Ok(removed.len())
    }

    /// Remove every record originated by `rid`.
    pub fn purge_rid(&self, rid: ReplicaId) -> Result<usize, ReplError> {
        let mut records = self.records.write().map_err(log_err)?;
        let before = records.len();
        records.retain(|csn, _| csn.rid() != rid);
        let removed = before - records.len();
        drop(records);
        self.purged.write().map_err(log_err)?.delete_replica(rid);
        Ok(removed)
    }

    /// Remove everything; used when a total update replaces the database.
    pub fn clear(&self) -> Result<(), ReplError> {
        self.records.write().map_err(log_err)?.clear();
        *self.purged.write().map_err(log_err)? = Ruv::new();
        Ok(())
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    /// True if empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dn::Dn;
    use crate::entry::UniqueId;
    use crate::op::{DeleteOp, Operation};

    fn op(ts: u32, rid: ReplicaId) -> ReplicatedOp {
        ReplicatedOp::new(
            Csn::new(ts, 0, rid, 0),
            Operation::Delete(DeleteOp {
                dn: Dn::parse("cn=x,dc=example").unwrap(),
                uniqueid: UniqueId::new(format!("u{ts}")),
            }),
        )
    }

    #[test]
    fn test_changes_since_skips_covered() {
        let log = Changelog::new(Arc::new(CleanedRids::new()));
        for ts in 1..=5 {
            log.append(&op(ts, 1)).unwrap();
        }
        let mut consumer = Ruv::new();
        consumer.update(Csn::new(3, 0, 1, 0));
        let changes = log.changes_since(&consumer, 100).unwrap();
        assert_eq!(changes.iter().map(|c| c.csn.timestamp()).collect::<Vec<_>>(), vec![4, 5]);
        assert_eq!(log.changes_since(&consumer, 1).unwrap().len(), 1);
    }

    #[test]
    fn test_cleaned_rid_dropped_on_append() {
        let cleaned = Arc::new(CleanedRids::new());
        let log = Changelog::new(cleaned.clone());
        cleaned.mark_cleaned(5);
        assert!(!log.append(&op(1, 5)).unwrap());
        assert!(log.append(&op(2, 1)).unwrap());
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_trim_sets_purge_point() {
        let log = Changelog::new(Arc::new(CleanedRids::new()));
        for ts in 1..=5 {
            log.append(&op(ts, 1)).unwrap();
        }
        assert_eq!(log.trim_before(&Csn::new(3, 0, 0, 0)).unwrap(), 2);
        let mut consumer = Ruv::new();
        consumer.update(Csn::new(1, 0, 1, 0));
        assert!(log.is_below_purge_point(&consumer).unwrap());
        consumer.update(Csn::new(2, 0, 1, 0));
        assert!(!log.is_below_purge_point(&consumer).unwrap());
    }

    #[test]
    fn test_purge_rid() {
        let log = Changelog::new(Arc::new(CleanedRids::new()));
        log.append(&op(1, 5)).unwrap();
        log.append(&op(2, 1)).unwrap();
        assert_eq!(log.purge_rid(5).unwrap(), 1);
        assert!(log.get(&Csn::new(1, 0, 5, 0)).unwrap().is_none());
        assert!(log.get(&Csn::new(2, 0, 1, 0)).unwrap().is_some());
    }
}
