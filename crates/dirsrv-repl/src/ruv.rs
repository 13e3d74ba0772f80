//! Replica Update Vector and the in-progress CSN list.

use crate::csn::{Csn, ReplicaId};
use crate::error::ReplError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One replica's contribution to a RUV.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuvElement {
    /// Replica id.
    pub rid: ReplicaId,
    /// First CSN seen from this replica.
    pub csn_min: Option<Csn>,
    /// Largest CSN seen from this replica.
    pub csn_max: Option<Csn>,
    /// Peer URL of the replica, when known.
    pub purl: Option<String>,
}

/// Per-replica high-water marks.
///
/// The max CSN of a replica id never decreases. Elements keep insertion
/// order; the local replica is conventionally first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ruv {
    generation: Option<String>,
    elements: Vec<RuvElement>,
}

impl Ruv {
    /// Empty RUV.
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty RUV tagged with a replica generation.
    pub fn with_generation(generation: impl Into<String>) -> Self {
        Self {
            generation: Some(generation.into()),
            elements: Vec::new(),
        }
    }

    /// Replica generation, set when the database was initialized.
    pub fn generation(&self) -> Option<&str> {
        self.generation.as_deref()
    }

    /// Elements in order.
    pub fn elements(&self) -> &[RuvElement] {
        &self.elements
    }

    /// Known replica ids.
    pub fn replica_ids(&self) -> Vec<ReplicaId> {
        self.elements.iter().map(|e| e.rid).collect()
    }

    /// Element for `rid`.
    pub fn element(&self, rid: ReplicaId) -> Option<&RuvElement> {
        self.elements.iter().find(|e| e.rid == rid)
    }

    /// Register a replica id with no CSNs yet.
    pub fn add_replica(&mut self, rid: ReplicaId, purl: Option<String>) {
        match self.elements.iter_mut().find(|e| e.rid == rid) {
            Some(element) => {
                if purl.is_some() {
                    element.purl = purl;
                }
            }
            None => self.elements.push(RuvElement {
                rid,
                csn_min: None,
                csn_max: None,
                purl,
            }),
        }
    }

    /// Record `csn`. Returns true if the max CSN for its replica advanced.
    pub fn update(&mut self, csn: Csn) -> bool {
        let rid = csn.rid();
        let element = match self.elements.iter_mut().position(|e| e.rid == rid) {
            Some(idx) => &mut self.elements[idx],
            None => {
                self.elements.push(RuvElement {
                    rid,
                    csn_min: None,
                    csn_max: None,
                    purl: None,
                });
                let last = self.elements.len() - 1;
                &mut self.elements[last]
            }
        };
        if element.csn_min.map_or(true, |min| csn < min) {
            element.csn_min = Some(csn);
        }
        if element.csn_max.map_or(true, |max| csn > max) {
            element.csn_max = Some(csn);
            return true;
        }
        false
    }

    /// Largest CSN seen from `rid`.
    pub fn max_csn(&self, rid: ReplicaId) -> Option<Csn> {
        self.element(rid).and_then(|e| e.csn_max)
    }

    /// First CSN seen from `rid`.
    pub fn min_csn(&self, rid: ReplicaId) -> Option<Csn> {
        self.element(rid).and_then(|e| e.csn_min)
    }

    /// Largest CSN across all replicas.
    pub fn largest_csn(&self) -> Option<Csn> {
        self.elements.iter().filter_map(|e| e.csn_max).max()
    }

    /// Smallest of the per-replica max CSNs; the basis of the purge point.
    pub fn min_max_csn(&self) -> Option<Csn> {
        self.elements.iter().filter_map(|e| e.csn_max).min()
    }

    /// True if the change identified by `csn` is already reflected here.
    pub fn covers_csn(&self, csn: &Csn) -> bool {
        self.max_csn(csn.rid()).map_or(false, |max| *csn <= max)
    }

    /// True if every max CSN of `other` is covered by this RUV.
    pub fn covers_ruv(&self, other: &Ruv) -> bool {
        other
            .elements
            .iter()
            .filter_map(|e| e.csn_max)
            .all(|csn| self.covers_csn(&csn))
    }

    /// Remove a retired replica id.
    pub fn delete_replica(&mut self, rid: ReplicaId) -> Option<RuvElement> {
        let idx = self.elements.iter().position(|e| e.rid == rid)?;
        Some(self.elements.remove(idx))
    }

    /// Render in the `nsds50ruv` attribute form.
    pub fn to_values(&self) -> Vec<String> {
        let mut values = Vec::with_capacity(self.elements.len() + 1);
        if let Some(gen) = &self.generation {
            values.push(format!("{{replicageneration}} {gen}"));
        }
        for e in &self.elements {
            let mut value = format!("{{replica {}", e.rid);
            if let Some(purl) = &e.purl {
                value.push(' ');
                value.push_str(purl);
            }
            value.push('}');
            if let (Some(min), Some(max)) = (e.csn_min, e.csn_max) {
                value.push_str(&format!(" {min} {max}"));
            }
            values.push(value);
        }
        values
    }

    /// Parse the `nsds50ruv` attribute form.
    pub fn from_values<S: AsRef<str>>(values: &[S]) -> Result<Self, ReplError> {
        let mut ruv = Ruv::new();
        for value in values {
            let value = value.as_ref().trim();
            let invalid = || ReplError::InvalidArgument {
                msg: format!("malformed RUV element: {value}"),
            };
            if let Some(gen) = value.strip_prefix("{replicageneration}") {
                ruv.generation = Some(gen.trim().to_string());
                continue;
            }
            let rest = value.strip_prefix("{replica ").ok_or_else(invalid)?;
            let (head, tail) = rest.split_once('}').ok_or_else(invalid)?;
            let mut head = head.split_whitespace();
            let rid: ReplicaId = head.next().and_then(|r| r.parse().ok()).ok_or_else(invalid)?;
            let purl = head.next().map(str::to_string);
            let csns: Vec<&str> = tail.split_whitespace().collect();
            let (csn_min, csn_max) = match csns.as_slice() {
                [] => (None, None),
                [min, max] => (Some(min.parse()?), Some(max.parse()?)),
                _ => return Err(invalid()),
            };
            ruv.elements.push(RuvElement {
                rid,
                csn_min,
                csn_max,
                purl,
            });
        }
        Ok(ruv)
    }
}

/// CSNs generated locally but not yet committed.
///
/// The RUV may only advance to a CSN once every earlier pending CSN has been
/// committed or cancelled; pending CSNs also hold back the purge point.
#[derive(Debug, Default)]
pub struct PendingCsns {
    entries: BTreeMap<Csn, bool>,
}

impl PendingCsns {
    /// Empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a newly generated CSN.
    pub fn insert(&mut self, csn: Csn) {
        self.entries.entry(csn).or_insert(false);
    }

    /// Mark `csn` committed and return the largest CSN that can now be folded
    /// into the RUV, if any.
    pub fn commit(&mut self, csn: Csn) -> Option<Csn> {
        if let Some(committed) = self.entries.get_mut(&csn) {
            *committed = true;
        }
        self.roll_up()
    }

    /// Forget a CSN whose operation failed.
    pub fn cancel(&mut self, csn: &Csn) -> Option<Csn> {
        self.entries.remove(csn);
        self.roll_up()
    }

    /// Smallest CSN still in progress.
    pub fn min_pending(&self) -> Option<Csn> {
        self.entries.iter().find(|(_, committed)| !**committed).map(|(csn, _)| *csn)
    }

    /// Number of tracked CSNs.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn roll_up(&mut self) -> Option<Csn> {
        let mut rolled = None;
        while let Some((&csn, &committed)) = self.entries.iter().next() {
            if !committed {
                break;
            }
            self.entries.remove(&csn);
            rolled = Some(csn);
        }
        rolled
    }
}
