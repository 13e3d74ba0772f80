//! Directory entries with replication state.
//!
//! Every attribute carries the CSN of its last update; the entry carries the
//! CSN that fixed its current DN and, once deleted, its deletion CSN. The
//! tombstone, glue, conflict and cenotaph markers are plain attributes so a
//! total update transfers them unchanged.

use crate::csn::Csn;
use crate::dn::Dn;
use crate::op::{AddOp, Mod, ModOp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// `objectclass`.
pub const ATTR_OBJECTCLASS: &str = "objectclass";
/// Unique id attribute, also used to qualify conflict RDNs.
pub const ATTR_UNIQUEID: &str = "nsuniqueid";
/// Conflict reason: `namingConflict (<OP>) <dn>`.
pub const ATTR_CONFLICT: &str = "nsds5replconflict";
/// CSN of the operation that produced a conflict entry.
pub const ATTR_CONFLICT_CSN: &str = "conflictcsn";
/// On a conflict entry parked by a tombstone's deletion window, the unique id
/// of that tombstone.
pub const ATTR_CONFLICT_TOMBSTONE: &str = "conflicttombstoneid";
/// Deletion CSN of a tombstone.
pub const ATTR_TOMBSTONE_CSN: &str = "nstombstonecsn";
/// DN a tombstone or cenotaph had while live.
pub const ATTR_ENTRY_DN: &str = "nscpentrydn";
/// Parent unique id of a tombstone.
pub const ATTR_PARENT_UNIQUEID: &str = "nsparentuniqueid";
/// Why an entry is glue.
pub const ATTR_GLUE_REASON: &str = "nsds5replgluereason";
/// Marks a cenotaph; value is the unique id of the renamed entry.
pub const ATTR_CENOTAPH_ID: &str = "cenotaphid";
/// CSN from which the renamed entry held the vacated DN.
pub const ATTR_CENOTAPH_FROM: &str = "cenotaphfrom";

/// Tombstone objectclass.
pub const OC_TOMBSTONE: &str = "nstombstone";
/// Glue objectclass.
pub const OC_GLUE: &str = "glue";
/// Objectclass allowing any attribute on glue entries.
pub const OC_EXTENSIBLE: &str = "extensibleobject";
/// `top`.
pub const OC_TOP: &str = "top";

/// Conflict reason prefix for naming conflicts.
pub const REASON_NAMING_CONFLICT: &str = "namingConflict";
/// Glue reason for a synthesized missing parent.
pub const GLUE_MISSING_ENTRY: &str = "missingEntry";
/// Glue reason for a delete that hit a non-leaf entry.
pub const GLUE_DELETED_WITH_CHILDREN: &str = "deletedEntryHasChildren";
/// Glue reason for a tombstone brought back as a parent or rename target.
pub const GLUE_RESURRECTED: &str = "resurrectedEntry";

/// RDN of the container holding tombstones and cenotaphs under a suffix.
pub const TOMBSTONE_CONTAINER_RDN: &str = "cn=repl tombstones";

/// Entry unique id, stored lowercase.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UniqueId(String);

impl UniqueId {
    /// Wrap an existing id.
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(id.as_ref().trim().to_ascii_lowercase())
    }

    /// Fresh random id for a locally created entry.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Deterministic id every replica derives from the same seed, used for
    /// glue placeholders and cenotaphs.
    pub fn derived(seed: &str) -> Self {
        Self(Uuid::new_v5(&Uuid::NAMESPACE_OID, seed.to_ascii_lowercase().as_bytes()).to_string())
    }

    /// String form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Values of one attribute and the CSN that last wrote it. An attribute with
/// no values but a CSN remembers a deletion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttrState {
    /// Current values.
    pub values: Vec<String>,
    /// CSN of the last write.
    pub csn: Option<Csn>,
}

/// A directory entry with replication state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    dn: Dn,
    uniqueid: UniqueId,
    attrs: BTreeMap<String, AttrState>,
    dn_csn: Option<Csn>,
    #[serde(default)]
    rename_csn: Option<Csn>,
    deletion_csn: Option<Csn>,
}

impl Entry {
    /// Empty entry.
    pub fn new(dn: Dn, uniqueid: UniqueId) -> Self {
        Self {
            dn,
            uniqueid,
            attrs: BTreeMap::new(),
            dn_csn: None,
            rename_csn: None,
            deletion_csn: None,
        }
    }

    /// Entry as created by a replicated add.
    pub fn from_add(op: &AddOp, csn: Csn) -> Self {
        let mut entry = Self::new(op.dn.clone(), op.uniqueid.clone());
        for (attr, values) in &op.attrs {
            entry.add_values(attr, values.iter().cloned(), Some(csn));
        }
        entry.add_rdn_values(Some(csn));
        entry.dn_csn = Some(csn);
        entry
    }

    /// Current DN.
    pub fn dn(&self) -> &Dn {
        &self.dn
    }

    /// Move the entry; the caller is responsible for the DN-CSN.
    pub fn set_dn(&mut self, dn: Dn) {
        self.dn = dn;
    }

    /// Unique id.
    pub fn uniqueid(&self) -> &UniqueId {
        &self.uniqueid
    }

    /// CSN from which the entry has held its current name. Naming conflicts
    /// compare this value.
    pub fn dn_csn(&self) -> Option<Csn> {
        self.dn_csn
    }

    /// Set the DN-CSN.
    pub fn set_dn_csn(&mut self, csn: Option<Csn>) {
        self.dn_csn = csn;
    }

    /// CSN of the latest add or rename applied to the entry, including
    /// renames that kept the same name.
    pub fn last_rename_csn(&self) -> Option<Csn> {
        self.dn_csn.max(self.rename_csn)
    }

    /// Record a rename that left the name unchanged.
    pub fn set_rename_csn(&mut self, csn: Csn) {
        if Some(csn) > self.rename_csn {
            self.rename_csn = Some(csn);
        }
    }

    /// Deletion CSN, for tombstones.
    pub fn deletion_csn(&self) -> Option<Csn> {
        self.deletion_csn
    }

    /// Set the deletion CSN.
    pub fn set_deletion_csn(&mut self, csn: Option<Csn>) {
        self.deletion_csn = csn;
        match csn {
            Some(c) => self.set_values(ATTR_TOMBSTONE_CSN, vec![c.to_string()], None),
            None => self.remove_attr(ATTR_TOMBSTONE_CSN),
        }
    }

    /// Attribute state.
    pub fn attr(&self, attr: &str) -> Option<&AttrState> {
        self.attrs.get(&attr.to_ascii_lowercase())
    }

    /// Names of attributes that currently have values.
    pub fn attr_names(&self) -> impl Iterator<Item = &str> {
        self.attrs
            .iter()
            .filter(|(_, state)| !state.values.is_empty())
            .map(|(name, _)| name.as_str())
    }

    /// Values of an attribute; empty when absent.
    pub fn values(&self, attr: &str) -> &[String] {
        self.attr(attr).map(|s| s.values.as_slice()).unwrap_or(&[])
    }

    /// First value of an attribute.
    pub fn first_value(&self, attr: &str) -> Option<&str> {
        self.values(attr).first().map(String::as_str)
    }

    /// True if the attribute has at least one value.
    pub fn has_attr(&self, attr: &str) -> bool {
        !self.values(attr).is_empty()
    }

    /// Case-insensitive value test.
    pub fn has_value(&self, attr: &str, value: &str) -> bool {
        self.values(attr).iter().any(|v| v.eq_ignore_ascii_case(value))
    }

    /// Add values that are not already present.
    pub fn add_values<I: IntoIterator<Item = String>>(&mut self, attr: &str, values: I, csn: Option<Csn>) {
        let state = self.attrs.entry(attr.to_ascii_lowercase()).or_default();
        for value in values {
            if !state.values.iter().any(|v| v.eq_ignore_ascii_case(&value)) {
                state.values.push(value);
            }
        }
        if csn.is_some() && csn > state.csn {
            state.csn = csn;
        }
    }

    /// Replace all values.
    pub fn set_values(&mut self, attr: &str, values: Vec<String>, csn: Option<Csn>) {
        let state = self.attrs.entry(attr.to_ascii_lowercase()).or_default();
        state.values = values;
        if csn.is_some() && csn > state.csn {
            state.csn = csn;
        }
    }

    /// Remove specific values (all values when `values` is empty).
    pub fn remove_values(&mut self, attr: &str, values: &[String], csn: Option<Csn>) {
        let key = attr.to_ascii_lowercase();
        if let Some(state) = self.attrs.get_mut(&key) {
            if values.is_empty() {
                state.values.clear();
            } else {
                state
                    .values
                    .retain(|v| !values.iter().any(|r| r.eq_ignore_ascii_case(v)));
            }
            if csn.is_some() && csn > state.csn {
                state.csn = csn;
            }
            if state.values.is_empty() && state.csn.is_none() {
                self.attrs.remove(&key);
            }
        }
    }

    /// Drop an attribute and its state entirely.
    pub fn remove_attr(&mut self, attr: &str) {
        self.attrs.remove(&attr.to_ascii_lowercase());
    }

    /// Objectclass test.
    pub fn has_objectclass(&self, oc: &str) -> bool {
        self.has_value(ATTR_OBJECTCLASS, oc)
    }

    /// Add an objectclass value without touching its CSN.
    pub fn add_objectclass(&mut self, oc: &str) {
        self.add_values(ATTR_OBJECTCLASS, [oc.to_string()], None);
    }

    /// Remove an objectclass value without touching its CSN.
    pub fn remove_objectclass(&mut self, oc: &str) {
        self.remove_values(ATTR_OBJECTCLASS, &[oc.to_string()], None);
    }

    /// Deleted entry kept for replication.
    pub fn is_tombstone(&self) -> bool {
        self.has_objectclass(OC_TOMBSTONE) && !self.is_cenotaph()
    }

    /// Memorial of a DN vacated by a rename.
    pub fn is_cenotaph(&self) -> bool {
        self.has_attr(ATTR_CENOTAPH_ID)
    }

    /// Synthetic placeholder.
    pub fn is_glue(&self) -> bool {
        self.has_objectclass(OC_GLUE)
    }

    /// Loser of a naming conflict.
    pub fn is_conflict(&self) -> bool {
        self.has_attr(ATTR_CONFLICT)
    }

    /// Live entry: not a tombstone or cenotaph.
    pub fn is_live(&self) -> bool {
        !self.has_objectclass(OC_TOMBSTONE)
    }

    /// `nsds5ReplConflict` value.
    pub fn conflict_reason(&self) -> Option<&str> {
        self.first_value(ATTR_CONFLICT)
    }

    /// DN named in the conflict reason, i.e. the DN this entry lost.
    pub fn conflict_dn(&self) -> Option<Dn> {
        let reason = self.conflict_reason()?;
        let (_, dn) = reason.split_once(") ")?;
        Dn::parse(dn).ok()
    }

    /// Tombstone whose deletion window parked this conflict entry.
    pub fn conflict_tombstone(&self) -> Option<UniqueId> {
        self.first_value(ATTR_CONFLICT_TOMBSTONE).map(UniqueId::new)
    }

    /// Glue reason.
    pub fn glue_reason(&self) -> Option<&str> {
        self.first_value(ATTR_GLUE_REASON)
    }

    /// DN a tombstone or cenotaph had while live.
    pub fn original_dn(&self) -> Option<Dn> {
        self.first_value(ATTR_ENTRY_DN).and_then(|dn| Dn::parse(dn).ok())
    }

    /// Parent unique id recorded on a tombstone.
    pub fn parent_uniqueid(&self) -> Option<UniqueId> {
        self.first_value(ATTR_PARENT_UNIQUEID).map(UniqueId::new)
    }

    /// CSN window `(from, to)` during which a cenotaph's entry held its old DN.
    pub fn cenotaph_window(&self) -> Option<(Option<Csn>, Csn)> {
        if !self.is_cenotaph() {
            return None;
        }
        let from = self.first_value(ATTR_CENOTAPH_FROM).and_then(|c| c.parse().ok());
        Some((from, self.deletion_csn?))
    }

    /// Make sure the RDN values are present as attribute values.
    pub fn add_rdn_values(&mut self, csn: Option<Csn>) {
        for (attr, value) in self.dn.rdn_avas() {
            if attr.eq_ignore_ascii_case(ATTR_UNIQUEID) {
                continue;
            }
            self.add_values(&attr, [value], csn);
        }
    }

    /// Apply modifications, skipping attributes already written by a newer CSN.
    /// Returns true if anything changed.
    pub fn apply_mods(&mut self, mods: &[Mod], csn: Csn) -> bool {
        let before = self.attrs.clone();
        for m in mods {
            if self.attr(&m.attr).and_then(|s| s.csn).map_or(false, |last| last > csn) {
                continue;
            }
            match m.op {
                ModOp::Add => self.add_values(&m.attr, m.values.iter().cloned(), Some(csn)),
                ModOp::Replace => self.set_values(&m.attr, m.values.clone(), Some(csn)),
                ModOp::Delete => self.remove_values(&m.attr, &m.values, Some(csn)),
            }
        }
        before != self.attrs
    }

    /// User-visible attributes, without replication markers.
    pub fn user_attrs(&self) -> BTreeMap<String, Vec<String>> {
        const MARKERS: [&str; 9] = [
            ATTR_CONFLICT,
            ATTR_CONFLICT_CSN,
            ATTR_TOMBSTONE_CSN,
            ATTR_ENTRY_DN,
            ATTR_PARENT_UNIQUEID,
            ATTR_GLUE_REASON,
            ATTR_CENOTAPH_ID,
            ATTR_CENOTAPH_FROM,
            ATTR_UNIQUEID,
        ];
        self.attrs
            .iter()
            .filter(|(name, state)| !state.values.is_empty() && !MARKERS.contains(&name.as_str()))
            .map(|(name, state)| {
                let mut values = state.values.clone();
                if name == ATTR_OBJECTCLASS {
                    values.retain(|v| {
                        !v.eq_ignore_ascii_case(OC_GLUE) && !v.eq_ignore_ascii_case(OC_TOMBSTONE)
                    });
                }
                values.sort_by_key(|v| v.to_ascii_lowercase());
                (name.clone(), values)
            })
            .filter(|(_, values)| !values.is_empty())
            .collect()
    }

    /// Attributes as `(name, values)` pairs, for sending.
    pub fn to_attr_pairs(&self) -> Vec<(String, Vec<String>)> {
        self.attrs
            .iter()
            .filter(|(_, s)| !s.values.is_empty())
            .map(|(name, s)| (name.clone(), s.values.clone()))
            .collect()
    }
}

/// `nsuniqueid=<id>+<rdn>`: the RDN a conflict loser is parked under.
pub fn qualified_rdn(uniqueid: &UniqueId, rdn: &str) -> String {
    format!("{}={}+{}", ATTR_UNIQUEID, uniqueid, rdn)
}

/// True if the RDN carries a unique-id qualification.
pub fn is_qualified_rdn(rdn: &str) -> bool {
    crate::dn::rdn_avas(rdn)
        .iter()
        .any(|(attr, _)| attr.eq_ignore_ascii_case(ATTR_UNIQUEID))
}

/// The RDN without its unique-id qualification; `None` if nothing remains.
pub fn unqualified_rdn(rdn: &str) -> Option<String> {
    let avas: Vec<String> = crate::dn::rdn_avas(rdn)
        .into_iter()
        .filter(|(attr, _)| !attr.eq_ignore_ascii_case(ATTR_UNIQUEID))
        .map(|(attr, value)| format!("{attr}={value}"))
        .collect();
    if avas.is_empty() {
        None
    } else {
        Some(avas.join("+"))
    }
}

/// Conflict reason value for a naming conflict.
pub fn naming_conflict_reason(op: crate::op::OpType, dn: &Dn) -> String {
    format!("{} ({}) {}", REASON_NAMING_CONFLICT, op.label(), dn)
}
