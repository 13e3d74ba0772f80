//! Update Resolution Procedures.
//!
//! Every replicated operation passes through [`Urp::resolve`] inside the same
//! [`Txn`] as the write itself. Decisions compare CSNs only, so replicas that
//! see the same operations in different orders end in the same state.
//!
//! Naming conflicts: the operation with the smaller CSN keeps the contested
//! DN; the other entry is parked under `nsuniqueid=<id>+<rdn>,<parent>` and
//! tagged with `nsds5ReplConflict`.

use crate::csn::Csn;
use crate::dn::{rdn_avas, Dn};
use crate::entry::{
    is_qualified_rdn, Entry, UniqueId, ATTR_CONFLICT_TOMBSTONE, ATTR_UNIQUEID, GLUE_DELETED_WITH_CHILDREN,
    GLUE_RESURRECTED,
};
use crate::error::ReplError;
use crate::ldap::LdapResultCode;
use crate::op::{AddOp, DeleteOp, ModRdnOp, ModifyOp, OpType, Operation, ReplicatedOp};
use crate::store::Txn;
use crate::urp_fixup as fixup;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

/// Default cap on conflict candidates examined when healing a freed DN.
pub const DEFAULT_MAX_CONFLICT_CANDIDATES: usize = 5;

/// URP tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UrpConfig {
    /// Conflict siblings examined per healed DN.
    pub max_conflict_candidates: usize,
}

impl Default for UrpConfig {
    fn default() -> Self {
        Self {
            max_conflict_candidates: DEFAULT_MAX_CONFLICT_CANDIDATES,
        }
    }
}

/// What URP did with an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resolution {
    /// Applied as requested.
    Applied,
    /// Applied, but the new or renamed entry lost its DN and was parked.
    AppliedAsConflict,
    /// Applied; the entry previously holding the DN was parked.
    RenamedExisting,
    /// Delete of a non-leaf turned the entry into glue.
    ConvertedToGlue,
    /// Delete of a tombstone removed a conflict of the same entry instead.
    TombstonedConflict,
    /// Delete was redirected to the entry that owns the requested DN.
    Retargeted,
    /// Rename resurrected a tombstone as glue before applying.
    Resurrected,
    /// Superseded or replayed; nothing written.
    Discarded,
}

/// Outcome of one URP decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UrpDecision {
    /// What happened.
    pub resolution: Resolution,
    /// Result code reported for the operation.
    pub code: LdapResultCode,
}

impl UrpDecision {
    fn applied(resolution: Resolution) -> Self {
        Self {
            resolution,
            code: LdapResultCode::Success,
        }
    }

    fn discard(code: LdapResultCode) -> Self {
        Self {
            resolution: Resolution::Discarded,
            code,
        }
    }

    /// True if the operation changed the store and belongs in the changelog.
    pub fn is_applied(&self) -> bool {
        self.resolution != Resolution::Discarded
    }
}

/// URP engine.
#[derive(Debug, Clone, Default)]
pub struct Urp {
    config: UrpConfig,
}

impl Urp {
    /// Engine with the given tunables.
    pub fn new(config: UrpConfig) -> Self {
        Self { config }
    }

    /// Resolve `op` against the replica rooted at `root`, buffering every
    /// resulting write in `txn`.
    pub fn resolve(&self, txn: &mut Txn<'_>, root: &Dn, op: &ReplicatedOp) -> Result<UrpDecision, ReplError> {
        if !op.op.dn().is_within(root) {
            return Err(ReplError::Refused {
                code: LdapResultCode::UnwillingToPerform,
                msg: format!("{} is outside replica {}", op.op.dn(), root),
            });
        }
        let decision = match &op.op {
            Operation::Add(add) => self.add(txn, root, add, op.csn)?,
            Operation::Delete(del) => self.delete(txn, root, del, op.csn)?,
            Operation::Modify(modify) => self.modify(txn, modify, op.csn)?,
            Operation::ModRdn(modrdn) => self.modrdn(txn, root, modrdn, op.csn)?,
        };
        debug!(
            csn = %op.csn,
            op = %op.op.kind(),
            uniqueid = %op.op.uniqueid(),
            resolution = ?decision.resolution,
            code = %decision.code,
            "urp decision"
        );
        Ok(decision)
    }

    fn add(&self, txn: &mut Txn<'_>, root: &Dn, op: &AddOp, csn: Csn) -> Result<UrpDecision, ReplError> {
        if let Some(existing) = txn.get(&op.uniqueid)? {
            if existing.is_live() && existing.is_glue() {
                fixup::glue_to_entry(txn, existing, &op.attrs, csn)?;
                return Ok(UrpDecision::applied(Resolution::Applied));
            }
            debug!(uniqueid = %op.uniqueid, csn = %csn, "add replay discarded");
            return Ok(UrpDecision::discard(LdapResultCode::AlreadyExists));
        }

        let target = if op.dn.is_descendant_of(root) {
            let rdn = op.dn.rdn().ok_or_else(|| ReplError::InvalidDn {
                dn: op.dn.to_string(),
                msg: "empty RDN".to_string(),
            })?;
            let parent = fixup::ensure_parent(txn, root, &op.dn, op.parent_uniqueid.as_ref(), csn)
                .map_err(|e| divergence_logged("glue synthesis failed", &op.dn, csn, e))?;
            parent.child(rdn)?
        } else {
            op.dn.clone()
        };
        let mut entry = Entry::from_add(op, csn);
        entry.set_dn(target.clone());

        let remembered = txn.by_original_dn(&target)?;
        let straddled = remembered
            .iter()
            .filter(|t| t.is_tombstone())
            .find(|t| {
                t.deletion_csn().map_or(false, |d| d < csn)
                    && remembered
                        .iter()
                        .filter_map(Entry::cenotaph_window)
                        .any(|(_, upper)| csn < upper)
            })
            .map(|t| t.uniqueid().clone());
        if let Some(tombstone) = straddled {
            entry.set_values(ATTR_CONFLICT_TOMBSTONE, vec![tombstone.to_string()], None);
            return self.park_incoming(txn, entry, &target, csn);
        }
        for tombstone in remembered.into_iter().filter(Entry::is_tombstone) {
            if tombstone.deletion_csn().map_or(false, |d| csn < d) {
                fixup::tombstone_to_conflict(txn, tombstone, OpType::Add, csn)?;
            }
        }

        if let Some(occupant) = txn.get_by_dn(&target)? {
            return match occupant.dn_csn() {
                Some(c) if c == csn => Err(divergence_logged(
                    "equal CSNs for different entries",
                    &target,
                    csn,
                    ReplError::Divergence {
                        msg: format!("{} and {} both claim {} with CSN {}", occupant.uniqueid(), op.uniqueid, target, csn),
                    },
                )),
                Some(c) if c > csn => {
                    fixup::park_as_conflict(txn, occupant, &target, OpType::Add, csn)?;
                    txn.put(entry);
                    Ok(UrpDecision::applied(Resolution::RenamedExisting))
                }
                _ => self.park_incoming(txn, entry, &target, csn),
            };
        }
        txn.put(entry);
        Ok(UrpDecision::applied(Resolution::Applied))
    }

    fn park_incoming(&self, txn: &mut Txn<'_>, mut entry: Entry, target: &Dn, csn: Csn) -> Result<UrpDecision, ReplError> {
        fixup::mark_conflict(&mut entry, target, OpType::Add, csn);
        entry.set_dn(fixup::conflict_dn(target, entry.uniqueid())?);
        info!(uniqueid = %entry.uniqueid(), dn = %target, csn = %csn, "naming conflict: added entry parked");
        txn.put(entry);
        Ok(UrpDecision::applied(Resolution::AppliedAsConflict))
    }

    fn delete(&self, txn: &mut Txn<'_>, root: &Dn, op: &DeleteOp, csn: Csn) -> Result<UrpDecision, ReplError> {
        let entry = match txn.get(&op.uniqueid)? {
            Some(entry) if !entry.is_cenotaph() => entry,
            _ => {
                debug!(uniqueid = %op.uniqueid, csn = %csn, "delete of missing entry discarded");
                return Ok(UrpDecision::discard(LdapResultCode::NoSuchObject));
            }
        };

        if !entry.is_live() {
            return self.delete_tombstone(txn, root, entry, csn);
        }

        let children = txn.children(entry.dn())?;
        if !children.is_empty() {
            match self.conflict_sibling(txn, entry.dn(), entry.uniqueid())? {
                Some(sibling) => {
                    for child in children {
                        let rdn = child.dn().rdn().unwrap_or_default().to_string();
                        let mut dest = sibling.dn().child(&rdn)?;
                        if txn.get_by_dn(&dest)?.is_some() {
                            dest = fixup::conflict_dn(&dest, child.uniqueid())?;
                        }
                        txn.move_subtree(child, dest)?;
                    }
                    debug!(uniqueid = %op.uniqueid, sibling = %sibling.uniqueid(), "children moved under conflict sibling");
                }
                None => {
                    fixup::entry_to_glue(txn, entry, GLUE_DELETED_WITH_CHILDREN)?;
                    return Ok(UrpDecision::applied(Resolution::ConvertedToGlue));
                }
            }
        }

        let mut target = entry;
        let mut resolution = Resolution::Applied;
        if target.is_conflict() && op.dn != *target.dn() {
            let better = match txn.get_by_dn(&op.dn)? {
                Some(valid)
                    if valid.is_live()
                        && !valid.is_conflict()
                        && valid.uniqueid() != target.uniqueid()
                        && valid.dn_csn() < target.dn_csn()
                        && txn.children(valid.dn())?.is_empty() =>
                {
                    Some(valid)
                }
                _ => None,
            };
            match better {
                Some(valid) => {
                    info!(requested = %target.uniqueid(), retargeted = %valid.uniqueid(), dn = %op.dn, "delete retargeted");
                    target = valid;
                    resolution = Resolution::Retargeted;
                }
                None => fixup::clear_conflict(&mut target),
            }
        }

        if resolution == Resolution::Applied && target.last_rename_csn().map_or(false, |d| d > csn) {
            debug!(uniqueid = %target.uniqueid(), csn = %csn, "delete superseded by later rename");
            return Ok(UrpDecision::discard(LdapResultCode::Success));
        }

        let freed = target.dn().clone();
        fixup::entry_to_tombstone(txn, root, target, csn)?;
        self.remove_naming_conflict(txn, &freed)?;
        Ok(UrpDecision::applied(resolution))
    }

    fn delete_tombstone(&self, txn: &mut Txn<'_>, root: &Dn, mut tombstone: Entry, csn: Csn) -> Result<UrpDecision, ReplError> {
        if tombstone.deletion_csn() == Some(csn) {
            debug!(uniqueid = %tombstone.uniqueid(), csn = %csn, "delete replay discarded");
            return Ok(UrpDecision::discard(LdapResultCode::AlreadyExists));
        }
        if let Some(original) = tombstone.original_dn() {
            if let Some(conflict) = self.parked_by(txn, &original, tombstone.uniqueid())? {
                if txn.children(conflict.dn())?.is_empty() {
                    info!(
                        uniqueid = %tombstone.uniqueid(),
                        conflict = %conflict.uniqueid(),
                        "delete of tombstone applied to its conflict entry"
                    );
                    fixup::entry_to_tombstone(txn, root, conflict, csn)?;
                    return Ok(UrpDecision::applied(Resolution::TombstonedConflict));
                }
            }
        }
        if tombstone.deletion_csn().map_or(false, |d| csn < d) {
            tombstone.set_deletion_csn(Some(csn));
            txn.put(tombstone);
            return Ok(UrpDecision::applied(Resolution::Applied));
        }
        Ok(UrpDecision::discard(LdapResultCode::AlreadyExists))
    }

    fn modify(&self, txn: &mut Txn<'_>, op: &ModifyOp, csn: Csn) -> Result<UrpDecision, ReplError> {
        let mut entry = match txn.get(&op.uniqueid)? {
            Some(entry) if entry.is_live() => entry,
            _ => {
                debug!(uniqueid = %op.uniqueid, csn = %csn, "modify of missing entry discarded");
                return Ok(UrpDecision::discard(LdapResultCode::NoSuchObject));
            }
        };
        if entry.apply_mods(&op.mods, csn) {
            txn.put(entry);
        }
        Ok(UrpDecision::applied(Resolution::Applied))
    }

    fn modrdn(&self, txn: &mut Txn<'_>, root: &Dn, op: &ModRdnOp, csn: Csn) -> Result<UrpDecision, ReplError> {
        let mut entry = match txn.get(&op.uniqueid)? {
            Some(entry) if !entry.is_cenotaph() => entry,
            _ => {
                debug!(uniqueid = %op.uniqueid, csn = %csn, "rename of missing entry discarded");
                return Ok(UrpDecision::discard(LdapResultCode::NoSuchObject));
            }
        };
        if entry.last_rename_csn().map_or(false, |d| d >= csn) {
            return self.superseded_rename(txn, entry, op, csn);
        }

        let mut resolution = Resolution::Applied;
        if !entry.is_live() {
            match entry.deletion_csn() {
                Some(deleted) if deleted < csn => {
                    entry = fixup::tombstone_to_glue(txn, root, entry, GLUE_RESURRECTED, csn)?;
                    resolution = Resolution::Resurrected;
                }
                _ => {
                    debug!(uniqueid = %op.uniqueid, csn = %csn, "rename of entry deleted earlier discarded");
                    return Ok(UrpDecision::discard(LdapResultCode::NoSuchObject));
                }
            }
        }

        let old_dn = entry.dn().clone();
        let old_dn_csn = entry.dn_csn();
        let contested_before = entry.conflict_dn();
        let name_before = contested_before.clone().unwrap_or_else(|| old_dn.clone());

        let parent = match &op.new_superior {
            Some(superior) => {
                let placement = superior.child(&op.new_rdn)?;
                if placement.is_descendant_of(root) {
                    fixup::ensure_parent(txn, root, &placement, op.new_superior_uniqueid.as_ref(), csn)
                        .map_err(|e| divergence_logged("glue synthesis failed", &placement, csn, e))?
                } else {
                    superior.clone()
                }
            }
            None => old_dn.parent().ok_or_else(|| ReplError::InvalidDn {
                dn: old_dn.to_string(),
                msg: "cannot rename the root DSE".to_string(),
            })?,
        };
        let requested = parent.child(&op.new_rdn)?;
        if !requested.is_within(root) {
            return Err(ReplError::Refused {
                code: LdapResultCode::UnwillingToPerform,
                msg: format!("{requested} is outside replica {root}"),
            });
        }

        // A rename that keeps the name (same DN up to case) keeps the entry's
        // claim on it.
        let moving = requested != name_before;
        let claim = if moving { csn } else { entry.dn_csn().unwrap_or(csn) };

        let mut lost = false;
        if let Some(occupant) = txn.get_by_dn(&requested)? {
            if occupant.uniqueid() != entry.uniqueid() {
                match occupant.dn_csn() {
                    Some(c) if c == claim => {
                        return Err(divergence_logged(
                            "equal CSNs for different entries",
                            &requested,
                            csn,
                            ReplError::Divergence {
                                msg: format!("{} and {} both claim {} with CSN {}", occupant.uniqueid(), op.uniqueid, requested, csn),
                            },
                        ))
                    }
                    Some(c) if c > claim => {
                        fixup::park_as_conflict(txn, occupant, &requested, OpType::ModRdn, csn)?;
                        if resolution == Resolution::Applied {
                            resolution = Resolution::RenamedExisting;
                        }
                    }
                    _ => lost = true,
                }
            }
        }

        let new_avas = rdn_avas(&op.new_rdn);
        if op.delete_old_rdn {
            for (attr, value) in old_dn.rdn_avas() {
                if attr.eq_ignore_ascii_case(ATTR_UNIQUEID) {
                    continue;
                }
                let kept = new_avas
                    .iter()
                    .any(|(a, v)| a.eq_ignore_ascii_case(&attr) && v.eq_ignore_ascii_case(&value));
                if !kept {
                    entry.remove_values(&attr, &[value], Some(csn));
                }
            }
        }
        for (attr, value) in new_avas {
            if !attr.eq_ignore_ascii_case(ATTR_UNIQUEID) {
                entry.add_values(&attr, [value], Some(csn));
            }
        }
        entry.apply_mods(&op.mods, csn);
        if moving {
            entry.set_dn_csn(Some(csn));
        }
        entry.set_rename_csn(csn);

        let was_conflict = entry.is_conflict();
        let dest = if lost {
            if moving {
                fixup::clear_conflict(&mut entry);
                fixup::mark_conflict(&mut entry, &requested, OpType::ModRdn, csn);
                info!(uniqueid = %op.uniqueid, dn = %requested, csn = %csn, "naming conflict: renamed entry parked");
            }
            resolution = Resolution::AppliedAsConflict;
            fixup::conflict_dn(&requested, entry.uniqueid())?
        } else {
            fixup::clear_conflict(&mut entry);
            requested
        };
        let id = entry.uniqueid().clone();
        txn.move_subtree(entry, dest.clone())?;

        if was_conflict && !lost && moving {
            let vacated = contested_before.unwrap_or_else(|| old_dn.clone());
            fixup::add_cenotaph(txn, root, &id, &vacated, old_dn_csn, csn)?;
        }
        if old_dn != dest {
            self.remove_naming_conflict(txn, &old_dn)?;
        }
        Ok(UrpDecision::applied(resolution))
    }

    /// A rename older than the entry's latest one. If it would have moved the
    /// entry off its current name, then in CSN order the entry only came back
    /// to that name with the latest rename, and its claim moves up to match.
    fn superseded_rename(&self, txn: &mut Txn<'_>, mut entry: Entry, op: &ModRdnOp, csn: Csn) -> Result<UrpDecision, ReplError> {
        let stale = UrpDecision::discard(LdapResultCode::UnwillingToPerform);
        let (Some(claim), Some(latest)) = (entry.dn_csn(), entry.last_rename_csn()) else {
            return Ok(stale);
        };
        if !entry.is_live() || claim >= csn {
            debug!(uniqueid = %op.uniqueid, csn = %csn, "rename superseded");
            return Ok(stale);
        }
        let parent = match (&op.new_superior, op.dn.parent()) {
            (Some(superior), _) => superior.clone(),
            (None, Some(parent)) => parent,
            (None, None) => return Ok(stale),
        };
        let name = entry.conflict_dn().unwrap_or_else(|| entry.dn().clone());
        if parent.child(&op.new_rdn)? == name {
            debug!(uniqueid = %op.uniqueid, csn = %csn, "rename superseded");
            return Ok(stale);
        }

        entry.set_dn_csn(Some(latest));
        debug!(uniqueid = %op.uniqueid, csn = %csn, claim = %latest, "stale rename moved the name claim forward");
        match self.conflict_sibling(txn, &name, entry.uniqueid())? {
            Some(rival) if !entry.is_conflict() && rival.dn_csn() < Some(latest) => {
                fixup::park_as_conflict(txn, entry, &name, OpType::ModRdn, latest)?;
                self.remove_naming_conflict(txn, &name)?;
                Ok(UrpDecision::applied(Resolution::AppliedAsConflict))
            }
            _ => {
                txn.put(entry);
                Ok(UrpDecision::applied(Resolution::Applied))
            }
        }
    }

    /// Live conflict entry parked for `dn` by the deletion window of
    /// `tombstone`.
    fn parked_by(&self, txn: &Txn<'_>, dn: &Dn, tombstone: &UniqueId) -> Result<Option<Entry>, ReplError> {
        let Some(parent) = dn.parent() else {
            return Ok(None);
        };
        Ok(txn
            .children(&parent)?
            .into_iter()
            .filter(|e| {
                e.is_live()
                    && e.is_conflict()
                    && e.conflict_dn().as_ref() == Some(dn)
                    && e.conflict_tombstone().as_ref() == Some(tombstone)
            })
            .min_by_key(Entry::dn_csn))
    }

    /// Live conflict entry, other than `exclude`, that lost `dn`. Smallest
    /// DN-CSN first.
    fn conflict_sibling(&self, txn: &Txn<'_>, dn: &Dn, exclude: &UniqueId) -> Result<Option<Entry>, ReplError> {
        let Some(parent) = dn.parent() else {
            return Ok(None);
        };
        Ok(txn
            .children(&parent)?
            .into_iter()
            .filter(|e| e.uniqueid() != exclude && e.is_conflict() && e.conflict_dn().as_ref() == Some(dn))
            .min_by_key(Entry::dn_csn))
    }

    /// After `freed` was vacated, restore the oldest conflict entry parked
    /// for it. Returns the healed entry's unique id.
    pub fn remove_naming_conflict(&self, txn: &mut Txn<'_>, freed: &Dn) -> Result<Option<UniqueId>, ReplError> {
        let Some(rdn) = freed.rdn() else {
            return Ok(None);
        };
        if is_qualified_rdn(rdn) || txn.get_by_dn(freed)?.is_some() {
            return Ok(None);
        }
        let Some(parent) = freed.parent() else {
            return Ok(None);
        };
        let mut candidates = Vec::new();
        for child in txn.children(&parent)? {
            if candidates.len() >= self.config.max_conflict_candidates {
                debug!(dn = %freed, cap = self.config.max_conflict_candidates, "conflict candidate scan capped");
                break;
            }
            if !child.is_conflict() || !child.dn().rdn().map_or(false, is_qualified_rdn) {
                continue;
            }
            if fixup::plain_dn(child.dn()).as_ref() == Some(freed) {
                candidates.push(child);
            }
        }
        let Some(winner) = candidates.into_iter().min_by_key(Entry::dn_csn) else {
            return Ok(None);
        };
        let id = winner.uniqueid().clone();
        info!(uniqueid = %id, dn = %freed, "naming conflict healed");
        fixup::resolve_conflict(txn, winner, freed.clone())?;
        Ok(Some(id))
    }
}

fn divergence_logged(what: &str, dn: &Dn, csn: Csn, err: ReplError) -> ReplError {
    error!(dn = %dn, csn = %csn, error = %err, "replication divergence: {what}; administrative intervention required");
    match err {
        ReplError::Divergence { .. } => err,
        other => ReplError::Divergence {
            msg: format!("{what} for {dn}: {other}"),
        },
    }
}
