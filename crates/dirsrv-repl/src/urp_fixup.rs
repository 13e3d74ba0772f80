//! Placeholder state transitions used by the URP engine.
//!
//! Tombstone, glue and conflict are interconvertible states. Each transition
//! checks the current markers first, so applying it twice is the same as
//! applying it once. All writes go through the operation's [`Txn`].

use crate::csn::Csn;
use crate::dn::Dn;
use crate::entry::{
    is_qualified_rdn, naming_conflict_reason, qualified_rdn, unqualified_rdn, Entry, UniqueId,
    ATTR_CENOTAPH_FROM, ATTR_CENOTAPH_ID, ATTR_CONFLICT, ATTR_CONFLICT_CSN, ATTR_CONFLICT_TOMBSTONE,
    ATTR_ENTRY_DN, ATTR_GLUE_REASON, ATTR_OBJECTCLASS, ATTR_PARENT_UNIQUEID, GLUE_MISSING_ENTRY,
    GLUE_RESURRECTED, OC_EXTENSIBLE, OC_GLUE, OC_TOMBSTONE, OC_TOP, TOMBSTONE_CONTAINER_RDN,
};
use crate::error::ReplError;
use crate::op::OpType;
use crate::store::Txn;
use tracing::{debug, info};

fn divergence(msg: String) -> ReplError {
    ReplError::Divergence { msg }
}

/// DN tombstones and cenotaphs of `id` live under.
pub fn tombstone_dn(root: &Dn, id: &UniqueId) -> Result<Dn, ReplError> {
    root.child(TOMBSTONE_CONTAINER_RDN)?
        .child(&format!("{}={}", crate::entry::ATTR_UNIQUEID, id))
}

/// DN a naming-conflict loser is parked under.
pub fn conflict_dn(contested: &Dn, id: &UniqueId) -> Result<Dn, ReplError> {
    let parent = contested
        .parent()
        .ok_or_else(|| divergence(format!("cannot qualify root DN {contested}")))?;
    let rdn = contested
        .rdn()
        .ok_or_else(|| divergence(format!("cannot qualify root DN {contested}")))?;
    let plain = unqualified_rdn(rdn).unwrap_or_else(|| rdn.to_string());
    parent.child(&qualified_rdn(id, &plain))
}

/// The plain DN a qualified DN stands for.
pub fn plain_dn(dn: &Dn) -> Option<Dn> {
    let rdn = dn.rdn()?;
    if !is_qualified_rdn(rdn) {
        return Some(dn.clone());
    }
    dn.parent()?.child(&unqualified_rdn(rdn)?).ok()
}

/// Tag `entry` as the loser of a naming conflict over `contested`. Does not
/// move it.
pub fn mark_conflict(entry: &mut Entry, contested: &Dn, op: OpType, csn: Csn) {
    if entry.is_conflict() {
        return;
    }
    entry.set_values(ATTR_CONFLICT, vec![naming_conflict_reason(op, contested)], None);
    entry.set_values(ATTR_CONFLICT_CSN, vec![csn.to_string()], None);
}

/// Remove conflict markers.
pub fn clear_conflict(entry: &mut Entry) {
    entry.remove_attr(ATTR_CONFLICT);
    entry.remove_attr(ATTR_CONFLICT_CSN);
    entry.remove_attr(ATTR_CONFLICT_TOMBSTONE);
}

/// Move a live entry that lost `contested` to its qualified DN. The recorded
/// conflict CSN is the entry's own DN-CSN.
pub fn park_as_conflict(
    txn: &mut Txn<'_>,
    mut entry: Entry,
    contested: &Dn,
    op: OpType,
    csn: Csn,
) -> Result<Entry, ReplError> {
    let target = conflict_dn(contested, entry.uniqueid())?;
    let own_csn = entry.dn_csn().unwrap_or(csn);
    mark_conflict(&mut entry, contested, op, own_csn);
    info!(
        uniqueid = %entry.uniqueid(),
        dn = %contested,
        op = %op,
        csn = %csn,
        "naming conflict: renaming existing entry to its unique-id qualified form"
    );
    txn.move_subtree(entry.clone(), target.clone())?;
    entry.set_dn(target);
    Ok(entry)
}

/// Strip the conflict markers and move the entry back to `plain`.
pub fn resolve_conflict(txn: &mut Txn<'_>, mut entry: Entry, plain: Dn) -> Result<Entry, ReplError> {
    clear_conflict(&mut entry);
    txn.move_subtree(entry.clone(), plain.clone())?;
    entry.set_dn(plain);
    Ok(entry)
}

/// Live entry to tombstone.
pub fn entry_to_tombstone(txn: &mut Txn<'_>, root: &Dn, mut entry: Entry, csn: Csn) -> Result<Entry, ReplError> {
    if !entry.is_live() {
        return Ok(entry);
    }
    let live_dn = entry.dn().clone();
    let parent_id = match live_dn.parent() {
        Some(parent) => txn.get_by_dn(&parent)?.map(|p| p.uniqueid().clone()),
        None => None,
    };
    entry.set_values(ATTR_ENTRY_DN, vec![live_dn.to_string()], None);
    if let Some(parent_id) = parent_id {
        entry.set_values(ATTR_PARENT_UNIQUEID, vec![parent_id.to_string()], None);
    }
    entry.add_objectclass(OC_TOMBSTONE);
    entry.set_deletion_csn(Some(csn));
    entry.set_dn(tombstone_dn(root, entry.uniqueid())?);
    debug!(uniqueid = %entry.uniqueid(), dn = %live_dn, csn = %csn, "entry converted to tombstone");
    txn.put(entry.clone());
    Ok(entry)
}

/// Tombstone back to a live glue placeholder at its original DN. If that DN
/// is taken the glue is parked under its qualified DN instead.
pub fn tombstone_to_glue(
    txn: &mut Txn<'_>,
    root: &Dn,
    mut tomb: Entry,
    reason: &str,
    csn: Csn,
) -> Result<Entry, ReplError> {
    if tomb.is_live() {
        return Ok(tomb);
    }
    let original = tomb
        .original_dn()
        .ok_or_else(|| divergence(format!("tombstone {} has no original DN", tomb.uniqueid())))?;
    let rdn = original
        .rdn()
        .ok_or_else(|| divergence(format!("tombstone {} has an empty DN", tomb.uniqueid())))?
        .to_string();
    let mut target = if original.is_descendant_of(root) {
        ensure_parent(txn, root, &original, tomb.parent_uniqueid().as_ref(), csn)?.child(&rdn)?
    } else {
        original.clone()
    };
    if let Some(occupant) = txn.get_by_dn(&target)? {
        if occupant.uniqueid() != tomb.uniqueid() {
            let contested = target.clone();
            target = conflict_dn(&contested, tomb.uniqueid())?;
            mark_conflict(&mut tomb, &contested, OpType::Add, csn);
        }
    }
    tomb.remove_objectclass(OC_TOMBSTONE);
    tomb.set_deletion_csn(None);
    tomb.remove_attr(ATTR_ENTRY_DN);
    tomb.remove_attr(ATTR_PARENT_UNIQUEID);
    tomb.add_objectclass(OC_GLUE);
    tomb.add_objectclass(OC_EXTENSIBLE);
    tomb.set_values(ATTR_GLUE_REASON, vec![reason.to_string()], None);
    tomb.set_dn(target);
    info!(uniqueid = %tomb.uniqueid(), dn = %tomb.dn(), reason, "tombstone resurrected as glue");
    txn.put(tomb.clone());
    Ok(tomb)
}

/// Mark a tombstone as a naming-conflict loser so it no longer claims its
/// original DN.
pub fn tombstone_to_conflict(txn: &mut Txn<'_>, mut tomb: Entry, op: OpType, csn: Csn) -> Result<Entry, ReplError> {
    if tomb.is_live() || tomb.is_conflict() {
        return Ok(tomb);
    }
    let original = tomb
        .original_dn()
        .ok_or_else(|| divergence(format!("tombstone {} has no original DN", tomb.uniqueid())))?;
    mark_conflict(&mut tomb, &original, op, csn);
    let parked = conflict_dn(&original, tomb.uniqueid())?;
    tomb.set_values(ATTR_ENTRY_DN, vec![parked.to_string()], None);
    debug!(uniqueid = %tomb.uniqueid(), dn = %original, "tombstone converted to conflict");
    txn.put(tomb.clone());
    Ok(tomb)
}

/// Live entry to glue, keeping its attributes and subtree.
pub fn entry_to_glue(txn: &mut Txn<'_>, mut entry: Entry, reason: &str) -> Result<Entry, ReplError> {
    if entry.is_glue() {
        return Ok(entry);
    }
    entry.add_objectclass(OC_GLUE);
    entry.add_objectclass(OC_EXTENSIBLE);
    entry.set_values(ATTR_GLUE_REASON, vec![reason.to_string()], None);
    info!(uniqueid = %entry.uniqueid(), dn = %entry.dn(), reason, "entry converted to glue");
    txn.put(entry.clone());
    Ok(entry)
}

/// Glue placeholder back to the real entry whose add just arrived.
pub fn glue_to_entry(
    txn: &mut Txn<'_>,
    mut glue: Entry,
    attrs: &[(String, Vec<String>)],
    csn: Csn,
) -> Result<Entry, ReplError> {
    if !glue.is_glue() {
        return Ok(glue);
    }
    let synthesized = glue.glue_reason() == Some(GLUE_MISSING_ENTRY);
    glue.remove_objectclass(OC_GLUE);
    glue.remove_attr(ATTR_GLUE_REASON);
    let wants_extensible = attrs.iter().any(|(attr, values)| {
        attr.eq_ignore_ascii_case(ATTR_OBJECTCLASS) && values.iter().any(|v| v.eq_ignore_ascii_case(OC_EXTENSIBLE))
    });
    if synthesized && !wants_extensible {
        glue.remove_objectclass(OC_EXTENSIBLE);
    }
    for (attr, values) in attrs {
        glue.add_values(attr, values.iter().cloned(), Some(csn));
    }
    if glue.dn_csn().map_or(true, |d| csn < d) {
        glue.set_dn_csn(Some(csn));
    }
    info!(uniqueid = %glue.uniqueid(), dn = %glue.dn(), "glue entry replaced by its real entry");
    txn.put(glue.clone());
    Ok(glue)
}

/// Conflict entry promoted to glue so children have a stable parent. Moves
/// back to the plain DN when it is free.
pub fn conflict_to_glue(txn: &mut Txn<'_>, mut entry: Entry) -> Result<Entry, ReplError> {
    if !entry.is_conflict() {
        return Ok(entry);
    }
    let plain = entry.conflict_dn().or_else(|| plain_dn(entry.dn()));
    clear_conflict(&mut entry);
    entry.add_objectclass(OC_GLUE);
    entry.add_objectclass(OC_EXTENSIBLE);
    entry.set_values(ATTR_GLUE_REASON, vec![GLUE_MISSING_ENTRY.to_string()], None);
    let target = match plain {
        Some(plain) if txn.get_by_dn(&plain)?.is_none() => plain,
        _ => entry.dn().clone(),
    };
    info!(uniqueid = %entry.uniqueid(), dn = %target, "conflict entry promoted to glue");
    txn.move_subtree(entry.clone(), target.clone())?;
    entry.set_dn(target);
    Ok(entry)
}

/// Leave a cenotaph for `vacated`, which `id` held from `from` until `to`.
pub fn add_cenotaph(
    txn: &mut Txn<'_>,
    root: &Dn,
    id: &UniqueId,
    vacated: &Dn,
    from: Option<Csn>,
    to: Csn,
) -> Result<Entry, ReplError> {
    let cenotaph_id = UniqueId::derived(&format!("cenotaph:{}:{}", id, to));
    if let Some(existing) = txn.get(&cenotaph_id)? {
        return Ok(existing);
    }
    let mut cenotaph = Entry::new(tombstone_dn(root, &cenotaph_id)?, cenotaph_id);
    cenotaph.set_values(ATTR_OBJECTCLASS, vec![OC_TOP.to_string(), OC_TOMBSTONE.to_string()], None);
    cenotaph.set_values(ATTR_CENOTAPH_ID, vec![id.to_string()], None);
    cenotaph.set_values(ATTR_ENTRY_DN, vec![vacated.to_string()], None);
    if let Some(from) = from {
        cenotaph.set_values(ATTR_CENOTAPH_FROM, vec![from.to_string()], None);
    }
    cenotaph.set_deletion_csn(Some(to));
    debug!(dn = %vacated, uniqueid = %id, csn = %to, "cenotaph created");
    txn.put(cenotaph.clone());
    Ok(cenotaph)
}

/// Synthesize a glue entry at `dn`, creating glue ancestors as needed.
pub fn create_glue_entry(
    txn: &mut Txn<'_>,
    root: &Dn,
    dn: &Dn,
    id: UniqueId,
    reason: &str,
    csn: Csn,
) -> Result<Entry, ReplError> {
    if let Some(existing) = txn.get(&id)? {
        if existing.is_live() {
            return Ok(existing);
        }
        if !existing.is_cenotaph() {
            return tombstone_to_glue(txn, root, existing, GLUE_RESURRECTED, csn);
        }
    }
    if !dn.is_within(root) {
        return Err(divergence(format!("cannot create glue for {dn} outside {root}")));
    }
    let rdn = dn
        .rdn()
        .ok_or_else(|| divergence("cannot create glue for the root DSE".to_string()))?
        .to_string();
    let mut target = if dn.is_descendant_of(root) {
        ensure_parent(txn, root, dn, None, csn)?.child(&rdn)?
    } else {
        dn.clone()
    };
    let mut glue = Entry::new(target.clone(), id);
    if let Some(occupant) = txn.get_by_dn(&target)? {
        if occupant.uniqueid() != glue.uniqueid() {
            let contested = target.clone();
            target = conflict_dn(&contested, glue.uniqueid())?;
            mark_conflict(&mut glue, &contested, OpType::Add, csn);
            glue.set_dn(target.clone());
        }
    }
    glue.set_values(
        ATTR_OBJECTCLASS,
        vec![OC_TOP.to_string(), OC_EXTENSIBLE.to_string(), OC_GLUE.to_string()],
        Some(csn),
    );
    for (attr, value) in crate::dn::rdn_avas(&rdn) {
        if !attr.eq_ignore_ascii_case(crate::entry::ATTR_UNIQUEID) {
            glue.add_values(&attr, [value], Some(csn));
        }
    }
    glue.set_values(ATTR_GLUE_REASON, vec![reason.to_string()], None);
    glue.set_dn_csn(Some(csn));
    info!(dn = %target, uniqueid = %glue.uniqueid(), reason, "glue entry created");
    txn.put(glue.clone());
    Ok(glue)
}

/// Make sure `dn` has a live parent and return that parent's actual DN.
///
/// Lookup goes by the parent unique id first, then by DN. A tombstoned parent
/// is resurrected as glue; a conflict parent is redirected to the entry that
/// won its DN or promoted to glue; a missing parent is synthesized.
pub fn ensure_parent(
    txn: &mut Txn<'_>,
    root: &Dn,
    dn: &Dn,
    parent_id: Option<&UniqueId>,
    csn: Csn,
) -> Result<Dn, ReplError> {
    let requested = dn
        .parent()
        .ok_or_else(|| divergence(format!("{dn} has no parent")))?;
    if !dn.is_descendant_of(root) {
        return Ok(requested);
    }
    if let Some(parent_id) = parent_id {
        if let Some(parent) = txn.get(parent_id)? {
            if parent.is_cenotaph() {
                // not a real entry; fall through to the DN lookup
            } else if !parent.is_live() {
                return Ok(tombstone_to_glue(txn, root, parent, GLUE_RESURRECTED, csn)?.dn().clone());
            } else if parent.is_conflict() {
                return resolve_conflict_parent(txn, parent);
            } else {
                return Ok(parent.dn().clone());
            }
        }
    }
    if let Some(parent) = txn.get_by_dn(&requested)? {
        if parent.is_conflict() {
            return resolve_conflict_parent(txn, parent);
        }
        return Ok(requested);
    }
    if parent_id.is_none() {
        let tombstone = txn
            .by_original_dn(&requested)?
            .into_iter()
            .filter(Entry::is_tombstone)
            .max_by_key(Entry::deletion_csn);
        if let Some(tombstone) = tombstone {
            return Ok(tombstone_to_glue(txn, root, tombstone, GLUE_RESURRECTED, csn)?.dn().clone());
        }
    }
    let id = parent_id
        .cloned()
        .unwrap_or_else(|| UniqueId::derived(&format!("glue:{}", requested.normalized())));
    let glue = create_glue_entry(txn, root, &requested, id, GLUE_MISSING_ENTRY, csn)?;
    Ok(glue.dn().clone())
}

fn resolve_conflict_parent(txn: &mut Txn<'_>, parent: Entry) -> Result<Dn, ReplError> {
    if let Some(plain) = parent.conflict_dn() {
        if let Some(valid) = txn.get_by_dn(&plain)? {
            if valid.is_live() && !valid.is_conflict() {
                debug!(conflict = %parent.dn(), valid = %plain, "redirecting child of conflict entry");
                return Ok(plain);
            }
        }
    }
    Ok(conflict_to_glue(txn, parent)?.dn().clone())
}
