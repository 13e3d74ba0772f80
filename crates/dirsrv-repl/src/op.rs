//! Replicated operations and their wire form.

use crate::csn::Csn;
use crate::dn::Dn;
use crate::entry::UniqueId;
use crate::error::ReplError;
use crate::ldap::{LdapRequest, UpdateInfoControl};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Modification kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModOp {
    /// Add values.
    Add,
    /// Delete values, or the whole attribute when no values are given.
    Delete,
    /// Replace all values.
    Replace,
}

/// One attribute modification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mod {
    /// Kind.
    pub op: ModOp,
    /// Attribute name.
    pub attr: String,
    /// Values.
    pub values: Vec<String>,
}

impl Mod {
    /// Build a modification.
    pub fn new<I, S>(op: ModOp, attr: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            op,
            attr: attr.to_string(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// `add: attr` modification.
    pub fn add<I: IntoIterator<Item = S>, S: Into<String>>(attr: &str, values: I) -> Self {
        Self::new(ModOp::Add, attr, values)
    }

    /// `delete: attr` modification.
    pub fn delete<I: IntoIterator<Item = S>, S: Into<String>>(attr: &str, values: I) -> Self {
        Self::new(ModOp::Delete, attr, values)
    }

    /// `replace: attr` modification.
    pub fn replace<I: IntoIterator<Item = S>, S: Into<String>>(attr: &str, values: I) -> Self {
        Self::new(ModOp::Replace, attr, values)
    }
}

/// Operation type, as recorded in conflict reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpType {
    /// Add.
    Add,
    /// Delete.
    Delete,
    /// Modify.
    Modify,
    /// Rename.
    ModRdn,
}

impl OpType {
    /// Upper-case label used in `nsds5ReplConflict` values.
    pub fn label(self) -> &'static str {
        match self {
            Self::Add => "ADD",
            Self::Delete => "DELETE",
            Self::Modify => "MODIFY",
            Self::ModRdn => "MODRDN",
        }
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Replicated add.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddOp {
    /// Requested DN.
    pub dn: Dn,
    /// Unique id of the new entry.
    pub uniqueid: UniqueId,
    /// Unique id of the parent at the originating replica.
    pub parent_uniqueid: Option<UniqueId>,
    /// Attributes.
    pub attrs: Vec<(String, Vec<String>)>,
}

/// Replicated delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteOp {
    /// DN at the originating replica.
    pub dn: Dn,
    /// Target unique id.
    pub uniqueid: UniqueId,
}

/// Replicated modify.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifyOp {
    /// DN at the originating replica.
    pub dn: Dn,
    /// Target unique id.
    pub uniqueid: UniqueId,
    /// Modifications.
    pub mods: Vec<Mod>,
}

/// Replicated rename.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModRdnOp {
    /// DN at the originating replica.
    pub dn: Dn,
    /// Target unique id.
    pub uniqueid: UniqueId,
    /// New RDN.
    pub new_rdn: String,
    /// New superior DN, when moving.
    pub new_superior: Option<Dn>,
    /// Unique id of the new superior.
    pub new_superior_uniqueid: Option<UniqueId>,
    /// Remove the old RDN values.
    pub delete_old_rdn: bool,
    /// Side-effect modifications applied with the rename.
    pub mods: Vec<Mod>,
}

/// A replicable directory update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Add.
    Add(AddOp),
    /// Delete.
    Delete(DeleteOp),
    /// Modify.
    Modify(ModifyOp),
    /// Rename.
    ModRdn(ModRdnOp),
}

impl Operation {
    /// Operation type.
    pub fn kind(&self) -> OpType {
        match self {
            Self::Add(_) => OpType::Add,
            Self::Delete(_) => OpType::Delete,
            Self::Modify(_) => OpType::Modify,
            Self::ModRdn(_) => OpType::ModRdn,
        }
    }

    /// Target unique id.
    pub fn uniqueid(&self) -> &UniqueId {
        match self {
            Self::Add(op) => &op.uniqueid,
            Self::Delete(op) => &op.uniqueid,
            Self::Modify(op) => &op.uniqueid,
            Self::ModRdn(op) => &op.uniqueid,
        }
    }

    /// Target DN at the originating replica.
    pub fn dn(&self) -> &Dn {
        match self {
            Self::Add(op) => &op.dn,
            Self::Delete(op) => &op.dn,
            Self::Modify(op) => &op.dn,
            Self::ModRdn(op) => &op.dn,
        }
    }

    /// Attribute names written by the operation, lowercased.
    pub fn touched_attrs(&self) -> Vec<String> {
        match self {
            Self::Add(op) => op.attrs.iter().map(|(a, _)| a.to_ascii_lowercase()).collect(),
            Self::Delete(_) => Vec::new(),
            Self::Modify(op) => op.mods.iter().map(|m| m.attr.to_ascii_lowercase()).collect(),
            Self::ModRdn(op) => op.mods.iter().map(|m| m.attr.to_ascii_lowercase()).collect(),
        }
    }
}

/// An operation stamped with the CSN it was originally assigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicatedOp {
    /// CSN of the operation.
    pub csn: Csn,
    /// The operation.
    pub op: Operation,
}

impl ReplicatedOp {
    /// Pair an operation with its CSN.
    pub fn new(csn: Csn, op: Operation) -> Self {
        Self { csn, op }
    }

    /// Wire request carrying the update-info control.
    pub fn to_request(&self) -> LdapRequest {
        let control = |superior: Option<&UniqueId>, mods: Vec<Mod>| {
            Some(UpdateInfoControl {
                uniqueid: self.op.uniqueid().to_string(),
                superior_uniqueid: superior.map(ToString::to_string),
                csn: self.csn,
                modrdn_mods: mods,
            })
        };
        match &self.op {
            Operation::Add(op) => LdapRequest::Add {
                dn: op.dn.to_string(),
                attrs: op.attrs.clone(),
                control: control(op.parent_uniqueid.as_ref(), Vec::new()),
            },
            Operation::Delete(op) => LdapRequest::Delete {
                dn: op.dn.to_string(),
                control: control(None, Vec::new()),
            },
            Operation::Modify(op) => LdapRequest::Modify {
                dn: op.dn.to_string(),
                mods: op.mods.clone(),
                control: control(None, Vec::new()),
            },
            Operation::ModRdn(op) => LdapRequest::Rename {
                dn: op.dn.to_string(),
                new_rdn: op.new_rdn.clone(),
                new_superior: op.new_superior.as_ref().map(ToString::to_string),
                delete_old_rdn: op.delete_old_rdn,
                control: control(op.new_superior_uniqueid.as_ref(), op.mods.clone()),
            },
        }
    }

    /// Decode a replicated update received from a supplier.
    pub fn from_request(request: &LdapRequest) -> Result<Self, ReplError> {
        let missing = || ReplError::InvalidArgument {
            msg: format!("{} request carries no update-info control", request.label()),
        };
        let (csn, op) = match request {
            LdapRequest::Add { dn, attrs, control } => {
                let control = control.as_ref().ok_or_else(missing)?;
                let op = Operation::Add(AddOp {
                    dn: Dn::parse(dn)?,
                    uniqueid: UniqueId::new(&control.uniqueid),
                    parent_uniqueid: control.superior_uniqueid.as_deref().map(UniqueId::new),
                    attrs: attrs.clone(),
                });
                (control.csn, op)
            }
            LdapRequest::Delete { dn, control } => {
                let control = control.as_ref().ok_or_else(missing)?;
                let op = Operation::Delete(DeleteOp {
                    dn: Dn::parse(dn)?,
                    uniqueid: UniqueId::new(&control.uniqueid),
                });
                (control.csn, op)
            }
            LdapRequest::Modify { dn, mods, control } => {
                let control = control.as_ref().ok_or_else(missing)?;
                let op = Operation::Modify(ModifyOp {
                    dn: Dn::parse(dn)?,
                    uniqueid: UniqueId::new(&control.uniqueid),
                    mods: mods.clone(),
                });
                (control.csn, op)
            }
            LdapRequest::Rename {
                dn,
                new_rdn,
                new_superior,
                delete_old_rdn,
                control,
            } => {
                let control = control.as_ref().ok_or_else(missing)?;
                let new_superior = match new_superior {
                    Some(s) => Some(Dn::parse(s)?),
                    None => None,
                };
                let op = Operation::ModRdn(ModRdnOp {
                    dn: Dn::parse(dn)?,
                    uniqueid: UniqueId::new(&control.uniqueid),
                    new_rdn: new_rdn.clone(),
                    new_superior,
                    new_superior_uniqueid: control.superior_uniqueid.as_deref().map(UniqueId::new),
                    delete_old_rdn: *delete_old_rdn,
                    mods: control.modrdn_mods.clone(),
                });
                (control.csn, op)
            }
            LdapRequest::Extended { oid, .. } => {
                return Err(ReplError::InvalidArgument {
                    msg: format!("extended operation {oid} is not a replicated update"),
                })
            }
        };
        Ok(Self { csn, op })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rename() -> ReplicatedOp {
        ReplicatedOp::new(
            Csn::new(100, 0, 1, 0),
            Operation::ModRdn(ModRdnOp {
                dn: Dn::parse("cn=a,dc=example").unwrap(),
                uniqueid: UniqueId::new("u1"),
                new_rdn: "cn=b".to_string(),
                new_superior: Some(Dn::parse("ou=x,dc=example").unwrap()),
                new_superior_uniqueid: Some(UniqueId::new("u2")),
                delete_old_rdn: true,
                mods: vec![Mod::replace("modifiersname", ["cn=admin"])],
            }),
        )
    }

    #[test]
    fn test_rename_request_carries_control() {
        let request = rename().to_request();
        match &request {
            LdapRequest::Rename { control: Some(c), .. } => {
                assert_eq!(c.uniqueid, "u1");
                assert_eq!(c.superior_uniqueid.as_deref(), Some("u2"));
                assert_eq!(c.modrdn_mods.len(), 1);
            }
            other => panic!("unexpected request {other:?}"),
        }
        assert_eq!(ReplicatedOp::from_request(&request).unwrap(), rename());
    }

    #[test]
    fn test_request_without_control_rejected() {
        let request = LdapRequest::Delete {
            dn: "cn=a,dc=example".to_string(),
            control: None,
        };
        assert!(ReplicatedOp::from_request(&request).is_err());
    }

    #[test]
    fn test_op_type_labels() {
        assert_eq!(OpType::Add.label(), "ADD");
        assert_eq!(OpType::ModRdn.to_string(), "MODRDN");
    }

    #[test]
    fn test_touched_attrs_lowercased() {
        let op = Operation::Modify(ModifyOp {
            dn: Dn::parse("cn=a,dc=example").unwrap(),
            uniqueid: UniqueId::new("u1"),
            mods: vec![Mod::replace("Description", ["x"])],
        });
        assert_eq!(op.touched_attrs(), vec!["description".to_string()]);
    }
}
