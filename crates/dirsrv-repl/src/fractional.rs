//! Fractional replication: attributes an agreement does not send.

use crate::error::ReplError;
use crate::ldap::LdapResultCode;
use crate::op::{Mod, Operation, ReplicatedOp};
use serde::{Deserialize, Serialize};

/// Attribute list used by incremental updates.
pub const ATTR_FRACTIONAL_LIST: &str = "nsds5replicatedattributelist";
/// Attribute list used by total updates; falls back to the incremental list.
pub const ATTR_FRACTIONAL_LIST_TOTAL: &str = "nsds5replicatedattributelisttotal";
/// Attributes whose modification alone is not worth a send.
pub const ATTR_STRIP_ATTRS: &str = "nsds5replicastripattrs";

/// Attributes that may never be excluded.
pub const NEVER_EXCLUDED: [&str; 8] = [
    "nsuniqueid",
    "modifiersname",
    "lastmodifiedtime",
    "dc",
    "o",
    "ou",
    "cn",
    "objectclass",
];

const FILTER_PREFIX: &str = "(objectclass=*)";

/// A parsed `(objectclass=*) $ EXCLUDE a b c` list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FractionalList {
    excluded: Vec<String>,
}

impl FractionalList {
    /// Parse the list held in `attr`, refusing denied exclusions.
    pub fn parse(attr: &str, value: &str) -> Result<Self, ReplError> {
        let reject = |msg: String| ReplError::ConfigRejected {
            attr: attr.to_string(),
            code: LdapResultCode::UnwillingToPerform,
            msg,
        };
        let (filter, rest) = value
            .split_once('$')
            .ok_or_else(|| reject(format!("{value:?} is missing '$ EXCLUDE'")))?;
        if !filter.trim().eq_ignore_ascii_case(FILTER_PREFIX) {
            return Err(reject(format!("unsupported filter {:?}", filter.trim())));
        }
        let mut words = rest.split_whitespace();
        if !words.next().map_or(false, |w| w.eq_ignore_ascii_case("exclude")) {
            return Err(reject(format!("{value:?} is missing EXCLUDE")));
        }
        let mut excluded: Vec<String> = Vec::new();
        for name in words {
            let name = name.to_ascii_lowercase();
            if NEVER_EXCLUDED.contains(&name.as_str()) {
                return Err(reject(format!("attribute {name} may not be excluded")));
            }
            if !excluded.contains(&name) {
                excluded.push(name);
            }
        }
        Ok(Self { excluded })
    }

    /// True if nothing is excluded.
    pub fn is_empty(&self) -> bool {
        self.excluded.is_empty()
    }

    /// True if `attr` is not sent.
    pub fn excludes(&self, attr: &str) -> bool {
        self.excluded.iter().any(|e| e.eq_ignore_ascii_case(attr))
    }

    /// Excluded attribute names, lowercased.
    pub fn excluded(&self) -> &[String] {
        &self.excluded
    }

    /// Attribute value form.
    pub fn to_value(&self) -> String {
        format!("{} $ EXCLUDE {}", FILTER_PREFIX, self.excluded.join(" "))
    }

    fn filter_mods(&self, mods: &[Mod]) -> Vec<Mod> {
        mods.iter().filter(|m| !self.excludes(&m.attr)).cloned().collect()
    }

    /// Drop excluded attributes from an attribute list.
    pub fn filter_attrs(&self, attrs: &[(String, Vec<String>)]) -> Vec<(String, Vec<String>)> {
        attrs.iter().filter(|(a, _)| !self.excludes(a)).cloned().collect()
    }
}

/// Everything fractional about one agreement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FractionalConfig {
    /// Incremental list.
    pub incremental: FractionalList,
    /// Total list; `None` uses the incremental list.
    pub total: Option<FractionalList>,
    /// Strip attributes, lowercased.
    pub strip: Vec<String>,
}

impl FractionalConfig {
    /// Parse strip attributes from a space-separated value.
    pub fn parse_strip(value: &str) -> Vec<String> {
        value.split_whitespace().map(|s| s.to_ascii_lowercase()).collect()
    }

    /// List used for total updates.
    pub fn total_list(&self) -> &FractionalList {
        self.total.as_ref().unwrap_or(&self.incremental)
    }

    fn only_strip(&self, mods: &[Mod]) -> bool {
        !self.strip.is_empty() && mods.iter().all(|m| self.strip.iter().any(|s| s.eq_ignore_ascii_case(&m.attr)))
    }

    /// The operation as this agreement sends it; `None` if nothing is left
    /// worth sending.
    pub fn filter_op(&self, op: &ReplicatedOp) -> Option<ReplicatedOp> {
        let list = &self.incremental;
        let filtered = match &op.op {
            Operation::Add(add) => {
                let mut add = add.clone();
                add.attrs = list.filter_attrs(&add.attrs);
                Operation::Add(add)
            }
            Operation::Delete(_) => op.op.clone(),
            Operation::Modify(modify) => {
                let mods = list.filter_mods(&modify.mods);
                if mods.is_empty() || self.only_strip(&mods) {
                    return None;
                }
                let mut modify = modify.clone();
                modify.mods = mods;
                Operation::Modify(modify)
            }
            Operation::ModRdn(modrdn) => {
                let mut modrdn = modrdn.clone();
                modrdn.mods = list.filter_mods(&modrdn.mods);
                Operation::ModRdn(modrdn)
            }
        };
        Some(ReplicatedOp::new(op.csn, filtered))
    }
}
