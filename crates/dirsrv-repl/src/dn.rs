//! Distinguished names with case-insensitive comparison.

use crate::error::ReplError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// A parsed DN. Equality, ordering and hashing use the normalized form;
/// `Display` keeps the original spelling.
#[derive(Clone)]
pub struct Dn {
    rdns: Vec<String>,
    norm: Vec<String>,
}

impl Dn {
    /// Parse a DN. The empty string is the root DSE.
    pub fn parse(s: &str) -> Result<Self, ReplError> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Ok(Self::root());
        }
        let mut rdns = Vec::new();
        let mut norm = Vec::new();
        for rdn in split_unescaped(trimmed, ',') {
            let rdn = rdn.trim();
            let n = normalize_rdn(rdn).ok_or_else(|| ReplError::InvalidDn {
                dn: s.to_string(),
                msg: format!("malformed RDN {rdn:?}"),
            })?;
            rdns.push(rdn.to_string());
            norm.push(n);
        }
        Ok(Self { rdns, norm })
    }

    /// The empty DN.
    pub fn root() -> Self {
        Self {
            rdns: Vec::new(),
            norm: Vec::new(),
        }
    }

    /// True for the empty DN.
    pub fn is_root(&self) -> bool {
        self.rdns.is_empty()
    }

    /// Number of RDNs.
    pub fn depth(&self) -> usize {
        self.rdns.len()
    }

    /// Leftmost RDN as written.
    pub fn rdn(&self) -> Option<&str> {
        self.rdns.first().map(String::as_str)
    }

    /// Leftmost RDN, normalized.
    pub fn rdn_norm(&self) -> Option<&str> {
        self.norm.first().map(String::as_str)
    }

    /// Attribute/value pairs of the leftmost RDN as written.
    pub fn rdn_avas(&self) -> Vec<(String, String)> {
        self.rdn().map(rdn_avas).unwrap_or_default()
    }

    /// Parent DN; `None` for the root.
    pub fn parent(&self) -> Option<Dn> {
        if self.is_root() {
            return None;
        }
        Some(Self {
            rdns: self.rdns[1..].to_vec(),
            norm: self.norm[1..].to_vec(),
        })
    }

    /// Child of this DN with the given RDN.
    pub fn child(&self, rdn: &str) -> Result<Dn, ReplError> {
        let rdn = rdn.trim();
        let n = normalize_rdn(rdn).ok_or_else(|| ReplError::InvalidDn {
            dn: rdn.to_string(),
            msg: "malformed RDN".to_string(),
        })?;
        let mut rdns = Vec::with_capacity(self.rdns.len() + 1);
        rdns.push(rdn.to_string());
        rdns.extend(self.rdns.iter().cloned());
        let mut norm = Vec::with_capacity(self.norm.len() + 1);
        norm.push(n);
        norm.extend(self.norm.iter().cloned());
        Ok(Self { rdns, norm })
    }

    /// True if `self` equals `ancestor` or lies below it.
    pub fn is_within(&self, ancestor: &Dn) -> bool {
        self.norm.len() >= ancestor.norm.len() && self.norm.ends_with(&ancestor.norm)
    }

    /// True if `self` lies strictly below `ancestor`.
    pub fn is_descendant_of(&self, ancestor: &Dn) -> bool {
        self.norm.len() > ancestor.norm.len() && self.norm.ends_with(&ancestor.norm)
    }

    /// Replace the `old_base` suffix with `new_base`.
    pub fn rebase(&self, old_base: &Dn, new_base: &Dn) -> Option<Dn> {
        if !self.is_within(old_base) {
            return None;
        }
        let keep = self.rdns.len() - old_base.rdns.len();
        let mut rdns = self.rdns[..keep].to_vec();
        rdns.extend(new_base.rdns.iter().cloned());
        let mut norm = self.norm[..keep].to_vec();
        norm.extend(new_base.norm.iter().cloned());
        Some(Self { rdns, norm })
    }

    /// Normalized string form.
    pub fn normalized(&self) -> String {
        self.norm.join(",")
    }
}

impl PartialEq for Dn {
    fn eq(&self, other: &Self) -> bool {
        self.norm == other.norm
    }
}

impl Eq for Dn {}

impl Hash for Dn {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.norm.hash(state);
    }
}

impl PartialOrd for Dn {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Dn {
    fn cmp(&self, other: &Self) -> Ordering {
        self.norm.cmp(&other.norm)
    }
}

impl fmt::Display for Dn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rdns.join(","))
    }
}

impl fmt::Debug for Dn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Dn({:?})", self.to_string())
    }
}

impl FromStr for Dn {
    type Err = ReplError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Dn {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Dn {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Dn::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Split on `sep` where it is not preceded by a backslash escape.
fn split_unescaped(s: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    for (idx, ch) in s.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        if ch == '\\' {
            escaped = true;
        } else if ch == sep {
            parts.push(&s[start..idx]);
            start = idx + ch.len_utf8();
        }
    }
    parts.push(&s[start..]);
    parts
}

/// Attribute/value pairs of one RDN, e.g. `nsuniqueid=x+cn=foo`.
pub fn rdn_avas(rdn: &str) -> Vec<(String, String)> {
    split_unescaped(rdn, '+')
        .into_iter()
        .filter_map(|ava| {
            let (attr, value) = ava.split_once('=')?;
            Some((attr.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

fn normalize_rdn(rdn: &str) -> Option<String> {
    let mut avas = Vec::new();
    for ava in split_unescaped(rdn, '+') {
        let (attr, value) = ava.split_once('=')?;
        let attr = attr.trim().to_ascii_lowercase();
        if attr.is_empty() || attr.contains(char::is_whitespace) {
            return None;
        }
        avas.push(format!("{}={}", attr, value.trim().to_lowercase()));
    }
    avas.sort();
    Some(avas.join("+"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dn(s: &str) -> Dn {
        Dn::parse(s).unwrap()
    }

    #[test]
    fn test_case_insensitive_equality() {
        assert_eq!(dn("CN=Foo, DC=Example"), dn("cn=foo,dc=example"));
        assert_eq!(dn("CN=Foo,dc=example").to_string(), "CN=Foo,dc=example");
    }

    #[test]
    fn test_parent_and_child() {
        let d = dn("cn=foo,ou=people,dc=example");
        assert_eq!(d.parent().unwrap(), dn("ou=people,dc=example"));
        assert_eq!(d.parent().unwrap().child("cn=foo").unwrap(), d);
        assert!(Dn::root().parent().is_none());
    }

    #[test]
    fn test_multi_valued_rdn_order_independent() {
        assert_eq!(dn("nsuniqueid=abc+cn=foo,dc=example"), dn("cn=foo+nsuniqueid=abc,dc=example"));
        let avas = dn("nsuniqueid=abc+cn=foo,dc=example").rdn_avas();
        assert_eq!(avas.len(), 2);
        assert_eq!(avas[1], ("cn".to_string(), "foo".to_string()));
    }

    #[test]
    fn test_escaped_comma() {
        let d = dn("cn=Smith\\, John,dc=example");
        assert_eq!(d.depth(), 2);
        assert_eq!(d.rdn(), Some("cn=Smith\\, John"));
    }

    #[test]
    fn test_ancestry() {
        let root = dn("dc=example");
        let child = dn("ou=a,dc=example");
        assert!(child.is_within(&root));
        assert!(child.is_descendant_of(&root));
        assert!(root.is_within(&root));
        assert!(!root.is_descendant_of(&root));
        assert!(!dn("dc=other").is_within(&root));
    }

    #[test]
    fn test_rebase() {
        let d = dn("cn=x,ou=old,dc=example");
        let moved = d.rebase(&dn("ou=old,dc=example"), &dn("ou=new,dc=example")).unwrap();
        assert_eq!(moved, dn("cn=x,ou=new,dc=example"));
        assert!(d.rebase(&dn("ou=other,dc=example"), &dn("dc=x")).is_none());
    }

    #[test]
    fn test_malformed() {
        assert!(Dn::parse("cn=foo,bogus").is_err());
        assert!(Dn::parse("=x").is_err());
    }
}
