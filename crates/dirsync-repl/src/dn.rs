//! Distinguished names.
//!
//! Attribute types and values compare case-insensitively. Escaping follows
//! the usual backslash convention for `,`, `+`, `=` and `\`.

use crate::error::{ReplError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// One `type=value` pair of an RDN.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ava {
    /// Attribute type, lower-cased.
    pub attr: String,
    /// Attribute value as written.
    pub value: String,
}

impl Ava {
    /// Create an AVA.
    pub fn new(attr: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            attr: attr.into().to_ascii_lowercase(),
            value: value.into(),
        }
    }

    fn normalized(&self) -> (String, String) {
        (self.attr.clone(), self.value.to_lowercase())
    }
}

/// Relative distinguished name: one or more AVAs joined by `+`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Rdn {
    avas: Vec<Ava>,
}

impl Rdn {
    /// Single-valued RDN.
    pub fn new(attr: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            avas: vec![Ava::new(attr, value)],
        }
    }

    /// Build from a list of AVAs.
    pub fn from_avas(avas: Vec<Ava>) -> Result<Self> {
        if avas.is_empty() {
            return Err(ReplError::InvalidDn {
                dn: String::new(),
                reason: "empty RDN".into(),
            });
        }
        Ok(Self { avas })
    }

    /// The AVAs of this RDN.
    pub fn avas(&self) -> &[Ava] {
        &self.avas
    }

    /// True if one of the AVAs uses `attr`.
    pub fn has_attribute(&self, attr: &str) -> bool {
        self.avas.iter().any(|a| a.attr.eq_ignore_ascii_case(attr))
    }

    /// The value of `attr` in this RDN.
    pub fn value_of(&self, attr: &str) -> Option<&str> {
        self.avas
            .iter()
            .find(|a| a.attr.eq_ignore_ascii_case(attr))
            .map(|a| a.value.as_str())
    }

    /// The quarantine form of `rdn`: `entryuuid=<id>+<rdn>`.
    pub fn conflict(entry_uuid: &str, rdn: &Rdn) -> Rdn {
        let mut avas = vec![Ava::new(crate::entry::ENTRYUUID_ATTR, entry_uuid)];
        avas.extend(
            rdn.avas
                .iter()
                .filter(|a| !a.attr.eq_ignore_ascii_case(crate::entry::ENTRYUUID_ATTR))
                .cloned(),
        );
        Rdn { avas }
    }

    fn normalized(&self) -> Vec<(String, String)> {
        let mut n: Vec<_> = self.avas.iter().map(Ava::normalized).collect();
        n.sort();
        n
    }

    fn parse(text: &str) -> Result<Self> {
        let mut avas = Vec::new();
        for part in split_unescaped(text, '+') {
            let pieces = split_unescaped(&part, '=');
            let [attr, value] = pieces.as_slice() else {
                return Err(ReplError::InvalidDn {
                    dn: text.to_string(),
                    reason: format!("malformed AVA {part:?}"),
                });
            };
            let attr = attr.trim();
            if attr.is_empty() {
                return Err(ReplError::InvalidDn {
                    dn: text.to_string(),
                    reason: "empty attribute type".into(),
                });
            }
            avas.push(Ava::new(attr, unescape(value.trim())));
        }
        Self::from_avas(avas).map_err(|_| ReplError::InvalidDn {
            dn: text.to_string(),
            reason: "empty RDN".into(),
        })
    }
}

impl PartialEq for Rdn {
    fn eq(&self, other: &Self) -> bool {
        self.normalized() == other.normalized()
    }
}

impl Eq for Rdn {}

impl Hash for Rdn {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.normalized().hash(state);
    }
}

impl fmt::Display for Rdn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, ava) in self.avas.iter().enumerate() {
            if i > 0 {
                f.write_str("+")?;
            }
            write!(f, "{}={}", ava.attr, escape(&ava.value))?;
        }
        Ok(())
    }
}

impl FromStr for Rdn {
    type Err = ReplError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Rdn {
    type Error = ReplError;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<Rdn> for String {
    fn from(rdn: Rdn) -> Self {
        rdn.to_string()
    }
}

/// Distinguished name, leaf RDN first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Dn {
    rdns: Vec<Rdn>,
}

impl Dn {
    /// The empty (root) DN.
    pub fn root() -> Self {
        Self::default()
    }

    /// Parse a DN from its string form.
    pub fn parse(text: &str) -> Result<Self> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(Self::root());
        }
        let rdns = split_unescaped(trimmed, ',')
            .iter()
            .map(|part| Rdn::parse(part))
            .collect::<Result<Vec<_>>>()
            .map_err(|e| match e {
                ReplError::InvalidDn { reason, .. } => ReplError::InvalidDn {
                    dn: text.to_string(),
                    reason,
                },
                other => other,
            })?;
        Ok(Self { rdns })
    }

    /// True for the empty DN.
    pub fn is_root(&self) -> bool {
        self.rdns.is_empty()
    }

    /// Leaf RDN.
    pub fn rdn(&self) -> Option<&Rdn> {
        self.rdns.first()
    }

    /// Parent DN, `None` for the root.
    pub fn parent(&self) -> Option<Dn> {
        if self.rdns.is_empty() {
            None
        } else {
            Some(Dn {
                rdns: self.rdns[1..].to_vec(),
            })
        }
    }

    /// `rdn,self`.
    pub fn child(&self, rdn: Rdn) -> Dn {
        let mut rdns = Vec::with_capacity(self.rdns.len() + 1);
        rdns.push(rdn);
        rdns.extend(self.rdns.iter().cloned());
        Dn { rdns }
    }

    /// Number of RDNs.
    pub fn depth(&self) -> usize {
        self.rdns.len()
    }

    /// True if `self` is `ancestor` or lies below it.
    pub fn is_descendant_of(&self, ancestor: &Dn) -> bool {
        let n = ancestor.rdns.len();
        self.rdns.len() >= n && self.rdns[self.rdns.len() - n..] == ancestor.rdns[..]
    }

    /// True if `self` lies strictly below `ancestor`.
    pub fn is_strict_descendant_of(&self, ancestor: &Dn) -> bool {
        self.rdns.len() > ancestor.rdns.len() && self.is_descendant_of(ancestor)
    }

    /// Move `self` from below `old_base` to below `new_base`.
    pub fn rebase(&self, old_base: &Dn, new_base: &Dn) -> Option<Dn> {
        if !self.is_descendant_of(old_base) {
            return None;
        }
        let keep = self.rdns.len() - old_base.rdns.len();
        let mut rdns = self.rdns[..keep].to_vec();
        rdns.extend(new_base.rdns.iter().cloned());
        Some(Dn { rdns })
    }

    /// Canonical lower-cased form used as a map key.
    pub fn normalized(&self) -> String {
        self.rdns
            .iter()
            .map(|rdn| {
                rdn.normalized()
                    .into_iter()
                    .map(|(a, v)| format!("{a}={}", escape(&v)))
                    .collect::<Vec<_>>()
                    .join("+")
            })
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl PartialEq for Dn {
    fn eq(&self, other: &Self) -> bool {
        self.rdns == other.rdns
    }
}

impl Eq for Dn {}

impl Hash for Dn {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rdns.hash(state);
    }
}

impl PartialOrd for Dn {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Dn {
    fn cmp(&self, other: &Self) -> Ordering {
        self.normalized().cmp(&other.normalized())
    }
}

impl fmt::Display for Dn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, rdn) in self.rdns.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{rdn}")?;
        }
        Ok(())
    }
}

impl FromStr for Dn {
    type Err = ReplError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Dn {
    type Error = ReplError;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<Dn> for String {
    fn from(dn: Dn) -> Self {
        dn.to_string()
    }
}

fn split_unescaped(text: &str, sep: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            current.push(c);
            if let Some(next) = chars.next() {
                current.push(next);
            }
        } else if c == sep {
            parts.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    parts.push(current);
    parts
}

fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, ',' | '+' | '=' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
