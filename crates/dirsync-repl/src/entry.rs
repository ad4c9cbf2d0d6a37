//! Directory entries and the operational attributes replication relies on.

use crate::dn::Dn;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Attribute holding the immutable surrogate id of an entry.
pub const ENTRYUUID_ATTR: &str = "entryuuid";

/// Attribute holding the encoded historical ledger of an entry.
pub const HISTORICAL_ATTR: &str = "ds-sync-hist";

/// Attribute tagging a quarantined entry with the DN it should have had.
pub const CONFLICT_ATTR: &str = "ds-sync-conflict";

/// True for attributes owned by replication itself, which are never
/// tracked in the historical ledger.
pub fn is_replication_attribute(attr: &str) -> bool {
    [ENTRYUUID_ATTR, HISTORICAL_ATTR, CONFLICT_ATTR]
        .iter()
        .any(|a| a.eq_ignore_ascii_case(attr))
}

/// Immutable surrogate key of an entry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntryUuid(String);

impl EntryUuid {
    /// Wrap an existing id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into().to_ascii_lowercase())
    }

    /// Generate a fresh random id.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// String form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntryUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Attribute map, keyed by lower-cased attribute type.
pub type Attributes = BTreeMap<String, Vec<String>>;

/// A directory entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Current DN.
    pub dn: Dn,
    /// Attribute values.
    pub attributes: Attributes,
}

impl Entry {
    /// Create an entry with no attributes.
    pub fn new(dn: Dn) -> Self {
        Self {
            dn,
            attributes: Attributes::new(),
        }
    }

    /// Builder-style attribute setter.
    pub fn with_attr(mut self, attr: &str, values: &[&str]) -> Self {
        self.set_values(attr, values.iter().map(|v| v.to_string()).collect());
        self
    }

    /// Values of `attr` (empty if absent).
    pub fn values(&self, attr: &str) -> &[String] {
        self.attributes
            .get(&attr.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// First value of `attr`.
    pub fn first_value(&self, attr: &str) -> Option<&str> {
        self.values(attr).first().map(String::as_str)
    }

    /// True if `attr` has `value` (case-insensitive).
    pub fn has_value(&self, attr: &str, value: &str) -> bool {
        self.values(attr).iter().any(|v| values_equal(v, value))
    }

    /// Replace all values of `attr`; an empty list removes it.
    pub fn set_values(&mut self, attr: &str, values: Vec<String>) {
        let key = attr.to_ascii_lowercase();
        if values.is_empty() {
            self.attributes.remove(&key);
        } else {
            self.attributes.insert(key, values);
        }
    }

    /// Add values not already present. Returns how many were added.
    pub fn add_values(&mut self, attr: &str, values: &[String]) -> usize {
        let slot = self
            .attributes
            .entry(attr.to_ascii_lowercase())
            .or_default();
        let mut added = 0;
        for v in values {
            if !slot.iter().any(|cur| values_equal(cur, v)) {
                slot.push(v.clone());
                added += 1;
            }
        }
        added
    }

    /// Remove the given values. Returns how many were removed.
    pub fn remove_values(&mut self, attr: &str, values: &[String]) -> usize {
        let key = attr.to_ascii_lowercase();
        let Some(slot) = self.attributes.get_mut(&key) else {
            return 0;
        };
        let before = slot.len();
        slot.retain(|cur| !values.iter().any(|v| values_equal(cur, v)));
        let removed = before - slot.len();
        if slot.is_empty() {
            self.attributes.remove(&key);
        }
        removed
    }

    /// Remove `attr` entirely. Returns true if it existed.
    pub fn remove_attr(&mut self, attr: &str) -> bool {
        self.attributes.remove(&attr.to_ascii_lowercase()).is_some()
    }

    /// Surrogate id of this entry.
    pub fn uuid(&self) -> Option<EntryUuid> {
        self.first_value(ENTRYUUID_ATTR).map(EntryUuid::new)
    }

    /// DN this entry should have had, if it is quarantined.
    pub fn conflict_tag(&self) -> Option<Dn> {
        self.first_value(CONFLICT_ATTR)
            .and_then(|v| Dn::parse(v).ok())
    }

    /// Raw historical attribute values.
    pub fn historical_values(&self) -> &[String] {
        self.values(HISTORICAL_ATTR)
    }
}

/// Attribute value equality used throughout replication.
pub fn values_equal(a: &str, b: &str) -> bool {
    a == b || a.to_lowercase() == b.to_lowercase()
}

/// Normalized form of a value used as a ledger key.
pub fn normalize_value(value: &str) -> String {
    value.to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> Entry {
        Entry::new(Dn::parse("cn=a,dc=e").unwrap())
            .with_attr("CN", &["a"])
            .with_attr("mail", &["a@e", "b@e"])
    }

    #[test]
    fn test_attribute_names_are_case_insensitive() {
        let e = entry();
        assert_eq!(e.values("cn"), &["a".to_string()]);
        assert!(e.has_value("MAIL", "A@E"));
    }

    #[test]
    fn test_add_and_remove_values() {
        let mut e = entry();
        assert_eq!(e.add_values("mail", &["a@e".into(), "c@e".into()]), 1);
        assert_eq!(e.remove_values("mail", &["a@e".into(), "x@e".into()]), 1);
        assert_eq!(e.values("mail").len(), 2);
        assert_eq!(e.remove_values("mail", &["b@e".into(), "c@e".into()]), 2);
        assert!(!e.attributes.contains_key("mail"));
    }

    #[test]
    fn test_uuid_and_conflict_tag() {
        let e = entry()
            .with_attr(ENTRYUUID_ATTR, &["ABC"])
            .with_attr(CONFLICT_ATTR, &["ou=sales,dc=e"]);
        assert_eq!(e.uuid(), Some(EntryUuid::new("abc")));
        assert_eq!(e.conflict_tag(), Some(Dn::parse("ou=sales,dc=e").unwrap()));
    }

    #[test]
    fn test_replication_attributes() {
        assert!(is_replication_attribute("entryUUID"));
        assert!(is_replication_attribute(HISTORICAL_ATTR));
        assert!(!is_replication_attribute("cn"));
    }
}
