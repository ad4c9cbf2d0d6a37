//! The slice of directory schema replication needs: which attributes are
//! single-valued.

use std::collections::BTreeSet;

/// Attribute schema view.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeSchema {
    single_valued: BTreeSet<String>,
}

impl AttributeSchema {
    /// Schema where every attribute is multi-valued.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schema with the given single-valued attributes.
    pub fn with_single_valued<I, S>(attrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            single_valued: attrs
                .into_iter()
                .map(|a| a.as_ref().to_ascii_lowercase())
                .collect(),
        }
    }

    /// True if `attr` holds at most one value.
    pub fn is_single_valued(&self, attr: &str) -> bool {
        self.single_valued.contains(&attr.to_ascii_lowercase())
    }
}
