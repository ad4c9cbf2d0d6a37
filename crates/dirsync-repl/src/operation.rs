//! Write operations as seen by the backend.

use crate::dn::{Dn, Rdn};
use crate::entry::Attributes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of attribute modification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModificationType {
    /// Add values.
    Add,
    /// Delete the given values, or the whole attribute when none are given.
    Delete,
    /// Replace all values; no values removes the attribute.
    Replace,
    /// Add an integer to a numeric value.
    Increment,
}

/// One attribute modification of a MODIFY operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Modification {
    /// What to do.
    pub kind: ModificationType,
    /// Lower-cased attribute type.
    pub attr: String,
    /// Values involved.
    pub values: Vec<String>,
}

impl Modification {
    /// Create a modification.
    pub fn new(kind: ModificationType, attr: &str, values: Vec<String>) -> Self {
        Self {
            kind,
            attr: attr.to_ascii_lowercase(),
            values,
        }
    }

    /// ADD modification.
    pub fn add(attr: &str, values: &[&str]) -> Self {
        Self::new(ModificationType::Add, attr, to_owned(values))
    }

    /// DELETE modification; no values deletes the attribute.
    pub fn delete(attr: &str, values: &[&str]) -> Self {
        Self::new(ModificationType::Delete, attr, to_owned(values))
    }

    /// REPLACE modification.
    pub fn replace(attr: &str, values: &[&str]) -> Self {
        Self::new(ModificationType::Replace, attr, to_owned(values))
    }

    /// INCREMENT modification.
    pub fn increment(attr: &str, by: i64) -> Self {
        Self::new(ModificationType::Increment, attr, vec![by.to_string()])
    }
}

fn to_owned(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

/// Kind of write operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    /// Entry creation.
    Add,
    /// Entry removal.
    Delete,
    /// Attribute changes.
    Modify,
    /// Rename and/or move.
    ModifyDn,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Add => "add",
            OperationKind::Delete => "delete",
            OperationKind::Modify => "modify",
            OperationKind::ModifyDn => "modifyDN",
        };
        f.write_str(name)
    }
}

/// ADD operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddOperation {
    /// DN of the new entry.
    pub dn: Dn,
    /// Initial attributes.
    pub attributes: Attributes,
}

/// DELETE operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteOperation {
    /// DN of the entry to remove.
    pub dn: Dn,
}

/// MODIFY operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifyOperation {
    /// DN of the entry to change.
    pub dn: Dn,
    /// Changes, applied in order.
    pub mods: Vec<Modification>,
}

/// MODIFY-DN operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifyDnOperation {
    /// DN of the entry to rename.
    pub dn: Dn,
    /// New leaf RDN.
    pub new_rdn: Rdn,
    /// Remove the old RDN values from the entry.
    pub delete_old_rdn: bool,
    /// New parent, if the entry moves.
    pub new_superior: Option<Dn>,
    /// Extra modifications applied together with the rename.
    pub mods: Vec<Modification>,
}

impl ModifyDnOperation {
    /// DN the entry will have after the rename.
    pub fn new_dn(&self) -> Option<Dn> {
        let parent = match &self.new_superior {
            Some(sup) => sup.clone(),
            None => self.dn.parent()?,
        };
        Some(parent.child(self.new_rdn.clone()))
    }
}

/// A write operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Entry creation.
    Add(AddOperation),
    /// Entry removal.
    Delete(DeleteOperation),
    /// Attribute changes.
    Modify(ModifyOperation),
    /// Rename and/or move.
    ModifyDn(ModifyDnOperation),
}

impl Operation {
    /// Kind of this operation.
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Add(_) => OperationKind::Add,
            Operation::Delete(_) => OperationKind::Delete,
            Operation::Modify(_) => OperationKind::Modify,
            Operation::ModifyDn(_) => OperationKind::ModifyDn,
        }
    }

    /// DN the operation targets.
    pub fn dn(&self) -> &Dn {
        match self {
            Operation::Add(op) => &op.dn,
            Operation::Delete(op) => &op.dn,
            Operation::Modify(op) => &op.dn,
            Operation::ModifyDn(op) => &op.dn,
        }
    }

    /// Convenience constructor for an ADD.
    pub fn add(dn: Dn, attributes: Attributes) -> Self {
        Operation::Add(AddOperation { dn, attributes })
    }

    /// Convenience constructor for a DELETE.
    pub fn delete(dn: Dn) -> Self {
        Operation::Delete(DeleteOperation { dn })
    }

    /// Convenience constructor for a MODIFY.
    pub fn modify(dn: Dn, mods: Vec<Modification>) -> Self {
        Operation::Modify(ModifyOperation { dn, mods })
    }

    /// Convenience constructor for a MODIFY-DN.
    pub fn modify_dn(
        dn: Dn,
        new_rdn: Rdn,
        delete_old_rdn: bool,
        new_superior: Option<Dn>,
    ) -> Self {
        Operation::ModifyDn(ModifyDnOperation {
            dn,
            new_rdn,
            delete_old_rdn,
            new_superior,
            mods: Vec::new(),
        })
    }
}
