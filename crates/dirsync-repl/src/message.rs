//! Replicated update messages exchanged between replicas.

use crate::csn::Csn;
use crate::dn::{Dn, Rdn};
use crate::entry::{Attributes, EntryUuid};
use crate::error::Result;
use crate::operation::{Modification, Operation, OperationKind};
use serde::{Deserialize, Serialize};

/// Operation-specific payload of an update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateBody {
    /// Entry creation.
    Add {
        /// DN at the originating replica.
        dn: Dn,
        /// Surrogate id of the parent at the originating replica.
        parent_uuid: Option<EntryUuid>,
        /// Initial attributes.
        attributes: Attributes,
    },
    /// Entry removal.
    Delete {
        /// DN at the originating replica.
        dn: Dn,
    },
    /// Attribute changes.
    Modify {
        /// DN at the originating replica.
        dn: Dn,
        /// Changes, in order.
        mods: Vec<Modification>,
    },
    /// Rename and/or move.
    ModifyDn {
        /// DN before the rename at the originating replica.
        dn: Dn,
        /// New leaf RDN.
        new_rdn: Rdn,
        /// Remove the old RDN values.
        delete_old_rdn: bool,
        /// New parent DN, if moved.
        new_superior: Option<Dn>,
        /// Surrogate id of the new parent, if moved.
        new_superior_uuid: Option<EntryUuid>,
    },
}

/// A replicated update: one committed write tagged with its CSN.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateMsg {
    /// CSN assigned by the originating replica.
    pub csn: Csn,
    /// Surrogate id of the target entry.
    pub entry_uuid: EntryUuid,
    /// Operation payload.
    pub body: UpdateBody,
}

impl UpdateMsg {
    /// Operation kind carried by this update.
    pub fn kind(&self) -> OperationKind {
        match &self.body {
            UpdateBody::Add { .. } => OperationKind::Add,
            UpdateBody::Delete { .. } => OperationKind::Delete,
            UpdateBody::Modify { .. } => OperationKind::Modify,
            UpdateBody::ModifyDn { .. } => OperationKind::ModifyDn,
        }
    }

    /// Target DN.
    pub fn dn(&self) -> &Dn {
        match &self.body {
            UpdateBody::Add { dn, .. }
            | UpdateBody::Delete { dn }
            | UpdateBody::Modify { dn, .. }
            | UpdateBody::ModifyDn { dn, .. } => dn,
        }
    }

    /// Retarget the update.
    pub fn set_dn(&mut self, new_dn: Dn) {
        match &mut self.body {
            UpdateBody::Add { dn, .. }
            | UpdateBody::Delete { dn }
            | UpdateBody::Modify { dn, .. }
            | UpdateBody::ModifyDn { dn, .. } => *dn = new_dn,
        }
    }

    /// Parent surrogate id of an ADD.
    pub fn parent_uuid(&self) -> Option<&EntryUuid> {
        match &self.body {
            UpdateBody::Add { parent_uuid, .. } => parent_uuid.as_ref(),
            _ => None,
        }
    }

    /// New superior surrogate id of a MODIFY-DN.
    pub fn new_superior_uuid(&self) -> Option<&EntryUuid> {
        match &self.body {
            UpdateBody::ModifyDn {
                new_superior_uuid, ..
            } => new_superior_uuid.as_ref(),
            _ => None,
        }
    }

    /// DN the entry will have after a MODIFY-DN, computed from the message alone.
    pub fn new_dn(&self) -> Option<Dn> {
        match &self.body {
            UpdateBody::ModifyDn {
                dn,
                new_rdn,
                new_superior,
                ..
            } => {
                let parent = match new_superior {
                    Some(sup) => sup.clone(),
                    None => dn.parent()?,
                };
                Some(parent.child(new_rdn.clone()))
            }
            _ => None,
        }
    }

    /// Build the backend operation to replay this update.
    pub fn to_operation(&self) -> Operation {
        match &self.body {
            UpdateBody::Add { dn, attributes, .. } => Operation::add(dn.clone(), attributes.clone()),
            UpdateBody::Delete { dn } => Operation::delete(dn.clone()),
            UpdateBody::Modify { dn, mods } => Operation::modify(dn.clone(), mods.clone()),
            UpdateBody::ModifyDn {
                dn,
                new_rdn,
                delete_old_rdn,
                new_superior,
                ..
            } => Operation::modify_dn(
                dn.clone(),
                new_rdn.clone(),
                *delete_old_rdn,
                new_superior.clone(),
            ),
        }
    }

    /// Build the update describing a locally committed operation.
    pub fn from_local(
        csn: Csn,
        entry_uuid: EntryUuid,
        op: &Operation,
        parent_uuid: Option<EntryUuid>,
        new_superior_uuid: Option<EntryUuid>,
    ) -> Self {
        let body = match op {
            Operation::Add(add) => UpdateBody::Add {
                dn: add.dn.clone(),
                parent_uuid,
                attributes: add.attributes.clone(),
            },
            Operation::Delete(del) => UpdateBody::Delete { dn: del.dn.clone() },
            Operation::Modify(m) => UpdateBody::Modify {
                dn: m.dn.clone(),
                mods: m.mods.clone(),
            },
            Operation::ModifyDn(r) => UpdateBody::ModifyDn {
                dn: r.dn.clone(),
                new_rdn: r.new_rdn.clone(),
                delete_old_rdn: r.delete_old_rdn,
                new_superior: r.new_superior.clone(),
                new_superior_uuid,
            },
        };
        Self {
            csn,
            entry_uuid,
            body,
        }
    }

    /// Serialize to bincode bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize from bincode bytes.
    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}
