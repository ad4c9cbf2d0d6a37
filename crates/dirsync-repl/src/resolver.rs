//! Naming-conflict resolution.
//!
//! When a replayed update fails, [`NamingConflictResolver::resolve`] looks at
//! the failure and the local tree and decides whether to retry a rewritten
//! update, treat it as already applied, quarantine an entry under a conflict
//! RDN, or give up. Every replica reaches the same decision for the same
//! pair of conflicting updates: the claimant of a DN with the newer CSN is
//! the one quarantined.

use crate::backend::{EntryView, ResultCode};
use crate::csn::Csn;
use crate::dn::{Dn, Rdn};
use crate::entry::{Entry, EntryUuid, CONFLICT_ATTR};
use crate::historical::EntryHistorical;
use crate::message::{UpdateBody, UpdateMsg};
use crate::operation::{Modification, ModificationType};
use tracing::debug;

/// Change to make to some other entry before retrying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuarantineAction {
    /// Move an entry to a conflict DN and tag it with the DN it should have.
    Rename {
        /// Entry to move.
        entry_uuid: EntryUuid,
        /// Where it is now.
        from: Dn,
        /// Conflict DN.
        to: Dn,
        /// DN recorded in the conflict tag.
        expected: Dn,
    },
    /// Tag an entry with the DN it should have, without moving it.
    Mark {
        /// Entry to tag.
        entry_uuid: EntryUuid,
        /// DN recorded in the conflict tag.
        expected: Dn,
    },
}

/// Decision for one failed update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Replay this rewritten update.
    Retry {
        /// Rewritten update.
        msg: UpdateMsg,
    },
    /// Nothing left to do; the update is obsolete.
    ResolvedNoOp,
    /// Apply the actions, then replay the rewritten update.
    QuarantineAndRetry {
        /// Actions on other entries.
        actions: Vec<QuarantineAction>,
        /// Rewritten update.
        msg: UpdateMsg,
    },
    /// Not a naming conflict this resolver can repair.
    Unresolved {
        /// Original failure.
        code: ResultCode,
    },
}

/// Naming-conflict resolver over a view of the local tree.
pub struct NamingConflictResolver<'a> {
    base_dn: &'a Dn,
    view: &'a dyn EntryView,
}

impl<'a> NamingConflictResolver<'a> {
    /// Create a resolver for the domain rooted at `base_dn`.
    pub fn new(base_dn: &'a Dn, view: &'a dyn EntryView) -> Self {
        Self { base_dn, view }
    }

    /// Decide what to do about `msg` failing with `code`.
    pub fn resolve(&self, msg: &UpdateMsg, code: ResultCode) -> Resolution {
        let resolution = match &msg.body {
            UpdateBody::Modify { mods, .. } => match code {
                ResultCode::NoSuchObject => self.retarget(msg, code),
                ResultCode::NotAllowedOnRdn => self.keep_rdn_values(msg, mods, code),
                _ => Resolution::Unresolved { code },
            },
            UpdateBody::Delete { dn } => match code {
                ResultCode::NoSuchObject => self.retarget(msg, code),
                ResultCode::NotAllowedOnNonLeaf => self.orphan_children(msg, dn),
                _ => Resolution::Unresolved { code },
            },
            UpdateBody::Add { dn, .. } => match code {
                ResultCode::NoSuchObject => self.add_without_parent(msg, code),
                ResultCode::EntryAlreadyExists => self.add_over_existing(msg, dn),
                _ => Resolution::Unresolved { code },
            },
            UpdateBody::ModifyDn { .. } => match code {
                ResultCode::NoSuchObject
                | ResultCode::UnwillingToPerform
                | ResultCode::ObjectClassViolation => self.rename_retarget(msg, code),
                ResultCode::EntryAlreadyExists => self.rename_over_existing(msg, code),
                _ => Resolution::Unresolved { code },
            },
        };
        debug!(csn = %msg.csn, kind = %msg.kind(), dn = %msg.dn(), %code, ?resolution, "naming conflict");
        resolution
    }

    /// Conflict DN for `entry_uuid` currently named `rdn`, under `parent`.
    pub fn conflict_dn(parent: &Dn, entry_uuid: &EntryUuid, rdn: &Rdn) -> Dn {
        parent.child(Rdn::conflict(entry_uuid.as_str(), rdn))
    }

    fn retarget(&self, msg: &UpdateMsg, code: ResultCode) -> Resolution {
        match self.view.entry_by_uuid(&msg.entry_uuid) {
            None => Resolution::ResolvedNoOp,
            Some(current) if current.dn != *msg.dn() => {
                let mut msg = msg.clone();
                msg.set_dn(current.dn);
                Resolution::Retry { msg }
            }
            Some(_) => Resolution::Unresolved { code },
        }
    }

    fn keep_rdn_values(&self, msg: &UpdateMsg, mods: &[Modification], code: ResultCode) -> Resolution {
        let target = self
            .view
            .entry_by_uuid(&msg.entry_uuid)
            .or_else(|| self.view.entry_by_dn(msg.dn()));
        let Some(rdn) = target.as_ref().and_then(|e| e.dn.rdn()).cloned() else {
            return Resolution::Unresolved { code };
        };
        let mut rewritten = Vec::with_capacity(mods.len());
        for m in mods {
            let rdn_values: Vec<String> = rdn
                .avas()
                .iter()
                .filter(|ava| ava.attr == m.attr)
                .map(|ava| ava.value.clone())
                .collect();
            if rdn_values.is_empty() {
                rewritten.push(m.clone());
                continue;
            }
            match m.kind {
                ModificationType::Delete if m.values.is_empty() => {
                    rewritten.push(Modification::new(ModificationType::Replace, &m.attr, rdn_values));
                }
                ModificationType::Delete => {
                    let values: Vec<String> = m
                        .values
                        .iter()
                        .filter(|v| !rdn_values.iter().any(|r| r.eq_ignore_ascii_case(v)))
                        .cloned()
                        .collect();
                    if !values.is_empty() {
                        rewritten.push(Modification::new(ModificationType::Delete, &m.attr, values));
                    }
                }
                ModificationType::Replace => {
                    let mut values = m.values.clone();
                    for r in rdn_values {
                        if !values.iter().any(|v| v.eq_ignore_ascii_case(&r)) {
                            values.push(r);
                        }
                    }
                    rewritten.push(Modification::new(ModificationType::Replace, &m.attr, values));
                }
                ModificationType::Add | ModificationType::Increment => rewritten.push(m.clone()),
            }
        }
        if rewritten == mods {
            return Resolution::Unresolved { code };
        }
        let mut msg = msg.clone();
        if let UpdateBody::Modify { mods, .. } = &mut msg.body {
            *mods = rewritten;
        }
        Resolution::Retry { msg }
    }

    fn orphan_children(&self, msg: &UpdateMsg, dn: &Dn) -> Resolution {
        let parent_dn = self
            .view
            .entry_by_uuid(&msg.entry_uuid)
            .map(|e| e.dn)
            .unwrap_or_else(|| dn.clone());
        let actions: Vec<QuarantineAction> = self
            .view
            .children(&parent_dn)
            .into_iter()
            .filter_map(|child| self.quarantine(child, self.base_dn))
            .collect();
        if actions.is_empty() {
            return Resolution::Retry { msg: msg.clone() };
        }
        Resolution::QuarantineAndRetry {
            actions,
            msg: msg.clone(),
        }
    }

    fn add_without_parent(&self, msg: &UpdateMsg, code: ResultCode) -> Resolution {
        let Some(rdn) = msg.dn().rdn().cloned() else {
            return Resolution::Unresolved { code };
        };
        if let Some(parent) = msg.parent_uuid().and_then(|p| self.view.entry_by_uuid(p)) {
            if msg.dn().parent().as_ref() == Some(&parent.dn) {
                return Resolution::Unresolved { code };
            }
            let mut msg = msg.clone();
            msg.set_dn(parent.dn.child(rdn));
            return Resolution::Retry { msg };
        }
        let expected = msg.dn().clone();
        let mut msg = msg.clone();
        let to = Self::conflict_dn(self.base_dn, &msg.entry_uuid, &rdn);
        tag_add(&mut msg, to, &expected);
        Resolution::QuarantineAndRetry {
            actions: Vec::new(),
            msg,
        }
    }

    fn add_over_existing(&self, msg: &UpdateMsg, dn: &Dn) -> Resolution {
        if self.view.entry_by_uuid(&msg.entry_uuid).is_some() {
            return Resolution::ResolvedNoOp;
        }
        let Some(occupant) = self.view.entry_by_dn(dn) else {
            return Resolution::Retry { msg: msg.clone() };
        };
        let parent = dn.parent().unwrap_or_else(|| self.base_dn.clone());
        if !incoming_is_newer(&msg.csn, &occupant) {
            if let Some(action) = self.quarantine(occupant, &parent) {
                return Resolution::QuarantineAndRetry {
                    actions: vec![action],
                    msg: msg.clone(),
                };
            }
        }
        let Some(rdn) = dn.rdn() else {
            return Resolution::Unresolved {
                code: ResultCode::EntryAlreadyExists,
            };
        };
        let mut msg = msg.clone();
        let to = Self::conflict_dn(&parent, &msg.entry_uuid, rdn);
        tag_add(&mut msg, to, dn);
        Resolution::QuarantineAndRetry {
            actions: Vec::new(),
            msg,
        }
    }

    fn rename_retarget(&self, msg: &UpdateMsg, code: ResultCode) -> Resolution {
        let UpdateBody::ModifyDn {
            new_rdn,
            new_superior,
            new_superior_uuid,
            ..
        } = &msg.body
        else {
            return Resolution::Unresolved { code };
        };
        let Some(target) = self.view.entry_by_uuid(&msg.entry_uuid) else {
            return Resolution::ResolvedNoOp;
        };

        let superior = match new_superior_uuid {
            Some(sup_uuid) => match self.view.entry_by_uuid(sup_uuid) {
                Some(sup) => Some(sup.dn),
                None => {
                    let expected = msg.new_dn().unwrap_or_else(|| target.dn.clone());
                    let mut rewritten = msg.clone();
                    rewritten.set_dn(target.dn.clone());
                    if let UpdateBody::ModifyDn {
                        new_rdn,
                        new_superior,
                        new_superior_uuid,
                        ..
                    } = &mut rewritten.body
                    {
                        *new_rdn = Rdn::conflict(msg.entry_uuid.as_str(), new_rdn);
                        *new_superior = Some(self.base_dn.clone());
                        *new_superior_uuid = None;
                    }
                    return Resolution::QuarantineAndRetry {
                        actions: vec![QuarantineAction::Mark {
                            entry_uuid: msg.entry_uuid.clone(),
                            expected,
                        }],
                        msg: rewritten,
                    };
                }
            },
            None => new_superior.clone(),
        };

        let destination_parent = match &superior {
            Some(sup) => Some(sup.clone()),
            None => target.dn.parent(),
        };
        if destination_parent.map(|p| p.child(new_rdn.clone())).as_ref() == Some(&target.dn) {
            return Resolution::ResolvedNoOp;
        }
        if target.dn == *msg.dn() && superior == *new_superior {
            return Resolution::Unresolved { code };
        }
        let mut rewritten = msg.clone();
        rewritten.set_dn(target.dn);
        if let UpdateBody::ModifyDn { new_superior, .. } = &mut rewritten.body {
            *new_superior = superior;
        }
        Resolution::Retry { msg: rewritten }
    }

    fn rename_over_existing(&self, msg: &UpdateMsg, code: ResultCode) -> Resolution {
        let Some(destination) = msg.new_dn() else {
            return Resolution::Unresolved { code };
        };
        let Some(occupant) = self.view.entry_by_dn(&destination) else {
            return Resolution::Retry { msg: msg.clone() };
        };
        if occupant.uuid().as_ref() == Some(&msg.entry_uuid) {
            return Resolution::ResolvedNoOp;
        }
        let parent = destination.parent().unwrap_or_else(|| self.base_dn.clone());
        if !incoming_is_newer(&msg.csn, &occupant) {
            if let Some(action) = self.quarantine(occupant, &parent) {
                return Resolution::QuarantineAndRetry {
                    actions: vec![action],
                    msg: msg.clone(),
                };
            }
        }
        let mut rewritten = msg.clone();
        if let UpdateBody::ModifyDn { new_rdn, .. } = &mut rewritten.body {
            *new_rdn = Rdn::conflict(msg.entry_uuid.as_str(), new_rdn);
        }
        Resolution::QuarantineAndRetry {
            actions: vec![QuarantineAction::Mark {
                entry_uuid: msg.entry_uuid.clone(),
                expected: destination,
            }],
            msg: rewritten,
        }
    }

    fn quarantine(&self, entry: Entry, under: &Dn) -> Option<QuarantineAction> {
        let entry_uuid = entry.uuid()?;
        let rdn = entry.dn.rdn()?;
        let to = Self::conflict_dn(under, &entry_uuid, rdn);
        Some(QuarantineAction::Rename {
            entry_uuid,
            from: entry.dn.clone(),
            to,
            expected: entry.dn,
        })
    }
}

/// True if the update claims the DN later than `occupant` did.
fn incoming_is_newer(csn: &Csn, occupant: &Entry) -> bool {
    csn.is_newer_than_opt(EntryHistorical::read_dn_date(occupant).as_ref())
}

fn tag_add(msg: &mut UpdateMsg, to: Dn, expected: &Dn) {
    if let UpdateBody::Add {
        dn,
        parent_uuid,
        attributes,
    } = &mut msg.body
    {
        *dn = to;
        *parent_uuid = None;
        attributes.insert(CONFLICT_ATTR.to_string(), vec![expected.to_string()]);
    }
}
