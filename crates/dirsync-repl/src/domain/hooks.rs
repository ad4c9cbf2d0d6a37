//! Pre-operation hooks: ledger bookkeeping for local writes and identity
//! checks plus ledger adjudication for replayed updates. Both run under the
//! backend's write lock.

use crate::backend::{EntryView, HookResult, PreOperationHook, ResultCode};
use crate::csn::Csn;
use crate::entry::{Entry, EntryUuid, ENTRYUUID_ATTR, HISTORICAL_ATTR};
use crate::historical::EntryHistorical;
use crate::message::UpdateMsg;
use crate::operation::{Modification, ModificationType, Operation};
use crate::schema::AttributeSchema;
use tracing::debug;

fn historical_mod(hist: &EntryHistorical) -> Modification {
    Modification::new(ModificationType::Replace, HISTORICAL_ATTR, hist.encode())
}

/// Hook for locally originated writes: records the operation in the ledger
/// and captures the surrogate ids the outbound update needs.
pub(crate) struct LocalHook<'a> {
    csn: Csn,
    schema: &'a AttributeSchema,
    pub(crate) entry_uuid: Option<EntryUuid>,
    pub(crate) parent_uuid: Option<EntryUuid>,
    pub(crate) new_superior_uuid: Option<EntryUuid>,
}

impl<'a> LocalHook<'a> {
    pub(crate) fn new(csn: Csn, schema: &'a AttributeSchema) -> Self {
        Self {
            csn,
            schema,
            entry_uuid: None,
            parent_uuid: None,
            new_superior_uuid: None,
        }
    }
}

impl PreOperationHook for LocalHook<'_> {
    fn resolve_on_replay(&mut self, op: &mut Operation, view: &dyn EntryView) -> HookResult {
        match op {
            Operation::Add(add) => {
                let uuid = match add.attributes.get(ENTRYUUID_ATTR).and_then(|v| v.first()) {
                    Some(existing) => EntryUuid::new(existing.as_str()),
                    None => {
                        let fresh = EntryUuid::random();
                        add.attributes
                            .insert(ENTRYUUID_ATTR.to_string(), vec![fresh.to_string()]);
                        fresh
                    }
                };
                self.parent_uuid = add
                    .dn
                    .parent()
                    .and_then(|p| view.entry_by_dn(&p))
                    .and_then(|e| e.uuid());
                let mut hist = EntryHistorical::new();
                hist.record_entry_add(self.csn, &add.attributes, self.schema);
                add.attributes
                    .insert(HISTORICAL_ATTR.to_string(), hist.encode());
                self.entry_uuid = Some(uuid);
            }
            Operation::Delete(del) => {
                self.entry_uuid = view.entry_by_dn(&del.dn).and_then(|e| e.uuid());
            }
            Operation::Modify(m) => {
                let Some(entry) = view.entry_by_dn(&m.dn) else {
                    return HookResult::Proceed;
                };
                self.entry_uuid = entry.uuid();
                let mut hist = EntryHistorical::from_entry(&entry, self.schema);
                hist.process_local(self.csn, &m.mods, &entry, self.schema);
                m.mods.push(historical_mod(&hist));
            }
            Operation::ModifyDn(r) => {
                let Some(entry) = view.entry_by_dn(&r.dn) else {
                    return HookResult::Proceed;
                };
                self.entry_uuid = entry.uuid();
                self.new_superior_uuid = r
                    .new_superior
                    .as_ref()
                    .and_then(|s| view.entry_by_dn(s))
                    .and_then(|e| e.uuid());
                let mut hist = EntryHistorical::from_entry(&entry, self.schema);
                hist.record_rename(self.csn);
                r.mods.push(historical_mod(&hist));
            }
        }
        HookResult::Proceed
    }
}

/// Hook for replayed updates.
pub(crate) struct ReplayHook<'a> {
    msg: &'a UpdateMsg,
    schema: &'a AttributeSchema,
    pub(crate) modify_conflict: bool,
}

impl<'a> ReplayHook<'a> {
    pub(crate) fn new(msg: &'a UpdateMsg, schema: &'a AttributeSchema) -> Self {
        Self {
            msg,
            schema,
            modify_conflict: false,
        }
    }

    /// The entry at `dn`, if it is the one the update targets.
    fn target(&self, view: &dyn EntryView, dn: &crate::dn::Dn) -> Option<Entry> {
        view.entry_by_dn(dn)
            .filter(|e| e.uuid().as_ref() == Some(&self.msg.entry_uuid))
    }
}

impl PreOperationHook for ReplayHook<'_> {
    fn resolve_on_replay(&mut self, op: &mut Operation, view: &dyn EntryView) -> HookResult {
        let csn = self.msg.csn;
        match op {
            Operation::Add(add) => {
                if view.entry_by_uuid(&self.msg.entry_uuid).is_some() {
                    debug!(%csn, entry_uuid = %self.msg.entry_uuid, "entry already added");
                    return HookResult::StopNoOp;
                }
                if let (Some(parent_uuid), Some(parent_dn)) = (self.msg.parent_uuid(), add.dn.parent()) {
                    if let Some(parent) = view.entry_by_dn(&parent_dn) {
                        if parent.uuid().as_ref() != Some(parent_uuid) {
                            return HookResult::StopFatal(ResultCode::NoSuchObject);
                        }
                    }
                }
                add.attributes.insert(
                    ENTRYUUID_ATTR.to_string(),
                    vec![self.msg.entry_uuid.to_string()],
                );
                add.attributes.remove(HISTORICAL_ATTR);
                let mut hist = EntryHistorical::new();
                hist.record_entry_add(csn, &add.attributes, self.schema);
                add.attributes
                    .insert(HISTORICAL_ATTR.to_string(), hist.encode());
            }
            Operation::Delete(del) => {
                if self.target(view, &del.dn).is_none() {
                    return HookResult::StopFatal(ResultCode::NoSuchObject);
                }
            }
            Operation::Modify(m) => {
                let Some(entry) = self.target(view, &m.dn) else {
                    return HookResult::StopFatal(ResultCode::NoSuchObject);
                };
                let mut hist = EntryHistorical::from_entry(&entry, self.schema);
                let outcome = hist.replay_modify(csn, &m.mods, &entry, self.schema);
                self.modify_conflict = outcome.conflict;
                let mut mods: Vec<Modification> = outcome
                    .mods
                    .into_iter()
                    .filter(|m| !m.attr.eq_ignore_ascii_case(HISTORICAL_ATTR))
                    .collect();
                mods.push(historical_mod(&hist));
                m.mods = mods;
            }
            Operation::ModifyDn(r) => {
                let Some(entry) = self.target(view, &r.dn) else {
                    return HookResult::StopFatal(ResultCode::NoSuchObject);
                };
                if let (Some(sup_uuid), Some(sup_dn)) = (self.msg.new_superior_uuid(), &r.new_superior) {
                    let same = view
                        .entry_by_dn(sup_dn)
                        .is_some_and(|sup| sup.uuid().as_ref() == Some(sup_uuid));
                    if !same {
                        return HookResult::StopFatal(ResultCode::NoSuchObject);
                    }
                }
                let mut hist = EntryHistorical::from_entry(&entry, self.schema);
                if csn.is_older_than_opt(hist.rename_date().as_ref()) {
                    debug!(%csn, dn = %r.dn, "rename older than the entry's last rename");
                    return HookResult::StopNoOp;
                }
                hist.record_rename(csn);
                r.mods.push(historical_mod(&hist));
            }
        }
        HookResult::Proceed
    }
}

/// Hook for the historical purge: the ledger is re-read and purged under
/// the write lock so records written since the entry was found are kept.
pub(crate) struct PurgeHook<'a> {
    entry_uuid: Option<EntryUuid>,
    watermark: &'a Csn,
    schema: &'a AttributeSchema,
    pub(crate) purged: bool,
}

impl<'a> PurgeHook<'a> {
    pub(crate) fn new(entry_uuid: Option<EntryUuid>, watermark: &'a Csn, schema: &'a AttributeSchema) -> Self {
        Self {
            entry_uuid,
            watermark,
            schema,
            purged: false,
        }
    }
}

impl PreOperationHook for PurgeHook<'_> {
    fn resolve_on_replay(&mut self, op: &mut Operation, view: &dyn EntryView) -> HookResult {
        let Operation::Modify(m) = op else {
            return HookResult::StopNoOp;
        };
        let Some(entry) = view.entry_by_dn(&m.dn) else {
            return HookResult::StopNoOp;
        };
        if entry.uuid() != self.entry_uuid {
            // Renamed away since it was found; the next pass picks it up.
            return HookResult::StopNoOp;
        }
        let mut hist = EntryHistorical::from_entry(&entry, self.schema);
        let before = hist.encode();
        hist.purge(self.watermark);
        if hist.encode() == before {
            return HookResult::StopNoOp;
        }
        m.mods = vec![historical_mod(&hist)];
        self.purged = true;
        HookResult::Proceed
    }
}
