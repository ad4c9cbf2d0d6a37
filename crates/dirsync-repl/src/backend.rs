//! Backend boundary: the directory store replication replays into.
//!
//! The replication core only needs entry lookups ([`EntryView`]) and a way
//! to apply one operation under the store's write exclusivity with a
//! pre-operation hook ([`Backend::apply_operation`]). [`InMemoryBackend`] is
//! the reference implementation used by the binary and the tests.

use crate::dn::Dn;
use crate::entry::{values_equal, Entry, EntryUuid, ENTRYUUID_ATTR};
use crate::historical::apply_modification;
use crate::operation::{
    AddOperation, DeleteOperation, ModificationType, ModifyDnOperation, ModifyOperation, Operation,
};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::trace;

/// Outcome of a directory operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    /// Operation applied.
    Success,
    /// Target or parent does not exist.
    NoSuchObject,
    /// Target DN is taken.
    EntryAlreadyExists,
    /// Entry still has children.
    NotAllowedOnNonLeaf,
    /// Modification would remove an RDN value.
    NotAllowedOnRdn,
    /// Schema violation.
    ObjectClassViolation,
    /// Server refuses the operation.
    UnwillingToPerform,
    /// Transient: server busy.
    Busy,
    /// Transient: server unavailable.
    Unavailable,
    /// Operation intentionally skipped.
    NoOperation,
    /// Value constraint violated.
    ConstraintViolation,
    /// Value already present.
    AttributeOrValueExists,
    /// Attribute or value absent.
    NoSuchAttribute,
    /// Anything else.
    Other,
}

impl ResultCode {
    /// True for [`ResultCode::Success`].
    pub fn is_success(self) -> bool {
        self == ResultCode::Success
    }

    /// True for failures worth retrying unchanged.
    pub fn is_transient(self) -> bool {
        matches!(self, ResultCode::Busy | ResultCode::Unavailable)
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResultCode::Success => "success",
            ResultCode::NoSuchObject => "noSuchObject",
            ResultCode::EntryAlreadyExists => "entryAlreadyExists",
            ResultCode::NotAllowedOnNonLeaf => "notAllowedOnNonLeaf",
            ResultCode::NotAllowedOnRdn => "notAllowedOnRDN",
            ResultCode::ObjectClassViolation => "objectClassViolation",
            ResultCode::UnwillingToPerform => "unwillingToPerform",
            ResultCode::Busy => "busy",
            ResultCode::Unavailable => "unavailable",
            ResultCode::NoOperation => "noOperation",
            ResultCode::ConstraintViolation => "constraintViolation",
            ResultCode::AttributeOrValueExists => "attributeOrValueExists",
            ResultCode::NoSuchAttribute => "noSuchAttribute",
            ResultCode::Other => "other",
        };
        f.write_str(name)
    }
}

/// Verdict of a pre-operation hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookResult {
    /// Apply the (possibly rewritten) operation.
    Proceed,
    /// Skip it; it is already reflected or obsolete.
    StopNoOp,
    /// Fail it with the given code.
    StopFatal(ResultCode),
}

/// Read access to entries.
pub trait EntryView: Send + Sync {
    /// Entry with surrogate id `uuid`.
    fn entry_by_uuid(&self, uuid: &EntryUuid) -> Option<Entry>;

    /// Entry at `dn`.
    fn entry_by_dn(&self, dn: &Dn) -> Option<Entry>;

    /// Immediate children of `dn`.
    fn children(&self, dn: &Dn) -> Vec<Entry>;
}

/// Hook run under the backend's write lock before an operation is applied.
pub trait PreOperationHook {
    /// Inspect and possibly rewrite `op`.
    fn resolve_on_replay(&mut self, op: &mut Operation, view: &dyn EntryView) -> HookResult;
}

/// Hook for internal operations that need no replication processing.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThrough;

impl PreOperationHook for PassThrough {
    fn resolve_on_replay(&mut self, _op: &mut Operation, _view: &dyn EntryView) -> HookResult {
        HookResult::Proceed
    }
}

/// A directory store.
pub trait Backend: EntryView {
    /// Apply `op` atomically, running `hook` first under the write lock.
    fn apply_operation(&self, op: &mut Operation, hook: &mut dyn PreOperationHook) -> ResultCode;

    /// Entries at or below `base` matching `filter`.
    fn search(&self, base: &Dn, filter: &dyn Fn(&Entry) -> bool) -> Vec<Entry>;

    /// This backend as a plain entry view.
    fn as_view(&self) -> &dyn EntryView;
}

#[derive(Debug, Default)]
struct Tree {
    entries: BTreeMap<String, Entry>,
    by_uuid: BTreeMap<String, String>,
    injected: VecDeque<ResultCode>,
}

impl EntryView for Tree {
    fn entry_by_uuid(&self, uuid: &EntryUuid) -> Option<Entry> {
        self.by_uuid
            .get(uuid.as_str())
            .and_then(|key| self.entries.get(key))
            .cloned()
    }

    fn entry_by_dn(&self, dn: &Dn) -> Option<Entry> {
        self.entries.get(&dn.normalized()).cloned()
    }

    fn children(&self, dn: &Dn) -> Vec<Entry> {
        self.entries
            .values()
            .filter(|e| e.dn.parent().as_ref() == Some(dn))
            .cloned()
            .collect()
    }
}

impl Tree {
    fn has_children(&self, dn: &Dn) -> bool {
        self.entries.values().any(|e| e.dn.parent().as_ref() == Some(dn))
    }

    fn insert(&mut self, entry: Entry) {
        let key = entry.dn.normalized();
        if let Some(uuid) = entry.uuid() {
            self.by_uuid.insert(uuid.as_str().to_string(), key.clone());
        }
        self.entries.insert(key, entry);
    }

    fn take(&mut self, dn: &Dn) -> Option<Entry> {
        let entry = self.entries.remove(&dn.normalized())?;
        if let Some(uuid) = entry.uuid() {
            self.by_uuid.remove(uuid.as_str());
        }
        Some(entry)
    }

    fn add(&mut self, op: &AddOperation) -> ResultCode {
        if self.entries.contains_key(&op.dn.normalized()) {
            return ResultCode::EntryAlreadyExists;
        }
        let Some(parent) = op.dn.parent() else {
            return ResultCode::UnwillingToPerform;
        };
        if !self.entries.contains_key(&parent.normalized()) {
            return ResultCode::NoSuchObject;
        }
        let mut entry = Entry::new(op.dn.clone());
        entry.attributes = op.attributes.clone();
        if let Some(uuid) = entry.uuid() {
            if self.by_uuid.contains_key(uuid.as_str()) {
                return ResultCode::EntryAlreadyExists;
            }
        }
        if let Some(rdn) = op.dn.rdn() {
            for ava in rdn.avas() {
                entry.add_values(&ava.attr, std::slice::from_ref(&ava.value));
            }
        }
        self.insert(entry);
        ResultCode::Success
    }

    fn delete(&mut self, op: &DeleteOperation) -> ResultCode {
        if !self.entries.contains_key(&op.dn.normalized()) {
            return ResultCode::NoSuchObject;
        }
        if self.has_children(&op.dn) {
            return ResultCode::NotAllowedOnNonLeaf;
        }
        self.take(&op.dn);
        ResultCode::Success
    }

    fn modify(&mut self, op: &ModifyOperation) -> ResultCode {
        let Some(current) = self.entries.get(&op.dn.normalized()) else {
            return ResultCode::NoSuchObject;
        };
        let mut entry = current.clone();
        for m in &op.mods {
            let code = check_modification(&entry, m);
            if !code.is_success() {
                return code;
            }
            apply_modification(&mut entry, m);
        }
        if let Some(rdn) = entry.dn.rdn() {
            if rdn.avas().iter().any(|ava| !entry.has_value(&ava.attr, &ava.value)) {
                return ResultCode::NotAllowedOnRdn;
            }
        }
        if entry.uuid() != current.uuid() {
            return ResultCode::ConstraintViolation;
        }
        self.insert(entry);
        ResultCode::Success
    }

    fn modify_dn(&mut self, op: &ModifyDnOperation) -> ResultCode {
        let Some(current) = self.entries.get(&op.dn.normalized()) else {
            return ResultCode::NoSuchObject;
        };
        let Some(new_dn) = op.new_dn() else {
            return ResultCode::UnwillingToPerform;
        };
        if let Some(sup) = &op.new_superior {
            if !self.entries.contains_key(&sup.normalized()) {
                return ResultCode::NoSuchObject;
            }
            if sup.is_descendant_of(&op.dn) {
                return ResultCode::UnwillingToPerform;
            }
        }
        if new_dn != op.dn && self.entries.contains_key(&new_dn.normalized()) {
            return ResultCode::EntryAlreadyExists;
        }

        let mut entry = current.clone();
        for ava in op.new_rdn.avas() {
            entry.add_values(&ava.attr, std::slice::from_ref(&ava.value));
        }
        if op.delete_old_rdn {
            if let Some(old) = op.dn.rdn() {
                for ava in old.avas() {
                    let kept = op
                        .new_rdn
                        .avas()
                        .iter()
                        .any(|n| n.attr == ava.attr && values_equal(&n.value, &ava.value));
                    if !kept {
                        entry.remove_values(&ava.attr, std::slice::from_ref(&ava.value));
                    }
                }
            }
        }
        for m in &op.mods {
            apply_modification(&mut entry, m);
        }

        let moved: Vec<Dn> = self
            .entries
            .values()
            .filter(|e| e.dn.is_strict_descendant_of(&op.dn))
            .map(|e| e.dn.clone())
            .collect();
        self.take(&op.dn);
        entry.dn = new_dn.clone();
        self.insert(entry);
        for old in moved {
            if let Some(mut child) = self.take(&old) {
                if let Some(rebased) = old.rebase(&op.dn, &new_dn) {
                    child.dn = rebased;
                }
                self.insert(child);
            }
        }
        ResultCode::Success
    }
}

fn check_modification(entry: &Entry, m: &crate::operation::Modification) -> ResultCode {
    match m.kind {
        ModificationType::Add => {
            if m.values.iter().any(|v| entry.has_value(&m.attr, v)) {
                ResultCode::AttributeOrValueExists
            } else {
                ResultCode::Success
            }
        }
        ModificationType::Delete => {
            let missing = if m.values.is_empty() {
                entry.values(&m.attr).is_empty()
            } else {
                m.values.iter().any(|v| !entry.has_value(&m.attr, v))
            };
            if missing {
                ResultCode::NoSuchAttribute
            } else {
                ResultCode::Success
            }
        }
        ModificationType::Replace => {
            if m.attr == ENTRYUUID_ATTR {
                ResultCode::ConstraintViolation
            } else {
                ResultCode::Success
            }
        }
        ModificationType::Increment => {
            let numeric = entry
                .first_value(&m.attr)
                .is_some_and(|v| v.parse::<i64>().is_ok());
            if !numeric {
                ResultCode::NoSuchAttribute
            } else if m.values.first().and_then(|v| v.parse::<i64>().ok()).is_none() {
                ResultCode::ConstraintViolation
            } else {
                ResultCode::Success
            }
        }
    }
}

/// In-memory directory tree.
#[derive(Debug)]
pub struct InMemoryBackend {
    tree: RwLock<Tree>,
}

impl InMemoryBackend {
    /// Create a tree holding only the suffix entry `base`.
    pub fn new(base: Dn) -> Self {
        let mut tree = Tree::default();
        let mut entry = Entry::new(base.clone());
        if let Some(rdn) = base.rdn() {
            for ava in rdn.avas() {
                entry.add_values(&ava.attr, std::slice::from_ref(&ava.value));
            }
        }
        tree.insert(entry);
        Self {
            tree: RwLock::new(tree),
        }
    }

    /// Make the next `times` operations fail with `code` before any hook runs.
    pub fn inject_failure(&self, code: ResultCode, times: usize) {
        let mut tree = self.write();
        tree.injected.extend(std::iter::repeat(code).take(times));
    }

    /// Every entry in canonical form (values sorted), ordered by DN.
    pub fn snapshot(&self) -> Vec<Entry> {
        let tree = self.read();
        let mut entries: Vec<Entry> = tree
            .entries
            .values()
            .cloned()
            .map(|mut e| {
                for values in e.attributes.values_mut() {
                    values.sort_by_key(|v| v.to_lowercase());
                }
                e
            })
            .collect();
        entries.sort_by(|a, b| a.dn.cmp(&b.dn));
        entries
    }

    /// Number of entries, including the suffix.
    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    /// True if not even the suffix exists.
    pub fn is_empty(&self) -> bool {
        self.read().entries.is_empty()
    }

    fn read(&self) -> RwLockReadGuard<'_, Tree> {
        self.tree.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tree> {
        self.tree.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl EntryView for InMemoryBackend {
    fn entry_by_uuid(&self, uuid: &EntryUuid) -> Option<Entry> {
        self.read().entry_by_uuid(uuid)
    }

    fn entry_by_dn(&self, dn: &Dn) -> Option<Entry> {
        self.read().entry_by_dn(dn)
    }

    fn children(&self, dn: &Dn) -> Vec<Entry> {
        self.read().children(dn)
    }
}

impl Backend for InMemoryBackend {
    fn apply_operation(&self, op: &mut Operation, hook: &mut dyn PreOperationHook) -> ResultCode {
        let mut tree = self.write();
        if let Some(code) = tree.injected.pop_front() {
            return code;
        }
        match hook.resolve_on_replay(op, &*tree) {
            HookResult::Proceed => {}
            HookResult::StopNoOp => return ResultCode::NoOperation,
            HookResult::StopFatal(code) => return code,
        }
        let code = match op {
            Operation::Add(add) => tree.add(add),
            Operation::Delete(del) => tree.delete(del),
            Operation::Modify(m) => tree.modify(m),
            Operation::ModifyDn(r) => tree.modify_dn(r),
        };
        trace!(kind = %op.kind(), dn = %op.dn(), %code, "operation applied");
        code
    }

    fn search(&self, base: &Dn, filter: &dyn Fn(&Entry) -> bool) -> Vec<Entry> {
        self.read()
            .entries
            .values()
            .filter(|e| e.dn.is_descendant_of(base) && filter(e))
            .cloned()
            .collect()
    }

    fn as_view(&self) -> &dyn EntryView {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dn::Rdn;
    use crate::entry::Attributes;
    use crate::operation::Modification;

    fn dn(s: &str) -> Dn {
        Dn::parse(s).unwrap()
    }

    fn attrs(uuid: &str) -> Attributes {
        let mut a = Attributes::new();
        a.insert(ENTRYUUID_ATTR.to_string(), vec![uuid.to_string()]);
        a
    }

    fn apply(backend: &InMemoryBackend, mut op: Operation) -> ResultCode {
        backend.apply_operation(&mut op, &mut PassThrough)
    }

    fn populated() -> InMemoryBackend {
        let b = InMemoryBackend::new(dn("dc=e"));
        assert_eq!(apply(&b, Operation::add(dn("ou=p,dc=e"), attrs("p"))), ResultCode::Success);
        assert_eq!(apply(&b, Operation::add(dn("cn=c,ou=p,dc=e"), attrs("c"))), ResultCode::Success);
        b
    }

    mod naming {
        use super::*;

        #[test]
        fn test_add_checks() {
            let b = populated();
            assert_eq!(
                apply(&b, Operation::add(dn("cn=c,ou=p,dc=e"), attrs("x"))),
                ResultCode::EntryAlreadyExists
            );
            assert_eq!(
                apply(&b, Operation::add(dn("cn=x,ou=gone,dc=e"), attrs("x"))),
                ResultCode::NoSuchObject
            );
            assert_eq!(
                apply(&b, Operation::add(dn("cn=y,dc=e"), attrs("c"))),
                ResultCode::EntryAlreadyExists
            );
            let c = b.entry_by_uuid(&EntryUuid::new("c")).unwrap();
            assert_eq!(c.first_value("cn"), Some("c"));
        }

        #[test]
        fn test_delete_non_leaf() {
            let b = populated();
            assert_eq!(apply(&b, Operation::delete(dn("ou=p,dc=e"))), ResultCode::NotAllowedOnNonLeaf);
            assert_eq!(apply(&b, Operation::delete(dn("cn=c,ou=p,dc=e"))), ResultCode::Success);
            assert_eq!(apply(&b, Operation::delete(dn("ou=p,dc=e"))), ResultCode::Success);
            assert_eq!(apply(&b, Operation::delete(dn("ou=p,dc=e"))), ResultCode::NoSuchObject);
        }

        #[test]
        fn test_rename_moves_subtree() {
            let b = populated();
            let op = Operation::modify_dn(dn("ou=p,dc=e"), Rdn::new("ou", "q"), true, None);
            assert_eq!(apply(&b, op), ResultCode::Success);
            let child = b.entry_by_uuid(&EntryUuid::new("c")).unwrap();
            assert_eq!(child.dn, dn("cn=c,ou=q,dc=e"));
            let parent = b.entry_by_dn(&dn("ou=q,dc=e")).unwrap();
            assert_eq!(parent.values("ou"), ["q".to_string()]);
            assert!(b.entry_by_dn(&dn("ou=p,dc=e")).is_none());
        }

        #[test]
        fn test_rename_checks() {
            let b = populated();
            apply(&b, Operation::add(dn("ou=s,dc=e"), attrs("s")));
            let taken = Operation::modify_dn(dn("ou=s,dc=e"), Rdn::new("ou", "p"), true, None);
            assert_eq!(apply(&b, taken), ResultCode::EntryAlreadyExists);
            let under_self =
                Operation::modify_dn(dn("ou=p,dc=e"), Rdn::new("ou", "p"), true, Some(dn("cn=c,ou=p,dc=e")));
            assert_eq!(apply(&b, under_self), ResultCode::UnwillingToPerform);
            let no_sup =
                Operation::modify_dn(dn("ou=s,dc=e"), Rdn::new("ou", "s"), true, Some(dn("ou=gone,dc=e")));
            assert_eq!(apply(&b, no_sup), ResultCode::NoSuchObject);
        }
    }

    mod modify {
        use super::*;

        #[test]
        fn test_rdn_value_protected() {
            let b = populated();
            let op = Operation::modify(dn("cn=c,ou=p,dc=e"), vec![Modification::delete("cn", &[])]);
            assert_eq!(apply(&b, op), ResultCode::NotAllowedOnRdn);
        }

        #[test]
        fn test_value_checks() {
            let b = populated();
            let at = dn("cn=c,ou=p,dc=e");
            let ok = Operation::modify(at.clone(), vec![Modification::add("mail", &["a@e"])]);
            assert_eq!(apply(&b, ok), ResultCode::Success);
            let dup = Operation::modify(at.clone(), vec![Modification::add("mail", &["A@E"])]);
            assert_eq!(apply(&b, dup), ResultCode::AttributeOrValueExists);
            let missing = Operation::modify(at.clone(), vec![Modification::delete("mail", &["b@e"])]);
            assert_eq!(apply(&b, missing), ResultCode::NoSuchAttribute);
            let atomic = Operation::modify(
                at.clone(),
                vec![Modification::add("sn", &["s"]), Modification::delete("title", &[])],
            );
            assert_eq!(apply(&b, atomic), ResultCode::NoSuchAttribute);
            assert!(b.entry_by_dn(&at).unwrap().values("sn").is_empty());
        }
    }

    mod hooks {
        use super::*;

        struct Skip;

        impl PreOperationHook for Skip {
            fn resolve_on_replay(&mut self, _op: &mut Operation, view: &dyn EntryView) -> HookResult {
                assert!(view.entry_by_dn(&Dn::parse("dc=e").unwrap()).is_some());
                HookResult::StopNoOp
            }
        }

        #[test]
        fn test_hook_runs_under_lock_and_can_skip() {
            let b = populated();
            let mut op = Operation::delete(dn("cn=c,ou=p,dc=e"));
            assert_eq!(b.apply_operation(&mut op, &mut Skip), ResultCode::NoOperation);
            assert_eq!(b.len(), 3);
        }

        #[test]
        fn test_injected_failures() {
            let b = populated();
            b.inject_failure(ResultCode::Busy, 2);
            assert_eq!(apply(&b, Operation::delete(dn("cn=c,ou=p,dc=e"))), ResultCode::Busy);
            assert_eq!(apply(&b, Operation::delete(dn("cn=c,ou=p,dc=e"))), ResultCode::Busy);
            assert_eq!(apply(&b, Operation::delete(dn("cn=c,ou=p,dc=e"))), ResultCode::Success);
        }
    }

    #[test]
    fn test_search_and_snapshot() {
        let b = populated();
        let found = b.search(&dn("ou=p,dc=e"), &|e| e.uuid().is_some());
        assert_eq!(found.len(), 2);
        let snap = b.snapshot();
        assert_eq!(snap.len(), 3);
        assert!(snap.windows(2).all(|w| w[0].dn < w[1].dn));
    }
}
