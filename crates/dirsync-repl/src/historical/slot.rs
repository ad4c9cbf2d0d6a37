//! The per-value slot shared by single- and multi-valued ledgers.

use super::{HistKind, HistLine};
use crate::csn::Csn;

/// Add/delete times of one value (or of the single value of an attribute),
/// plus the kind of the newest operation that touched it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValueSlot {
    add_time: Option<Csn>,
    delete_time: Option<Csn>,
    last: Option<HistKind>,
}

impl ValueSlot {
    /// When the value was last added.
    pub fn add_time(&self) -> Option<Csn> {
        self.add_time
    }

    /// When the value was last deleted.
    pub fn delete_time(&self) -> Option<Csn> {
        self.delete_time
    }

    /// Kind of the newest recorded operation.
    pub fn last_kind(&self) -> Option<HistKind> {
        self.last
    }

    /// Newest time recorded in this slot.
    pub fn newest(&self) -> Option<Csn> {
        self.add_time.max(self.delete_time)
    }

    /// Oldest time recorded in this slot.
    pub fn oldest(&self) -> Option<Csn> {
        match (self.add_time, self.delete_time) {
            (Some(a), Some(d)) => Some(a.min(d)),
            (a, d) => a.or(d),
        }
    }

    fn touch(&mut self, csn: Csn, kind: HistKind) {
        if csn.is_newer_than_or_equal_opt(self.newest().as_ref()) {
            self.last = Some(kind);
        }
    }

    /// Record an add at `csn`; times only move forward.
    pub fn record_add(&mut self, csn: Csn, kind: HistKind) {
        self.touch(csn, kind);
        if csn.is_newer_than_opt(self.add_time.as_ref()) {
            self.add_time = Some(csn);
        }
    }

    /// Record a delete at `csn`; times only move forward.
    pub fn record_delete(&mut self, csn: Csn, kind: HistKind) {
        self.touch(csn, kind);
        if csn.is_newer_than_opt(self.delete_time.as_ref()) {
            self.delete_time = Some(csn);
        }
    }

    /// Forget the add time (single-valued delete).
    pub fn clear_add(&mut self) {
        self.add_time = None;
    }

    /// True if the newest recorded operation left the value in place.
    pub fn is_live(&self) -> bool {
        match (self.add_time, self.delete_time) {
            (Some(_), None) => true,
            (Some(a), Some(d)) => a > d || (a == d && self.last_is_add()),
            (None, _) => false,
        }
    }

    /// True if the newest operation was an ADD or REPLACE.
    pub fn last_is_add(&self) -> bool {
        matches!(self.last, Some(HistKind::Add | HistKind::Replace))
    }

    /// A delete at `csn` may remove the value: it is newer than the add,
    /// or happened in the same operation right after it.
    pub fn delete_honored(&self, csn: &Csn) -> bool {
        match &self.add_time {
            None => true,
            Some(a) => csn > a || (csn == a && self.last_is_add()),
        }
    }

    /// The value was deleted after `csn`.
    pub fn deleted_after(&self, csn: &Csn) -> bool {
        csn.is_older_than_opt(self.delete_time.as_ref())
    }

    /// The value was added after `csn`.
    pub fn added_after(&self, csn: &Csn) -> bool {
        csn.is_older_than_opt(self.add_time.as_ref())
    }

    /// `csn == delete_time == add_time` and the last operation deleted.
    pub fn is_degenerate_readd(&self, csn: &Csn) -> bool {
        self.add_time.as_ref() == Some(csn)
            && self.delete_time.as_ref() == Some(csn)
            && matches!(self.last, Some(HistKind::Delete | HistKind::DeleteAttr))
    }

    /// Encoded lines; the line carrying the newest kind comes last so that
    /// replaying them restores `last`.
    pub fn lines(&self, value: Option<&str>) -> Vec<HistLine> {
        let newest = self.newest();
        let del = self.delete_time.map(|d| {
            let kind = match self.last {
                Some(k @ (HistKind::Delete | HistKind::DeleteAttr)) if Some(d) == newest => k,
                _ => HistKind::Delete,
            };
            HistLine::new(d, kind, value.map(str::to_string))
        });
        let add = self.add_time.map(|a| {
            let kind = match self.last {
                Some(k @ (HistKind::Add | HistKind::Replace)) if Some(a) == newest => k,
                _ => HistKind::Add,
            };
            HistLine::new(a, kind, value.map(str::to_string))
        });
        if self.last_is_add() {
            del.into_iter().chain(add).collect()
        } else {
            add.into_iter().chain(del).collect()
        }
    }

    /// Replay one decoded line.
    pub fn load(&mut self, line: &HistLine) {
        match line.kind {
            HistKind::Add | HistKind::Replace => self.record_add(line.csn, line.kind),
            HistKind::Delete | HistKind::DeleteAttr => self.record_delete(line.csn, line.kind),
        }
    }
}
