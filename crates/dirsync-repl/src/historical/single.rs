//! Ledger for single-valued attributes.

use super::slot::ValueSlot;
use super::{AttrHistorical, HistKind, HistLine, ReplayOutcome};
use crate::csn::Csn;
use crate::entry::values_equal;
use crate::operation::{Modification, ModificationType};
use tracing::debug;

/// Historical state of a single-valued attribute.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SingleValueHistorical {
    value: Option<String>,
    slot: ValueSlot,
    deleted_value: Option<String>,
}

impl SingleValueHistorical {
    /// Empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ledger for an attribute that already holds `value` with no recorded history.
    pub fn seeded(value: Option<&str>) -> Self {
        Self {
            value: value.map(str::to_string),
            ..Self::default()
        }
    }

    /// Current value according to the ledger.
    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    /// Last value removed by a delete (diagnostics only, never encoded).
    pub fn deleted_value(&self) -> Option<&str> {
        self.deleted_value.as_deref()
    }

    /// Add/delete times.
    pub fn slot(&self) -> &ValueSlot {
        &self.slot
    }

    fn delete_now(&mut self, csn: Csn, kind: HistKind) {
        self.slot.record_delete(csn, kind);
        self.slot.clear_add();
        self.deleted_value = self.value.take();
    }

    fn replay_delete(&mut self, csn: Csn, m: &Modification) -> ReplayOutcome {
        let kind = if m.values.is_empty() {
            HistKind::DeleteAttr
        } else {
            HistKind::Delete
        };
        if !self.slot.delete_honored(&csn) {
            self.slot.record_delete(csn, kind);
            debug!(%csn, attr = %m.attr, "delete older than current value dropped");
            return ReplayOutcome::dropped();
        }
        match (&self.value, m.values.first()) {
            (None, _) => {
                self.slot.record_delete(csn, kind);
                ReplayOutcome::dropped()
            }
            (Some(current), Some(target)) if !values_equal(current, target) => {
                debug!(%csn, attr = %m.attr, "delete of a value that is not current dropped");
                ReplayOutcome::dropped()
            }
            _ => {
                self.delete_now(csn, kind);
                debug!(%csn, attr = %m.attr, deleted = ?self.deleted_value, "delete applied");
                ReplayOutcome::keep(m.clone())
            }
        }
    }

    fn replay_add(&mut self, csn: Csn, m: &Modification) -> ReplayOutcome {
        let Some(value) = m.values.first() else {
            return ReplayOutcome::dropped();
        };
        if self.slot.deleted_after(&csn) {
            return ReplayOutcome::dropped();
        }
        if self.value.is_none() || self.slot.is_degenerate_readd(&csn) {
            self.slot.record_add(csn, HistKind::Add);
            self.value = Some(value.clone());
            return ReplayOutcome::keep(m.clone());
        }
        if csn.is_newer_than_opt(self.slot.add_time().as_ref()) {
            // A later add wins; as a REPLACE it cannot collide with the old value.
            self.slot.record_add(csn, HistKind::Add);
            self.value = Some(value.clone());
            return ReplayOutcome::rewritten(Modification::new(
                ModificationType::Replace,
                &m.attr,
                vec![value.clone()],
            ));
        }
        debug!(%csn, attr = %m.attr, "add older than current value dropped");
        ReplayOutcome::dropped()
    }

    fn replay_replace(&mut self, csn: Csn, m: &Modification) -> ReplayOutcome {
        let Some(value) = m.values.first() else {
            let delete = Modification::new(ModificationType::Delete, &m.attr, vec![]);
            let out = self.replay_delete(csn, &delete);
            return if out.mods.is_empty() {
                out
            } else {
                ReplayOutcome::keep(m.clone())
            };
        };
        if self.slot.deleted_after(&csn) || self.slot.added_after(&csn) {
            self.slot.record_delete(csn, HistKind::Replace);
            debug!(%csn, attr = %m.attr, "replace older than current value dropped");
            return ReplayOutcome::dropped();
        }
        self.slot.record_delete(csn, HistKind::Replace);
        self.slot.record_add(csn, HistKind::Replace);
        self.value = Some(value.clone());
        ReplayOutcome::keep(m.clone())
    }
}

impl AttrHistorical for SingleValueHistorical {
    fn replay(&mut self, csn: Csn, m: &Modification, _current: &[String]) -> ReplayOutcome {
        match m.kind {
            ModificationType::Delete => self.replay_delete(csn, m),
            ModificationType::Add => self.replay_add(csn, m),
            ModificationType::Replace => self.replay_replace(csn, m),
            ModificationType::Increment => ReplayOutcome::unsupported(m.clone()),
        }
    }

    fn record_local(&mut self, csn: Csn, m: &Modification, _current: &[String]) {
        match (m.kind, m.values.first()) {
            (ModificationType::Delete, first) => {
                let kind = if first.is_some() {
                    HistKind::Delete
                } else {
                    HistKind::DeleteAttr
                };
                self.delete_now(csn, kind);
            }
            (ModificationType::Add, Some(value)) => {
                self.slot.record_add(csn, HistKind::Add);
                self.value = Some(value.clone());
            }
            (ModificationType::Add, None) => {}
            (ModificationType::Replace, Some(value)) => {
                self.slot.record_delete(csn, HistKind::Replace);
                self.slot.record_add(csn, HistKind::Replace);
                self.value = Some(value.clone());
            }
            (ModificationType::Replace, None) => self.delete_now(csn, HistKind::DeleteAttr),
            (ModificationType::Increment, _) => {}
        }
    }

    fn lines(&self) -> Vec<HistLine> {
        self.slot
            .lines(None)
            .into_iter()
            .map(|mut line| {
                if matches!(line.kind, HistKind::Add | HistKind::Replace) {
                    line.value = self.value.clone();
                }
                line
            })
            .collect()
    }

    fn load(&mut self, line: &HistLine) {
        self.slot.load(line);
        match line.kind {
            HistKind::Add | HistKind::Replace => self.value = line.value.clone(),
            HistKind::Delete | HistKind::DeleteAttr => {
                if !self.slot.is_live() {
                    self.value = None;
                    self.slot.clear_add();
                }
            }
        }
    }

    fn purge(&mut self, watermark: &Csn) -> bool {
        self.value.is_none()
            && self
                .slot
                .delete_time()
                .map_or(true, |d| d.is_older_than(watermark))
    }

    fn oldest_csn(&self) -> Option<Csn> {
        self.slot.oldest()
    }

    fn is_empty(&self) -> bool {
        self.value.is_none() && self.slot.newest().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn csn(t: i64) -> Csn {
        Csn::new(t, 0, 1)
    }

    fn with_value(t: i64, v: &str) -> SingleValueHistorical {
        let mut h = SingleValueHistorical::new();
        h.record_local(csn(t), &Modification::add("title", &[v]), &[]);
        h
    }

    mod replay {
        use super::*;

        #[test]
        fn test_older_add_is_dropped() {
            let mut h = with_value(100, "x");
            let before = h.clone();
            let out = h.replay(csn(90), &Modification::add("title", &["y"]), &[]);
            assert!(out.conflict);
            assert!(out.mods.is_empty());
            assert_eq!(h, before);
        }

        #[test]
        fn test_newer_replace_applies() {
            let mut h = with_value(100, "x");
            let out = h.replay(csn(110), &Modification::replace("title", &["z"]), &[]);
            assert!(!out.conflict);
            assert_eq!(out.mods, vec![Modification::replace("title", &["z"])]);
            assert_eq!(h.slot().add_time(), Some(csn(110)));
            assert_eq!(h.slot().delete_time(), Some(csn(110)));
            assert_eq!(h.value(), Some("z"));
        }

        #[test]
        fn test_newer_add_becomes_replace() {
            let mut h = with_value(100, "x");
            let out = h.replay(csn(120), &Modification::add("title", &["y"]), &[]);
            assert!(out.conflict);
            assert_eq!(out.mods, vec![Modification::replace("title", &["y"])]);
            assert_eq!(h.value(), Some("y"));
        }

        #[test]
        fn test_add_after_delete_applies() {
            let mut h = with_value(100, "x");
            h.replay(csn(110), &Modification::delete("title", &[]), &[]);
            assert_eq!(h.value(), None);
            assert_eq!(h.deleted_value(), Some("x"));
            let out = h.replay(csn(120), &Modification::add("title", &["y"]), &[]);
            assert_eq!(out.mods, vec![Modification::add("title", &["y"])]);
            assert!(!out.conflict);
        }

        #[test]
        fn test_add_older_than_delete_dropped() {
            let mut h = with_value(100, "x");
            h.replay(csn(110), &Modification::delete("title", &[]), &[]);
            let out = h.replay(csn(105), &Modification::add("title", &["y"]), &[]);
            assert!(out.mods.is_empty());
            assert_eq!(h.value(), None);
        }

        #[test]
        fn test_delete_older_than_add_dropped() {
            let mut h = with_value(100, "x");
            let out = h.replay(csn(50), &Modification::delete("title", &[]), &[]);
            assert!(out.conflict);
            assert!(out.mods.is_empty());
            assert_eq!(h.value(), Some("x"));
        }

        #[test]
        fn test_delete_of_other_value_dropped() {
            let mut h = with_value(100, "x");
            let out = h.replay(csn(150), &Modification::delete("title", &["q"]), &[]);
            assert!(out.conflict);
            assert_eq!(h.value(), Some("x"));
        }

        #[test]
        fn test_delete_of_absent_records_time() {
            let mut h = SingleValueHistorical::new();
            let out = h.replay(csn(10), &Modification::delete("title", &[]), &[]);
            assert!(out.conflict);
            assert_eq!(h.slot().delete_time(), Some(csn(10)));
            let out = h.replay(csn(5), &Modification::replace("title", &["a"]), &[]);
            assert!(out.mods.is_empty());
        }

        #[test]
        fn test_same_operation_delete_then_add() {
            let mut h = with_value(100, "x");
            let c = csn(200);
            h.replay(c, &Modification::delete("title", &[]), &[]);
            let out = h.replay(c, &Modification::add("title", &["y"]), &[]);
            assert_eq!(out.mods, vec![Modification::add("title", &["y"])]);
            assert_eq!(h.value(), Some("y"));
        }

        #[test]
        fn test_same_operation_add_then_delete() {
            let mut h = SingleValueHistorical::new();
            let c = csn(200);
            h.replay(c, &Modification::add("title", &["y"]), &[]);
            let out = h.replay(c, &Modification::delete("title", &["y"]), &[]);
            assert_eq!(out.mods.len(), 1);
            assert_eq!(h.value(), None);
        }

        #[test]
        fn test_increment_is_unsupported() {
            let mut h = with_value(100, "1");
            let out = h.replay(csn(110), &Modification::increment("title", 1), &[]);
            assert!(out.unsupported);
            assert_eq!(out.mods.len(), 1);
        }

        #[test]
        fn test_replay_twice_is_idempotent() {
            let m = Modification::replace("title", &["z"]);
            let mut h = with_value(100, "x");
            h.replay(csn(110), &m, &[]);
            let once = h.clone();
            h.replay(csn(110), &m, &[]);
            assert_eq!(h, once);
        }
    }

    mod encoding {
        use super::*;

        fn roundtrip(h: &SingleValueHistorical) -> SingleValueHistorical {
            let mut back = SingleValueHistorical::new();
            for line in h.lines() {
                back.load(&line);
            }
            back
        }

        #[test]
        fn test_live_value_roundtrip() {
            let mut h = with_value(100, "x");
            h.replay(csn(50), &Modification::delete("title", &[]), &[]);
            let back = roundtrip(&h);
            assert_eq!(back.value(), Some("x"));
            assert_eq!(back.slot(), h.slot());
        }

        #[test]
        fn test_deleted_value_roundtrip() {
            let mut h = with_value(100, "x");
            h.record_local(csn(120), &Modification::delete("title", &[]), &[]);
            let back = roundtrip(&h);
            assert_eq!(back.value(), None);
            assert_eq!(back.slot(), h.slot());
        }

        #[test]
        fn test_purge() {
            let mut h = with_value(100, "x");
            assert!(!h.purge(&csn(1000)));
            h.record_local(csn(120), &Modification::delete("title", &[]), &[]);
            assert!(!h.purge(&csn(110)));
            assert!(h.purge(&csn(130)));
        }
    }
}
