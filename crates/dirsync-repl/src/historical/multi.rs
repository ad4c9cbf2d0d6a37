//! Ledger for multi-valued attributes: one slot per distinct value plus an
//! attribute-level delete time.
//!
//! Every replayed modification is recorded (times only move forward), and
//! the modification handed to the backend is derived by comparing the
//! entry's current values with what the ledger says should be present.

use super::slot::ValueSlot;
use super::{AttrHistorical, HistKind, HistLine, ReplayOutcome};
use crate::csn::Csn;
use crate::entry::{normalize_value, values_equal};
use crate::operation::{Modification, ModificationType};
use std::collections::BTreeMap;

/// Ledger slot of one value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueHistorical {
    /// The value as first seen.
    pub value: String,
    /// Its add/delete times.
    pub slot: ValueSlot,
}

/// Historical state of a multi-valued attribute.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultiValueHistorical {
    delete_time: Option<Csn>,
    values: BTreeMap<String, ValueHistorical>,
}

impl MultiValueHistorical {
    /// Empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Time of the last whole-attribute delete.
    pub fn delete_time(&self) -> Option<Csn> {
        self.delete_time
    }

    /// Slot of `value`, if any.
    pub fn value_slot(&self, value: &str) -> Option<&ValueSlot> {
        self.values.get(&normalize_value(value)).map(|vh| &vh.slot)
    }

    /// True if the ledger says `value` is currently present.
    pub fn is_present(&self, value: &str) -> bool {
        self.values
            .get(&normalize_value(value))
            .is_some_and(|vh| self.slot_present(&vh.slot))
    }

    fn slot_present(&self, slot: &ValueSlot) -> bool {
        if !slot.is_live() {
            return false;
        }
        match (slot.add_time(), self.delete_time) {
            (Some(a), Some(d)) => a > d || (a == d && slot.last_is_add()),
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    fn slot_mut(&mut self, value: &str) -> &mut ValueSlot {
        &mut self
            .values
            .entry(normalize_value(value))
            .or_insert_with(|| ValueHistorical {
                value: value.to_string(),
                slot: ValueSlot::default(),
            })
            .slot
    }

    fn mark_attribute_delete(&mut self, csn: Csn) {
        if csn.is_newer_than_opt(self.delete_time.as_ref()) {
            self.delete_time = Some(csn);
        }
        // Values added earlier in the same operation are deleted by it.
        for vh in self.values.values_mut() {
            if vh.slot.add_time() == Some(csn) {
                vh.slot.record_delete(csn, HistKind::DeleteAttr);
            }
        }
    }

    fn record(&mut self, csn: Csn, m: &Modification) {
        match m.kind {
            ModificationType::Add => {
                for v in &m.values {
                    self.slot_mut(v).record_add(csn, HistKind::Add);
                }
            }
            ModificationType::Delete if m.values.is_empty() => self.mark_attribute_delete(csn),
            ModificationType::Delete => {
                for v in &m.values {
                    self.slot_mut(v).record_delete(csn, HistKind::Delete);
                }
            }
            ModificationType::Replace => {
                self.mark_attribute_delete(csn);
                for v in &m.values {
                    let slot = self.slot_mut(v);
                    slot.record_delete(csn, HistKind::Replace);
                    slot.record_add(csn, HistKind::Replace);
                }
            }
            ModificationType::Increment => {}
        }
    }
}

fn contains(values: &[String], v: &str) -> bool {
    values.iter().any(|cur| values_equal(cur, v))
}

fn same_set(a: &[String], b: &[String]) -> bool {
    a.iter().all(|v| contains(b, v)) && b.iter().all(|v| contains(a, v))
}

fn push_unique(out: &mut Vec<String>, v: &str) {
    if !contains(out, v) {
        out.push(v.to_string());
    }
}

fn outcome_for(m: &Modification, kept: Vec<String>) -> ReplayOutcome {
    if kept.is_empty() {
        ReplayOutcome::dropped()
    } else if same_set(&kept, &m.values) {
        ReplayOutcome::keep(m.clone())
    } else {
        ReplayOutcome::rewritten(Modification::new(m.kind, &m.attr, kept))
    }
}

impl AttrHistorical for MultiValueHistorical {
    fn replay(&mut self, csn: Csn, m: &Modification, current: &[String]) -> ReplayOutcome {
        if m.kind == ModificationType::Increment {
            return ReplayOutcome::unsupported(m.clone());
        }
        self.record(csn, m);
        match m.kind {
            ModificationType::Add => {
                let mut added = Vec::new();
                for v in m.values.iter().filter(|v| !contains(current, v) && self.is_present(v)) {
                    push_unique(&mut added, v);
                }
                outcome_for(m, added)
            }
            ModificationType::Delete if m.values.is_empty() => {
                let removed: Vec<String> = current
                    .iter()
                    .filter(|v| !self.is_present(v))
                    .cloned()
                    .collect();
                if removed.is_empty() {
                    ReplayOutcome::dropped()
                } else if removed.len() == current.len() {
                    ReplayOutcome::keep(m.clone())
                } else {
                    ReplayOutcome::rewritten(Modification::new(
                        ModificationType::Delete,
                        &m.attr,
                        removed,
                    ))
                }
            }
            ModificationType::Delete => {
                let mut removed = Vec::new();
                for v in m.values.iter().filter(|v| contains(current, v) && !self.is_present(v)) {
                    push_unique(&mut removed, v);
                }
                outcome_for(m, removed)
            }
            ModificationType::Replace => {
                let mut result = Vec::new();
                for v in m.values.iter().chain(current.iter()) {
                    if self.is_present(v) {
                        push_unique(&mut result, v);
                    }
                }
                if same_set(&result, &m.values) {
                    ReplayOutcome::keep(m.clone())
                } else if same_set(&result, current) {
                    ReplayOutcome::dropped()
                } else {
                    ReplayOutcome::rewritten(Modification::new(
                        ModificationType::Replace,
                        &m.attr,
                        result,
                    ))
                }
            }
            ModificationType::Increment => ReplayOutcome::unsupported(m.clone()),
        }
    }

    fn record_local(&mut self, csn: Csn, m: &Modification, _current: &[String]) {
        self.record(csn, m);
    }

    fn lines(&self) -> Vec<HistLine> {
        let mut lines: Vec<HistLine> = self
            .delete_time
            .map(|d| HistLine::new(d, HistKind::DeleteAttr, None))
            .into_iter()
            .collect();
        for vh in self.values.values() {
            lines.extend(vh.slot.lines(Some(&vh.value)));
        }
        lines
    }

    fn load(&mut self, line: &HistLine) {
        match &line.value {
            None => {
                if line.csn.is_newer_than_opt(self.delete_time.as_ref()) {
                    self.delete_time = Some(line.csn);
                }
            }
            Some(value) => self.slot_mut(value).load(line),
        }
    }

    fn purge(&mut self, watermark: &Csn) -> bool {
        let stale: Vec<String> = self
            .values
            .iter()
            .filter(|(_, vh)| {
                !self.slot_present(&vh.slot)
                    && vh.slot.newest().map_or(true, |n| n.is_older_than(watermark))
            })
            .map(|(k, _)| k.clone())
            .collect();
        for key in stale {
            self.values.remove(&key);
        }
        let all_present = self.values.values().all(|vh| self.slot_present(&vh.slot));
        if all_present && self.delete_time.is_some_and(|d| d.is_older_than(watermark)) {
            self.delete_time = None;
        }
        self.is_empty()
    }

    fn oldest_csn(&self) -> Option<Csn> {
        self.values
            .values()
            .filter_map(|vh| vh.slot.oldest())
            .chain(self.delete_time)
            .min()
    }

    fn is_empty(&self) -> bool {
        self.values.is_empty() && self.delete_time.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn csn(t: i64) -> Csn {
        Csn::new(t, 0, 1)
    }

    fn vals(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn seeded(t: i64, v: &[&str]) -> MultiValueHistorical {
        let mut h = MultiValueHistorical::new();
        h.record_local(csn(t), &Modification::add("mail", v), &[]);
        h
    }

    #[test]
    fn test_add_skips_present_values() {
        let mut h = seeded(10, &["a"]);
        let out = h.replay(csn(20), &Modification::add("mail", &["a", "b"]), &vals(&["a"]));
        assert!(out.conflict);
        assert_eq!(out.mods, vec![Modification::add("mail", &["b"])]);
    }

    #[test]
    fn test_add_after_later_delete_dropped() {
        let mut h = seeded(10, &["a"]);
        h.replay(csn(30), &Modification::delete("mail", &["a"]), &vals(&["a"]));
        let out = h.replay(csn(20), &Modification::add("mail", &["a"]), &[]);
        assert!(out.mods.is_empty());
        assert!(!h.is_present("a"));
    }

    #[test]
    fn test_delete_older_than_add_dropped() {
        let mut h = seeded(10, &["a"]);
        let out = h.replay(csn(5), &Modification::delete("mail", &["a"]), &vals(&["a"]));
        assert!(out.mods.is_empty());
        assert!(h.is_present("a"));
    }

    #[test]
    fn test_attribute_delete_keeps_newer_values() {
        let mut h = seeded(10, &["a"]);
        h.replay(csn(30), &Modification::add("mail", &["b"]), &vals(&["a"]));
        let out = h.replay(csn(20), &Modification::delete("mail", &[]), &vals(&["a", "b"]));
        assert!(out.conflict);
        assert_eq!(out.mods, vec![Modification::delete("mail", &["a"])]);
        assert!(h.is_present("b"));
    }

    #[test]
    fn test_attribute_delete_of_everything_kept_as_is() {
        let mut h = seeded(10, &["a", "b"]);
        let m = Modification::delete("mail", &[]);
        let out = h.replay(csn(20), &m, &vals(&["a", "b"]));
        assert!(!out.conflict);
        assert_eq!(out.mods, vec![m]);
    }

    #[test]
    fn test_replace_preserves_newer_values() {
        let mut h = seeded(10, &["a"]);
        h.replay(csn(30), &Modification::add("mail", &["b"]), &vals(&["a"]));
        let out = h.replay(csn(20), &Modification::replace("mail", &["c"]), &vals(&["a", "b"]));
        assert!(out.conflict);
        assert_eq!(out.mods, vec![Modification::replace("mail", &["c", "b"])]);
    }

    #[test]
    fn test_replace_older_than_attribute_delete_dropped() {
        let mut h = seeded(10, &["a"]);
        h.replay(csn(30), &Modification::delete("mail", &[]), &vals(&["a"]));
        let out = h.replay(csn(20), &Modification::replace("mail", &["c"]), &[]);
        assert!(out.conflict);
        assert!(out.mods.is_empty());
    }

    #[test]
    fn test_values_without_history_are_oldest() {
        let mut h = MultiValueHistorical::new();
        let out = h.replay(csn(5), &Modification::delete("mail", &[]), &vals(&["legacy"]));
        assert_eq!(out.mods, vec![Modification::delete("mail", &[])]);
    }

    #[test]
    fn test_same_operation_add_then_attribute_delete() {
        let mut h = MultiValueHistorical::new();
        h.replay(csn(9), &Modification::add("mail", &["a"]), &[]);
        h.replay(csn(9), &Modification::delete("mail", &[]), &vals(&["a"]));
        assert!(!h.is_present("a"));
    }

    #[test]
    fn test_replace_twice_is_idempotent() {
        let mut h = seeded(10, &["a"]);
        let m = Modification::replace("mail", &["c", "d"]);
        h.replay(csn(20), &m, &vals(&["a"]));
        let once = h.clone();
        h.replay(csn(20), &m, &vals(&["c", "d"]));
        assert_eq!(h, once);
    }

    #[test]
    fn test_lines_roundtrip() {
        let mut h = seeded(10, &["a", "b"]);
        h.replay(csn(20), &Modification::delete("mail", &["a"]), &vals(&["a", "b"]));
        h.replay(csn(30), &Modification::replace("mail", &["c"]), &vals(&["b"]));
        let mut back = MultiValueHistorical::new();
        for line in h.lines() {
            back.load(&line);
        }
        assert_eq!(back, h);
    }

    #[test]
    fn test_purge_drops_dead_values() {
        let mut h = seeded(10, &["a", "b"]);
        h.replay(csn(20), &Modification::delete("mail", &["a"]), &vals(&["a", "b"]));
        assert!(!h.purge(&csn(15)));
        assert!(h.value_slot("a").is_some());
        assert!(!h.purge(&csn(25)));
        assert!(h.value_slot("a").is_none());
        assert!(h.is_present("b"));
        assert_eq!(h.oldest_csn(), Some(csn(10)));
    }
}
