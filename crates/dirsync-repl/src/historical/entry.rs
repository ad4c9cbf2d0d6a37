//! Entry-level ledger: add/rename dates plus one attribute ledger per
//! attribute, stored in the entry's historical attribute.

use super::{
    AttrHistorical, HistLine, MultiValueHistorical, ReplayOutcome, SingleValueHistorical,
};
use crate::csn::Csn;
use crate::entry::{is_replication_attribute, Attributes, Entry};
use crate::error::{ReplError, Result};
use crate::operation::{Modification, ModificationType};
use crate::schema::AttributeSchema;
use std::collections::BTreeMap;
use tracing::{debug, warn};

const DN_KEY: &str = "dn";
const DN_ADD: &str = "add";
const DN_RENAME: &str = "moddn";

/// Ledger of one attribute, chosen by the attribute's cardinality.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrLedger {
    /// Single-valued attribute.
    Single(SingleValueHistorical),
    /// Multi-valued attribute.
    Multi(MultiValueHistorical),
}

impl AttrLedger {
    /// Fresh ledger for `attr`, aware of values already in the entry.
    pub fn for_attribute(attr: &str, schema: &AttributeSchema, current: &[String]) -> Self {
        if schema.is_single_valued(attr) {
            AttrLedger::Single(SingleValueHistorical::seeded(
                current.first().map(String::as_str),
            ))
        } else {
            AttrLedger::Multi(MultiValueHistorical::new())
        }
    }

    fn inner(&self) -> &dyn AttrHistorical {
        match self {
            AttrLedger::Single(h) => h,
            AttrLedger::Multi(h) => h,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn AttrHistorical {
        match self {
            AttrLedger::Single(h) => h,
            AttrLedger::Multi(h) => h,
        }
    }
}

impl AttrHistorical for AttrLedger {
    fn replay(&mut self, csn: Csn, m: &Modification, current: &[String]) -> ReplayOutcome {
        self.inner_mut().replay(csn, m, current)
    }

    fn record_local(&mut self, csn: Csn, m: &Modification, current: &[String]) {
        self.inner_mut().record_local(csn, m, current)
    }

    fn lines(&self) -> Vec<HistLine> {
        self.inner().lines()
    }

    fn load(&mut self, line: &HistLine) {
        self.inner_mut().load(line)
    }

    fn purge(&mut self, watermark: &Csn) -> bool {
        self.inner_mut().purge(watermark)
    }

    fn oldest_csn(&self) -> Option<Csn> {
        self.inner().oldest_csn()
    }

    fn is_empty(&self) -> bool {
        self.inner().is_empty()
    }
}

/// Historical information of one entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryHistorical {
    add_date: Option<Csn>,
    rename_date: Option<Csn>,
    attrs: BTreeMap<String, AttrLedger>,
}

impl EntryHistorical {
    /// Empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode the historical attribute of `entry`.
    pub fn parse(entry: &Entry, schema: &AttributeSchema) -> Result<Self> {
        let mut hist = Self::new();
        for raw in entry.historical_values() {
            hist.load_value(raw, schema)?;
        }
        Ok(hist)
    }

    /// Decode the historical attribute of `entry`, skipping malformed values.
    pub fn from_entry(entry: &Entry, schema: &AttributeSchema) -> Self {
        let mut hist = Self::new();
        for raw in entry.historical_values() {
            if let Err(e) = hist.load_value(raw, schema) {
                warn!(dn = %entry.dn, value = %raw, error = %e, "ignoring malformed historical value");
            }
        }
        hist
    }

    /// Add-or-rename date of `entry` without decoding attribute ledgers.
    pub fn read_dn_date(entry: &Entry) -> Option<Csn> {
        entry
            .historical_values()
            .iter()
            .filter_map(|raw| parse_dn_line(raw).ok().flatten())
            .map(|(csn, _)| csn)
            .max()
    }

    fn load_value(&mut self, raw: &str, schema: &AttributeSchema) -> Result<()> {
        if let Some((csn, is_add)) = parse_dn_line(raw)? {
            let slot = if is_add {
                &mut self.add_date
            } else {
                &mut self.rename_date
            };
            if csn.is_newer_than_opt(slot.as_ref()) {
                *slot = Some(csn);
            }
            return Ok(());
        }
        let (attr, line) = HistLine::decode(raw)?;
        self.attrs
            .entry(attr.clone())
            .or_insert_with(|| AttrLedger::for_attribute(&attr, schema, &[]))
            .load(&line);
        Ok(())
    }

    /// Encode into historical attribute values.
    pub fn encode(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(csn) = self.add_date {
            out.push(format!("{DN_KEY}:{csn}:{DN_ADD}"));
        }
        if let Some(csn) = self.rename_date {
            out.push(format!("{DN_KEY}:{csn}:{DN_RENAME}"));
        }
        for (attr, ledger) in &self.attrs {
            out.extend(ledger.lines().iter().map(|line| line.encode(attr)));
        }
        out
    }

    /// When the entry was created.
    pub fn add_date(&self) -> Option<Csn> {
        self.add_date
    }

    /// When the entry was last renamed.
    pub fn rename_date(&self) -> Option<Csn> {
        self.rename_date
    }

    /// When the entry got its current name.
    pub fn dn_date(&self) -> Option<Csn> {
        self.add_date.max(self.rename_date)
    }

    /// True if the entry was added or renamed after `csn`.
    pub fn added_or_renamed_after(&self, csn: &Csn) -> bool {
        csn.is_older_than_opt(self.add_date.as_ref())
            || csn.is_older_than_opt(self.rename_date.as_ref())
    }

    /// Ledger of `attr`.
    pub fn attribute(&self, attr: &str) -> Option<&AttrLedger> {
        self.attrs.get(&attr.to_ascii_lowercase())
    }

    fn ledger_mut(
        &mut self,
        attr: &str,
        schema: &AttributeSchema,
        current: &[String],
    ) -> &mut AttrLedger {
        self.attrs
            .entry(attr.to_ascii_lowercase())
            .or_insert_with(|| AttrLedger::for_attribute(attr, schema, current))
    }

    /// Record the creation of an entry with `attributes`.
    pub fn record_entry_add(&mut self, csn: Csn, attributes: &Attributes, schema: &AttributeSchema) {
        if csn.is_newer_than_opt(self.add_date.as_ref()) {
            self.add_date = Some(csn);
        }
        for (attr, values) in attributes {
            if is_replication_attribute(attr) || values.is_empty() {
                continue;
            }
            let m = Modification::new(ModificationType::Add, attr, values.clone());
            self.ledger_mut(attr, schema, &[]).record_local(csn, &m, &[]);
        }
    }

    /// Record a rename.
    pub fn record_rename(&mut self, csn: Csn) {
        if csn.is_newer_than_opt(self.rename_date.as_ref()) {
            self.rename_date = Some(csn);
        }
    }

    /// Record locally originated modifications against `entry`.
    pub fn process_local(
        &mut self,
        csn: Csn,
        mods: &[Modification],
        entry: &Entry,
        schema: &AttributeSchema,
    ) {
        let mut working = entry.clone();
        for m in mods {
            if !is_replication_attribute(&m.attr) && m.kind != ModificationType::Increment {
                let current = working.values(&m.attr).to_vec();
                self.ledger_mut(&m.attr, schema, &current)
                    .record_local(csn, m, &current);
            }
            apply_modification(&mut working, m);
        }
    }

    /// Check replayed modifications against the ledger, recording them.
    /// Returns the modifications the backend should apply.
    pub fn replay_modify(
        &mut self,
        csn: Csn,
        mods: &[Modification],
        entry: &Entry,
        schema: &AttributeSchema,
    ) -> ReplayOutcome {
        let mut working = entry.clone();
        let mut result = ReplayOutcome::default();
        for m in mods {
            let outcome = if is_replication_attribute(&m.attr) {
                ReplayOutcome::keep(m.clone())
            } else {
                let current = working.values(&m.attr).to_vec();
                self.ledger_mut(&m.attr, schema, &current)
                    .replay(csn, m, &current)
            };
            if outcome.unsupported {
                debug!(%csn, attr = %m.attr, "modification kind not tracked by the historical ledger");
            }
            for applied in &outcome.mods {
                apply_modification(&mut working, applied);
            }
            result.conflict |= outcome.conflict;
            result.unsupported |= outcome.unsupported;
            result.mods.extend(outcome.mods);
        }
        result
    }

    /// Drop records older than `watermark`. Returns the number of attribute
    /// ledgers removed.
    pub fn purge(&mut self, watermark: &Csn) -> usize {
        let before = self.attrs.len();
        self.attrs.retain(|_, ledger| !ledger.purge(watermark));
        before - self.attrs.len()
    }

    /// Oldest CSN recorded for any attribute.
    pub fn oldest_csn(&self) -> Option<Csn> {
        self.attrs.values().filter_map(|l| l.oldest_csn()).min()
    }

    /// True if nothing is recorded.
    pub fn is_empty(&self) -> bool {
        self.add_date.is_none() && self.rename_date.is_none() && self.attrs.is_empty()
    }
}

fn parse_dn_line(raw: &str) -> Result<Option<(Csn, bool)>> {
    let mut parts = raw.splitn(3, ':');
    if parts.next() != Some(DN_KEY) {
        return Ok(None);
    }
    let (Some(csn), Some(kind)) = (parts.next(), parts.next()) else {
        return Err(ReplError::HistoricalDecode {
            msg: format!("malformed dn historical value {raw:?}"),
        });
    };
    let csn: Csn = csn.parse()?;
    match kind {
        DN_ADD => Ok(Some((csn, true))),
        DN_RENAME => Ok(Some((csn, false))),
        other => Err(ReplError::HistoricalDecode {
            msg: format!("unknown dn historical kind {other:?}"),
        }),
    }
}

/// Apply `m` to `entry` without validation.
pub fn apply_modification(entry: &mut Entry, m: &Modification) {
    match m.kind {
        ModificationType::Add => {
            entry.add_values(&m.attr, &m.values);
        }
        ModificationType::Delete if m.values.is_empty() => {
            entry.remove_attr(&m.attr);
        }
        ModificationType::Delete => {
            entry.remove_values(&m.attr, &m.values);
        }
        ModificationType::Replace => entry.set_values(&m.attr, m.values.clone()),
        ModificationType::Increment => {
            let current = entry.first_value(&m.attr).and_then(|v| v.parse::<i64>().ok());
            let by = m.values.first().and_then(|v| v.parse::<i64>().ok());
            if let (Some(current), Some(by)) = (current, by) {
                entry.set_values(&m.attr, vec![current.saturating_add(by).to_string()]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dn::Dn;
    use crate::entry::HISTORICAL_ATTR;

    fn csn(t: i64) -> Csn {
        Csn::new(t, 0, 1)
    }

    fn schema() -> AttributeSchema {
        AttributeSchema::with_single_valued(["title"])
    }

    fn person() -> Entry {
        Entry::new(Dn::parse("cn=p,dc=e").unwrap())
            .with_attr("cn", &["p"])
            .with_attr("title", &["x"])
            .with_attr("mail", &["a@e"])
    }

    fn with_history(entry: &Entry, hist: &EntryHistorical) -> Entry {
        let mut e = entry.clone();
        e.set_values(HISTORICAL_ATTR, hist.encode());
        e
    }

    #[test]
    fn test_entry_add_then_encode_parse() {
        let entry = person();
        let mut hist = EntryHistorical::new();
        hist.record_entry_add(csn(100), &entry.attributes, &schema());
        let stored = with_history(&entry, &hist);
        let back = EntryHistorical::parse(&stored, &schema()).unwrap();
        assert_eq!(back, hist);
        assert_eq!(back.dn_date(), Some(csn(100)));
        assert_eq!(EntryHistorical::read_dn_date(&stored), Some(csn(100)));
        assert!(matches!(back.attribute("title"), Some(AttrLedger::Single(_))));
        assert!(matches!(back.attribute("mail"), Some(AttrLedger::Multi(_))));
    }

    #[test]
    fn test_single_valued_race() {
        let entry = person();
        let mut hist = EntryHistorical::new();
        hist.record_entry_add(csn(100), &entry.attributes, &schema());

        let out = hist.replay_modify(csn(90), &[Modification::add("title", &["y"])], &entry, &schema());
        assert!(out.conflict);
        assert!(out.mods.is_empty());

        let out = hist.replay_modify(
            csn(110),
            &[Modification::replace("title", &["z"])],
            &entry,
            &schema(),
        );
        assert_eq!(out.mods, vec![Modification::replace("title", &["z"])]);
        let Some(AttrLedger::Single(title)) = hist.attribute("title") else {
            panic!("title ledger missing");
        };
        assert_eq!(title.value(), Some("z"));
        assert_eq!(title.slot().add_time(), Some(csn(110)));
        assert_eq!(title.slot().delete_time(), Some(csn(110)));
    }

    #[test]
    fn test_replication_attributes_pass_through() {
        let entry = person();
        let mut hist = EntryHistorical::new();
        let m = Modification::replace(crate::entry::CONFLICT_ATTR, &["cn=q,dc=e"]);
        let out = hist.replay_modify(csn(5), &[m.clone()], &entry, &schema());
        assert_eq!(out.mods, vec![m]);
        assert!(hist.attribute(crate::entry::CONFLICT_ATTR).is_none());
    }

    #[test]
    fn test_later_mods_see_earlier_ones() {
        let entry = person();
        let mut hist = EntryHistorical::new();
        hist.record_entry_add(csn(100), &entry.attributes, &schema());
        let out = hist.replay_modify(
            csn(120),
            &[
                Modification::delete("mail", &[]),
                Modification::add("mail", &["b@e"]),
            ],
            &entry,
            &schema(),
        );
        assert_eq!(out.mods.len(), 2);
        assert!(!out.conflict);
    }

    #[test]
    fn test_rename_date() {
        let mut hist = EntryHistorical::new();
        hist.record_entry_add(csn(10), &Attributes::new(), &schema());
        hist.record_rename(csn(20));
        assert_eq!(hist.dn_date(), Some(csn(20)));
        assert!(hist.added_or_renamed_after(&csn(15)));
        assert!(!hist.added_or_renamed_after(&csn(20)));
    }

    #[test]
    fn test_lenient_parse_skips_bad_values() {
        let mut entry = person();
        entry.set_values(
            HISTORICAL_ATTR,
            vec!["garbage".into(), format!("dn:{}:add", csn(3))],
        );
        assert!(EntryHistorical::parse(&entry, &schema()).is_err());
        let hist = EntryHistorical::from_entry(&entry, &schema());
        assert_eq!(hist.add_date(), Some(csn(3)));
    }

    #[test]
    fn test_purge_removes_dead_attributes() {
        let entry = person();
        let mut hist = EntryHistorical::new();
        hist.record_entry_add(csn(10), &entry.attributes, &schema());
        hist.process_local(csn(20), &[Modification::delete("title", &[])], &entry, &schema());
        assert_eq!(hist.oldest_csn(), Some(csn(10)));
        assert_eq!(hist.purge(&csn(30)), 1);
        assert!(hist.attribute("title").is_none());
        assert!(hist.attribute("mail").is_some());
    }

    #[test]
    fn test_apply_increment() {
        let mut entry = person().with_attr("counter", &["41"]);
        apply_modification(&mut entry, &Modification::increment("counter", 1));
        assert_eq!(entry.first_value("counter"), Some("42"));
    }
}
