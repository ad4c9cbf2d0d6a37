//! Attribute historical ledger.
//!
//! Each replicated entry carries, per attribute, the CSNs of the last add
//! and delete it saw. Replayed modifications are checked against those
//! times and dropped or rewritten when they lost a race. Single- and
//! multi-valued attributes implement the same [`AttrHistorical`] interface
//! on top of a shared [`ValueSlot`].

mod entry;
mod multi;
mod single;
mod slot;

pub use entry::{apply_modification, AttrLedger, EntryHistorical};
pub use multi::{MultiValueHistorical, ValueHistorical};
pub use single::SingleValueHistorical;
pub use slot::ValueSlot;

use crate::csn::Csn;
use crate::error::{ReplError, Result};
use crate::operation::Modification;
use std::fmt;
use std::str::FromStr;

/// Kind of operation recorded in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HistKind {
    /// Value added.
    Add,
    /// Value deleted.
    Delete,
    /// Attribute replaced.
    Replace,
    /// Whole attribute deleted.
    DeleteAttr,
}

impl fmt::Display for HistKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HistKind::Add => "add",
            HistKind::Delete => "del",
            HistKind::Replace => "repl",
            HistKind::DeleteAttr => "attrDel",
        })
    }
}

impl FromStr for HistKind {
    type Err = ReplError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "add" => Ok(HistKind::Add),
            "del" => Ok(HistKind::Delete),
            "repl" => Ok(HistKind::Replace),
            "attrDel" => Ok(HistKind::DeleteAttr),
            other => Err(ReplError::HistoricalDecode {
                msg: format!("unknown historical kind {other:?}"),
            }),
        }
    }
}

/// One encoded ledger record: `attr:csn:kind[:value]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistLine {
    /// When.
    pub csn: Csn,
    /// What.
    pub kind: HistKind,
    /// Which value, when the record is per value.
    pub value: Option<String>,
}

impl HistLine {
    /// Create a line.
    pub fn new(csn: Csn, kind: HistKind, value: Option<String>) -> Self {
        Self { csn, kind, value }
    }

    /// Encode for attribute `attr`.
    pub fn encode(&self, attr: &str) -> String {
        match &self.value {
            Some(v) => format!("{attr}:{}:{}:{v}", self.csn, self.kind),
            None => format!("{attr}:{}:{}", self.csn, self.kind),
        }
    }

    /// Decode one attribute value into `(attr, line)`.
    pub fn decode(text: &str) -> Result<(String, HistLine)> {
        let mut parts = text.splitn(4, ':');
        let (Some(attr), Some(csn), Some(kind)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(ReplError::HistoricalDecode {
                msg: format!("malformed historical value {text:?}"),
            });
        };
        let csn: Csn = csn.parse()?;
        let kind: HistKind = kind.parse()?;
        let value = parts.next().map(str::to_string);
        Ok((attr.to_ascii_lowercase(), HistLine::new(csn, kind, value)))
    }
}

/// Result of checking one replayed modification against the ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayOutcome {
    /// Modifications to hand to the backend instead of the original.
    pub mods: Vec<Modification>,
    /// The original was dropped or rewritten.
    pub conflict: bool,
    /// The ledger cannot adjudicate this kind of modification.
    pub unsupported: bool,
}

impl ReplayOutcome {
    /// Apply the modification unchanged.
    pub fn keep(m: Modification) -> Self {
        Self {
            mods: vec![m],
            ..Self::default()
        }
    }

    /// Apply a rewritten modification.
    pub fn rewritten(m: Modification) -> Self {
        Self {
            mods: vec![m],
            conflict: true,
            unsupported: false,
        }
    }

    /// Drop the modification.
    pub fn dropped() -> Self {
        Self {
            mods: Vec::new(),
            conflict: true,
            unsupported: false,
        }
    }

    /// Pass through a modification the ledger does not understand.
    pub fn unsupported(m: Modification) -> Self {
        Self {
            mods: vec![m],
            conflict: false,
            unsupported: true,
        }
    }
}

/// Per-attribute ledger interface.
pub trait AttrHistorical {
    /// Check a replayed modification, record it, and return what to apply.
    /// `current` holds the attribute's values in the entry right now.
    fn replay(&mut self, csn: Csn, m: &Modification, current: &[String]) -> ReplayOutcome;

    /// Record a locally originated modification unconditionally.
    fn record_local(&mut self, csn: Csn, m: &Modification, current: &[String]);

    /// Encoded records.
    fn lines(&self) -> Vec<HistLine>;

    /// Replay one decoded record.
    fn load(&mut self, line: &HistLine);

    /// Forget what is older than `watermark`. Returns true if nothing is left.
    fn purge(&mut self, watermark: &Csn) -> bool;

    /// Oldest CSN still recorded.
    fn oldest_csn(&self) -> Option<Csn>;

    /// True if nothing is recorded.
    fn is_empty(&self) -> bool;
}
