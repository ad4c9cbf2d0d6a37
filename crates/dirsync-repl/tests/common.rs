//! Common test utilities: an in-process topology of replicas over
//! in-memory backends with manually driven clocks.

#![allow(dead_code)]

use dirsync_repl::backend::{Backend, InMemoryBackend, ResultCode};
use dirsync_repl::csn_generator::{ManualClock, TimeSource};
use dirsync_repl::dn::Dn;
use dirsync_repl::domain::{DomainChannels, ReplicationDomain};
use dirsync_repl::entry::{Attributes, Entry};
use dirsync_repl::operation::Operation;
use dirsync_repl::{DomainConfig, ReplicaId, UpdateMsg};
use std::sync::Arc;

pub const BASE: &str = "dc=example,dc=com";

pub fn dn(s: &str) -> Dn {
    Dn::parse(s).unwrap()
}

pub fn under_base(rdn: &str) -> Dn {
    dn(&format!("{rdn},{BASE}"))
}

pub fn attrs(pairs: &[(&str, &str)]) -> Attributes {
    let mut out = Attributes::new();
    for (attr, value) in pairs {
        out.entry(attr.to_ascii_lowercase())
            .or_insert_with(Vec::new)
            .push(value.to_string());
    }
    out
}

/// One replica of the test topology.
pub struct TestReplica {
    pub domain: Arc<ReplicationDomain>,
    pub channels: DomainChannels,
    pub backend: Arc<InMemoryBackend>,
    pub clock: Arc<ManualClock>,
}

impl TestReplica {
    pub fn new(replica_id: ReplicaId) -> Self {
        let config = DomainConfig {
            replica_id,
            base_dn: BASE.to_string(),
            single_valued_attributes: vec!["displayName".to_string()],
            ..DomainConfig::default()
        };
        let backend = Arc::new(InMemoryBackend::new(dn(BASE)));
        let clock = Arc::new(ManualClock::new(1_000));
        let (domain, channels) = ReplicationDomain::with_clock(
            config,
            Arc::clone(&backend) as Arc<dyn Backend>,
            Arc::clone(&clock) as Arc<dyn TimeSource>,
        )
        .unwrap();
        Self {
            domain,
            channels,
            backend,
            clock,
        }
    }

    /// Apply a local write; returns the published update if it succeeded.
    pub async fn local(&mut self, op: Operation) -> Option<UpdateMsg> {
        let code = self.domain.apply_local_operation(op).await.unwrap();
        if code != ResultCode::Success {
            return None;
        }
        self.channels.outbound.try_recv().ok()
    }

    /// Like [`TestReplica::local`] but the write must succeed.
    pub async fn must(&mut self, op: Operation) -> UpdateMsg {
        self.local(op).await.expect("local operation was not published")
    }

    pub async fn deliver(&self, msg: UpdateMsg) {
        self.domain.process_update(msg).await.unwrap();
    }

    pub async fn deliver_all(&self, msgs: &[UpdateMsg]) {
        for msg in msgs {
            self.deliver(msg.clone()).await;
        }
    }

    pub fn snapshot(&self) -> Vec<Entry> {
        self.backend.snapshot()
    }

    pub fn entry(&self, at: &Dn) -> Option<Entry> {
        use dirsync_repl::backend::EntryView;
        self.backend.entry_by_dn(at)
    }
}

/// Replicas with ids `1..=n`.
pub fn topology(n: u16) -> Vec<TestReplica> {
    (1..=n).map(TestReplica::new).collect()
}

/// Merge per-origin update streams into one delivery order. Each origin's
/// own order is kept; `choices` picks which origin goes next.
pub fn interleave(streams: &[Vec<UpdateMsg>], choices: &[usize]) -> Vec<UpdateMsg> {
    let mut cursors = vec![0usize; streams.len()];
    let total: usize = streams.iter().map(Vec::len).sum();
    let mut out = Vec::with_capacity(total);
    let mut pick = choices.iter().copied().cycle();
    while out.len() < total {
        let open: Vec<usize> = (0..streams.len())
            .filter(|&i| cursors[i] < streams[i].len())
            .collect();
        let choice = pick.next().unwrap_or(0) % open.len();
        let origin = open[choice];
        out.push(streams[origin][cursors[origin]].clone());
        cursors[origin] += 1;
    }
    out
}
