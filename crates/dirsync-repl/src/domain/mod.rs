//! Replication domain: everything replication does for one suffix.
//!
//! A domain owns the CSN generator, state vector and both pending buffers of
//! a suffix. Local writes go through [`ReplicationDomain::apply_local_operation`];
//! remote updates enter through [`ReplicationDomain::receive_update`] and are
//! replayed by a fixed pool of worker tasks, with naming conflicts repaired
//! by the [`NamingConflictResolver`](crate::resolver::NamingConflictResolver).

mod hooks;

use crate::backend::{Backend, PassThrough, ResultCode};
use crate::config::DomainConfig;
use crate::csn::{Csn, ReplicaId};
use crate::csn_generator::{CsnGenerator, SystemClock, TimeSource};
use crate::dn::Dn;
use crate::entry::{Entry, CONFLICT_ATTR};
use crate::error::{ReplError, Result};
use crate::historical::EntryHistorical;
use crate::message::UpdateMsg;
use crate::operation::{Modification, ModificationType, ModifyDnOperation, Operation, OperationKind};
use crate::pending::{LocalPendingChanges, RemotePendingChanges};
use crate::resolver::{NamingConflictResolver, QuarantineAction, Resolution};
use crate::schema::AttributeSchema;
use crate::server_state::{ServerState, StateVector};
use hooks::{LocalHook, PurgeHook, ReplayHook};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Lifecycle of a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainState {
    /// Created, workers not started.
    Idle,
    /// Replaying and accepting writes.
    Running,
    /// Shutting down; in-flight replays are abandoned.
    Stopping,
    /// Fully stopped.
    Stopped,
}

#[derive(Debug, Default)]
struct DomainStatsInner {
    local_operations: AtomicU64,
    replayed: AtomicU64,
    duplicates: AtomicU64,
    decode_errors: AtomicU64,
    replay_errors: AtomicU64,
    resolved_naming_conflicts: AtomicU64,
    unresolved_naming_conflicts: AtomicU64,
    resolved_modify_conflicts: AtomicU64,
    conflicts_cleared: AtomicU64,
    historical_purged: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Point-in-time view of a domain for monitoring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainMonitor {
    /// Replicated suffix.
    pub base_dn: String,
    /// This replica.
    pub replica_id: ReplicaId,
    /// Lifecycle state.
    pub state: DomainState,
    /// Local changes not yet published.
    pub pending_local: usize,
    /// Remote updates not yet committed.
    pub pending_remote: usize,
    /// Remote updates parked behind a dependency.
    pub dependent: usize,
    /// Local operations committed.
    pub local_operations: u64,
    /// Remote updates replayed successfully.
    pub replayed: u64,
    /// Inbound duplicates discarded.
    pub duplicates: u64,
    /// Inbound updates that could not be decoded.
    pub decode_errors: u64,
    /// Replays that failed permanently.
    pub replay_errors: u64,
    /// Naming conflicts repaired without quarantine.
    pub resolved_naming_conflicts: u64,
    /// Naming conflicts that quarantined an entry or gave up.
    pub unresolved_naming_conflicts: u64,
    /// Modifications dropped or rewritten by the ledger.
    pub resolved_modify_conflicts: u64,
    /// Quarantined entries moved back to their freed DN.
    pub conflicts_cleared: u64,
    /// Entries whose ledger was purged.
    pub historical_purged: u64,
    /// State vector.
    pub state_vector: StateVector,
}

/// Receivers for what a domain publishes.
#[derive(Debug)]
pub struct DomainChannels {
    /// Committed local changes, in CSN order.
    pub outbound: mpsc::Receiver<UpdateMsg>,
    /// Local changes replayed for a peer that is catching up.
    pub recovery: mpsc::Receiver<UpdateMsg>,
}

#[derive(Debug, Default)]
struct RecoveryLog {
    entries: BTreeMap<Csn, UpdateMsg>,
    evicted_up_to: Option<Csn>,
}

/// Replication of one suffix.
pub struct ReplicationDomain {
    config: DomainConfig,
    base_dn: Dn,
    schema: AttributeSchema,
    backend: Arc<dyn Backend>,
    clock: Arc<dyn TimeSource>,
    generator: Arc<CsnGenerator>,
    state: Arc<ServerState>,
    local: LocalPendingChanges,
    remote: RemotePendingChanges,
    replay_tx: mpsc::Sender<UpdateMsg>,
    replay_rx: Arc<Mutex<mpsc::Receiver<UpdateMsg>>>,
    recovery_tx: mpsc::Sender<UpdateMsg>,
    recovery_log: Mutex<RecoveryLog>,
    stats: Arc<DomainStatsInner>,
    lifecycle: Mutex<DomainState>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ReplicationDomain {
    /// Create a domain over `backend` driven by the system clock.
    pub fn new(config: DomainConfig, backend: Arc<dyn Backend>) -> Result<(Arc<Self>, DomainChannels)> {
        Self::with_clock(config, backend, Arc::new(SystemClock))
    }

    /// Create a domain with an explicit time source.
    pub fn with_clock(
        config: DomainConfig,
        backend: Arc<dyn Backend>,
        clock: Arc<dyn TimeSource>,
    ) -> Result<(Arc<Self>, DomainChannels)> {
        config.validate()?;
        let base_dn = config.base()?;
        let state = match &config.state_file {
            Some(path) => ServerState::load(path)?,
            None => ServerState::new(),
        };
        let state = Arc::new(state);
        let seen = state.snapshot();
        let generator = Arc::new(CsnGenerator::seeded(
            config.replica_id,
            Arc::clone(&clock),
            seen.csns(),
        ));
        let (outbound_tx, outbound) = mpsc::channel(config.outbound_queue_capacity);
        let (recovery_tx, recovery) = mpsc::channel(config.recovery_log_capacity);
        let (replay_tx, replay_rx) = mpsc::channel(config.replay_queue_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let domain = Arc::new(Self {
            schema: AttributeSchema::with_single_valued(&config.single_valued_attributes),
            local: LocalPendingChanges::new(
                Arc::clone(&generator),
                Arc::clone(&state),
                outbound_tx,
                shutdown_rx,
            ),
            remote: RemotePendingChanges::new(Arc::clone(&state)),
            config,
            base_dn,
            backend,
            clock,
            generator,
            state,
            replay_tx,
            replay_rx: Arc::new(Mutex::new(replay_rx)),
            recovery_tx,
            recovery_log: Mutex::new(RecoveryLog::default()),
            stats: Arc::new(DomainStatsInner::default()),
            lifecycle: Mutex::new(DomainState::Idle),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        });
        Ok((domain, DomainChannels { outbound, recovery }))
    }

    /// Replicated suffix.
    pub fn base_dn(&self) -> &Dn {
        &self.base_dn
    }

    /// This replica.
    pub fn replica_id(&self) -> ReplicaId {
        self.config.replica_id
    }

    /// Settings.
    pub fn config(&self) -> &DomainConfig {
        &self.config
    }

    /// Shared state vector.
    pub fn server_state(&self) -> &Arc<ServerState> {
        &self.state
    }

    /// Backend the domain writes into.
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// CSN generator.
    pub fn generator(&self) -> &Arc<CsnGenerator> {
        &self.generator
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Start replay workers, the state flusher and the purge task.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        match *lifecycle {
            DomainState::Idle => {}
            DomainState::Running => return Ok(()),
            DomainState::Stopping | DomainState::Stopped => return Err(ReplError::Shutdown),
        }
        let mut tasks = self.tasks.lock().await;
        // Receivers are subscribed here so a shutdown sent before a task is
        // first polled is still observed.
        for worker in 0..self.config.replay_workers {
            let shutdown = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(Arc::clone(self).replay_worker(worker, shutdown)));
        }
        if let Some(path) = self.config.state_file.clone() {
            let shutdown = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(Arc::clone(self).flush_loop(path, shutdown)));
        }
        let shutdown = self.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(Arc::clone(self).purge_loop(shutdown)));
        *lifecycle = DomainState::Running;
        info!(
            base_dn = %self.base_dn,
            replica_id = self.config.replica_id,
            workers = self.config.replay_workers,
            "replication domain started"
        );
        Ok(())
    }

    /// Stop all tasks, refuse new local CSNs and save the state vector.
    pub async fn shutdown(&self) -> Result<()> {
        {
            let mut lifecycle = self.lifecycle.lock().await;
            if matches!(*lifecycle, DomainState::Stopping | DomainState::Stopped) {
                return Ok(());
            }
            *lifecycle = DomainState::Stopping;
        }
        self.shutdown_tx.send_replace(true);
        self.local.close().await;
        let handles = std::mem::take(&mut *self.tasks.lock().await);
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(base_dn = %self.base_dn, error = %e, "domain task ended abnormally");
            }
        }
        let saved = match &self.config.state_file {
            Some(path) => self.state.save(path),
            None => Ok(()),
        };
        *self.lifecycle.lock().await = DomainState::Stopped;
        info!(base_dn = %self.base_dn, "replication domain stopped");
        saved
    }

    /// Current lifecycle state.
    pub async fn lifecycle(&self) -> DomainState {
        *self.lifecycle.lock().await
    }

    // ---- local write path ----

    /// Apply a locally originated write and publish it once every older
    /// local change has been published.
    pub async fn apply_local_operation(&self, mut op: Operation) -> Result<ResultCode> {
        if self.is_shutting_down() {
            return Err(ReplError::Shutdown);
        }
        let csn = self.local.put_local_operation(&op).await?;
        let original = op.clone();
        let mut hook = LocalHook::new(csn, &self.schema);
        let code = self.backend.apply_operation(&mut op, &mut hook);
        if !code.is_success() {
            self.local.remove(csn).await?;
            debug!(%csn, kind = %op.kind(), dn = %op.dn(), %code, "local operation failed");
            return Ok(code);
        }
        let Some(entry_uuid) = hook.entry_uuid.take() else {
            warn!(%csn, dn = %op.dn(), "entry has no surrogate id; change not replicated");
            self.local.remove(csn).await?;
            return Ok(code);
        };
        let msg = UpdateMsg::from_local(
            csn,
            entry_uuid,
            &original,
            hook.parent_uuid.take(),
            hook.new_superior_uuid.take(),
        );
        self.remember_for_recovery(msg.clone()).await;
        self.local.commit_and_push_committed_changes(csn, msg).await?;
        bump(&self.stats.local_operations);
        if matches!(original.kind(), OperationKind::Delete | OperationKind::ModifyDn) {
            self.check_for_cleared_conflict(original.dn());
        }
        Ok(code)
    }

    async fn remember_for_recovery(&self, msg: UpdateMsg) {
        let mut log = self.recovery_log.lock().await;
        log.entries.insert(msg.csn, msg);
        while log.entries.len() > self.config.recovery_log_capacity {
            if let Some((csn, _)) = log.entries.pop_first() {
                log.evicted_up_to = Some(csn);
            }
        }
    }

    // ---- replay path ----

    /// Queue a remote update for the replay workers. Returns false for a
    /// duplicate. Blocks while the replay queue is full.
    pub async fn receive_update(&self, msg: UpdateMsg) -> Result<bool> {
        if !self.accept(&msg).await {
            return Ok(false);
        }
        let mut shutdown = self.shutdown_tx.subscribe();
        if *shutdown.borrow_and_update() {
            return Err(ReplError::Shutdown);
        }
        tokio::select! {
            sent = self.replay_tx.send(msg) => sent.map_err(|_| ReplError::ChannelClosed {
                msg: "replay queue".to_string(),
            })?,
            _ = shutdown.changed() => return Err(ReplError::Shutdown),
        }
        Ok(true)
    }

    /// Decode and queue an update. Undecodable input is logged and dropped.
    pub async fn receive_encoded(&self, data: &[u8]) -> Result<bool> {
        match UpdateMsg::decode(data) {
            Ok(msg) => self.receive_update(msg).await,
            Err(e) => {
                bump(&self.stats.decode_errors);
                warn!(base_dn = %self.base_dn, error = %e, len = data.len(), "dropping undecodable update");
                Ok(false)
            }
        }
    }

    /// Replay a remote update on the calling task instead of a worker.
    pub async fn process_update(&self, msg: UpdateMsg) -> Result<bool> {
        if self.is_shutting_down() {
            return Err(ReplError::Shutdown);
        }
        if !self.accept(&msg).await {
            return Ok(false);
        }
        self.replay(msg).await;
        Ok(true)
    }

    async fn accept(&self, msg: &UpdateMsg) -> bool {
        self.generator.adjust(&msg.csn);
        if self.remote.put_remote_update(msg.clone()).await {
            true
        } else {
            bump(&self.stats.duplicates);
            debug!(csn = %msg.csn, dn = %msg.dn(), "duplicate update ignored");
            false
        }
    }

    async fn replay_worker(self: Arc<Self>, worker: usize, mut shutdown: watch::Receiver<bool>) {
        debug!(base_dn = %self.base_dn, worker, "replay worker started");
        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            let next = {
                let mut rx = self.replay_rx.lock().await;
                tokio::select! {
                    msg = rx.recv() => msg,
                    _ = shutdown.wait_for(|stop| *stop) => None,
                }
            };
            let Some(msg) = next else {
                break;
            };
            self.replay(msg).await;
        }
        debug!(base_dn = %self.base_dn, worker, "replay worker stopped");
    }

    /// Replay `msg`, then every parked update its completion released.
    async fn replay(&self, msg: UpdateMsg) {
        let mut next = Some(msg);
        while let Some(msg) = next.take() {
            if self.is_shutting_down() {
                return;
            }
            if !self.remote.check_dependencies(&msg, self.backend.as_view()).await {
                self.replay_one(msg).await;
            }
            next = self.remote.get_next_update().await;
        }
    }

    async fn replay_one(&self, original: UpdateMsg) {
        let csn = original.csn;
        let mut msg = original;
        let mut attempts = 0;
        let mut finished = false;
        while attempts < self.config.max_replay_retries {
            if self.is_shutting_down() {
                return;
            }
            attempts += 1;
            let code = self.apply_remote_update(&msg);
            match code {
                ResultCode::Success | ResultCode::NoOperation => {
                    bump(&self.stats.replayed);
                    finished = true;
                    break;
                }
                ResultCode::Busy | ResultCode::Unavailable => {
                    tokio::time::sleep(Duration::from_millis(self.config.busy_retry_backoff_ms)).await;
                    continue;
                }
                _ => {}
            }
            if self.remote.check_dependencies(&msg, self.backend.as_view()).await {
                // Parked again; released when the change it waits for commits.
                return;
            }
            if !self.config.solve_conflicts {
                warn!(%csn, dn = %msg.dn(), %code, "replay failed; conflict resolution disabled");
                bump(&self.stats.replay_errors);
                finished = true;
                break;
            }
            let resolution =
                NamingConflictResolver::new(&self.base_dn, self.backend.as_view()).resolve(&msg, code);
            match resolution {
                Resolution::Retry { msg: rewritten } => {
                    bump(&self.stats.resolved_naming_conflicts);
                    msg = rewritten;
                }
                Resolution::ResolvedNoOp => {
                    bump(&self.stats.resolved_naming_conflicts);
                    finished = true;
                    break;
                }
                Resolution::QuarantineAndRetry {
                    actions,
                    msg: rewritten,
                } => {
                    bump(&self.stats.unresolved_naming_conflicts);
                    if rewritten.dn() != msg.dn() {
                        warn!(%csn, dn = %msg.dn(), conflict_dn = %rewritten.dn(), "naming conflict: update quarantined");
                    }
                    self.apply_quarantine(&actions);
                    msg = rewritten;
                }
                Resolution::Unresolved { code } => {
                    error!(
                        %csn,
                        kind = %msg.kind(),
                        dn = %msg.dn(),
                        entry_uuid = %msg.entry_uuid,
                        %code,
                        "could not replay update; manual repair needed"
                    );
                    bump(&self.stats.replay_errors);
                    finished = true;
                    break;
                }
            }
        }
        if !finished {
            error!(
                %csn,
                dn = %msg.dn(),
                attempts,
                "loop replaying update; giving up"
            );
            bump(&self.stats.unresolved_naming_conflicts);
            bump(&self.stats.replay_errors);
        }
        if let Err(e) = self.remote.commit(csn).await {
            warn!(%csn, error = %e, "replayed update missing from pending buffer");
        }
    }

    fn apply_remote_update(&self, msg: &UpdateMsg) -> ResultCode {
        let mut op = msg.to_operation();
        let mut hook = ReplayHook::new(msg, &self.schema);
        let code = self.backend.apply_operation(&mut op, &mut hook);
        if hook.modify_conflict {
            bump(&self.stats.resolved_modify_conflicts);
        }
        debug!(csn = %msg.csn, kind = %msg.kind(), dn = %msg.dn(), %code, "update replayed");
        if code.is_success() && matches!(op.kind(), OperationKind::Delete | OperationKind::ModifyDn) {
            self.check_for_cleared_conflict(op.dn());
        }
        code
    }

    fn apply_quarantine(&self, actions: &[QuarantineAction]) {
        for action in actions {
            match action {
                QuarantineAction::Rename {
                    entry_uuid,
                    from,
                    to,
                    expected,
                } => {
                    let Some(current) = self.backend.entry_by_uuid(entry_uuid) else {
                        continue;
                    };
                    let Some(new_rdn) = to.rdn().cloned() else {
                        continue;
                    };
                    let mut op = Operation::ModifyDn(ModifyDnOperation {
                        dn: current.dn,
                        new_rdn,
                        delete_old_rdn: false,
                        new_superior: to.parent(),
                        mods: vec![tag(expected)],
                    });
                    let code = self.backend.apply_operation(&mut op, &mut PassThrough);
                    if code.is_success() {
                        warn!(%entry_uuid, %from, %to, "naming conflict: entry renamed");
                    } else {
                        error!(%entry_uuid, %from, %to, %code, "could not quarantine conflicting entry");
                    }
                }
                QuarantineAction::Mark {
                    entry_uuid,
                    expected,
                } => {
                    let Some(current) = self.backend.entry_by_uuid(entry_uuid) else {
                        continue;
                    };
                    let mut op = Operation::modify(current.dn.clone(), vec![tag(expected)]);
                    let code = self.backend.apply_operation(&mut op, &mut PassThrough);
                    if !code.is_success() {
                        error!(%entry_uuid, dn = %current.dn, %code, "could not tag conflicting entry");
                    }
                }
            }
        }
    }

    /// Move the oldest entry quarantined for `freed` back into it.
    fn check_for_cleared_conflict(&self, freed: &Dn) {
        if !self.config.solve_conflicts || self.backend.entry_by_dn(freed).is_some() {
            return;
        }
        let candidates = self
            .backend
            .search(&self.base_dn, &|e| e.conflict_tag().as_ref() == Some(freed));
        let Some(winner) = candidates
            .into_iter()
            .min_by_key(|e| (EntryHistorical::read_dn_date(e), e.uuid()))
        else {
            return;
        };
        let Some(new_rdn) = freed.rdn().cloned() else {
            return;
        };
        let mut op = Operation::ModifyDn(ModifyDnOperation {
            dn: winner.dn.clone(),
            new_rdn,
            delete_old_rdn: false,
            new_superior: freed.parent(),
            mods: vec![Modification::new(ModificationType::Delete, CONFLICT_ATTR, Vec::new())],
        });
        let code = self.backend.apply_operation(&mut op, &mut PassThrough);
        if code.is_success() {
            bump(&self.stats.conflicts_cleared);
            info!(from = %winner.dn, to = %freed, "conflicting entry moved to freed DN");
        } else {
            warn!(from = %winner.dn, to = %freed, %code, "could not move conflicting entry to freed DN");
        }
    }

    // ---- background tasks ----

    async fn flush_loop(self: Arc<Self>, path: PathBuf, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.state_flush_interval_ms));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.state.flush(&path) {
                        warn!(path = %path.display(), error = %e, "could not save replication state");
                    }
                }
                _ = shutdown.wait_for(|stop| *stop) => break,
            }
        }
    }

    async fn purge_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.config.historical_purge_interval_ms));
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let purged = self.purge_historical(self.clock.now_millis());
                    if purged > 0 {
                        info!(base_dn = %self.base_dn, purged, "historical information purged");
                    }
                }
                _ = shutdown.wait_for(|stop| *stop) => break,
            }
        }
    }

    /// Oldest CSN whose history may be forgotten at `now_ms`: older than the
    /// purge delay and already seen from every known replica.
    pub fn purge_watermark(&self, now_ms: i64) -> Csn {
        let by_age = Csn::new(
            now_ms.saturating_sub(self.config.historical_purge_delay_ms as i64),
            0,
            0,
        );
        match self.state.snapshot().oldest_max_csn() {
            Some(seen) => by_age.min(seen),
            None => by_age,
        }
    }

    /// Drop ledger records older than the watermark. Returns the number of
    /// entries rewritten.
    pub fn purge_historical(&self, now_ms: i64) -> usize {
        let watermark = self.purge_watermark(now_ms);
        let entries = self
            .backend
            .search(&self.base_dn, &|e| !e.historical_values().is_empty());
        let mut rewritten = 0;
        for entry in entries {
            if purge_entry(self.backend.as_ref(), &entry, &self.schema, &watermark) {
                rewritten += 1;
            }
        }
        self.stats
            .historical_purged
            .fetch_add(rewritten as u64, Ordering::Relaxed);
        rewritten
    }

    // ---- recovery ----

    /// A peer connected with state `peer`. If it is missing local changes,
    /// publish them on the recovery channel in CSN order before normal
    /// publication resumes. Returns the number of changes published.
    pub async fn session_initiated(&self, peer: &StateVector) -> Result<usize> {
        let me = self.config.replica_id;
        let peer_max = peer.get(me);
        let Some(local_max) = self.state.max_csn(me) else {
            return Ok(0);
        };
        if !local_max.is_newer_than_opt(peer_max.as_ref()) {
            return Ok(0);
        }
        self.local.set_recovering(true).await;
        info!(base_dn = %self.base_dn, peer_max = ?peer_max, %local_max, "publishing missing changes");
        self.publish_missing_changes(peer_max, local_max).await
    }

    async fn publish_missing_changes(&self, peer_max: Option<Csn>, local_max: Csn) -> Result<usize> {
        let mut from = peer_max;
        let mut published = 0;
        loop {
            let batch: Vec<UpdateMsg> = {
                let log = self.recovery_log.lock().await;
                if let Some(evicted) = log.evicted_up_to {
                    if published == 0 && evicted.is_newer_than_opt(from.as_ref()) {
                        warn!(base_dn = %self.base_dn, %evicted, "peer is missing changes no longer in the recovery log");
                    }
                }
                log.entries
                    .values()
                    .filter(|msg| msg.csn.is_newer_than_opt(from.as_ref()) && self.state.cover(&msg.csn))
                    .cloned()
                    .collect()
            };
            let empty = batch.is_empty();
            for msg in batch {
                from = Some(msg.csn);
                self.recovery_tx
                    .send(msg)
                    .await
                    .map_err(|_| ReplError::ChannelClosed {
                        msg: "recovery stream".to_string(),
                    })?;
                published += 1;
            }
            if self.local.recovery_until(from.unwrap_or(local_max)).await {
                break;
            }
            if empty {
                self.local.set_recovering(false).await;
                break;
            }
        }
        Ok(published)
    }

    // ---- monitoring ----

    /// Snapshot of counters and queue sizes.
    pub async fn monitor(&self) -> DomainMonitor {
        let s = &self.stats;
        DomainMonitor {
            base_dn: self.base_dn.to_string(),
            replica_id: self.config.replica_id,
            state: *self.lifecycle.lock().await,
            pending_local: self.local.size().await,
            pending_remote: self.remote.size().await,
            dependent: self.remote.dependent_count().await,
            local_operations: s.local_operations.load(Ordering::Relaxed),
            replayed: s.replayed.load(Ordering::Relaxed),
            duplicates: s.duplicates.load(Ordering::Relaxed),
            decode_errors: s.decode_errors.load(Ordering::Relaxed),
            replay_errors: s.replay_errors.load(Ordering::Relaxed),
            resolved_naming_conflicts: s.resolved_naming_conflicts.load(Ordering::Relaxed),
            unresolved_naming_conflicts: s.unresolved_naming_conflicts.load(Ordering::Relaxed),
            resolved_modify_conflicts: s.resolved_modify_conflicts.load(Ordering::Relaxed),
            conflicts_cleared: s.conflicts_cleared.load(Ordering::Relaxed),
            historical_purged: s.historical_purged.load(Ordering::Relaxed),
            state_vector: self.state.snapshot(),
        }
    }
}

fn tag(expected: &Dn) -> Modification {
    Modification::new(ModificationType::Replace, CONFLICT_ATTR, vec![expected.to_string()])
}

fn purge_entry(backend: &dyn Backend, entry: &Entry, schema: &AttributeSchema, watermark: &Csn) -> bool {
    let mut op = Operation::modify(entry.dn.clone(), Vec::new());
    let mut hook = PurgeHook::new(entry.uuid(), watermark, schema);
    let code = backend.apply_operation(&mut op, &mut hook);
    hook.purged && code.is_success()
}
