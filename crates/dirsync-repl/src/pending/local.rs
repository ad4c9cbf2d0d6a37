//! Buffer of local writes between CSN assignment and outbound publication.

use crate::csn::Csn;
use crate::csn_generator::CsnGenerator;
use crate::dn::Dn;
use crate::error::{ReplError, Result};
use crate::message::UpdateMsg;
use crate::operation::{Operation, OperationKind};
use crate::server_state::ServerState;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, trace};

#[derive(Debug)]
struct LocalPending {
    kind: OperationKind,
    dn: Dn,
    msg: Option<UpdateMsg>,
}

#[derive(Debug, Default)]
struct Inner {
    pending: BTreeMap<Csn, LocalPending>,
    last_pushed: Option<Csn>,
    recovering: bool,
    closed: bool,
}

/// Local writes waiting for their CSN turn on the outbound stream.
///
/// A committed change is only published once every older local CSN has
/// either committed or been removed, so peers see local changes in CSN
/// order. The state vector only moves past a local CSN once it is
/// published.
pub struct LocalPendingChanges {
    inner: Mutex<Inner>,
    generator: Arc<CsnGenerator>,
    state: Arc<ServerState>,
    outbound: mpsc::Sender<UpdateMsg>,
    shutdown: watch::Receiver<bool>,
}

impl LocalPendingChanges {
    /// Create a buffer publishing to `outbound`. A publish blocked on a
    /// full stream gives up once `shutdown` turns true.
    pub fn new(
        generator: Arc<CsnGenerator>,
        state: Arc<ServerState>,
        outbound: mpsc::Sender<UpdateMsg>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            generator,
            state,
            outbound,
            shutdown,
        }
    }

    /// Assign a CSN to `op` and hold it until it commits or fails.
    pub async fn put_local_operation(&self, op: &Operation) -> Result<Csn> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(ReplError::Shutdown);
        }
        // Issued under the lock so map order matches issue order.
        let csn = self.generator.next_csn();
        inner.pending.insert(
            csn,
            LocalPending {
                kind: op.kind(),
                dn: op.dn().clone(),
                msg: None,
            },
        );
        trace!(%csn, kind = %op.kind(), dn = %op.dn(), "local operation pending");
        Ok(csn)
    }

    /// Mark `csn` committed with its outbound message, then publish the
    /// committed prefix. Returns how many messages were published.
    pub async fn commit_and_push_committed_changes(&self, csn: Csn, msg: UpdateMsg) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        let record = inner
            .pending
            .get_mut(&csn)
            .ok_or(ReplError::NotPending { csn })?;
        debug!(%csn, kind = %record.kind, dn = %record.dn, "local operation committed");
        record.msg = Some(msg);
        self.push_locked(&mut inner).await
    }

    /// Drop a change whose operation failed, then publish whatever it was blocking.
    pub async fn remove(&self, csn: Csn) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        if inner.pending.remove(&csn).is_none() {
            return Err(ReplError::NotPending { csn });
        }
        self.push_locked(&mut inner).await
    }

    /// Publish the committed prefix.
    pub async fn push_committed_changes(&self) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        self.push_locked(&mut inner).await
    }

    async fn push_locked(&self, inner: &mut Inner) -> Result<usize> {
        let mut pushed = 0;
        loop {
            let Some((&csn, record)) = inner.pending.first_key_value() else {
                break;
            };
            let Some(msg) = record.msg.clone() else {
                break;
            };
            if !inner.recovering {
                self.publish(msg).await?;
            }
            inner.pending.remove(&csn);
            self.state.update(csn);
            inner.last_pushed = Some(csn);
            pushed += 1;
        }
        Ok(pushed)
    }

    /// Send on the outbound stream, waiting for room unless shutting down.
    async fn publish(&self, msg: UpdateMsg) -> Result<()> {
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            biased;
            sent = self.outbound.send(msg) => sent.map_err(|_| ReplError::ChannelClosed {
                msg: "outbound update stream".to_string(),
            }),
            _ = shutdown.wait_for(|stop| *stop) => Err(ReplError::Shutdown),
        }
    }

    /// Number of changes not yet published.
    pub async fn size(&self) -> usize {
        self.inner.lock().await.pending.len()
    }

    /// Newest CSN taken off the buffer.
    pub async fn last_pushed(&self) -> Option<Csn> {
        self.inner.lock().await.last_pushed
    }

    /// Stop publishing on the normal stream while a peer is caught up
    /// through the recovery channel.
    pub async fn set_recovering(&self, recovering: bool) {
        self.inner.lock().await.recovering = recovering;
    }

    /// True while in recovery.
    pub async fn is_recovering(&self) -> bool {
        self.inner.lock().await.recovering
    }

    /// Leave recovery if everything up to the last published CSN has been
    /// replayed up to `csn`. Returns true if recovery ended.
    pub async fn recovery_until(&self, csn: Csn) -> bool {
        let mut inner = self.inner.lock().await;
        if csn.is_newer_than_or_equal_opt(inner.last_pushed.as_ref()) {
            inner.recovering = false;
            true
        } else {
            false
        }
    }

    /// Refuse new CSNs.
    pub async fn close(&self) {
        self.inner.lock().await.closed = true;
    }
}
