//! Remote updates waiting for replay, and the dependencies between them.

use crate::backend::EntryView;
use crate::csn::Csn;
use crate::error::{ReplError, Result};
use crate::message::{UpdateBody, UpdateMsg};
use crate::server_state::ServerState;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug)]
struct RemotePending {
    msg: UpdateMsg,
    committed: bool,
    depends_on: Option<Csn>,
}

#[derive(Debug, Default)]
struct Inner {
    pending: BTreeMap<Csn, RemotePending>,
    dependent: BTreeSet<Csn>,
}

/// Remote updates received but not yet replayed.
pub struct RemotePendingChanges {
    inner: Mutex<Inner>,
    state: Arc<ServerState>,
}

impl RemotePendingChanges {
    /// Create an empty buffer advancing `state` as updates commit.
    pub fn new(state: Arc<ServerState>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            state,
        }
    }

    /// Track an incoming update. Returns false for a duplicate: already
    /// pending, or already covered by the state vector.
    pub async fn put_remote_update(&self, msg: UpdateMsg) -> bool {
        if self.state.cover(&msg.csn) {
            return false;
        }
        let mut inner = self.inner.lock().await;
        if inner.pending.contains_key(&msg.csn) {
            return false;
        }
        inner.pending.insert(
            msg.csn,
            RemotePending {
                msg,
                committed: false,
                depends_on: None,
            },
        );
        true
    }

    /// Check whether `msg` must wait for an older uncommitted update. When it
    /// must, it is parked as a dependent and true is returned.
    pub async fn check_dependencies(&self, msg: &UpdateMsg, view: &dyn EntryView) -> bool {
        let mut inner = self.inner.lock().await;
        let blocker = inner
            .pending
            .range(..msg.csn)
            .rev()
            .filter(|(_, older)| !older.committed)
            .find(|(_, older)| depends_on(msg, &older.msg, view))
            .map(|(csn, _)| *csn);
        let Some(blocker) = blocker else {
            return false;
        };
        let Some(record) = inner.pending.get_mut(&msg.csn) else {
            return false;
        };
        record.depends_on = Some(blocker);
        inner.dependent.insert(msg.csn);
        debug!(csn = %msg.csn, depends_on = %blocker, dn = %msg.dn(), "update parked behind older change");
        true
    }

    /// Mark `csn` replayed and advance the state vector over the committed
    /// prefix.
    pub async fn commit(&self, csn: Csn) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let record = inner
            .pending
            .get_mut(&csn)
            .ok_or(ReplError::NotPending { csn })?;
        record.committed = true;
        while let Some(first) = inner.pending.first_entry() {
            if !first.get().committed {
                break;
            }
            let (done, _) = first.remove_entry();
            inner.dependent.remove(&done);
            self.state.update(done);
        }
        Ok(())
    }

    /// Oldest parked update whose dependency has been replayed.
    pub async fn get_next_update(&self) -> Option<UpdateMsg> {
        let mut inner = self.inner.lock().await;
        let ready = inner.dependent.iter().copied().find(|csn| {
            match inner.pending.get(csn).and_then(|r| r.depends_on) {
                Some(dep) => inner.pending.get(&dep).map_or(true, |d| d.committed),
                None => true,
            }
        })?;
        inner.dependent.remove(&ready);
        let record = inner.pending.get_mut(&ready)?;
        record.depends_on = None;
        Some(record.msg.clone())
    }

    /// Number of updates not yet committed out of the buffer.
    pub async fn size(&self) -> usize {
        self.inner.lock().await.pending.len()
    }

    /// Number of parked updates.
    pub async fn dependent_count(&self) -> usize {
        self.inner.lock().await.dependent.len()
    }
}

fn unresolved_target(msg: &UpdateMsg, older: &UpdateMsg, view: &dyn EntryView) -> bool {
    older.entry_uuid == msg.entry_uuid && view.entry_by_uuid(&msg.entry_uuid).is_none()
}

/// True if `msg` cannot be replayed before `older`.
fn depends_on(msg: &UpdateMsg, older: &UpdateMsg, view: &dyn EntryView) -> bool {
    match &msg.body {
        UpdateBody::Add {
            dn, parent_uuid, ..
        } => match &older.body {
            UpdateBody::Add { .. } => parent_uuid
                .as_ref()
                .is_some_and(|p| *p == older.entry_uuid && view.entry_by_uuid(p).is_none()),
            UpdateBody::Delete { dn: deleted } => deleted == dn,
            UpdateBody::ModifyDn { dn: from, .. } => {
                from == dn || older.new_dn().as_ref() == Some(dn)
            }
            UpdateBody::Modify { .. } => false,
        },
        UpdateBody::Delete { dn } => match &older.body {
            UpdateBody::Add { .. } => unresolved_target(msg, older, view),
            UpdateBody::Delete { dn: deleted } => deleted.is_strict_descendant_of(dn),
            UpdateBody::Modify { .. } | UpdateBody::ModifyDn { .. } => false,
        },
        UpdateBody::Modify { .. } => match &older.body {
            UpdateBody::Add { .. } => unresolved_target(msg, older, view),
            UpdateBody::Delete { .. } | UpdateBody::Modify { .. } | UpdateBody::ModifyDn { .. } => {
                false
            }
        },
        UpdateBody::ModifyDn {
            new_superior_uuid, ..
        } => match &older.body {
            UpdateBody::Add { .. } => {
                unresolved_target(msg, older, view)
                    || new_superior_uuid
                        .as_ref()
                        .is_some_and(|s| *s == older.entry_uuid && view.entry_by_uuid(s).is_none())
            }
            UpdateBody::Delete { .. } | UpdateBody::Modify { .. } | UpdateBody::ModifyDn { .. } => {
                false
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::dn::{Dn, Rdn};
    use crate::entry::{Attributes, EntryUuid};

    fn dn(s: &str) -> Dn {
        Dn::parse(s).unwrap()
    }

    fn add(ts: i64, uuid: &str, at: &str, parent: Option<&str>) -> UpdateMsg {
        UpdateMsg {
            csn: Csn::new(ts, 0, 2),
            entry_uuid: EntryUuid::new(uuid),
            body: UpdateBody::Add {
                dn: dn(at),
                parent_uuid: parent.map(EntryUuid::new),
                attributes: Attributes::new(),
            },
        }
    }

    fn delete(ts: i64, uuid: &str, at: &str) -> UpdateMsg {
        UpdateMsg {
            csn: Csn::new(ts, 0, 2),
            entry_uuid: EntryUuid::new(uuid),
            body: UpdateBody::Delete { dn: dn(at) },
        }
    }

    fn setup() -> (RemotePendingChanges, Arc<ServerState>, InMemoryBackend) {
        let state = Arc::new(ServerState::new());
        (
            RemotePendingChanges::new(state.clone()),
            state,
            InMemoryBackend::new(dn("dc=e")),
        )
    }

    mod dedup {
        use super::*;

        #[tokio::test]
        async fn test_duplicate_and_covered_updates_rejected() {
            let (buf, state, _) = setup();
            let m = delete(10, "a", "cn=a,dc=e");
            assert!(buf.put_remote_update(m.clone()).await);
            assert!(!buf.put_remote_update(m.clone()).await);
            buf.commit(m.csn).await.unwrap();
            assert!(state.cover(&m.csn));
            assert!(!buf.put_remote_update(m).await);
        }
    }

    mod dependencies {
        use super::*;

        #[tokio::test]
        async fn test_child_add_waits_for_parent_add() {
            let (buf, _, backend) = setup();
            let parent = add(10, "p", "ou=p,dc=e", None);
            let child = add(11, "c", "cn=c,ou=p,dc=e", Some("p"));
            buf.put_remote_update(parent.clone()).await;
            buf.put_remote_update(child.clone()).await;
            assert!(!buf.check_dependencies(&parent, &backend).await);
            assert!(buf.check_dependencies(&child, &backend).await);
            assert_eq!(buf.dependent_count().await, 1);
            assert!(buf.get_next_update().await.is_none());

            buf.commit(parent.csn).await.unwrap();
            assert_eq!(buf.get_next_update().await, Some(child.clone()));
            assert_eq!(buf.dependent_count().await, 0);
            buf.commit(child.csn).await.unwrap();
            assert_eq!(buf.size().await, 0);
        }

        #[tokio::test]
        async fn test_readd_waits_for_delete_of_same_dn() {
            let (buf, _, backend) = setup();
            let del = delete(10, "a", "cn=a,dc=e");
            let re = add(11, "b", "cn=a,dc=e", None);
            buf.put_remote_update(del).await;
            buf.put_remote_update(re.clone()).await;
            assert!(buf.check_dependencies(&re, &backend).await);
        }

        #[tokio::test]
        async fn test_delete_waits_for_descendant_delete() {
            let (buf, _, backend) = setup();
            let leaf = delete(10, "c", "cn=c,ou=p,dc=e");
            let parent = delete(11, "p", "ou=p,dc=e");
            buf.put_remote_update(leaf).await;
            buf.put_remote_update(parent.clone()).await;
            assert!(buf.check_dependencies(&parent, &backend).await);
        }

        #[tokio::test]
        async fn test_rename_waits_for_new_superior_add() {
            let (buf, _, backend) = setup();
            let sup = add(10, "s", "ou=s,dc=e", None);
            let mv = UpdateMsg {
                csn: Csn::new(11, 0, 2),
                entry_uuid: EntryUuid::new("x"),
                body: UpdateBody::ModifyDn {
                    dn: dn("cn=x,dc=e"),
                    new_rdn: Rdn::new("cn", "x"),
                    delete_old_rdn: true,
                    new_superior: Some(dn("ou=s,dc=e")),
                    new_superior_uuid: Some(EntryUuid::new("s")),
                },
            };
            buf.put_remote_update(sup).await;
            buf.put_remote_update(mv.clone()).await;
            assert!(buf.check_dependencies(&mv, &backend).await);
        }

        #[tokio::test]
        async fn test_committed_older_change_is_no_dependency() {
            let (buf, _, backend) = setup();
            let first = delete(10, "a", "cn=a,dc=e");
            let second = delete(11, "b", "cn=b,dc=e");
            let readd = add(12, "c", "cn=a,dc=e", None);
            buf.put_remote_update(first.clone()).await;
            buf.put_remote_update(second).await;
            buf.put_remote_update(readd.clone()).await;
            buf.commit(first.csn).await.unwrap();
            assert!(!buf.check_dependencies(&readd, &backend).await);
        }
    }

    #[tokio::test]
    async fn test_commit_unknown_csn() {
        let (buf, _, _) = setup();
        let err = buf.commit(Csn::new(1, 0, 1)).await.unwrap_err();
        assert!(matches!(err, ReplError::NotPending { .. }));
    }

    #[tokio::test]
    async fn test_state_advances_over_committed_prefix_only() {
        let (buf, state, _) = setup();
        let a = delete(10, "a", "cn=a,dc=e");
        let b = delete(11, "b", "cn=b,dc=e");
        buf.put_remote_update(a.clone()).await;
        buf.put_remote_update(b.clone()).await;
        buf.commit(b.csn).await.unwrap();
        assert!(!state.cover(&b.csn));
        buf.commit(a.csn).await.unwrap();
        assert!(state.cover(&b.csn));
    }
}
