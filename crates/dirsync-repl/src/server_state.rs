//! Replica state vector: the newest CSN seen from each replica.
//!
//! [`StateVector`] is the plain value (serializable, comparable) and
//! [`ServerState`] is the shared, internally synchronized holder a domain
//! updates as changes commit. Entries only ever move forward.

use crate::csn::{Csn, ReplicaId};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Per-replica maximum CSN.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVector {
    csns: BTreeMap<ReplicaId, Csn>,
}

impl StateVector {
    /// Create an empty state vector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `csn`. Returns true if it advanced the vector.
    pub fn update(&mut self, csn: Csn) -> bool {
        match self.csns.get(&csn.replica_id()) {
            Some(current) if !csn.is_newer_than(current) => false,
            _ => {
                self.csns.insert(csn.replica_id(), csn);
                true
            }
        }
    }

    /// Newest CSN seen from `replica_id`.
    pub fn get(&self, replica_id: ReplicaId) -> Option<Csn> {
        self.csns.get(&replica_id).copied()
    }

    /// True if `csn` is already reflected in this vector.
    pub fn cover(&self, csn: &Csn) -> bool {
        self.csns
            .get(&csn.replica_id())
            .is_some_and(|max| csn.is_older_than_or_equal(max))
    }

    /// True if every CSN in `other` is covered by this vector.
    pub fn covers(&self, other: &StateVector) -> bool {
        other.csns.values().all(|csn| self.cover(csn))
    }

    /// Point-wise maximum with `other`. Returns true if anything advanced.
    pub fn merge(&mut self, other: &StateVector) -> bool {
        let mut changed = false;
        for csn in other.csns.values() {
            changed |= self.update(*csn);
        }
        changed
    }

    /// The newest CSN across all replicas.
    pub fn max_csn(&self) -> Option<Csn> {
        self.csns.values().max().copied()
    }

    /// The oldest of the per-replica maxima; nothing older can still be in flight
    /// from a replica that has since issued a newer change.
    pub fn oldest_max_csn(&self) -> Option<Csn> {
        self.csns.values().min().copied()
    }

    /// Iterate `(replica, csn)` pairs in replica order.
    pub fn iter(&self) -> impl Iterator<Item = (ReplicaId, Csn)> + '_ {
        self.csns.iter().map(|(r, c)| (*r, *c))
    }

    /// All CSNs in the vector.
    pub fn csns(&self) -> impl Iterator<Item = &Csn> {
        self.csns.values()
    }

    /// Number of replicas tracked.
    pub fn len(&self) -> usize {
        self.csns.len()
    }

    /// True if no replica is tracked.
    pub fn is_empty(&self) -> bool {
        self.csns.is_empty()
    }

    /// Serialize to bincode bytes (for persistence).
    pub fn to_bytes(&self) -> std::result::Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from bincode bytes.
    pub fn from_bytes(data: &[u8]) -> std::result::Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

#[derive(Debug, Default)]
struct Inner {
    vector: StateVector,
    dirty: bool,
}

/// Shared state vector of one replication domain.
#[derive(Debug, Default)]
pub struct ServerState {
    inner: Mutex<Inner>,
}

impl ServerState {
    /// Create an empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a state starting from `vector`.
    pub fn from_vector(vector: StateVector) -> Self {
        Self {
            inner: Mutex::new(Inner {
                vector,
                dirty: false,
            }),
        }
    }

    /// Record a committed CSN. Returns true if the state advanced.
    pub fn update(&self, csn: Csn) -> bool {
        let mut inner = self.lock();
        let advanced = inner.vector.update(csn);
        inner.dirty |= advanced;
        advanced
    }

    /// Merge another replica's view into this one.
    pub fn merge(&self, other: &StateVector) -> bool {
        let mut inner = self.lock();
        let advanced = inner.vector.merge(other);
        inner.dirty |= advanced;
        advanced
    }

    /// True if `csn` has already been seen.
    pub fn cover(&self, csn: &Csn) -> bool {
        self.lock().vector.cover(csn)
    }

    /// Newest CSN seen from `replica_id`.
    pub fn max_csn(&self, replica_id: ReplicaId) -> Option<Csn> {
        self.lock().vector.get(replica_id)
    }

    /// A copy of the current vector.
    pub fn snapshot(&self) -> StateVector {
        self.lock().vector.clone()
    }

    /// True if the state changed since it was last saved.
    pub fn is_dirty(&self) -> bool {
        self.lock().dirty
    }

    /// Persist the state if it changed. Returns true if a write happened.
    pub fn flush(&self, path: &Path) -> Result<bool> {
        let bytes = {
            let mut inner = self.lock();
            if !inner.dirty {
                return Ok(false);
            }
            inner.dirty = false;
            inner.vector.to_bytes()?
        };
        if let Err(e) = write_atomic(path, &bytes) {
            self.lock().dirty = true;
            return Err(e);
        }
        Ok(true)
    }

    /// Persist the state unconditionally.
    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = {
            let mut inner = self.lock();
            inner.dirty = false;
            inner.vector.to_bytes()?
        };
        write_atomic(path, &bytes)
    }

    /// Load a previously saved state. A missing file yields an empty state.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read(path) {
            Ok(bytes) => Ok(Self::from_vector(StateVector::from_bytes(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
