//! Thread-safe CSN issuance for one replica.

use crate::csn::{Csn, ReplicaId};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of wall-clock milliseconds.
pub trait TimeSource: Send + Sync {
    /// Current time in milliseconds since the epoch.
    fn now_millis(&self) -> i64;
}

/// The system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl TimeSource for SystemClock {
    fn now_millis(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

#[derive(Debug, Default)]
struct GeneratorState {
    last_time: i64,
    seqnum: u32,
}

/// Issues strictly increasing CSNs for a replica.
pub struct CsnGenerator {
    replica_id: ReplicaId,
    state: Mutex<GeneratorState>,
    clock: Arc<dyn TimeSource>,
}

impl CsnGenerator {
    /// Create a generator driven by the system clock.
    pub fn new(replica_id: ReplicaId) -> Self {
        Self::with_clock(replica_id, Arc::new(SystemClock))
    }

    /// Create a generator driven by the given time source.
    pub fn with_clock(replica_id: ReplicaId, clock: Arc<dyn TimeSource>) -> Self {
        Self {
            replica_id,
            state: Mutex::new(GeneratorState::default()),
            clock,
        }
    }

    /// Create a generator that will never issue a CSN older than any of `seen`.
    pub fn seeded<'a>(
        replica_id: ReplicaId,
        clock: Arc<dyn TimeSource>,
        seen: impl IntoIterator<Item = &'a Csn>,
    ) -> Self {
        let gen = Self::with_clock(replica_id, clock);
        if let Some(max) = seen.into_iter().max() {
            let mut state = gen.lock();
            state.last_time = max.timestamp();
            state.seqnum = max.seqnum();
        }
        gen
    }

    /// The replica this generator issues CSNs for.
    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    /// Issue a CSN strictly newer than every CSN issued before.
    pub fn next_csn(&self) -> Csn {
        let now = self.clock.now_millis();
        let mut state = self.lock();
        if now > state.last_time {
            state.last_time = now;
            state.seqnum = 0;
        } else {
            match state.seqnum.checked_add(1) {
                Some(next) => state.seqnum = next,
                None => {
                    state.last_time += 1;
                    state.seqnum = 0;
                }
            }
        }
        Csn::new(state.last_time, state.seqnum, self.replica_id)
    }

    /// Move the clock past a CSN observed from another replica.
    pub fn adjust(&self, seen: &Csn) {
        let mut state = self.lock();
        if seen.timestamp() >= state.last_time {
            state.last_time = seen.timestamp().saturating_add(1);
            state.seqnum = 0;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GeneratorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for CsnGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CsnGenerator")
            .field("replica_id", &self.replica_id)
            .finish_non_exhaustive()
    }
}

/// A manually driven clock for tests and simulations.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: std::sync::atomic::AtomicI64,
}

impl ManualClock {
    /// Create a clock reading `now`.
    pub fn new(now: i64) -> Self {
        Self {
            now: std::sync::atomic::AtomicI64::new(now),
        }
    }

    /// Set the current time.
    pub fn set(&self, now: i64) {
        self.now.store(now, std::sync::atomic::Ordering::SeqCst);
    }

    /// Advance the current time.
    pub fn advance(&self, millis: i64) {
        self.now
            .fetch_add(millis, std::sync::atomic::Ordering::SeqCst);
    }
}

impl TimeSource for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_same_millisecond_increments_seqnum() {
        let clock = Arc::new(ManualClock::new(1000));
        let gen = CsnGenerator::with_clock(1, clock);
        let a = gen.next_csn();
        let b = gen.next_csn();
        assert_eq!(a, Csn::new(1000, 0, 1));
        assert_eq!(b, Csn::new(1000, 1, 1));
    }

    #[test]
    fn test_seqnum_resets_when_clock_advances() {
        let clock = Arc::new(ManualClock::new(1000));
        let gen = CsnGenerator::with_clock(1, clock.clone());
        gen.next_csn();
        gen.next_csn();
        clock.advance(5);
        assert_eq!(gen.next_csn(), Csn::new(1005, 0, 1));
    }

    #[test]
    fn test_clock_going_backwards_stays_monotonic() {
        let clock = Arc::new(ManualClock::new(1000));
        let gen = CsnGenerator::with_clock(1, clock.clone());
        let a = gen.next_csn();
        clock.set(900);
        let b = gen.next_csn();
        assert!(b.is_newer_than(&a));
    }

    #[test]
    fn test_adjust_moves_past_seen() {
        let clock = Arc::new(ManualClock::new(1000));
        let gen = CsnGenerator::with_clock(1, clock);
        let seen = Csn::new(5000, 42, 7);
        gen.adjust(&seen);
        let next = gen.next_csn();
        assert!(next.is_newer_than(&seen));
        assert!(next.timestamp() >= 5001);
    }

    #[test]
    fn test_adjust_with_older_csn_is_noop() {
        let clock = Arc::new(ManualClock::new(1000));
        let gen = CsnGenerator::with_clock(1, clock);
        let a = gen.next_csn();
        gen.adjust(&Csn::new(10, 0, 2));
        assert_eq!(gen.next_csn(), Csn::new(a.timestamp(), 1, 1));
    }

    #[test]
    fn test_seeded_never_goes_back() {
        let clock = Arc::new(ManualClock::new(10));
        let seen = [Csn::new(500, 3, 2), Csn::new(400, 9, 1)];
        let gen = CsnGenerator::seeded(1, clock, seen.iter());
        let next = gen.next_csn();
        assert!(next.is_newer_than(&seen[0]));
    }

    #[test]
    fn test_concurrent_callers_get_unique_csns() {
        let gen = Arc::new(CsnGenerator::new(3));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gen = gen.clone();
                std::thread::spawn(move || (0..500).map(|_| gen.next_csn()).collect::<Vec<_>>())
            })
            .collect();
        let mut all = HashSet::new();
        for h in handles {
            for csn in h.join().unwrap() {
                assert!(all.insert(csn));
            }
        }
        assert_eq!(all.len(), 4000);
    }
}
