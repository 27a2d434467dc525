// src/keys/store.rs

//! Shared pool of unclaimed key candidates.
//!
//! Scan workers of every monitored client insert into the same pool; decode
//! streams search it and claim what decrypts for them. The pool sits behind
//! one mutex that is held only for the duration of a single operation, never
//! across a memory read or a decrypt attempt.
//!
//! Ordering: newest candidates sit at the front and `search` walks front to
//! back, so a freshly discovered (likely live) key is offered before stale
//! ones that outlived a re-key.

use super::ledger::{TestLedger, TestState};
use super::material::{Direction, KeyMaterial};
use crate::comms::events::{EventSink, ScanEvent};
use crate::config::types::StoreConfig;
use crate::keygrab_log;
use log::Level;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, TryLockError,
    },
    thread,
    time::{Duration, Instant},
};
use thiserror::Error;

/// Retry step while waiting for the pool lock with a deadline.
const LOCK_RETRY: Duration = Duration::from_millis(1);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClaimError {
    /// Already claimed, purged, or never inserted.
    #[error("stream {stream_id} tried to claim a key (pid {pid}) not present in the unclaimed list")]
    NotPresent { stream_id: u32, pid: u32 },
}

struct KeyCandidate {
    material: Arc<KeyMaterial>,
    ledger:   TestLedger,
}

/// Counters for everything the store accepts, drops or hands out.
#[derive(Debug, Default)]
pub struct StoreStats {
    inserted:   AtomicU64,
    duplicates: AtomicU64,
    zeroed:     AtomicU64,
    claimed:    AtomicU64,
    purged:     AtomicU64,
    evicted:    AtomicU64,
}

/// Point-in-time copy of `StoreStats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub inserted:   u64,
    pub duplicates: u64,
    pub zeroed:     u64,
    pub claimed:    u64,
    pub purged:     u64,
    pub evicted:    u64,
}

impl StoreStats {
    fn bump(counter: &AtomicU64, outcome: &'static str, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
        metrics::counter!("keygrab_candidates_total", "outcome" => outcome).increment(n);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            inserted:   self.inserted.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            zeroed:     self.zeroed.load(Ordering::Relaxed),
            claimed:    self.claimed.load(Ordering::Relaxed),
            purged:     self.purged.load(Ordering::Relaxed),
            evicted:    self.evicted.load(Ordering::Relaxed),
        }
    }
}

pub struct KeyStore {
    pool:  Mutex<VecDeque<KeyCandidate>>,
    cfg:   StoreConfig,
    stats: StoreStats,
    sink:  Option<Arc<dyn EventSink>>,
}

impl KeyStore {
    pub fn new(cfg: StoreConfig) -> Self {
        Self { pool: Mutex::new(VecDeque::new()), cfg, stats: StoreStats::default(), sink: None }
    }

    /// Report candidate discoveries and claim errors to `sink`.
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Adds memory-scanned material unless the same slot was already found.
    pub fn insert(&self, material: KeyMaterial) -> bool {
        self.insert_candidate(material)
    }

    /// Adds material recovered from packet content. It is only offered to
    /// searches that carry a matching hint key.
    pub fn insert_external(&self, material: KeyMaterial) -> bool {
        self.insert_candidate(material.into_traffic())
    }

    fn insert_candidate(&self, material: KeyMaterial) -> bool {
        let mut pool = self.lock();
        if pool.iter().any(|c| c.material.same_discovery(&material)) {
            StoreStats::bump(&self.stats.duplicates, "duplicate", 1);
            return false;
        }

        keygrab_log!(
            Level::Debug,
            "store",
            "pid {} candidate at {:?}: {}",
            material.source_pid(),
            material.found_address(),
            material
        );
        let pid = material.source_pid();
        let address = material.found_address();

        pool.push_front(KeyCandidate { material: Arc::new(material), ledger: TestLedger::default() });
        StoreStats::bump(&self.stats.inserted, "inserted", 1);

        if let Some(cap) = self.cfg.max_candidates {
            let mut evicted = 0;
            while pool.len() > cap {
                pool.pop_back();
                evicted += 1;
            }
            if evicted > 0 {
                StoreStats::bump(&self.stats.evicted, "evicted", evicted);
            }
        }
        drop(pool);

        if let Some(address) = address {
            self.emit(ScanEvent::CandidateFound { pid, address });
        }
        true
    }

    /// Offers the first candidate not yet tested for `(stream_id, direction)`.
    ///
    /// The returned candidate is marked tested for that pair whether or not
    /// the caller goes on to claim it, so every stream tries each candidate
    /// at most once per direction. With a `hint`, only candidates whose key
    /// equals the hint's key qualify, and traffic-sourced candidates become
    /// eligible.
    ///
    /// Gives up and returns `None` if the pool lock is not acquired within
    /// the configured timeout.
    pub fn search(
        &self,
        stream_id: u32,
        direction: Direction,
        hint: Option<&KeyMaterial>,
    ) -> Option<Arc<KeyMaterial>> {
        let Some(mut pool) = self.lock_within(self.cfg.lock_timeout) else {
            keygrab_log!(Level::Debug, "store", "stream {} search timed out on pool lock", stream_id);
            return None;
        };

        let candidate = pool.iter_mut().find(|c| {
            if c.ledger.state(stream_id, direction) == TestState::Tested {
                return false;
            }
            match hint {
                Some(h) => h.key() == c.material.key(),
                None => !c.material.is_from_traffic(),
            }
        })?;
        candidate.ledger.mark(stream_id, direction);
        Some(Arc::clone(&candidate.material))
    }

    /// Permanently removes `candidate` from the pool on behalf of `stream_id`.
    pub fn claim(&self, candidate: &Arc<KeyMaterial>, stream_id: u32) -> Result<(), ClaimError> {
        let mut pool = self.lock();
        let pos = pool.iter().position(|c| Arc::ptr_eq(&c.material, candidate));
        match pos {
            Some(i) => {
                pool.remove(i);
                drop(pool);
                StoreStats::bump(&self.stats.claimed, "claimed", 1);
                Ok(())
            }
            None => {
                drop(pool);
                let err = ClaimError::NotPresent { stream_id, pid: candidate.source_pid() };
                keygrab_log!(Level::Error, "store", "{}", err);
                self.emit(ScanEvent::ClaimError { stream_id, pid: candidate.source_pid() });
                Err(err)
            }
        }
    }

    /// Drops every unclaimed candidate scanned from `pid`. Returns how many.
    pub fn purge(&self, pid: u32) -> usize {
        let mut pool = self.lock();
        let before = pool.len();
        pool.retain(|c| c.material.source_pid() != pid);
        let removed = before - pool.len();
        drop(pool);

        if removed > 0 {
            StoreStats::bump(&self.stats.purged, "purged", removed as u64);
            keygrab_log!(Level::Debug, "store", "purged {} candidate(s) from pid {}", removed, pid);
        }
        removed
    }

    /// Records a key block that was dropped because it was zeroed out.
    pub fn note_zeroed(&self) {
        StoreStats::bump(&self.stats.zeroed, "zeroed", 1);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    fn emit(&self, event: ScanEvent) {
        if let Some(sink) = &self.sink {
            sink.emit(event);
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<KeyCandidate>> {
        self.pool.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_within(&self, timeout: Duration) -> Option<MutexGuard<'_, VecDeque<KeyCandidate>>> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.pool.try_lock() {
                Ok(guard) => return Some(guard),
                Err(TryLockError::Poisoned(poisoned)) => return Some(poisoned.into_inner()),
                Err(TryLockError::WouldBlock) if Instant::now() < deadline => thread::sleep(LOCK_RETRY),
                Err(TryLockError::WouldBlock) => return None,
            }
        }
    }
}

impl Default for KeyStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}
