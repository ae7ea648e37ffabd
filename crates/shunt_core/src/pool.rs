//! Per-worker backend connection pool and the waiter queue.
//!
//! Each worker keeps, per target, an unordered set of idle connections.
//! A pooled connection is linked to no session; its descriptor carries
//! the pool-stub attachment, so any traffic on it evicts and closes it.
//! The pool-group map is mutex-guarded because administrative broadcasts
//! snapshot stats from other threads; every structural operation still
//! happens on the owning worker.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use shunt_common::error::PoolError;
use shunt_common::types::{SessionId, TargetId};
use shunt_protocol::{ReuseScore, SessionProfile};

use crate::backend::BackendConn;
use crate::target::Target;

/// Pool counters, per target per worker.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PoolStats {
    pub curr_size: usize,
    pub max_size: usize,
    pub times_found: u64,
    pub times_empty: u64,
}

impl PoolStats {
    /// Fold another worker's counters into this one.
    pub fn absorb(&mut self, rhs: &PoolStats) {
        self.curr_size += rhs.curr_size;
        self.max_size += rhs.max_size;
        self.times_found += rhs.times_found;
        self.times_empty += rhs.times_empty;
    }
}

/// One idle pooled connection.
pub struct PoolEntry {
    pub conn: BackendConn,
    pub created: Instant,
    /// Session-neutral state snapshot for reuse scoring.
    pub profile: SessionProfile,
}

/// Idle connections for one target on one worker.
pub struct ConnectionPool {
    target: Arc<Target>,
    entries: Vec<PoolEntry>,
    capacity: usize,
    stats: PoolStats,
}

impl ConnectionPool {
    pub fn new(target: Arc<Target>, capacity: usize) -> Self {
        Self {
            target,
            entries: Vec::new(),
            capacity,
            stats: PoolStats::default(),
        }
    }

    pub fn has_space(&self) -> bool {
        self.entries.len() < self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Recalculate the local capacity from a changed global capacity.
    pub fn set_capacity(&mut self, per_worker: usize) {
        self.capacity = per_worker;
    }

    fn add(&mut self, entry: PoolEntry) {
        self.target.stats.add_pooled();
        self.entries.push(entry);
        self.stats.max_size = self.stats.max_size.max(self.entries.len());
    }

    /// Pick the best-scoring entry for a session profile. `Optimal`
    /// short-circuits the search; ties break arbitrarily.
    fn take_best(&mut self, profile: &SessionProfile) -> Option<(ReuseScore, PoolEntry)> {
        let mut best: Option<(ReuseScore, usize)> = None;
        for (i, entry) in self.entries.iter().enumerate() {
            let score = entry.conn.codec.reuse_score(profile);
            if score == ReuseScore::NotPossible {
                continue;
            }
            match &best {
                Some((s, _)) if *s >= score => {}
                _ => best = Some((score, i)),
            }
            if score == ReuseScore::Optimal {
                break;
            }
        }
        match best {
            Some((score, i)) => {
                self.stats.times_found += 1;
                self.target.stats.remove_pooled();
                Some((score, self.entries.swap_remove(i)))
            }
            None => {
                self.stats.times_empty += 1;
                None
            }
        }
    }

    /// Remove the entry owning the descriptor at `token_index`, if any.
    fn take_by_token(&mut self, token_index: usize) -> Option<PoolEntry> {
        let i = self
            .entries
            .iter()
            .position(|e| e.conn.desc.key.index == token_index)?;
        self.target.stats.remove_pooled();
        Some(self.entries.swap_remove(i))
    }

    /// Collect entries the expiry sweep must close: hung up, older than
    /// the idle age, or in excess of a reduced capacity.
    fn take_expired(&mut self, max_age: Duration, now: Instant) -> Vec<PoolEntry> {
        let mut expired = Vec::new();
        let mut i = 0;
        while i < self.entries.len() {
            let e = &self.entries[i];
            if e.conn.desc.hung_up || now.saturating_duration_since(e.created) > max_age {
                self.target.stats.remove_pooled();
                expired.push(self.entries.swap_remove(i));
            } else {
                i += 1;
            }
        }
        while self.entries.len() > self.capacity {
            self.target.stats.remove_pooled();
            expired.push(self.entries.swap_remove(0));
        }
        expired
    }

    fn drain(&mut self) -> Vec<PoolEntry> {
        for _ in &self.entries {
            self.target.stats.remove_pooled();
        }
        std::mem::take(&mut self.entries)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            curr_size: self.entries.len(),
            ..self.stats
        }
    }
}

/// All of one worker's per-target pools.
pub struct PoolGroup {
    pools: Mutex<HashMap<TargetId, ConnectionPool>>,
    per_worker_capacity: Mutex<usize>,
}

impl PoolGroup {
    pub fn new(per_worker_capacity: usize) -> Self {
        Self {
            pools: Mutex::new(HashMap::new()),
            per_worker_capacity: Mutex::new(per_worker_capacity),
        }
    }

    /// Whether pooling can ever park a connection on this worker.
    pub fn pooling_enabled(&self) -> bool {
        *self.per_worker_capacity.lock() > 0
    }

    /// Try to park an idle connection. Returns the connection back to the
    /// caller when the pool has no space (the caller closes it). The
    /// pool for a target is created lazily on the first park, so an
    /// acquire against an unknown target touches no counters.
    pub fn try_park(&self, entry: PoolEntry) -> Result<(), PoolEntry> {
        let mut pools = self.pools.lock();
        let capacity = *self.per_worker_capacity.lock();
        if capacity == 0 {
            return Err(entry);
        }
        let pool = pools
            .entry(entry.conn.target.id)
            .or_insert_with(|| ConnectionPool::new(entry.conn.target.clone(), capacity));
        if pool.has_space() {
            pool.add(entry);
            Ok(())
        } else {
            Err(entry)
        }
    }

    /// Acquire the best-matching idle connection for a target.
    pub fn acquire(
        &self,
        target: TargetId,
        profile: &SessionProfile,
    ) -> Option<(ReuseScore, PoolEntry)> {
        self.pools.lock().get_mut(&target)?.take_best(profile)
    }

    /// Evict the pooled entry owning `token_index` (traffic on a pooled
    /// descriptor, or a stale slot cleanup).
    pub fn evict_token(&self, target: TargetId, token_index: usize) -> Option<PoolEntry> {
        self.pools.lock().get_mut(&target)?.take_by_token(token_index)
    }

    /// Expiry sweep: runs once per second per worker. Targets that are
    /// down are purged entirely.
    pub fn take_expired(&self, max_age: Duration, now: Instant) -> Vec<PoolEntry> {
        let mut out = Vec::new();
        let mut pools = self.pools.lock();
        for pool in pools.values_mut() {
            if pool.target.is_up() {
                out.extend(pool.take_expired(max_age, now));
            } else {
                out.extend(pool.drain());
            }
        }
        out
    }

    /// Remove and return every pooled connection (shutdown path).
    pub fn take_all(&self) -> Vec<PoolEntry> {
        let mut out = Vec::new();
        let mut pools = self.pools.lock();
        for pool in pools.values_mut() {
            out.extend(pool.drain());
        }
        pools.clear();
        out
    }

    /// Runtime capacity reconfiguration; overage is trimmed by the next
    /// expiry sweep.
    pub fn set_capacity(&self, per_worker: usize) {
        *self.per_worker_capacity.lock() = per_worker;
        for pool in self.pools.lock().values_mut() {
            pool.set_capacity(per_worker);
        }
    }

    /// Stats for one target. Safe to call from another thread.
    pub fn stats(&self, target: TargetId) -> PoolStats {
        self.pools
            .lock()
            .get(&target)
            .map(|p| p.stats())
            .unwrap_or_default()
    }

    /// Total pooled connections on this worker.
    pub fn total_len(&self) -> usize {
        self.pools.lock().values().map(|p| p.len()).sum()
    }
}

/// A session waiting for a connection slot to a target.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub session: SessionId,
    pub target: TargetId,
    pub enqueued: Instant,
}

/// Outcome of giving a waiter its one chance to proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinueOutcome {
    /// The waiter acquired a connection; remove it.
    Success,
    /// Still no slot; stop processing this target's queue.
    Wait,
    /// The waiter failed terminally; remove it and surface the error.
    Fail,
}

/// Per-target FIFO queues of sessions awaiting a connection slot.
#[derive(Default)]
pub struct WaiterMap {
    queues: HashMap<TargetId, VecDeque<Endpoint>>,
}

impl WaiterMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a waiter. A session holds at most one waiter per target;
    /// a duplicate registration is a no-op. Returns whether the waiter
    /// was actually appended.
    pub fn add(&mut self, endpoint: Endpoint, limit: usize) -> Result<bool, PoolError> {
        let queue = self.queues.entry(endpoint.target).or_default();
        if queue.iter().any(|e| e.session == endpoint.session) {
            return Ok(false);
        }
        if limit > 0 && queue.len() >= limit {
            return Err(PoolError::WaitersFull {
                target: endpoint.target,
            });
        }
        queue.push_back(endpoint);
        Ok(true)
    }

    /// Remove a specific session's waiter for a target.
    pub fn remove(&mut self, session: SessionId, target: TargetId) -> bool {
        let Some(queue) = self.queues.get_mut(&target) else {
            return false;
        };
        let before = queue.len();
        queue.retain(|e| e.session != session);
        let removed = queue.len() != before;
        if queue.is_empty() {
            self.queues.remove(&target);
        }
        removed
    }

    /// Pop the oldest waiter for a target.
    pub fn pop_front(&mut self, target: TargetId) -> Option<Endpoint> {
        let queue = self.queues.get_mut(&target)?;
        let ep = queue.pop_front();
        if queue.is_empty() {
            self.queues.remove(&target);
        }
        ep
    }

    /// Put a waiter back at the front (its turn produced `Wait`).
    pub fn push_front(&mut self, endpoint: Endpoint) {
        self.queues
            .entry(endpoint.target)
            .or_default()
            .push_front(endpoint);
    }

    pub fn has_waiters(&self, target: TargetId) -> bool {
        self.queues.contains_key(&target)
    }

    /// Targets that currently have waiters.
    pub fn targets(&self) -> Vec<TargetId> {
        self.queues.keys().copied().collect()
    }

    /// Remove and return waiters older than the multiplex timeout,
    /// oldest first per target.
    pub fn take_timed_out(&mut self, timeout: Duration, now: Instant) -> Vec<Endpoint> {
        let mut out = Vec::new();
        self.queues.retain(|_, queue| {
            while let Some(front) = queue.front() {
                if now.saturating_duration_since(front.enqueued) > timeout {
                    out.push(queue.pop_front().unwrap());
                } else {
                    break;
                }
            }
            !queue.is_empty()
        });
        out
    }

    pub fn total(&self) -> usize {
        self.queues.values().map(|q| q.len()).sum()
    }
}
