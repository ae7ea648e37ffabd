//! Backend target servers and their connection accounting.
//!
//! Admission control is approximate by design: a worker first marks an
//! intent, then re-reads current + intents against the cap. Racing
//! workers can each admit at most one extra connection; the intent is
//! dropped as soon as the single connect attempt resolves, before any
//! retry.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use serde::Serialize;

use shunt_common::types::TargetId;

/// Definition of one backend server, supplied at runtime construction.
#[derive(Debug, Clone)]
pub struct TargetSpec {
    pub name: String,
    pub addr: SocketAddr,
    /// Hard cap on concurrent connections to this target (0 = unlimited).
    pub max_connections: u32,
    /// Per-worker cap on queued waiters for this target (0 = unbounded).
    pub waiter_limit: usize,
}

impl TargetSpec {
    pub fn new(name: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            name: name.into(),
            addr,
            max_connections: 0,
            waiter_limit: 0,
        }
    }

    pub fn max_connections(mut self, cap: u32) -> Self {
        self.max_connections = cap;
        self
    }

    pub fn waiter_limit(mut self, limit: usize) -> Self {
        self.waiter_limit = limit;
        self
    }
}

/// Shared per-target connection counters. Relaxed/acq-rel atomics;
/// admission is best-effort.
#[derive(Debug, Default)]
pub struct TargetStats {
    current: AtomicU32,
    intents: AtomicU32,
    pooled: AtomicU32,
    waiting: AtomicU32,
    total_created: AtomicU64,
}

/// Snapshot of target counters for introspection.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TargetSnapshot {
    pub current: u32,
    pub intents: u32,
    pub pooled: u32,
    pub waiting: u32,
    pub total_created: u64,
}

impl TargetStats {
    pub fn current(&self) -> u32 {
        self.current.load(Ordering::Relaxed)
    }

    pub fn intents(&self) -> u32 {
        self.intents.load(Ordering::Relaxed)
    }

    pub fn pooled(&self) -> u32 {
        self.pooled.load(Ordering::Relaxed)
    }

    pub fn waiting(&self) -> u32 {
        self.waiting.load(Ordering::Relaxed)
    }

    pub fn total_created(&self) -> u64 {
        self.total_created.load(Ordering::Relaxed)
    }

    pub fn add_pooled(&self) {
        self.pooled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn remove_pooled(&self) {
        self.pooled.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn add_waiting(&self) {
        self.waiting.fetch_add(1, Ordering::Relaxed);
    }

    pub fn remove_waiting(&self) {
        self.waiting.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TargetSnapshot {
        TargetSnapshot {
            current: self.current(),
            intents: self.intents(),
            pooled: self.pooled(),
            waiting: self.waiting(),
            total_created: self.total_created(),
        }
    }
}

/// One backend server the router can dispatch statements to.
#[derive(Debug)]
pub struct Target {
    pub id: TargetId,
    pub name: String,
    pub addr: SocketAddr,
    pub max_connections: u32,
    pub waiter_limit: usize,
    up: AtomicBool,
    pub stats: TargetStats,
}

impl Target {
    pub fn new(id: TargetId, spec: TargetSpec) -> Self {
        Self {
            id,
            name: spec.name,
            addr: spec.addr,
            max_connections: spec.max_connections,
            waiter_limit: spec.waiter_limit,
            up: AtomicBool::new(true),
            stats: TargetStats::default(),
        }
    }

    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::Acquire)
    }

    /// Health flag, published by an external monitor.
    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::Release);
    }

    /// Try to reserve a connection slot. `None` means the cap is reached;
    /// the caller should queue a waiter or fail.
    pub fn try_admit(&self) -> Option<IntentGuard<'_>> {
        if self.max_connections == 0 {
            return Some(IntentGuard {
                stats: &self.stats,
                counted: false,
            });
        }
        let current = self.stats.current.load(Ordering::Acquire);
        let intents = self.stats.intents.load(Ordering::Acquire);
        if current + intents >= self.max_connections {
            return None;
        }
        // Mark intent, then re-read. May admit one extra connection per
        // racing worker, never more.
        let intents = self.stats.intents.fetch_add(1, Ordering::AcqRel) + 1;
        if intents + self.stats.current.load(Ordering::Acquire) <= self.max_connections {
            Some(IntentGuard {
                stats: &self.stats,
                counted: true,
            })
        } else {
            self.stats.intents.fetch_sub(1, Ordering::AcqRel);
            None
        }
    }

    /// Record a successfully created connection.
    pub fn add_connection(&self) {
        self.stats.current.fetch_add(1, Ordering::AcqRel);
        self.stats.total_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a closed connection.
    pub fn remove_connection(&self) {
        self.stats.current.fetch_sub(1, Ordering::AcqRel);
    }
}

/// RAII connection intent: decremented when the connect attempt resolves,
/// regardless of outcome.
pub struct IntentGuard<'a> {
    stats: &'a TargetStats,
    counted: bool,
}

impl Drop for IntentGuard<'_> {
    fn drop(&mut self) {
        if self.counted {
            self.stats.intents.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(cap: u32) -> Target {
        Target::new(
            TargetId(0),
            TargetSpec::new("db0", "127.0.0.1:3306".parse().unwrap()).max_connections(cap),
        )
    }

    #[test]
    fn test_unlimited_target_always_admits() {
        let t = target(0);
        for _ in 0..100 {
            assert!(t.try_admit().is_some());
        }
        assert_eq!(t.stats.intents(), 0);
    }

    #[test]
    fn test_admission_respects_cap() {
        let t = target(2);
        t.add_connection();
        t.add_connection();
        assert!(t.try_admit().is_none());
        t.remove_connection();
        assert!(t.try_admit().is_some());
    }

    #[test]
    fn test_intent_released_on_drop() {
        let t = target(1);
        {
            let guard = t.try_admit();
            assert!(guard.is_some());
            assert_eq!(t.stats.intents(), 1);
            // While the intent is held, a second admit is refused.
            assert!(t.try_admit().is_none());
        }
        assert_eq!(t.stats.intents(), 0);
        assert!(t.try_admit().is_some());
    }

    #[test]
    fn test_intent_counts_toward_cap() {
        let t = target(2);
        let _g1 = t.try_admit().unwrap();
        let _g2 = t.try_admit().unwrap();
        assert!(t.try_admit().is_none());
    }

    #[test]
    fn test_up_flag() {
        let t = target(0);
        assert!(t.is_up());
        t.set_up(false);
        assert!(!t.is_up());
    }

    #[test]
    fn test_created_counter_is_cumulative() {
        let t = target(0);
        t.add_connection();
        t.remove_connection();
        t.add_connection();
        assert_eq!(t.stats.total_created(), 2);
        assert_eq!(t.stats.current(), 1);
    }
}
