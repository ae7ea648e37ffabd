//! The cross-worker coordination plane: runtime construction, task
//! broadcast, load sampling, session migration and graceful shutdown.

use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::unbounded;
use dashmap::DashMap;
use mio::{Poll, Waker};
use parking_lot::Mutex;
use tracing::{info, warn};

use shunt_common::config::{ProxyConfig, SessionLimits};
use shunt_common::error::{ShuntError, ShuntResult};
use shunt_common::semaphore::Semaphore;
use shunt_common::shutdown::ShutdownSignal;
use shunt_common::types::{SessionId, TargetId, WorkerId};
use shunt_protocol::{ProtocolModule, RouterModule, VersionTag};

use crate::cache::{CacheEntrySnapshot, CacheStats};
use crate::descriptor::WAKER_TOKEN;
use crate::listener::ListenerSet;
use crate::pool::{PoolGroup, PoolStats};
use crate::stats::{AggregateStats, LoadInterval, MemoryUsage, WorkerInfo};
use crate::target::{Target, TargetSpec};
use crate::worker::{Worker, WorkerHandle};

/// How accepted clients are assigned to workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignPolicy {
    RoundRobin,
    LeastLoaded,
    /// Every session lands on one worker. Useful for tests and drains.
    Pinned(usize),
}

/// Ring of recent load samples per worker, fed by the sampling timer.
const LOAD_HISTORY_SAMPLES: usize = 10;

/// State shared by the coordinator and every worker.
pub struct RuntimeInner {
    pub config: ProxyConfig,
    pub limits: SessionLimits,
    pub protocol: Arc<dyn ProtocolModule>,
    pub router: Arc<dyn RouterModule>,
    pub targets: Vec<Arc<Target>>,
    pub workers: Vec<WorkerHandle>,
    pub listeners: ListenerSet,
    /// Which worker owns each live session; maintained across create,
    /// migrate and destroy.
    pub locator: DashMap<SessionId, WorkerId>,
    pub shutdown: ShutdownSignal,
    /// Migrations posted but not yet adopted.
    pub moves_in_flight: AtomicUsize,
    next_session_id: AtomicU64,
    next_assign: AtomicUsize,
    assign: Mutex<AssignPolicy>,
    load_history: Mutex<Vec<VecDeque<u32>>>,
}

impl RuntimeInner {
    pub fn target(&self, id: TargetId) -> Option<Arc<Target>> {
        self.targets.get(id.0 as usize).cloned()
    }

    pub fn allocate_session_id(&self) -> SessionId {
        SessionId(self.next_session_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Pick the worker for a new client per the assignment policy.
    pub fn pick_worker(&self) -> WorkerId {
        match *self.assign.lock() {
            AssignPolicy::RoundRobin => {
                let i = self.next_assign.fetch_add(1, Ordering::Relaxed);
                WorkerId(i % self.workers.len())
            }
            AssignPolicy::LeastLoaded => self
                .workers
                .iter()
                .min_by_key(|w| {
                    (
                        w.load.load(LoadInterval::OneSecond),
                        w.session_count.load(Ordering::Relaxed),
                    )
                })
                .map(|w| w.id)
                .unwrap_or(WorkerId(0)),
            AssignPolicy::Pinned(i) => WorkerId(i.min(self.workers.len() - 1)),
        }
    }

    pub fn set_assign_policy(&self, policy: AssignPolicy) {
        *self.assign.lock() = policy;
    }

    /// The sampling timer on worker 0: append each worker's load gauge
    /// to its ring and trigger a migration when the spread exceeds the
    /// threshold.
    pub fn collect_and_balance(self: &Arc<Self>) {
        let mut history = self.load_history.lock();
        if history.len() != self.workers.len() {
            *history = vec![VecDeque::with_capacity(LOAD_HISTORY_SAMPLES); self.workers.len()];
        }
        let mut averaged = Vec::with_capacity(self.workers.len());
        for (i, handle) in self.workers.iter().enumerate() {
            let ring = &mut history[i];
            if ring.len() == LOAD_HISTORY_SAMPLES {
                ring.pop_front();
            }
            ring.push_back(handle.load.load(LoadInterval::OneSecond));
            let avg = ring.iter().sum::<u32>() / ring.len() as u32;
            averaged.push(avg);
        }
        drop(history);

        let sessions: Vec<usize> = self
            .workers
            .iter()
            .map(|w| w.session_count.load(Ordering::Relaxed))
            .collect();
        if let Some((from, to, n)) =
            balance_decision(&averaged, &sessions, self.config.rebalance_threshold)
        {
            info!(
                from,
                to,
                sessions = n,
                "load spread exceeds rebalance threshold, migrating"
            );
            let to = WorkerId(to);
            self.workers[from].post_fn(move |w| w.note_rebalance(to, n));
        }
    }
}

/// Pure rebalance decision: busiest and quietest worker by averaged
/// load, and how many sessions to move.
pub fn balance_decision(
    loads: &[u32],
    session_counts: &[usize],
    threshold: u32,
) -> Option<(usize, usize, usize)> {
    if threshold == 0 || loads.len() < 2 {
        return None;
    }
    let (from, &max_load) = loads.iter().enumerate().max_by_key(|(_, &l)| l)?;
    let (to, &min_load) = loads.iter().enumerate().min_by_key(|(_, &l)| l)?;
    let diff = max_load.saturating_sub(min_load);
    if diff <= threshold || from == to {
        return None;
    }
    // Move a share of the busy worker's sessions proportional to the
    // load difference; diff of 100 moves half of them.
    let n = (session_counts[from] * diff as usize / 200).max(1);
    Some((from, to, n))
}

/// The routing engine: a fixed pool of workers, a shared accept path
/// and the coordination plane. Construct with [`Runtime::builder`].
pub struct Runtime {
    inner: Arc<RuntimeInner>,
    joins: Mutex<Vec<JoinHandle<()>>>,
}

impl Runtime {
    pub fn builder(config: ProxyConfig) -> RuntimeBuilder {
        RuntimeBuilder {
            config,
            limits: SessionLimits::default(),
            protocol: None,
            router: None,
            targets: Vec::new(),
            listen: Vec::new(),
            assign: AssignPolicy::RoundRobin,
        }
    }

    pub fn inner(&self) -> &Arc<RuntimeInner> {
        &self.inner
    }

    pub fn worker_count(&self) -> usize {
        self.inner.workers.len()
    }

    /// Addresses the listener set actually bound.
    pub fn listen_addrs(&self) -> Vec<SocketAddr> {
        self.inner.listeners.bound_addrs()
    }

    pub fn target(&self, id: TargetId) -> Option<Arc<Target>> {
        self.inner.target(id)
    }

    /// Live sessions across all workers.
    pub fn session_count(&self) -> usize {
        self.inner.locator.len()
    }

    // ── Broadcast plane ─────────────────────────────────────────────────

    /// Fire-and-forget broadcast: the task is shared and disposed when
    /// the last worker has executed it.
    pub fn broadcast<F>(&self, f: F) -> usize
    where
        F: Fn(&mut Worker) + Send + Sync + 'static,
    {
        let task: Arc<dyn Fn(&mut Worker) + Send + Sync> = Arc::new(f);
        self.inner
            .workers
            .iter()
            .filter(|w| w.post_shared(task.clone()))
            .count()
    }

    /// Broadcast and wait for every worker to finish executing.
    pub fn execute_concurrently<F>(&self, f: F) -> usize
    where
        F: Fn(&mut Worker) + Send + Sync + 'static,
    {
        let sem = Semaphore::new();
        let n = {
            let sem = sem.clone();
            self.broadcast(move |w| {
                f(w);
                sem.post();
            })
        };
        sem.wait_n(n)
    }

    /// Execute on worker 0, wait, then worker 1, and so on. Used when
    /// the per-worker results are too large to hold concurrently.
    pub fn execute_serially<F>(&self, f: F) -> usize
    where
        F: Fn(&mut Worker) + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let sem = Semaphore::new();
        let mut n = 0;
        for handle in &self.inner.workers {
            let f = f.clone();
            let sem_child = sem.clone();
            if handle.post_fn(move |w| {
                f(w);
                sem_child.post();
            }) {
                sem.wait();
                n += 1;
            }
        }
        n
    }

    /// Post a closure to one worker.
    pub fn post_to<F>(&self, worker: WorkerId, f: F) -> bool
    where
        F: FnOnce(&mut Worker) + Send + 'static,
    {
        match self.inner.workers.get(worker.0) {
            Some(handle) => handle.post_fn(f),
            None => false,
        }
    }

    /// Liveness probe: every worker executes a no-op within `timeout`.
    pub fn ping_workers(&self, timeout: Duration) -> bool {
        let sem = Semaphore::new();
        let n = {
            let sem = sem.clone();
            self.broadcast(move |_| sem.post())
        };
        let deadline = Instant::now() + timeout;
        for _ in 0..n {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !sem.wait_for(remaining) {
                return false;
            }
        }
        n == self.worker_count()
    }

    // ── Admin operations ────────────────────────────────────────────────

    /// Kill one session wherever it lives.
    pub fn kill_session(&self, session: SessionId) -> bool {
        let Some(worker) = self.inner.locator.get(&session).map(|w| *w) else {
            return false;
        };
        self.post_to(worker, move |w| {
            w.kill_session_local(session, "killed by administrator")
        })
    }

    /// Direct migration directive: move up to `n` movable sessions.
    pub fn migrate_sessions(&self, from: WorkerId, to: WorkerId, n: usize) -> bool {
        if from == to || self.inner.workers.get(to.0).is_none() {
            return false;
        }
        self.post_to(from, move |w| w.note_rebalance(to, n))
    }

    /// Migrations posted but not yet adopted by their new owner.
    pub fn moves_in_flight(&self) -> usize {
        self.inner.moves_in_flight.load(Ordering::Acquire)
    }

    /// Replace the parser version tag on every worker; stale cache
    /// entries are evicted lazily on their next lookup.
    pub fn set_parser_version(&self, version: VersionTag) {
        self.execute_concurrently(move |w| w.set_parser_version(version));
    }

    /// Reconfigure the global statement-cache budget.
    pub fn set_cache_max_bytes(&self, bytes: u64) {
        let per_worker = bytes / self.worker_count() as u64;
        self.execute_concurrently(move |w| w.core.cache.set_budget(per_worker));
    }

    /// Reconfigure the global pool capacity; overage is trimmed by the
    /// expiry sweep.
    pub fn set_pool_capacity(&self, per_target: usize) {
        let per_worker = per_target / self.worker_count();
        for handle in &self.inner.workers {
            handle.pools.set_capacity(per_worker);
        }
    }

    pub fn set_assign_policy(&self, policy: AssignPolicy) {
        self.inner.set_assign_policy(policy);
    }

    // ── Introspection ───────────────────────────────────────────────────

    /// Per-worker info blocks, collected serially to bound peak memory.
    pub fn worker_infos(&self) -> Vec<WorkerInfo> {
        let results: Arc<Mutex<BTreeMap<usize, WorkerInfo>>> = Arc::new(Mutex::new(BTreeMap::new()));
        let sink = results.clone();
        self.execute_serially(move |w| {
            sink.lock().insert(w.core.id.0, w.info());
        });
        let map = std::mem::take(&mut *results.lock());
        map.into_values().collect()
    }

    pub fn aggregate_stats(&self) -> AggregateStats {
        AggregateStats::fold(&self.worker_infos())
    }

    /// Per-worker statement-cache counters.
    pub fn cache_stats(&self) -> Vec<CacheStats> {
        let results: Arc<Mutex<BTreeMap<usize, CacheStats>>> = Arc::new(Mutex::new(BTreeMap::new()));
        let sink = results.clone();
        self.execute_serially(move |w| {
            sink.lock().insert(w.core.id.0, w.core.cache.stats());
        });
        let map = std::mem::take(&mut *results.lock());
        map.into_values().collect()
    }

    /// Every cached entry on every worker, serially.
    pub fn cache_state(&self) -> Vec<Vec<CacheEntrySnapshot>> {
        let results: Arc<Mutex<BTreeMap<usize, Vec<CacheEntrySnapshot>>>> =
            Arc::new(Mutex::new(BTreeMap::new()));
        let sink = results.clone();
        self.execute_serially(move |w| {
            sink.lock().insert(w.core.id.0, w.core.cache.snapshot());
        });
        let map = std::mem::take(&mut *results.lock());
        map.into_values().collect()
    }

    /// Pool counters for one target summed across workers. The pool
    /// group is mutex-guarded precisely so this may read cross-thread.
    pub fn pool_stats(&self, target: TargetId) -> PoolStats {
        let mut total = PoolStats::default();
        for handle in &self.inner.workers {
            total.absorb(&handle.pools.stats(target));
        }
        total
    }

    pub fn memory_usage(&self) -> MemoryUsage {
        let mut total = MemoryUsage::default();
        for info in self.worker_infos() {
            total.absorb(&info.memory);
        }
        total
    }

    // ── Shutdown ────────────────────────────────────────────────────────

    /// Begin the graceful drain: every worker runs a 100 ms probe that
    /// closes pool entries, kills remaining sessions and stops its loop
    /// once its registry is empty.
    pub fn start_shutdown(&self) {
        info!("shutdown requested");
        self.inner.shutdown.request();
        self.broadcast(|w| w.install_shutdown_probe());
    }

    /// True once every worker reports FINISHED.
    pub fn shutdown_complete(&self) -> bool {
        self.inner.workers.iter().all(|w| w.is_finished())
    }

    /// Join every worker thread. No timeout here; operators wrap one
    /// around the process externally.
    pub fn await_finished(&self) {
        let joins = std::mem::take(&mut *self.joins.lock());
        for join in joins {
            if join.join().is_err() {
                warn!("worker thread panicked during shutdown");
            }
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if !self.shutdown_complete() {
            self.start_shutdown();
        }
        self.await_finished();
    }
}

/// Builder for [`Runtime`].
pub struct RuntimeBuilder {
    config: ProxyConfig,
    limits: SessionLimits,
    protocol: Option<Arc<dyn ProtocolModule>>,
    router: Option<Arc<dyn RouterModule>>,
    targets: Vec<TargetSpec>,
    listen: Vec<SocketAddr>,
    assign: AssignPolicy,
}

impl RuntimeBuilder {
    pub fn limits(mut self, limits: SessionLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn protocol(mut self, protocol: Arc<dyn ProtocolModule>) -> Self {
        self.protocol = Some(protocol);
        self
    }

    pub fn router(mut self, router: Arc<dyn RouterModule>) -> Self {
        self.router = Some(router);
        self
    }

    /// Register a backend target; ids are handed out densely from 0.
    pub fn target(mut self, spec: TargetSpec) -> Self {
        self.targets.push(spec);
        self
    }

    pub fn listen(mut self, addr: SocketAddr) -> Self {
        self.listen.push(addr);
        self
    }

    pub fn assign(mut self, policy: AssignPolicy) -> Self {
        self.assign = policy;
        self
    }

    /// Validate, bind listeners, spawn the workers and return the
    /// running engine.
    pub fn start(self) -> ShuntResult<Runtime> {
        self.config.validate()?;
        let protocol = self
            .protocol
            .ok_or_else(|| ShuntError::Internal("protocol module is required".into()))?;
        let router = self
            .router
            .ok_or_else(|| ShuntError::Internal("router module is required".into()))?;

        let listeners = ListenerSet::new()?;
        for addr in &self.listen {
            listeners.add(*addr)?;
        }

        let targets: Vec<Arc<Target>> = self
            .targets
            .into_iter()
            .enumerate()
            .map(|(i, spec)| Arc::new(Target::new(TargetId(i as u32), spec)))
            .collect();

        let n = self.config.worker_count;
        let per_worker_pool = self.config.pool_capacity_per_worker();
        let mut polls = Vec::with_capacity(n);
        let mut inboxes = Vec::with_capacity(n);
        let mut handles = Vec::with_capacity(n);
        for i in 0..n {
            let poll = Poll::new()?;
            let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
            let (tx, rx) = unbounded();
            let pools = Arc::new(PoolGroup::new(per_worker_pool));
            handles.push(WorkerHandle::new(WorkerId(i), tx, waker, pools));
            polls.push(Some(poll));
            inboxes.push(Some(rx));
        }

        let inner = Arc::new(RuntimeInner {
            config: self.config,
            limits: self.limits,
            protocol,
            router,
            targets,
            workers: handles,
            listeners,
            locator: DashMap::new(),
            shutdown: ShutdownSignal::new(),
            moves_in_flight: AtomicUsize::new(0),
            next_session_id: AtomicU64::new(1),
            next_assign: AtomicUsize::new(0),
            assign: Mutex::new(self.assign),
            load_history: Mutex::new(Vec::new()),
        });

        let mut joins = Vec::with_capacity(n);
        for i in 0..n {
            let worker = Worker::new(
                WorkerId(i),
                polls[i].take().expect("poll built above"),
                inboxes[i].take().expect("inbox built above"),
                inner.workers[i].pools.clone(),
                inner.clone(),
            );
            let join = std::thread::Builder::new()
                .name(format!("shunt-worker-{i}"))
                .spawn(move || worker.run())
                .map_err(ShuntError::Io)?;
            joins.push(join);
        }

        info!(workers = n, "runtime started");
        Ok(Runtime {
            inner,
            joins: Mutex::new(joins),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_balance_decision_below_threshold() {
        assert_eq!(balance_decision(&[30, 20], &[5, 5], 20), None);
    }

    #[test]
    fn test_balance_decision_moves_proportional_share() {
        // diff = 60, busiest has 10 sessions: move 10 * 60 / 200 = 3.
        let (from, to, n) = balance_decision(&[80, 20], &[10, 2], 20).unwrap();
        assert_eq!(from, 0);
        assert_eq!(to, 1);
        assert_eq!(n, 3);
    }

    #[test]
    fn test_balance_decision_moves_at_least_one() {
        let (_, _, n) = balance_decision(&[90, 10], &[1, 0], 20).unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn test_balance_decision_disabled() {
        assert_eq!(balance_decision(&[100, 0], &[10, 0], 0), None);
        assert_eq!(balance_decision(&[100], &[10], 20), None);
    }
}
