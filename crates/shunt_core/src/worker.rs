//! Routing workers: one OS thread, one readiness set, and all state
//! owned by that thread.
//!
//! A loop turn polls the readiness set, dispatches each ready
//! descriptor (readable, then writable, then error), drains the task
//! inbox, runs due timed callbacks and finishes with maintenance:
//! timeout sweeps, zombie destruction and any pending rebalance. A
//! handler never blocks; work that cannot complete synchronously is
//! recorded on its session and resumed on a later turn.

use std::cell::Cell;
use std::collections::BinaryHeap;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use mio::event::Event;
use mio::net::TcpStream;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, error, info, warn};

use shunt_common::config::{ProxyConfig, SessionLimits};
use shunt_common::error::{PoolError, ShuntError};
use shunt_common::types::{SessionId, TargetId, WorkerId};
use shunt_protocol::{SessionProfile, VersionTag};

use crate::backend::BackendConn;
use crate::cache::StatementCache;
use crate::coordinator::RuntimeInner;
use crate::descriptor::{Attachment, Descriptor, Role, LISTENER_TOKEN, WAKER_TOKEN};
use crate::descriptor::TokenMap;
use crate::pool::{ContinueOutcome, Endpoint, PoolEntry, PoolGroup, WaiterMap};
use crate::registry::{DyingSession, SessionRegistry, ZombieDesc};
use crate::session::{Session, SessionVerdict, TickVerdict};
use crate::stats::{LoadGauge, LoadTracker, MemoryUsage, WorkerInfo, WorkerStats};

thread_local! {
    static CURRENT_WORKER: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Id of the worker whose thread we are on, if any.
pub fn current_worker_id() -> Option<WorkerId> {
    CURRENT_WORKER.with(|c| c.get().map(WorkerId))
}

/// Worker lifecycle, published through [`WorkerHandle::state`].
pub const WORKER_CREATED: u8 = 0;
pub const WORKER_RUNNING: u8 = 1;
pub const WORKER_FINISHED: u8 = 2;

/// A unit of work posted to a worker's inbox.
///
/// Broadcast tasks are shared (`Arc`): each recipient executes and
/// drops its reference, and the task is disposed when the count reaches
/// zero. Point tasks run on exactly one worker.
pub enum Task {
    Point {
        run: Box<dyn FnOnce(&mut Worker) + Send>,
        enqueued: Instant,
    },
    Shared {
        run: Arc<dyn Fn(&mut Worker) + Send + Sync>,
        enqueued: Instant,
    },
}

/// Cross-thread handle to one worker.
pub struct WorkerHandle {
    pub id: WorkerId,
    sender: Sender<Task>,
    waker: Arc<Waker>,
    pub load: Arc<LoadGauge>,
    /// Worker's pool group; mutex-guarded internally so administrative
    /// reads may come from any thread.
    pub pools: Arc<PoolGroup>,
    pub session_count: AtomicUsize,
    pub state: AtomicU8,
    pub moves_declined: AtomicU64,
}

impl WorkerHandle {
    pub fn new(
        id: WorkerId,
        sender: Sender<Task>,
        waker: Arc<Waker>,
        pools: Arc<PoolGroup>,
    ) -> Self {
        Self {
            id,
            sender,
            waker,
            load: Arc::new(LoadGauge::default()),
            pools,
            session_count: AtomicUsize::new(0),
            state: AtomicU8::new(WORKER_CREATED),
            moves_declined: AtomicU64::new(0),
        }
    }

    /// Submit a task. Tasks from one submitting thread execute in
    /// submission order on the receiving worker.
    pub fn post(&self, task: Task) -> bool {
        if self.sender.send(task).is_err() {
            return false;
        }
        let _ = self.waker.wake();
        true
    }

    pub fn post_fn<F>(&self, f: F) -> bool
    where
        F: FnOnce(&mut Worker) + Send + 'static,
    {
        self.post(Task::Point {
            run: Box::new(f),
            enqueued: Instant::now(),
        })
    }

    pub fn post_shared(&self, f: Arc<dyn Fn(&mut Worker) + Send + Sync>) -> bool {
        self.post(Task::Shared {
            run: f,
            enqueued: Instant::now(),
        })
    }

    pub fn is_finished(&self) -> bool {
        self.state.load(Ordering::Acquire) == WORKER_FINISHED
    }
}

/// Outcome of asking the core for a backend connection.
pub enum AcquireOutcome {
    Acquired(BackendConn),
    /// Connection cap reached; the caller may queue a waiter.
    Wait,
    Failed(ShuntError),
}

/// A timed callback on the worker's own clock.
struct Dcall {
    at: Instant,
    period: Option<Duration>,
    run: Box<dyn FnMut(&mut Worker) + Send>,
}

impl PartialEq for Dcall {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at
    }
}
impl Eq for Dcall {}
impl PartialOrd for Dcall {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Dcall {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed: the heap is a max-heap, we want the earliest deadline.
        other.at.cmp(&self.at)
    }
}

/// The worker state a session handler may touch: everything owned by
/// this worker except the session registry itself (the dispatched
/// session is taken out of the registry for the duration of the call).
pub struct WorkerCore {
    pub id: WorkerId,
    pub poll: Poll,
    pub tokens: TokenMap,
    pub cache: StatementCache,
    pub parser_version: VersionTag,
    pub pools: Arc<PoolGroup>,
    pub waiters: WaiterMap,
    pub stats: WorkerStats,
    pub zombies: Vec<ZombieDesc>,
    /// Targets whose waiters should be re-activated before this turn ends.
    notify_targets: Vec<TargetId>,
    pub limits: SessionLimits,
    pub runtime: Arc<RuntimeInner>,
}

impl WorkerCore {
    pub fn registry(&self) -> &mio::Registry {
        self.poll.registry()
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.runtime.config
    }

    /// Collaborator-facing cache entry point: return the cached parse
    /// result for a fingerprint or run the producer and retain its
    /// output. Sessions route through [`crate::cache::CacheScope`]
    /// instead so the exclusion class is honored.
    pub fn get_or_parse<F>(&mut self, fingerprint: &str, producer: F) -> shunt_protocol::SharedParse
    where
        F: FnOnce() -> shunt_protocol::SharedParse,
    {
        if let Some(parse) = self.cache.get(fingerprint, self.parser_version) {
            return parse;
        }
        let parse = producer();
        self.cache
            .insert(fingerprint, self.parser_version, parse.clone());
        parse
    }

    /// Acquire a backend connection for a session: pool reuse first,
    /// then a new connection under intent-accounted admission.
    pub fn acquire_backend(
        &mut self,
        session: SessionId,
        target_id: TargetId,
        profile: &SessionProfile,
    ) -> AcquireOutcome {
        let Some(target) = self.runtime.target(target_id) else {
            return AcquireOutcome::Failed(PoolError::UnknownTarget { target: target_id }.into());
        };
        if !target.is_up() {
            return AcquireOutcome::Failed(PoolError::TargetDown { target: target_id }.into());
        }

        // Reuse loop: a candidate that fails adoption is closed and the
        // next one is tried.
        loop {
            let Some((_score, mut entry)) = self.pools.acquire(target_id, profile) else {
                break;
            };
            if !self
                .tokens
                .rebind(entry.conn.desc.key, Attachment::Backend(session, target_id))
            {
                warn!(worker = %self.id, target = %target_id, "stale pooled descriptor");
                self.close_backend(entry.conn, "stale pooled token");
                continue;
            }
            if entry.conn.codec.adopt(profile) {
                entry.conn.profile = profile.clone();
                return AcquireOutcome::Acquired(entry.conn);
            }
            warn!(worker = %self.id, target = %target_id, "failed to reuse a pooled connection");
            self.close_backend(entry.conn, "reuse failed");
        }

        let outcome = match target.try_admit() {
            Some(_intent) => {
                // The intent is held for exactly this attempt and dropped
                // when it resolves, success or not.
                match self.connect_backend(session, target_id, profile) {
                    Ok(conn) => {
                        conn.target.add_connection();
                        AcquireOutcome::Acquired(conn)
                    }
                    Err(e) => AcquireOutcome::Failed(e),
                }
            }
            None => {
                if self.runtime.config.multiplex_timeout.is_zero() {
                    AcquireOutcome::Failed(PoolError::LimitReached { target: target_id }.into())
                } else {
                    AcquireOutcome::Wait
                }
            }
        };
        outcome
    }

    fn connect_backend(
        &mut self,
        session: SessionId,
        target_id: TargetId,
        profile: &SessionProfile,
    ) -> Result<BackendConn, ShuntError> {
        let target = self.runtime.target(target_id).expect("checked by caller");
        let stream = TcpStream::connect(target.addr)?;
        let key = self.tokens.insert(Attachment::Backend(session, target_id));
        let mut desc = Descriptor::new(stream, Role::Backend, key);
        if let Err(e) = desc.register(self.poll.registry()) {
            self.tokens.remove(key);
            return Err(e.into());
        }
        let mut codec = self.runtime.protocol.backend_codec(profile);
        if let Some(greeting) = codec.connect_greeting() {
            if let Err(e) = desc.enqueue_write(greeting, self.poll.registry()) {
                desc.deregister(self.poll.registry());
                self.tokens.remove(key);
                return Err(e.into());
            }
        }
        debug!(worker = %self.id, session = %session, target = %target_id, "backend connecting");
        Ok(BackendConn::new(target, desc, codec, profile.clone()))
    }

    /// Queue a waiter for a capped target.
    pub fn register_waiter(&mut self, endpoint: Endpoint) -> Result<(), ShuntError> {
        let target = self
            .runtime
            .target(endpoint.target)
            .ok_or(PoolError::UnknownTarget {
                target: endpoint.target,
            })?;
        let appended = self.waiters.add(endpoint, target.waiter_limit)?;
        if appended {
            target.stats.add_waiting();
        }
        Ok(())
    }

    /// Return a finished connection: park it in the pool when the
    /// preconditions hold, close it otherwise.
    pub fn release_backend(&mut self, mut conn: BackendConn) {
        let target_id = conn.target.id;
        let poolable = !conn.desc.hung_up
            && conn.codec.established()
            && conn.codec.is_safe_to_reuse()
            && conn.target.is_up()
            && self.pools.pooling_enabled();
        if poolable {
            if let Some(reset) = conn.codec.reset_for_pooling() {
                if conn.desc.enqueue_write(reset, self.poll.registry()).is_err() {
                    self.close_backend(conn, "reset write failed");
                    return;
                }
            }
            if self.tokens.rebind(conn.desc.key, Attachment::Pooled(target_id)) {
                let profile = conn.profile.clone();
                match self.pools.try_park(PoolEntry {
                    conn,
                    created: Instant::now(),
                    profile,
                }) {
                    Ok(()) => {
                        self.note_connection_available(target_id);
                        return;
                    }
                    Err(entry) => {
                        self.close_backend(entry.conn, "pool full");
                        return;
                    }
                }
            }
        }
        self.close_backend(conn, "not poolable");
    }

    /// Tear a backend connection down. The descriptor is parked as a
    /// zombie and destroyed at the end of the turn; the freed slot is
    /// announced to waiters here and on other workers.
    pub fn close_backend(&mut self, conn: BackendConn, reason: &'static str) {
        let target_id = conn.target.id;
        let BackendConn {
            target, mut desc, ..
        } = conn;
        desc.deregister(self.poll.registry());
        self.tokens.remove(desc.key);
        target.remove_connection();
        debug!(worker = %self.id, target = %target_id, reason, "backend closed");
        self.zombies.push(ZombieDesc {
            desc,
            parked_at: Instant::now(),
            reason,
        });
        self.note_connection_available(target_id);
        if target.stats.waiting() > 0 {
            // Waiters may be parked on other workers; a freed slot is
            // global, so tell everyone.
            for handle in &self.runtime.workers {
                if handle.id != self.id {
                    handle.post_fn(move |w| w.activate_waiting_endpoints_for(target_id));
                }
            }
        }
    }

    /// Schedule waiter activation for this target before the turn ends.
    fn note_connection_available(&mut self, target_id: TargetId) {
        if self.waiters.has_waiters(target_id) && !self.notify_targets.contains(&target_id) {
            self.notify_targets.push(target_id);
        }
    }
}

/// One routing worker. Owns its readiness set, descriptors, sessions,
/// statement cache and connection pool.
pub struct Worker {
    pub core: WorkerCore,
    sessions: SessionRegistry,
    dying: Vec<DyingSession>,
    inbox: Receiver<Task>,
    dcalls: BinaryHeap<Dcall>,
    events: Events,
    load: LoadTracker,
    next_timeout_check: Instant,
    rebalance_note: Option<(WorkerId, usize)>,
    shutdown_probe_installed: bool,
    stopping: bool,
    listener_fd: RawFd,
}

impl Worker {
    pub fn new(
        id: WorkerId,
        poll: Poll,
        inbox: Receiver<Task>,
        pools: Arc<PoolGroup>,
        runtime: Arc<RuntimeInner>,
    ) -> Self {
        let cache = StatementCache::new(runtime.config.cache_bytes_per_worker());
        let limits = runtime.limits.clone();
        let listener_fd = runtime.listeners.raw_fd();
        Self {
            core: WorkerCore {
                id,
                poll,
                tokens: TokenMap::new(),
                cache,
                parser_version: VersionTag::default(),
                pools,
                waiters: WaiterMap::new(),
                stats: WorkerStats::default(),
                zombies: Vec::new(),
                notify_targets: Vec::new(),
                limits,
                runtime,
            },
            sessions: SessionRegistry::new(),
            dying: Vec::new(),
            inbox,
            dcalls: BinaryHeap::new(),
            events: Events::with_capacity(256),
            load: LoadTracker::new(),
            next_timeout_check: Instant::now(),
            rebalance_note: None,
            shutdown_probe_installed: false,
            stopping: false,
            listener_fd,
        }
    }

    fn handle(&self) -> &WorkerHandle {
        &self.core.runtime.workers[self.core.id.0]
    }

    /// Schedule a periodic callback on this worker.
    pub fn dcall<F>(&mut self, period: Duration, run: F)
    where
        F: FnMut(&mut Worker) + Send + 'static,
    {
        self.dcalls.push(Dcall {
            at: Instant::now() + period,
            period: Some(period),
            run: Box::new(run),
        });
    }

    /// Schedule a one-shot callback after `delay`.
    pub fn dcall_once<F>(&mut self, delay: Duration, run: F)
    where
        F: FnMut(&mut Worker) + Send + 'static,
    {
        self.dcalls.push(Dcall {
            at: Instant::now() + delay,
            period: None,
            run: Box::new(run),
        });
    }

    fn pre_run(&mut self) {
        CURRENT_WORKER.with(|c| c.set(Some(self.core.id.0)));
        self.handle().state.store(WORKER_RUNNING, Ordering::Release);

        // All workers watch the shared listener set.
        let fd = self.listener_fd;
        if let Err(e) = self.core.poll.registry().register(
            &mut SourceFd(&fd),
            LISTENER_TOKEN,
            Interest::READABLE,
        ) {
            error!(worker = %self.core.id, error = %e, "cannot watch listener set");
        }

        // Once per second: expired pool entries and session timeouts.
        self.dcall(Duration::from_secs(1), |w| w.pool_close_expired());
        // Waiter activation safety net; the normal notification path is
        // only certain within one worker.
        self.dcall(Duration::from_secs(5), |w| w.activate_waiting_endpoints());
        // Waiters that outlived the multiplex timeout.
        self.dcall(Duration::from_secs(1), |w| w.fail_timed_out_waiters());

        // Worker 0 samples every worker's load gauge and triggers
        // rebalancing when the spread exceeds the threshold.
        if self.core.id.0 == 0 && self.core.runtime.config.rebalance_enabled() {
            let window = self.core.runtime.config.rebalance_window;
            self.dcall(window, |w| {
                let runtime = w.core.runtime.clone();
                runtime.collect_and_balance();
            });
        }

        info!(worker = %self.core.id, "worker started");
    }

    fn post_run(&mut self) {
        let entries = self.core.pools.take_all();
        for entry in entries {
            self.core.close_backend(entry.conn, "worker exit");
        }
        self.delete_zombies();
        CURRENT_WORKER.with(|c| c.set(None));
        self.handle().state.store(WORKER_FINISHED, Ordering::Release);
        info!(worker = %self.core.id, "worker finished");
    }

    /// The event loop. Returns when shutdown has drained this worker.
    pub fn run(mut self) {
        self.pre_run();
        loop {
            let timeout = self.next_poll_timeout();
            let wait_start = Instant::now();
            if let Err(e) = self.core.poll.poll(&mut self.events, Some(timeout)) {
                if e.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                error!(worker = %self.core.id, error = %e, "poll failed");
                break;
            }
            let work_start = Instant::now();

            let views: Vec<EventView> = self.events.iter().map(EventView::from).collect();
            self.core.stats.record_poll(views.len());
            for view in views {
                let t0 = Instant::now();
                self.dispatch(view);
                self.core.stats.record_exec(t0.elapsed());
            }

            self.drain_inbox();
            self.run_due_dcalls();
            self.run_pending_notifications();
            self.process_timeouts();
            self.delete_zombies();
            if self.rebalance_note.is_some() {
                self.rebalance();
            }
            if self.core.runtime.shutdown.requested() {
                self.install_shutdown_probe();
            }

            let gauge = self.handle().load.clone();
            self.load.record_turn(
                work_start.saturating_duration_since(wait_start),
                work_start.elapsed(),
                &gauge,
            );

            if self.stopping && self.sessions.is_empty() && self.dying.is_empty() {
                break;
            }
        }
        self.post_run();
    }

    fn next_poll_timeout(&self) -> Duration {
        let tick = self.core.runtime.config.loop_tick;
        match self.dcalls.peek() {
            Some(dcall) => tick.min(dcall.at.saturating_duration_since(Instant::now())),
            None => tick,
        }
    }

    // ── Event dispatch ──────────────────────────────────────────────────

    fn dispatch(&mut self, view: EventView) {
        match view.token {
            WAKER_TOKEN => {
                // Inbox wakeup; the queue is drained after dispatch.
            }
            LISTENER_TOKEN => self.on_listener_ready(),
            token => {
                let Some(attachment) = self.core.tokens.attachment(token.0) else {
                    // Stale event for a freed slot.
                    return;
                };
                match attachment {
                    Attachment::Pooled(target_id) => self.evict_pooled(token.0, target_id),
                    Attachment::Client(sid) => self.dispatch_client(sid, view),
                    Attachment::Backend(sid, target_id) => {
                        self.dispatch_backend(sid, target_id, view)
                    }
                }
            }
        }
    }

    fn dispatch_client(&mut self, sid: SessionId, view: EventView) {
        self.with_session(sid, |s, core| {
            if view.readable {
                let v = s.on_client_readable(core);
                if v == SessionVerdict::Close {
                    return v;
                }
            }
            if view.writable {
                let v = s.on_client_writable(core);
                if v == SessionVerdict::Close {
                    return v;
                }
            }
            if view.error {
                return s.on_client_error(core);
            }
            SessionVerdict::Keep
        });
    }

    fn dispatch_backend(&mut self, sid: SessionId, target_id: TargetId, view: EventView) {
        self.with_session(sid, |s, core| {
            if view.readable {
                let v = s.on_backend_readable(core, target_id);
                if v == SessionVerdict::Close {
                    return v;
                }
            }
            if view.writable {
                let v = s.on_backend_writable(core, target_id);
                if v == SessionVerdict::Close {
                    return v;
                }
            }
            if view.error {
                return s.on_backend_error(core, target_id);
            }
            SessionVerdict::Keep
        });
    }

    /// Any traffic on a pooled descriptor evicts and closes the entry.
    fn evict_pooled(&mut self, token_index: usize, target_id: TargetId) {
        if let Some(entry) = self.core.pools.evict_token(target_id, token_index) {
            debug!(worker = %self.core.id, target = %target_id, "pooled connection evicted");
            self.core.close_backend(entry.conn, "activity on pooled descriptor");
        }
    }

    fn with_session<F>(&mut self, sid: SessionId, f: F)
    where
        F: FnOnce(&mut Session, &mut WorkerCore) -> SessionVerdict,
    {
        let Some(mut session) = self.sessions.take(sid) else {
            return;
        };
        match f(&mut session, &mut self.core) {
            SessionVerdict::Keep => self.sessions.put(session),
            SessionVerdict::Close => self.close_session(session),
        }
    }

    // ── Session lifecycle ───────────────────────────────────────────────

    /// Wrap a freshly accepted client connection into a session owned by
    /// this worker.
    pub fn start_session(&mut self, stream: TcpStream, peer: SocketAddr) {
        let runtime = self.core.runtime.clone();
        let max_sessions = runtime.limits.max_sessions;
        if max_sessions > 0 && runtime.locator.len() >= max_sessions {
            // Resource exhaustion: do not admit. The client sees an
            // abrupt close, as nothing protocol-level exists yet.
            warn!(worker = %self.core.id, %peer, "session limit reached, refusing client");
            drop(stream);
            return;
        }
        let sid = runtime.allocate_session_id();
        let key = self.core.tokens.insert(Attachment::Client(sid));
        let mut desc = Descriptor::new(stream, Role::Client, key);
        if let Err(e) = desc.register(self.core.poll.registry()) {
            error!(worker = %self.core.id, error = %e, "cannot register client descriptor");
            self.core.tokens.remove(key);
            return;
        }
        let codec = runtime.protocol.client_codec();
        let policy = runtime.router.session_policy();
        let mut session = Session::new(sid, self.core.id, desc, codec, policy);
        self.core.stats.n_accepts += 1;
        runtime.locator.insert(sid, self.core.id);
        self.handle().session_count.fetch_add(1, Ordering::Relaxed);
        debug!(worker = %self.core.id, session = %sid, %peer, "session started");
        match session.begin(&mut self.core) {
            SessionVerdict::Keep => self.sessions.put(session),
            SessionVerdict::Close => self.close_session(session),
        }
    }

    /// Two-phase close: release what is safe, park the rest.
    fn close_session(&mut self, mut session: Session) {
        let sid = session.id;
        if let Some(target_id) = session.awaited_target() {
            if self.core.waiters.remove(sid, target_id) {
                if let Some(target) = self.core.runtime.target(target_id) {
                    target.stats.remove_waiting();
                }
            }
        }
        session.client.deregister(self.core.poll.registry());
        self.core.tokens.remove(session.client.key);
        self.core.runtime.locator.remove(&sid);
        self.handle().session_count.fetch_sub(1, Ordering::Relaxed);

        let mut pending = Vec::new();
        for (_, conn) in session.backends.drain() {
            if conn.can_close() {
                self.core.release_backend(conn);
            } else {
                // Let in-flight handshakes and replies settle under the
                // grace window before teardown.
                pending.push(conn);
            }
        }
        debug!(worker = %self.core.id, session = %sid, held_backends = pending.len(),
               "session closed");
        self.dying.push(DyingSession {
            id: sid,
            client: session.client,
            backends: pending,
            parked_at: Instant::now(),
            reparks: 0,
            repark_reason: "",
        });
    }

    /// Kill one session (admin request, timeout or shutdown).
    pub fn kill_session_local(&mut self, sid: SessionId, reason: &'static str) {
        debug!(worker = %self.core.id, session = %sid, reason, "killing session");
        self.with_session(sid, |s, _core| {
            s.kill_requested = true;
            SessionVerdict::Close
        });
    }

    // ── Waiter activation ───────────────────────────────────────────────

    /// Walk one target's waiter FIFO, giving each endpoint one chance.
    pub fn activate_waiting_endpoints_for(&mut self, target_id: TargetId) {
        loop {
            let Some(endpoint) = self.core.waiters.pop_front(target_id) else {
                return;
            };
            let target = self.core.runtime.target(target_id);
            let Some(mut session) = self.sessions.take(endpoint.session) else {
                // Session died while queued.
                if let Some(t) = &target {
                    t.stats.remove_waiting();
                }
                continue;
            };
            match session.continue_connecting(&mut self.core) {
                ContinueOutcome::Success => {
                    if let Some(t) = &target {
                        t.stats.remove_waiting();
                    }
                    self.sessions.put(session);
                }
                ContinueOutcome::Wait => {
                    // Still capped; keep its place and stop this target.
                    self.core.waiters.push_front(endpoint);
                    self.sessions.put(session);
                    return;
                }
                ContinueOutcome::Fail => {
                    if let Some(t) = &target {
                        t.stats.remove_waiting();
                    }
                    self.sessions.put(session);
                }
            }
        }
    }

    pub fn activate_waiting_endpoints(&mut self) {
        for target_id in self.core.waiters.targets() {
            self.activate_waiting_endpoints_for(target_id);
        }
    }

    fn run_pending_notifications(&mut self) {
        while let Some(target_id) = self.core.notify_targets.pop() {
            self.activate_waiting_endpoints_for(target_id);
        }
    }

    fn fail_timed_out_waiters(&mut self) {
        let timeout = self.core.runtime.config.multiplex_timeout;
        if timeout.is_zero() {
            return;
        }
        let expired = self.core.waiters.take_timed_out(timeout, Instant::now());
        for endpoint in expired {
            if let Some(target) = self.core.runtime.target(endpoint.target) {
                target.stats.remove_waiting();
            }
            self.with_session(endpoint.session, |s, core| {
                s.fail_waiting_statement(core, endpoint.target);
                SessionVerdict::Keep
            });
        }
    }

    // ── Periodic maintenance ────────────────────────────────────────────

    fn pool_close_expired(&mut self) {
        let max_age = self.core.runtime.config.pool_idle_max_age;
        let expired = self.core.pools.take_expired(max_age, Instant::now());
        for entry in expired {
            self.core.close_backend(entry.conn, "pool entry expired");
        }
    }

    /// Session timeout sweep, gated to once per second.
    fn process_timeouts(&mut self) {
        let now = Instant::now();
        if now < self.next_timeout_check {
            return;
        }
        self.next_timeout_check = now + Duration::from_secs(1);
        let limits = self.core.limits.clone();
        for sid in self.sessions.ids() {
            let Some(mut session) = self.sessions.take(sid) else {
                continue;
            };
            match session.tick(now, &limits) {
                TickVerdict::Keep => self.sessions.put(session),
                TickVerdict::ReleaseIdle => {
                    session.release_idle_backends(&mut self.core);
                    self.sessions.put(session);
                }
                TickVerdict::Kill(reason) => {
                    debug!(worker = %self.core.id, session = %sid, reason, "session timed out");
                    self.close_session(session);
                }
            }
        }
    }

    /// Destroy parked descriptors whose sessions report safe-to-close;
    /// re-park the rest with a reason.
    fn delete_zombies(&mut self) {
        let now = Instant::now();
        for zombie in self.core.zombies.drain(..) {
            // Bare descriptors were deregistered when parked; dropping
            // closes the socket.
            let _ = zombie;
        }
        let grace = self.core.runtime.config.shutdown_grace;
        let mut keep = Vec::new();
        for mut dying in self.dying.drain(..) {
            let all_safe = dying
                .backends
                .iter()
                .all(|conn| conn.safe_to_close(grace, now));
            if all_safe {
                for conn in dying.backends.drain(..) {
                    if conn.can_close() {
                        self.core.release_backend(conn);
                    } else {
                        self.core.close_backend(conn, "session teardown after grace");
                    }
                }
                // Dropping the client descriptor closes the socket.
            } else {
                dying.reparks += 1;
                dying.repark_reason = "backends not safe to close";
                keep.push(dying);
            }
        }
        self.dying = keep;
    }

    // ── Inbox & dcalls ──────────────────────────────────────────────────

    fn drain_inbox(&mut self) {
        while let Ok(task) = self.inbox.try_recv() {
            let t0 = Instant::now();
            match task {
                Task::Point { run, enqueued } => {
                    self.core.stats.record_queue_delay(t0 - enqueued);
                    run(self);
                }
                Task::Shared { run, enqueued } => {
                    self.core.stats.record_queue_delay(t0 - enqueued);
                    run(self);
                    // Dropping `run` releases this worker's reference;
                    // the task is disposed when the last one goes.
                }
            }
            self.core.stats.record_exec(t0.elapsed());
        }
    }

    fn run_due_dcalls(&mut self) {
        let now = Instant::now();
        while let Some(dcall) = self.dcalls.peek() {
            if dcall.at > now {
                break;
            }
            let mut dcall = self.dcalls.pop().expect("peeked");
            (dcall.run)(self);
            if let Some(period) = dcall.period {
                dcall.at = Instant::now() + period;
                self.dcalls.push(dcall);
            }
        }
    }

    // ── Listener ────────────────────────────────────────────────────────

    /// Drain pending accepts from the shared listener set and hand each
    /// connection to a worker picked by the assignment policy.
    fn on_listener_ready(&mut self) {
        let runtime = self.core.runtime.clone();
        for (stream, peer) in runtime.listeners.accept_pending() {
            let wid = runtime.pick_worker();
            if wid == self.core.id {
                self.start_session(stream, peer);
            } else {
                runtime.workers[wid.0].post_fn(move |w| w.start_session(stream, peer));
            }
        }
    }

    // ── Rebalance & migration ───────────────────────────────────────────

    /// Note a migration directive; performed during maintenance, never
    /// in the middle of event dispatch.
    pub fn note_rebalance(&mut self, to: WorkerId, sessions: usize) {
        self.rebalance_note = Some((to, sessions));
    }

    fn rebalance(&mut self) {
        let Some((to, requested)) = self.rebalance_note.take() else {
            return;
        };
        let available = self.sessions.len();
        let mut candidates: Vec<(u32, SessionId)> = self
            .sessions
            .iter()
            .filter(|s| s.is_movable())
            .map(|s| (s.io_activity, s.id))
            .collect();
        // Most active first.
        candidates.sort_by(|a, b| b.0.cmp(&a.0));
        candidates.truncate(requested);

        let movable = candidates.len();
        if movable < requested && available >= requested {
            // Some sessions were in an unmovable state.
            let declined = (requested - movable) as u64;
            self.handle()
                .moves_declined
                .fetch_add(declined, Ordering::Relaxed);
            info!(worker = %self.core.id, declined,
                  "sessions in an unmovable state were not migrated");
        }
        for (_, sid) in candidates {
            self.migrate_out(sid, to);
        }
    }

    /// Hand a session over to another worker. The descriptors leave this
    /// worker's readiness set and registry before the task is posted;
    /// ownership moves with the task.
    fn migrate_out(&mut self, sid: SessionId, to: WorkerId) {
        let Some(mut session) = self.sessions.take(sid) else {
            return;
        };
        if !session.is_movable() {
            self.handle().moves_declined.fetch_add(1, Ordering::Relaxed);
            self.sessions.put(session);
            return;
        }
        session.client.deregister(self.core.poll.registry());
        self.core.tokens.remove(session.client.key);
        for conn in session.backends.values_mut() {
            conn.desc.deregister(self.core.poll.registry());
            self.core.tokens.remove(conn.desc.key);
        }
        self.handle().session_count.fetch_sub(1, Ordering::Relaxed);
        self.core.runtime.moves_in_flight.fetch_add(1, Ordering::AcqRel);
        info!(worker = %self.core.id, session = %sid, to = %to, "migrating session");
        self.core.runtime.workers[to.0].post_fn(move |w| w.adopt_session(session));
    }

    /// Receive a migrated session: register its descriptors under fresh
    /// tokens and take ownership.
    pub fn adopt_session(&mut self, mut session: Session) {
        let sid = session.id;
        session.owner = self.core.id;
        let key = self.core.tokens.insert(Attachment::Client(sid));
        if let Err(e) = session.client.rekey(self.core.poll.registry(), key) {
            error!(worker = %self.core.id, session = %sid, error = %e,
                   "failed to adopt migrated session");
            self.core.tokens.remove(key);
            self.core.runtime.moves_in_flight.fetch_sub(1, Ordering::AcqRel);
            self.close_session(session);
            return;
        }
        let targets: Vec<TargetId> = session.backends.keys().copied().collect();
        for target_id in targets {
            let conn = session.backends.get_mut(&target_id).expect("just listed");
            let key = self.core.tokens.insert(Attachment::Backend(sid, target_id));
            if let Err(e) = conn.desc.rekey(self.core.poll.registry(), key) {
                error!(worker = %self.core.id, session = %sid, error = %e,
                       "failed to adopt migrated backend");
                self.core.tokens.remove(key);
            }
        }
        self.core.runtime.locator.insert(sid, self.core.id);
        self.handle().session_count.fetch_add(1, Ordering::Relaxed);
        self.sessions.put(session);
        self.core.runtime.moves_in_flight.fetch_sub(1, Ordering::AcqRel);
        debug!(worker = %self.core.id, session = %sid, "adopted migrated session");
    }

    // ── Shutdown ────────────────────────────────────────────────────────

    /// Install the 100 ms shutdown probe (idempotent).
    pub fn install_shutdown_probe(&mut self) {
        if self.shutdown_probe_installed {
            return;
        }
        self.shutdown_probe_installed = true;
        self.dcall(Duration::from_millis(100), |w| w.try_shutdown());
    }

    fn try_shutdown(&mut self) {
        let entries = self.core.pools.take_all();
        for entry in entries {
            self.core.close_backend(entry.conn, "shutdown");
        }
        if self.sessions.is_empty() {
            self.stopping = true;
        } else {
            for sid in self.sessions.ids() {
                self.kill_session_local(sid, "shutdown");
            }
        }
    }

    // ── Introspection ───────────────────────────────────────────────────

    /// Replace this worker's parser version tag; cached entries under
    /// the old tag are evicted lazily on lookup.
    pub fn set_parser_version(&mut self, version: VersionTag) {
        self.core.parser_version = version;
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn info(&mut self) -> WorkerInfo {
        self.core.stats.fds_current = self.core.tokens.len();
        self.core.stats.fds_total = self.core.tokens.total_inserted();
        let handle = &self.core.runtime.workers[self.core.id.0];
        let zombie_bytes: usize = self
            .dying
            .iter()
            .map(|d| d.client.buffered_bytes())
            .sum::<usize>()
            + self
                .core
                .zombies
                .iter()
                .map(|z| z.desc.buffered_bytes())
                .sum::<usize>();
        WorkerInfo {
            worker: self.core.id.0,
            stats: self.core.stats,
            load_1s: handle.load.load(crate::stats::LoadInterval::OneSecond),
            load_1m: handle.load.load(crate::stats::LoadInterval::OneMinute),
            load_1h: handle.load.load(crate::stats::LoadInterval::OneHour),
            sessions: self.sessions.len(),
            zombies: self.dying.len() + self.core.zombies.len(),
            cache: self.core.cache.stats(),
            memory: MemoryUsage {
                statement_cache: self.core.cache.memory_bytes(),
                zombies: zombie_bytes as u64,
                sessions: self.sessions.memory_bytes() as u64,
                total: 0,
            }
            .finish(),
        }
    }
}

/// Readiness flattened out of a `mio::event::Event`.
#[derive(Debug, Clone, Copy)]
struct EventView {
    token: Token,
    readable: bool,
    writable: bool,
    error: bool,
}

impl From<&Event> for EventView {
    fn from(event: &Event) -> Self {
        Self {
            token: event.token(),
            readable: event.is_readable() || event.is_read_closed(),
            writable: event.is_writable(),
            error: event.is_error(),
        }
    }
}
