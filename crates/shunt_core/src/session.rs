//! Per-client-connection session state machine.
//!
//! A session owns its client descriptor, its linked backend connections
//! and one router policy instance. Everything here runs on the owning
//! worker; a handler that cannot complete synchronously records its
//! residual state (the suspended statement) and returns.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, warn};

use shunt_common::config::SessionLimits;
use shunt_common::error::{Failure, PoolError, SessionError, ShuntError};
use shunt_common::types::{SessionId, TargetId, WorkerId};
use shunt_protocol::{
    AuthProgress, Classification, ClientCodec, Packet, Recovery, ReplyShape, RoutePlan,
    RouterPolicy, SharedParse, StatementKind,
};

use crate::backend::{BackendConn, PendingReply};
use crate::cache::CacheScope;
use crate::descriptor::Descriptor;
use crate::pool::{ContinueOutcome, Endpoint};
use crate::worker::{AcquireOutcome, WorkerCore};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created; greeting not yet sent.
    Init,
    /// Protocol-level authentication exchange in progress.
    Auth,
    /// Statements flow; the steady state.
    Routing,
    /// Kill or shutdown requested; backends are being wound down.
    Draining,
    /// Terminal.
    Closed,
}

/// What the worker does with a session after a handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionVerdict {
    Keep,
    Close,
}

/// Verdict of the once-per-second timeout sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickVerdict {
    Keep,
    /// Release idle backends to the pool, then keep.
    ReleaseIdle,
    Kill(&'static str),
}

/// The statement currently in flight (one at a time; further client
/// packets stay buffered until it completes).
#[derive(Clone)]
struct CurrentStatement {
    packet: Packet,
    plan: RoutePlan,
    started: Instant,
}

/// A statement suspended while its session waits for a connection slot.
struct SuspendedStatement {
    packet: Packet,
    plan: RoutePlan,
    /// Index into `plan.targets` of the target being waited on.
    next_target: usize,
}

enum DispatchOutcome {
    /// Statement written to every target (or completed with no reply).
    Dispatched,
    /// Waiting on a connection slot; the statement is suspended.
    Suspended,
    /// The statement failed; an error was relayed to the client.
    Failed,
}

pub struct Session {
    pub id: SessionId,
    pub owner: WorkerId,
    pub state: SessionState,
    pub client: Descriptor,
    pub codec: Box<dyn ClientCodec>,
    pub policy: Box<dyn RouterPolicy>,
    pub backends: HashMap<TargetId, BackendConn>,
    current: Option<CurrentStatement>,
    suspended: Option<SuspendedStatement>,
    /// Backends still owing terminal replies for the current statement.
    outstanding: u32,
    /// One silent reconnect allowed per statement.
    retried: bool,
    pub kill_requested: bool,
    /// Decaying readiness-event counter; the rebalancer picks the most
    /// active movable session by this.
    pub io_activity: u32,
    pub created: Instant,
}

impl Session {
    pub fn new(
        id: SessionId,
        owner: WorkerId,
        client: Descriptor,
        codec: Box<dyn ClientCodec>,
        policy: Box<dyn RouterPolicy>,
    ) -> Self {
        Self {
            id,
            owner,
            state: SessionState::Init,
            client,
            codec,
            policy,
            backends: HashMap::new(),
            current: None,
            suspended: None,
            outstanding: 0,
            retried: false,
            kill_requested: false,
            io_activity: 0,
            created: Instant::now(),
        }
    }

    /// Send the protocol greeting (server-first protocols) and enter the
    /// authentication state.
    pub fn begin(&mut self, core: &mut WorkerCore) -> SessionVerdict {
        debug_assert_eq!(self.state, SessionState::Init);
        if let Some(greeting) = self.codec.greeting() {
            if self.send_to_client(core, greeting).is_err() {
                return SessionVerdict::Close;
            }
        }
        self.state = SessionState::Auth;
        SessionVerdict::Keep
    }

    // ── Client-side events ──────────────────────────────────────────────

    pub fn on_client_readable(&mut self, core: &mut WorkerCore) -> SessionVerdict {
        self.io_activity = self.io_activity.saturating_add(1);
        let outcome = match self.client.fill_read_queue() {
            Ok(o) => o,
            Err(e) => {
                warn!(session = %self.id, error = %e, "client read failed");
                core.stats.n_errors += 1;
                return SessionVerdict::Close;
            }
        };
        if outcome.bytes > 0 {
            core.stats.n_reads += 1;
        }
        let verdict = match self.state {
            SessionState::Auth => self.advance_auth(core),
            SessionState::Routing => self.drive_client(core),
            _ => SessionVerdict::Keep,
        };
        if verdict == SessionVerdict::Close {
            return verdict;
        }
        if outcome.eof {
            debug!(session = %self.id, "client hung up");
            core.stats.n_hangups += 1;
            return SessionVerdict::Close;
        }
        SessionVerdict::Keep
    }

    pub fn on_client_writable(&mut self, core: &mut WorkerCore) -> SessionVerdict {
        self.io_activity = self.io_activity.saturating_add(1);
        core.stats.n_writes += 1;
        match self.client.flush(core.registry()) {
            Ok(_) => SessionVerdict::Keep,
            Err(e) => {
                warn!(session = %self.id, error = %e, "client write failed");
                core.stats.n_errors += 1;
                SessionVerdict::Close
            }
        }
    }

    pub fn on_client_error(&mut self, core: &mut WorkerCore) -> SessionVerdict {
        core.stats.n_errors += 1;
        SessionVerdict::Close
    }

    fn advance_auth(&mut self, core: &mut WorkerCore) -> SessionVerdict {
        match self.codec.advance_auth(&mut self.client.read_q) {
            Ok((progress, reply)) => {
                if let Some(reply) = reply {
                    if self.send_to_client(core, reply).is_err() {
                        return SessionVerdict::Close;
                    }
                }
                match progress {
                    AuthProgress::InProgress => SessionVerdict::Keep,
                    AuthProgress::Done => {
                        debug!(session = %self.id, "authenticated");
                        self.state = SessionState::Routing;
                        // Pipelined statements may already be buffered.
                        self.drive_client(core)
                    }
                    AuthProgress::Failed(reason) => {
                        debug!(session = %self.id, reason, "authentication failed");
                        SessionVerdict::Close
                    }
                }
            }
            Err(e) => {
                warn!(session = %self.id, error = %e, "malformed auth exchange");
                SessionVerdict::Close
            }
        }
    }

    /// Consume buffered client packets while no statement is in flight.
    /// A suspended statement applies backpressure: nothing further is
    /// consumed until it completes.
    fn drive_client(&mut self, core: &mut WorkerCore) -> SessionVerdict {
        while self.state == SessionState::Routing
            && self.suspended.is_none()
            && self.outstanding == 0
        {
            let packet = match self.codec.next_packet(&mut self.client.read_q) {
                Ok(Some(packet)) => packet,
                Ok(None) => break,
                Err(e) => {
                    // Malformed input: protocol error reply, then drain.
                    warn!(session = %self.id, error = %e, "malformed client packet");
                    let _ = self.send_error(core, &e.to_string());
                    self.state = SessionState::Draining;
                    return SessionVerdict::Close;
                }
            };
            let class = self.codec.classify(&packet);
            if class.kind == StatementKind::Ignorable {
                continue;
            }
            let parse = self.lookup_or_parse(core, &class);
            let plan = match self.policy.on_statement(&class, parse.as_ref()) {
                Ok(plan) => plan,
                Err(e) => {
                    // Policy error: distinct protocol error, session lives.
                    debug!(session = %self.id, error = %e, "router rejected statement");
                    if self.send_error(core, &e.to_string()).is_err() {
                        return SessionVerdict::Close;
                    }
                    continue;
                }
            };
            match self.dispatch_statement(core, packet, plan, 0, None) {
                Ok(DispatchOutcome::Dispatched) | Ok(DispatchOutcome::Failed) => {}
                Ok(DispatchOutcome::Suspended) => break,
                Err(_) => return SessionVerdict::Close,
            }
        }
        SessionVerdict::Keep
    }

    fn lookup_or_parse(
        &mut self,
        core: &mut WorkerCore,
        class: &Classification,
    ) -> Option<SharedParse> {
        if class.fingerprint.is_empty() {
            return None;
        }
        let mut scope = CacheScope::enter(&mut core.cache, &class.fingerprint, core.parser_version);
        if let Some(parse) = scope.hit() {
            return Some(parse);
        }
        let parse = self.codec.parse(&class.fingerprint);
        scope.produced(parse.clone(), class.touches_session_state);
        Some(parse)
    }

    /// Route one statement: acquire a backend per target, then write the
    /// serialized statement and record the expected replies.
    ///
    /// `skip_waiter_for` marks a target whose waiter is being activated:
    /// hitting the cap there again must not re-register the waiter (the
    /// activation loop keeps its place in the FIFO).
    fn dispatch_statement(
        &mut self,
        core: &mut WorkerCore,
        packet: Packet,
        plan: RoutePlan,
        start_idx: usize,
        skip_waiter_for: Option<TargetId>,
    ) -> Result<DispatchOutcome, ShuntError> {
        for i in start_idx..plan.targets.len() {
            let target_id = plan.targets[i];
            if self.backends.contains_key(&target_id) {
                continue;
            }
            let profile = self.codec.profile();
            match core.acquire_backend(self.id, target_id, &profile) {
                AcquireOutcome::Acquired(conn) => {
                    self.backends.insert(target_id, conn);
                }
                AcquireOutcome::Wait => {
                    if skip_waiter_for != Some(target_id) {
                        if let Err(e) = core.register_waiter(Endpoint {
                            session: self.id,
                            target: target_id,
                            enqueued: Instant::now(),
                        }) {
                            // Cap reached and waiter queue full: fail fast.
                            debug!(session = %self.id, target = %target_id, "resource busy");
                            let _ = self.send_error(core, &e.to_string());
                            return Ok(DispatchOutcome::Failed);
                        }
                    }
                    self.suspended = Some(SuspendedStatement {
                        packet,
                        plan,
                        next_target: i,
                    });
                    return Ok(DispatchOutcome::Suspended);
                }
                AcquireOutcome::Failed(e) => {
                    warn!(session = %self.id, target = %target_id, error = %e,
                          "backend acquisition failed");
                    if self.send_error(core, &e.to_string()).is_err() {
                        return Err(e);
                    }
                    return Ok(DispatchOutcome::Failed);
                }
            }
        }
        self.write_statement(core, packet, plan)
    }

    fn write_statement(
        &mut self,
        core: &mut WorkerCore,
        packet: Packet,
        plan: RoutePlan,
    ) -> Result<DispatchOutcome, ShuntError> {
        for &target_id in &plan.targets {
            let conn = self
                .backends
                .get_mut(&target_id)
                .expect("backend acquired above");
            let bytes = conn
                .codec
                .serialize_statement(&packet, plan.transform.as_ref());
            if conn.codec.established() {
                if let Err(e) = conn.desc.enqueue_write(bytes, core.poll.registry()) {
                    core.stats.n_errors += 1;
                    let verdict =
                        self.handle_backend_failure(core, target_id, ShuntError::from(e).failure());
                    if verdict == SessionVerdict::Close {
                        return Err(ShuntError::Internal("backend write failed".into()));
                    }
                    return Ok(DispatchOutcome::Failed);
                }
                core.stats.n_writes += 1;
            } else {
                // Handshake still in flight; flushed on completion.
                conn.held_writes.push(bytes);
            }
            if plan.shape != ReplyShape::None {
                conn.replies.push_back(PendingReply {
                    shape: plan.shape,
                    relay: plan.reply_source == Some(target_id),
                    remaining: plan.shape.expected_terminals(),
                });
                self.outstanding += 1;
            }
        }
        if self.outstanding > 0 {
            self.current = Some(CurrentStatement {
                packet,
                plan,
                started: Instant::now(),
            });
        } else {
            self.statement_complete(core);
        }
        Ok(DispatchOutcome::Dispatched)
    }

    // ── Backend-side events ─────────────────────────────────────────────

    pub fn on_backend_readable(
        &mut self,
        core: &mut WorkerCore,
        target_id: TargetId,
    ) -> SessionVerdict {
        self.io_activity = self.io_activity.saturating_add(1);
        let Some(conn) = self.backends.get_mut(&target_id) else {
            return SessionVerdict::Keep;
        };
        let outcome = match conn.desc.fill_read_queue() {
            Ok(o) => o,
            Err(e) => {
                core.stats.n_errors += 1;
                let failure = ShuntError::from(e).failure();
                return self.handle_backend_failure(core, target_id, failure);
            }
        };
        if outcome.bytes > 0 {
            core.stats.n_reads += 1;
        }

        if !conn.codec.established() {
            let verdict = self.advance_backend_auth(core, target_id);
            if verdict == SessionVerdict::Close {
                return verdict;
            }
        }
        let verdict = self.consume_replies(core, target_id);
        if verdict == SessionVerdict::Close {
            return verdict;
        }
        if outcome.eof {
            core.stats.n_hangups += 1;
            return self.handle_backend_failure(core, target_id, Failure::Transient);
        }
        SessionVerdict::Keep
    }

    pub fn on_backend_writable(
        &mut self,
        core: &mut WorkerCore,
        target_id: TargetId,
    ) -> SessionVerdict {
        if let Some(conn) = self.backends.get_mut(&target_id) {
            core.stats.n_writes += 1;
            if let Err(e) = conn.desc.flush(core.poll.registry()) {
                warn!(session = %self.id, target = %target_id, error = %e,
                      "backend write failed");
                core.stats.n_errors += 1;
                return self.handle_backend_failure(core, target_id, Failure::Transient);
            }
        }
        SessionVerdict::Keep
    }

    pub fn on_backend_error(
        &mut self,
        core: &mut WorkerCore,
        target_id: TargetId,
    ) -> SessionVerdict {
        core.stats.n_errors += 1;
        self.handle_backend_failure(core, target_id, Failure::Transient)
    }

    fn advance_backend_auth(
        &mut self,
        core: &mut WorkerCore,
        target_id: TargetId,
    ) -> SessionVerdict {
        let conn = self.backends.get_mut(&target_id).expect("caller checked");
        match conn.codec.advance_auth(&mut conn.desc.read_q) {
            Ok((progress, reply)) => {
                if let Some(reply) = reply {
                    if conn.desc.enqueue_write(reply, core.poll.registry()).is_err() {
                        return self.handle_backend_failure(
                            core,
                            target_id,
                            Failure::Transient,
                        );
                    }
                }
                match progress {
                    AuthProgress::InProgress => SessionVerdict::Keep,
                    AuthProgress::Done => {
                        debug!(session = %self.id, target = %target_id, "backend established");
                        let held = std::mem::take(&mut conn.held_writes);
                        for bytes in held {
                            if conn.desc.enqueue_write(bytes, core.poll.registry()).is_err() {
                                return self.handle_backend_failure(
                                    core,
                                    target_id,
                                    Failure::Transient,
                                );
                            }
                        }
                        SessionVerdict::Keep
                    }
                    AuthProgress::Failed(reason) => {
                        warn!(session = %self.id, target = %target_id, reason,
                              "backend authentication failed");
                        self.handle_backend_failure(core, target_id, Failure::Transient)
                    }
                }
            }
            Err(e) => {
                let failure = conn.codec.classify_failure(&e);
                self.handle_backend_failure(core, target_id, failure)
            }
        }
    }

    /// Splice backend replies toward the client in plan order.
    fn consume_replies(&mut self, core: &mut WorkerCore, target_id: TargetId) -> SessionVerdict {
        loop {
            let Some(conn) = self.backends.get_mut(&target_id) else {
                return SessionVerdict::Keep;
            };
            let Some(front) = conn.replies.front() else {
                if !conn.desc.read_q.is_empty() && conn.codec.established() {
                    // Unsolicited traffic outside a tracked reply.
                    warn!(session = %self.id, target = %target_id,
                          "unexpected bytes from idle backend");
                    return self.handle_backend_failure(
                        core,
                        target_id,
                        Failure::Permanent,
                    );
                }
                return SessionVerdict::Keep;
            };
            let shape = front.shape;
            match conn.codec.on_reply(&mut conn.desc.read_q, shape) {
                Ok(Some(step)) => {
                    let relay = conn.replies.front().map(|p| p.relay).unwrap_or(false);
                    if relay {
                        if let Some(bytes) = step.forward {
                            if self.send_to_client(core, bytes).is_err() {
                                return SessionVerdict::Close;
                            }
                        }
                    }
                    self.policy.on_reply(target_id, step.terminal);
                    if step.terminal {
                        let conn = self.backends.get_mut(&target_id).expect("still linked");
                        let done = {
                            let front = conn.replies.front_mut().expect("checked above");
                            front.remaining -= 1;
                            front.remaining == 0
                        };
                        if done {
                            conn.replies.pop_front();
                            self.outstanding -= 1;
                            if self.outstanding == 0 {
                                self.statement_complete(core);
                                return self.drive_client(core);
                            }
                        }
                    }
                }
                Ok(None) => return SessionVerdict::Keep,
                Err(e) => {
                    let failure = conn.codec.classify_failure(&e);
                    return self.handle_backend_failure(core, target_id, failure);
                }
            }
        }
    }

    fn statement_complete(&mut self, core: &mut WorkerCore) {
        self.current = None;
        self.retried = false;
        if core.limits.multiplex_idle == Some(Duration::ZERO) {
            self.release_idle_backends(core);
        }
    }

    /// A backend died. Classify, consult the router, retry or surface.
    fn handle_backend_failure(
        &mut self,
        core: &mut WorkerCore,
        target_id: TargetId,
        failure: Failure,
    ) -> SessionVerdict {
        let Some(conn) = self.backends.remove(&target_id) else {
            return SessionVerdict::Keep;
        };
        let in_txn = conn.codec.in_transaction();
        let owed = conn.replies.len() as u32;
        core.close_backend(conn, "backend failure");

        let recovery = self.policy.on_failure(target_id, failure);
        if owed == 0 && self.current.is_none() {
            // An idle backend died; nothing user-visible was lost.
            return match recovery {
                Recovery::Drain => {
                    self.state = SessionState::Draining;
                    SessionVerdict::Close
                }
                _ => SessionVerdict::Keep,
            };
        }
        let retriable = failure == Failure::Transient
            && !in_txn
            && !self.retried
            && self.current.is_some()
            && owed > 0;

        match recovery {
            Recovery::Retry if retriable => {
                self.outstanding -= owed;
                self.retried = true;
                debug!(session = %self.id, target = %target_id, "retrying statement");
                let current = self.current.clone().expect("checked retriable");
                match self.replay_on(core, target_id, &current) {
                    Ok(()) => SessionVerdict::Keep,
                    Err(_) => self.surface_failure(core, target_id, 0),
                }
            }
            Recovery::Drain => {
                self.outstanding = self.outstanding.saturating_sub(owed);
                self.state = SessionState::Draining;
                SessionVerdict::Close
            }
            _ => {
                self.outstanding = self.outstanding.saturating_sub(owed);
                self.surface_failure(core, target_id, owed)
            }
        }
    }

    fn replay_on(
        &mut self,
        core: &mut WorkerCore,
        target_id: TargetId,
        current: &CurrentStatement,
    ) -> Result<(), ShuntError> {
        let profile = self.codec.profile();
        match core.acquire_backend(self.id, target_id, &profile) {
            AcquireOutcome::Acquired(conn) => {
                self.backends.insert(target_id, conn);
                let conn = self.backends.get_mut(&target_id).expect("just inserted");
                let bytes = conn
                    .codec
                    .serialize_statement(&current.packet, current.plan.transform.as_ref());
                if conn.codec.established() {
                    conn.desc.enqueue_write(bytes, core.poll.registry())?;
                } else {
                    conn.held_writes.push(bytes);
                }
                conn.replies.push_back(PendingReply {
                    shape: current.plan.shape,
                    relay: current.plan.reply_source == Some(target_id),
                    remaining: current.plan.shape.expected_terminals(),
                });
                self.outstanding += 1;
                Ok(())
            }
            // Retrying through the waiter queue is not attempted; a
            // capped target during recovery surfaces the failure.
            AcquireOutcome::Wait => Err(PoolError::LimitReached { target: target_id }.into()),
            AcquireOutcome::Failed(e) => Err(e),
        }
    }

    fn surface_failure(
        &mut self,
        core: &mut WorkerCore,
        target_id: TargetId,
        _owed: u32,
    ) -> SessionVerdict {
        let err = SessionError::BackendLost {
            session: self.id,
            target: target_id,
        };
        if self.send_error(core, &err.to_string()).is_err() {
            return SessionVerdict::Close;
        }
        if self.outstanding == 0 {
            self.current = None;
            self.retried = false;
        }
        if self.backends.is_empty() && self.current.is_some() {
            // Lost the last backend mid-statement.
            self.current = None;
            self.state = SessionState::Draining;
            return SessionVerdict::Close;
        }
        SessionVerdict::Keep
    }

    // ── Waiter resumption ───────────────────────────────────────────────

    /// Give this session's suspended statement one chance to proceed.
    pub fn continue_connecting(&mut self, core: &mut WorkerCore) -> ContinueOutcome {
        let Some(susp) = self.suspended.take() else {
            return ContinueOutcome::Fail;
        };
        let waited_target = susp.plan.targets[susp.next_target];
        match self.dispatch_statement(
            core,
            susp.packet,
            susp.plan,
            susp.next_target,
            Some(waited_target),
        ) {
            Ok(DispatchOutcome::Dispatched) => ContinueOutcome::Success,
            Ok(DispatchOutcome::Suspended) => {
                let still_same = self
                    .suspended
                    .as_ref()
                    .map(|s| s.plan.targets[s.next_target] == waited_target)
                    .unwrap_or(false);
                if still_same {
                    ContinueOutcome::Wait
                } else {
                    // Advanced past the waited target; a new waiter was
                    // registered for a later one.
                    ContinueOutcome::Success
                }
            }
            Ok(DispatchOutcome::Failed) | Err(_) => ContinueOutcome::Fail,
        }
    }

    /// The multiplex timeout expired while waiting for a slot: fail the
    /// statement, keep the session.
    pub fn fail_waiting_statement(&mut self, core: &mut WorkerCore, target_id: TargetId) {
        if self.suspended.take().is_some() {
            debug!(session = %self.id, target = %target_id, "waiter timed out");
            let err = SessionError::MultiplexTimeout {
                session: self.id,
                target: target_id,
            };
            let _ = self.send_error(core, &err.to_string());
        }
    }

    // ── Maintenance ─────────────────────────────────────────────────────

    /// Once-per-second sweep: idle timeout, statement timeout, multiplex
    /// idle pooling, activity decay.
    pub fn tick(&mut self, now: Instant, limits: &SessionLimits) -> TickVerdict {
        self.io_activity /= 2;
        if self.kill_requested {
            return TickVerdict::Kill("kill requested");
        }
        if let Some(current) = &self.current {
            if !limits.statement_timeout.is_zero()
                && now.saturating_duration_since(current.started) > limits.statement_timeout
            {
                return TickVerdict::Kill("statement timeout");
            }
        }
        let idle = self.client.idle_for(now);
        if !limits.idle_timeout.is_zero() && idle > limits.idle_timeout {
            return TickVerdict::Kill("idle timeout");
        }
        if let Some(pool_after) = limits.multiplex_idle {
            if !pool_after.is_zero()
                && idle >= pool_after
                && self.outstanding == 0
                && self.backends.values().any(|b| b.is_idle())
            {
                return TickVerdict::ReleaseIdle;
            }
        }
        TickVerdict::Keep
    }

    /// Detach idle backends and hand them to the pool (or close them).
    pub fn release_idle_backends(&mut self, core: &mut WorkerCore) {
        let idle: Vec<TargetId> = self
            .backends
            .iter()
            .filter(|(_, conn)| conn.is_idle())
            .map(|(&t, _)| t)
            .collect();
        for target_id in idle {
            let conn = self.backends.remove(&target_id).expect("just listed");
            core.release_backend(conn);
        }
    }

    // ── Predicates & helpers ────────────────────────────────────────────

    /// A session is movable iff no in-flight work and every backend is in
    /// a clean per-connection state.
    pub fn is_movable(&self) -> bool {
        self.state == SessionState::Routing
            && !self.kill_requested
            && self.current.is_none()
            && self.suspended.is_none()
            && self.outstanding == 0
            && self
                .backends
                .values()
                .all(|b| b.codec.established() && b.codec.is_safe_to_reuse())
    }

    /// Whether this session is still waiting on a connection slot.
    pub fn is_awaiting_connection(&self) -> bool {
        self.suspended.is_some()
    }

    /// Target the suspended statement waits on, if any.
    pub fn awaited_target(&self) -> Option<TargetId> {
        self.suspended
            .as_ref()
            .map(|s| s.plan.targets[s.next_target])
    }

    pub fn send_to_client(&mut self, core: &mut WorkerCore, bytes: Bytes) -> Result<(), ShuntError> {
        core.stats.n_writes += 1;
        self.client
            .enqueue_write(bytes, core.poll.registry())
            .map_err(|e| {
                core.stats.n_errors += 1;
                e.into()
            })
    }

    fn send_error(&mut self, core: &mut WorkerCore, message: &str) -> Result<(), ShuntError> {
        let packet = self.codec.error_packet(message);
        self.send_to_client(core, packet)
    }

    /// Approximate heap footprint for the memory report.
    pub fn memory_bytes(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.client.buffered_bytes()
            + self
                .backends
                .values()
                .map(|b| b.desc.buffered_bytes())
                .sum::<usize>()
    }
}
