//! Per-worker session registry and the zombie lists.
//!
//! Closure is two-phase: descriptors requested closed are parked here
//! and destroyed at the end of a later loop turn, never while a handler
//! may still reference them.

use std::collections::HashMap;
use std::time::Instant;

use shunt_common::types::SessionId;

use crate::backend::BackendConn;
use crate::descriptor::Descriptor;
use crate::session::Session;

/// Sessions owned by one worker, keyed by session id.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: HashMap<SessionId, Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, session: Session) {
        self.sessions.insert(session.id, session);
    }

    /// Temporarily remove a session for dispatch; the caller puts it
    /// back unless the session closed.
    pub fn take(&mut self, id: SessionId) -> Option<Session> {
        self.sessions.remove(&id)
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    /// Approximate heap footprint of all sessions, for memory reports.
    pub fn memory_bytes(&self) -> usize {
        self.sessions.values().map(|s| s.memory_bytes()).sum()
    }
}

/// A bare descriptor pending destruction (e.g. a failed backend).
pub struct ZombieDesc {
    pub desc: Descriptor,
    pub parked_at: Instant,
    pub reason: &'static str,
}

/// A closed session whose client descriptor waits for its backends to
/// become safe to tear down (or for the grace window to expire).
pub struct DyingSession {
    pub id: SessionId,
    pub client: Descriptor,
    pub backends: Vec<BackendConn>,
    pub parked_at: Instant,
    /// How many sweeps re-parked this zombie, with the last reason.
    pub reparks: u32,
    pub repark_reason: &'static str,
}
