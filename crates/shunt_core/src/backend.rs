//! One backend connection: descriptor, codec and reply bookkeeping.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;

use shunt_protocol::{BackendCodec, ReplyShape, SessionProfile};

use crate::descriptor::Descriptor;
use crate::target::Target;

/// Tracking entry for one dispatched statement on one backend.
#[derive(Debug)]
pub struct PendingReply {
    pub shape: ReplyShape,
    /// Whether this backend's reply is relayed to the client.
    pub relay: bool,
    /// Terminal markers still expected.
    pub remaining: u32,
}

/// A live connection to a backend target. While linked to a session the
/// session drives it; while idle it lives in the worker's pool.
pub struct BackendConn {
    pub target: Arc<Target>,
    pub desc: Descriptor,
    pub codec: Box<dyn BackendCodec>,
    /// Session-neutral state the connection currently serves. Snapshotted
    /// into the pool entry so reuse can answer "can I serve session X?".
    pub profile: SessionProfile,
    /// Expected replies, oldest first.
    pub replies: VecDeque<PendingReply>,
    /// Statements serialized before the handshake completed, flushed in
    /// order once the backend is established.
    pub held_writes: Vec<Bytes>,
    pub created: Instant,
}

impl BackendConn {
    pub fn new(
        target: Arc<Target>,
        desc: Descriptor,
        codec: Box<dyn BackendCodec>,
        profile: SessionProfile,
    ) -> Self {
        Self {
            target,
            desc,
            codec,
            profile,
            replies: VecDeque::new(),
            held_writes: Vec::new(),
            created: Instant::now(),
        }
    }

    /// True when nothing is in flight and the protocol state is clean.
    pub fn is_idle(&self) -> bool {
        self.replies.is_empty() && self.codec.established() && self.codec.is_safe_to_reuse()
    }

    /// Whether tearing this connection down now is safe: the handshake
    /// finished and no reply is owed.
    pub fn can_close(&self) -> bool {
        self.codec.established() && self.replies.is_empty()
    }

    /// The zombie sweep's close predicate: safe, or idle past the grace
    /// window (a backend stuck mid-handshake is not waited on forever).
    pub fn safe_to_close(&self, grace: Duration, now: Instant) -> bool {
        self.can_close() || self.desc.idle_for(now) > grace
    }
}
