//! The codec and router capability sets the core dispatches into.
//!
//! These are the only cross-boundary calls: codecs and routers never
//! touch descriptors, worker state or the pool directly.

use bytes::Bytes;

use shunt_common::buffer::ReadQueue;
use shunt_common::error::{Failure, ProtocolError, RouteError};
use shunt_common::types::TargetId;

use crate::packet::{Classification, Packet};
use crate::parse::SharedParse;
use crate::plan::{Recovery, ReplyShape, ReplyStep, RoutePlan};

/// Progress of an authentication exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthProgress {
    /// More round trips needed.
    InProgress,
    /// The exchange completed successfully.
    Done,
    /// The peer failed authentication.
    Failed(String),
}

/// How well an idle pooled connection matches a session's requirements.
///
/// Ordered: `NotPossible < Score(0) < Score(n) < Optimal`. `Optimal`
/// short-circuits the pool's candidate search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReuseScore {
    NotPossible,
    Score(u32),
    Optimal,
}

impl ReuseScore {
    fn rank(&self) -> u64 {
        match self {
            ReuseScore::NotPossible => 0,
            ReuseScore::Score(n) => 1 + *n as u64,
            ReuseScore::Optimal => u64::MAX,
        }
    }
}

impl PartialOrd for ReuseScore {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReuseScore {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rank().cmp(&other.rank())
    }
}

/// Session-neutral state a backend connection must be able to serve:
/// who the client authenticated as and which connection attributes are
/// in effect. Pool entries snapshot this for reuse scoring.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionProfile {
    pub user: String,
    pub database: String,
    /// Protocol-specific attributes (charset, session variables, ...).
    pub attributes: Vec<(String, String)>,
}

/// Client-side protocol codec: frames and classifies traffic from one
/// client connection.
pub trait ClientCodec: Send {
    /// Greeting to send immediately after accept, for server-first
    /// protocols. `None` for client-first protocols.
    fn greeting(&mut self) -> Option<Bytes>;

    /// Drive the authentication exchange with buffered client bytes.
    /// Returns the progress and an optional reply to send.
    fn advance_auth(
        &mut self,
        input: &mut ReadQueue,
    ) -> Result<(AuthProgress, Option<Bytes>), ProtocolError>;

    /// Frame one complete logical packet, or `None` if more bytes are
    /// needed. Must not consume a partial packet.
    fn next_packet(&mut self, input: &mut ReadQueue) -> Result<Option<Packet>, ProtocolError>;

    /// Classify a framed packet. Synchronous, no I/O.
    fn classify(&mut self, packet: &Packet) -> Classification;

    /// Produce the shared parse result for a cache miss.
    fn parse(&mut self, fingerprint: &str) -> SharedParse;

    /// The session-neutral profile used for pool reuse scoring.
    fn profile(&self) -> SessionProfile;

    /// A protocol-flavored error packet the core relays to the client.
    fn error_packet(&self, message: &str) -> Bytes;
}

/// Backend-side protocol codec: drives one backend connection's
/// handshake, statement serialization and reply consumption.
pub trait BackendCodec: Send {
    /// First bytes to send on a fresh connection, for client-first
    /// handshakes. `None` for server-first protocols.
    fn connect_greeting(&mut self) -> Option<Bytes>;

    /// Drive the backend authentication exchange.
    fn advance_auth(
        &mut self,
        input: &mut ReadQueue,
    ) -> Result<(AuthProgress, Option<Bytes>), ProtocolError>;

    /// True once the handshake has completed.
    fn established(&self) -> bool;

    /// Wire bytes for one routed statement. `transform` replaces the
    /// client payload when the router rewrote the statement.
    fn serialize_statement(&mut self, packet: &Packet, transform: Option<&Bytes>) -> Bytes;

    /// Consume buffered backend bytes toward the front expected reply.
    /// Returns `None` when more bytes are needed.
    fn on_reply(
        &mut self,
        input: &mut ReadQueue,
        shape: ReplyShape,
    ) -> Result<Option<ReplyStep>, ProtocolError>;

    /// True when the connection is in a clean, session-neutral state
    /// (no open transaction, no result mid-flight).
    fn is_safe_to_reuse(&self) -> bool;

    /// True while a transaction is open on this connection.
    fn in_transaction(&self) -> bool;

    /// Score this idle connection against a session's profile.
    fn reuse_score(&self, profile: &SessionProfile) -> ReuseScore;

    /// Bytes to send when parking the connection in the pool, if the
    /// protocol needs a reset exchange.
    fn reset_for_pooling(&mut self) -> Option<Bytes>;

    /// Re-target a pooled connection at a new session's profile.
    /// Returns `false` when the connection cannot serve the profile
    /// after all; the pool then closes it and tries another candidate.
    fn adopt(&mut self, profile: &SessionProfile) -> bool;

    /// Classify a backend error for the retry decision.
    fn classify_failure(&self, error: &ProtocolError) -> Failure;
}

/// Per-session router policy: decides targets and recovery.
pub trait RouterPolicy: Send {
    /// Plan the routing of one classified statement.
    fn on_statement(
        &mut self,
        class: &Classification,
        parse: Option<&SharedParse>,
    ) -> Result<RoutePlan, RouteError>;

    /// Observe reply progress from a backend.
    fn on_reply(&mut self, target: TargetId, terminal: bool);

    /// Decide recovery after a backend failure.
    fn on_failure(&mut self, target: TargetId, failure: Failure) -> Recovery;
}

/// Factory for per-session codec instances.
pub trait ProtocolModule: Send + Sync {
    fn client_codec(&self) -> Box<dyn ClientCodec>;
    fn backend_codec(&self, profile: &SessionProfile) -> Box<dyn BackendCodec>;
}

/// Factory for per-session router policies.
pub trait RouterModule: Send + Sync {
    fn session_policy(&self) -> Box<dyn RouterPolicy>;
}
