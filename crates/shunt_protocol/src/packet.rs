use bytes::Bytes;

/// One logical wire packet, framed by a codec and opaque to the core.
///
/// The core forwards the payload verbatim; only the codec that produced
/// it may interpret the bytes.
#[derive(Debug, Clone)]
pub struct Packet {
    pub payload: Bytes,
}

impl Packet {
    pub fn new(payload: Bytes) -> Self {
        Self { payload }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Coarse statement category the core needs for dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    /// A routable statement that produces backend replies.
    Query,
    /// A session-scoped command that must reach every linked backend.
    Command,
    /// Traffic the proxy swallows (e.g. protocol pings answered by the
    /// codec itself).
    Ignorable,
}

/// Result of classifying one client packet. Synchronous, no I/O.
#[derive(Debug, Clone)]
pub struct Classification {
    pub kind: StatementKind,
    /// Canonical statement text: literals stripped, whitespace
    /// normalized. Used as the parsed-statement cache key.
    pub fingerprint: String,
    /// Whether the statement may modify backend state.
    pub is_write: bool,
    /// Whether the statement mutates connection-scoped state (e.g.
    /// autocommit toggles). Such statements are excluded from the cache.
    pub touches_session_state: bool,
}

impl Classification {
    /// A classification for traffic the proxy consumes itself.
    pub fn ignorable() -> Self {
        Self {
            kind: StatementKind::Ignorable,
            fingerprint: String::new(),
            is_write: false,
            touches_session_state: false,
        }
    }
}
