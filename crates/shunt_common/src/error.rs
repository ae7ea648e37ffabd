use thiserror::Error;

use crate::types::{SessionId, TargetId};

/// Convenience alias for `Result<T, ShuntError>`.
pub type ShuntResult<T> = Result<T, ShuntError>;

/// Classification of a backend-side failure for retry decisions.
///
/// - `Transient` — network hiccup, auth rejection, server restart; the
///   session may retry silently outside an open transaction.
/// - `Permanent` — wire-protocol violation, unauthorized, schema missing;
///   surfaced to the client immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    Transient,
    Permanent,
}

/// Top-level error type that all layer-specific errors convert into.
#[derive(Error, Debug)]
pub enum ShuntError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Routing error: {0}")]
    Route(#[from] RouteError),

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ShuntError {
    /// Collapse into the retry classification. Anything that is not an
    /// obvious network-level hiccup is treated as permanent.
    pub fn failure(&self) -> Failure {
        match self {
            ShuntError::Io(e) => match e.kind() {
                std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::TimedOut => Failure::Transient,
                _ => Failure::Permanent,
            },
            ShuntError::Pool(PoolError::LimitReached { .. }) => Failure::Transient,
            _ => Failure::Permanent,
        }
    }
}

/// Errors raised while validating the programmatic configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("worker_count must be at least 1")]
    NoWorkers,

    #[error("loop_tick must be non-zero")]
    ZeroTick,

    #[error("rebalance_threshold must be at most 100, got {0}")]
    ThresholdOutOfRange(u32),

    #[error("listener address '{0}' is invalid: {1}")]
    BadListenAddr(String, String),

    #[error("target '{0}' is registered twice")]
    DuplicateTarget(String),
}

/// Wire-protocol layer errors, produced by client and backend codecs.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("malformed client packet: {0}")]
    MalformedClient(String),

    #[error("malformed backend packet: {0}")]
    MalformedBackend(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("unexpected message from backend: {0}")]
    Unexpected(String),

    #[error("packet exceeds protocol ceiling: {size} > {limit}")]
    PacketTooLarge { size: usize, limit: usize },
}

/// Router policy errors; surfaced to clients as a distinct protocol error.
#[derive(Error, Debug)]
pub enum RouteError {
    #[error("no target available: {0}")]
    NoTarget(String),

    #[error("statement rejected by router: {0}")]
    Rejected(String),
}

/// Connection pool and admission errors.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("connection limit reached for target {target}")]
    LimitReached { target: TargetId },

    #[error("waiter queue full for target {target}")]
    WaitersFull { target: TargetId },

    #[error("target {target} is down")]
    TargetDown { target: TargetId },

    #[error("unknown target {target}")]
    UnknownTarget { target: TargetId },
}

/// Session lifecycle errors.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("session {session} lost its last backend for target {target}")]
    BackendLost {
        session: SessionId,
        target: TargetId,
    },

    #[error("session {session} timed out waiting for a connection to target {target}")]
    MultiplexTimeout {
        session: SessionId,
        target: TargetId,
    },

    #[error("session {session} was killed")]
    Killed { session: SessionId },

    #[error("session {0} not found")]
    NotFound(SessionId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_failure_classification() {
        let e: ShuntError =
            std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset").into();
        assert_eq!(e.failure(), Failure::Transient);

        let e: ShuntError =
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied").into();
        assert_eq!(e.failure(), Failure::Permanent);
    }

    #[test]
    fn test_pool_limit_is_transient() {
        let e: ShuntError = PoolError::LimitReached {
            target: TargetId(3),
        }
        .into();
        assert_eq!(e.failure(), Failure::Transient);
    }

    #[test]
    fn test_protocol_error_is_permanent() {
        let e: ShuntError = ProtocolError::MalformedClient("bad header".into()).into();
        assert_eq!(e.failure(), Failure::Permanent);
    }

    #[test]
    fn test_error_display_carries_context() {
        let e = SessionError::BackendLost {
            session: SessionId(7),
            target: TargetId(2),
        };
        let msg = e.to_string();
        assert!(msg.contains('7') && msg.contains('2'), "{msg}");
    }
}
