use bytes::Bytes;

use shunt_common::types::TargetId;

/// How many terminal replies a backend is expected to produce for one
/// routed statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyShape {
    /// Exactly one reply sequence ending in a terminal marker.
    Single,
    /// A fixed number of reply sequences (e.g. multi-statement batches).
    Multi(u32),
    /// The backend sends nothing back for this statement.
    None,
}

impl ReplyShape {
    /// Number of terminal markers to await.
    pub fn expected_terminals(&self) -> u32 {
        match self {
            ReplyShape::Single => 1,
            ReplyShape::Multi(n) => *n,
            ReplyShape::None => 0,
        }
    }
}

/// The router's decision for one classified statement.
#[derive(Debug, Clone)]
pub struct RoutePlan {
    /// Targets the statement is dispatched to, in dispatch order.
    pub targets: Vec<TargetId>,
    /// The target whose reply is relayed to the client. Replies from the
    /// remaining targets are consumed and discarded. `None` means no
    /// reply is relayed at all.
    pub reply_source: Option<TargetId>,
    /// Expected reply shape on every dispatched backend.
    pub shape: ReplyShape,
    /// Replacement payload to send instead of the client's bytes, when
    /// the router rewrites the statement.
    pub transform: Option<Bytes>,
}

impl RoutePlan {
    /// Plan that sends the statement to a single target and relays its
    /// reply.
    pub fn single(target: TargetId) -> Self {
        Self {
            targets: vec![target],
            reply_source: Some(target),
            shape: ReplyShape::Single,
            transform: None,
        }
    }
}

/// One step of reply consumption on a backend connection.
#[derive(Debug, Clone)]
pub struct ReplyStep {
    /// Bytes to splice into the client's write buffer, already framed by
    /// the codec. Empty for suppressed replies.
    pub forward: Option<Bytes>,
    /// True when this step completes one expected reply sequence.
    pub terminal: bool,
}

/// Router's recovery directive after a backend failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Reconnect and replay the in-flight statement once.
    Retry,
    /// Surface a protocol error to the client; the statement is lost.
    Surface,
    /// The session cannot continue; drain and close it.
    Drain,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_plan() {
        let plan = RoutePlan::single(TargetId(4));
        assert_eq!(plan.targets, vec![TargetId(4)]);
        assert_eq!(plan.reply_source, Some(TargetId(4)));
        assert_eq!(plan.shape.expected_terminals(), 1);
        assert!(plan.transform.is_none());
    }

    #[test]
    fn test_reply_shape_terminals() {
        assert_eq!(ReplyShape::None.expected_terminals(), 0);
        assert_eq!(ReplyShape::Multi(3).expected_terminals(), 3);
    }
}
