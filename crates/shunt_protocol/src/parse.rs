use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// An immutable parse result produced by an external parser backend.
///
/// The core never inspects the contents; it only accounts the size and
/// hands out shared references.
pub trait ParseInfo: Send + Sync {
    /// Accounted payload size in bytes, used for cache budgeting.
    fn size_bytes(&self) -> usize;

    /// Downcast hook for the router/codec that produced the result.
    fn as_any(&self) -> &dyn std::any::Any;
}

/// Shared handle to a parse result. Lookups hand out clones of this,
/// never copies of the underlying object.
pub type SharedParse = Arc<dyn ParseInfo>;

/// SQL dialect mode in effect when a statement was parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SqlDialect {
    #[default]
    Default,
    Ansi,
    Oracle,
}

/// Version tag for cached parse results: a result is only valid for the
/// dialect and parser options it was produced under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct VersionTag {
    pub dialect: SqlDialect,
    pub options: u32,
}

impl VersionTag {
    pub fn new(dialect: SqlDialect, options: u32) -> Self {
        Self { dialect, options }
    }
}
