//! The thread-per-core routing and connection-multiplexing engine of
//! the shunt database proxy.
//!
//! A fixed pool of workers each drives a readiness-based event loop over
//! the client and backend descriptors it owns. Sessions are per-client
//! state machines that consult an external protocol codec and router
//! policy (see `shunt_protocol`); parse results are cached per worker
//! and idle backend connections are pooled per worker with capacity
//! sharing and a waiter queue. A coordination plane handles broadcast,
//! load-aware session migration and graceful shutdown.

pub mod backend;
pub mod cache;
pub mod coordinator;
pub mod descriptor;
pub mod listener;
pub mod pool;
pub mod registry;
pub mod session;
pub mod stats;
pub mod target;
pub mod worker;

pub use cache::{CacheEntrySnapshot, CacheStats, StatementCache};
pub use coordinator::{balance_decision, AssignPolicy, Runtime, RuntimeBuilder};
pub use pool::{ContinueOutcome, Endpoint, PoolStats};
pub use session::{Session, SessionState};
pub use stats::{AggregateStats, LoadInterval, MemoryUsage, WorkerInfo, WorkerStats};
pub use target::{Target, TargetSpec};
pub use worker::{current_worker_id, Worker, WorkerHandle};
