//! Shared foundation for the shunt proxy core: id types, error taxonomy,
//! programmatic configuration, byte queues and the small blocking
//! primitives (shutdown signal, counting semaphore) the runtime is built on.

pub mod buffer;
pub mod config;
pub mod error;
pub mod semaphore;
pub mod shutdown;
pub mod types;

pub use error::{Failure, ShuntError, ShuntResult};
