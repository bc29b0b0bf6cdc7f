//! Fixed worker-thread pool for cancellable blocking subtasks: reverse-DNS lookups
//! today, anything else self-contained and blocking tomorrow.

pub mod job;
pub mod pool;
pub mod resolver;

pub use job::canceled;
pub use pool::{OnFinished, PoolError, WorkerPool, DEFAULT_POOL_SIZE, DEFAULT_QUEUE_SIZE};
pub use resolver::PoolResolver;
