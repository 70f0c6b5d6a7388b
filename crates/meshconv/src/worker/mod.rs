pub mod pool;

pub use pool::{WorkerContext, WorkerPool, WorkerPoolConfig};
