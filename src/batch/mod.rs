//! Batch scheduling: buffer operations, order them by priority and
//! dependencies, and emit them as one compound request.

pub mod ordering;
pub mod scheduler;

pub use ordering::{order_operations, Operation};
pub use scheduler::{Batch, BatchScheduler, SchedulerSettings, SchedulerStats};
