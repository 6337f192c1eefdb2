#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Low-level primitives shared by the `psg` pipelined scatter-gather scheduler.
//!
//! Nothing in this crate knows about jobs, tasks, or gathers: it only provides
//! the atomic/lock-free building blocks `psg` assembles into the scheduler.

/// Composite packed-pair atomic counter (the job's tasks/gathers counter).
pub mod counter;
/// Atomic cell paired with a change signal (`DynamicValue<T>`).
pub mod dynamic;
/// Unbounded MPMC queue wrapper used by the waiter queues.
pub mod queue;
/// Reusable timer checkout pool.
pub mod timer_pool;
/// One-slot waiter signaling object and its FIFO queue.
pub mod waiter;
