#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! A pipelined scatter-gather scheduler.
//!
//! A [`Job`] owns a lifecycle (open, closed, flushing, done), a pool of
//! concurrently running tasks, and a channel of completed task results
//! waiting to be gathered. [`TaskPool`] bounds how many tasks run at once;
//! [`CombinerPool`] lets many task results fold into a shared aggregator
//! before anything is gathered. Cancellation ([`CancelToken`]) and
//! re-entrancy tracking ([`Scope`]) are threaded explicitly rather than
//! smuggled through an ambient context.
//!
//! ```no_run
//! use psg::{CancelToken, Gather, Job, Scope, TaskPool};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let job = Job::new(None);
//! let pool = TaskPool::new(&job, 4);
//! let ctx = CancelToken::new();
//! let scope = Scope::root();
//!
//! let gather = Gather::new(|_ctx, _scope, result: Result<i32, anyhow::Error>| async move {
//!     println!("got {:?}", result);
//!     Ok(())
//! });
//!
//! gather.scatter(&ctx, &scope, &pool, |_ctx, _scope| async { Ok(1) }).await?;
//! job.close_and_gather_all(&ctx, &scope).await?;
//! # Ok(())
//! # }
//! ```

mod backpressure;
mod combine;
mod combiner_pool;
mod context;
mod error;
mod job;
mod scatter;
mod state;
mod task_pool;

pub use combine::{Combine, Combiner, Emit};
pub use combiner_pool::{CombineId, CombinerPool};
pub use context::{CancelToken, JobId, Scope};
pub use error::PsgError;
pub use job::Job;
pub use scatter::Gather;
pub use state::{InFlightSnapshot, Stage};
pub use task_pool::TaskPool;
