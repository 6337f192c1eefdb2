//! The backpressure-provider abstraction.
//!
//! A blocked `Scatter` needs some way to make cooperative progress while it
//! waits for pool capacity, rather than just parking. `Backpressure` binds
//! that to one job's gather channel: draining one pending gather frees up
//! whatever downstream capacity depends on it being processed.

use std::sync::Arc;

use psg_core::waiter::Waiter;
use tokio::sync::watch;

use crate::context::{CancelToken, Scope};
use crate::error::PsgError;
use crate::job::Job;

/// The backpressure provider a blocked `Scatter` cooperatively drains
/// through while waiting for pool capacity.
#[derive(Clone)]
pub struct Backpressure {
    job: Arc<Job>,
}

impl Backpressure {
    /// A `Backpressure` bound to `job`'s own gather channel.
    pub fn for_job(job: &Arc<Job>) -> Self {
        Backpressure { job: Arc::clone(job) }
    }

    fn job(&self) -> &Arc<Job> {
        &self.job
    }

    /// Non-blocking attempt to execute one unit of pending gather work.
    /// Returns whether it made progress.
    pub(crate) async fn yield_once(&self, ctx: &CancelToken, scope: &Scope) -> anyhow::Result<bool> {
        self.job().try_drain_one_internal(ctx, scope).await
    }

    /// Blocks until one unit of progress is possible: either this pool's
    /// waiter is notified, its limit changes, or a pending gather is
    /// drained.
    pub(crate) async fn block(
        &self,
        ctx: &CancelToken,
        scope: &Scope,
        waiter: &Arc<Waiter>,
        limit_rx: &mut watch::Receiver<i64>,
    ) -> anyhow::Result<()> {
        let job = self.job();
        tokio::select! {
            _ = waiter.wait() => Ok(()),
            _ = limit_rx.changed() => Ok(()),
            _ = ctx.cancelled() => Err(PsgError::Canceled.into()),
            _ = job.cancel.cancelled() => Err(PsgError::Canceled.into()),
            result = job.drain_one_blocking_internal(ctx, scope) => result,
        }
    }
}
