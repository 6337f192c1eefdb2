//! Concurrency-limited task admission.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use psg_core::dynamic::DynamicValue;
use psg_core::waiter::WaiterQueue;
use tracing::trace;

use crate::backpressure::Backpressure;
use crate::context::{CancelToken, Scope};
use crate::error::PsgError;
use crate::job::{BoxFuture, Job};
use crate::state::Stage;

/// A concurrency-limited admission gate bound to one [`Job`].
///
/// `limit < 0` admits without bound, `limit == 0` admits nothing, `limit >
/// 0` admits up to `limit` concurrently running tasks.
pub struct TaskPool {
    job: Arc<Job>,
    limit: DynamicValue<i64>,
    in_flight: AtomicU32,
    waiters: WaiterQueue,
}

impl TaskPool {
    /// Creates a pool bound to `job` with the given initial `limit`.
    ///
    /// # Panics
    /// Panics if `job` has already reached `Done`.
    pub fn new(job: &Arc<Job>, limit: i64) -> Arc<Self> {
        if job.stage() == Stage::Done {
            panic!("psg: NewTaskPool called on a Done job");
        }
        Arc::new(Self {
            job: Arc::clone(job),
            limit: DynamicValue::new(limit),
            in_flight: AtomicU32::new(0),
            waiters: WaiterQueue::new(),
        })
    }

    /// The job this pool is bound to.
    pub fn job(&self) -> &Arc<Job> {
        &self.job
    }

    /// Replaces the concurrency limit. Thread-safe; wakes any scatter
    /// currently blocked waiting for capacity so it can re-evaluate.
    pub fn set_limit(&self, limit: i64) {
        self.limit.store(limit);
    }

    fn increment_if_under(&self, limit: i64) -> bool {
        loop {
            let cur = self.in_flight.load(Ordering::SeqCst);
            if limit >= 0 && cur as i64 >= limit {
                return false;
            }
            if self
                .in_flight
                .compare_exchange(cur, cur + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
        }
    }

    fn decrement_and_check_under(&self, limit: i64) -> bool {
        let prev = self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let now = prev - 1;
        limit < 0 || (now as i64) < limit
    }

    pub(crate) fn decrement_and_notify(&self) {
        let limit = self.limit.get();
        if self.decrement_and_check_under(limit) {
            self.waiters.notify();
        }
    }

    /// Admits one unit of concurrency and spawns `worker` as a job-tracked
    /// task, blocking (cooperatively, via `backpressure`) until capacity is
    /// available if the pool is currently full.
    ///
    /// Returns `Ok(true)` once admitted and spawned. With no backpressure
    /// provider, returns `Ok(false)` immediately instead of blocking (the
    /// `Try*` path).
    pub(crate) async fn launch(
        self: &Arc<Self>,
        ctx: &CancelToken,
        scope: &Scope,
        backpressure: Option<&Backpressure>,
        worker: BoxFuture<()>,
    ) -> anyhow::Result<bool> {
        if ctx.is_cancelled() || self.job.cancel.is_cancelled() {
            return Err(PsgError::Canceled.into());
        }

        if self.increment_if_under(self.limit.get()) {
            self.job.spawn_worker(worker).await;
            return Ok(true);
        }

        let Some(bp) = backpressure else {
            return Ok(false);
        };

        loop {
            let waiter = self.waiters.push();
            let (limit, mut limit_rx) = self.limit.load();
            if self.increment_if_under(limit) {
                waiter.close();
                self.job.spawn_worker(worker).await;
                return Ok(true);
            }

            let outcome = tokio::select! {
                _ = ctx.cancelled() => { waiter.close(); Err(PsgError::Canceled.into()) }
                _ = self.job.cancel.cancelled() => { waiter.close(); Err(PsgError::Canceled.into()) }
                r = bp.block(ctx, scope, &waiter, &mut limit_rx) => { waiter.close(); r }
            };
            outcome?;
            trace!("psg: task pool re-checking admission after backpressure wakeup");
        }
    }
}
