//! `Gather<T>` and the `Scatter`/`TryScatter` worker body.

use std::future::Future;
use std::sync::Arc;

use tracing::{trace, warn};

use crate::backpressure::Backpressure;
use crate::context::{CancelToken, Scope};
use crate::error::PsgError;
use crate::job::{BoxFuture, BoundGather, Job};
use crate::state::Stage;
use crate::task_pool::TaskPool;

/// A type-erased, thread-safe `GatherFunc<T>`.
pub(crate) type GatherFn<T> =
    dyn Fn(CancelToken, Scope, Result<T, anyhow::Error>) -> BoxFuture<anyhow::Result<()>> + Send + Sync;

/// Binds a `GatherFunc<T>` that a `TaskFunc<T>`'s result is delivered to.
///
/// `Gather<T>` itself is not bound to a job; the binding happens per call to
/// [`Self::scatter`]/[`Self::try_scatter`], taken from the `TaskPool`
/// passed in.
#[derive(Clone)]
pub struct Gather<T> {
    func: Arc<GatherFn<T>>,
}

impl<T> Gather<T>
where
    T: Send + 'static,
{
    /// Wraps `f` as this gather's callback. Invoked with the gather
    /// caller's own context/scope, the task's value, and its error (if
    /// any).
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(CancelToken, Scope, Result<T, anyhow::Error>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            func: Arc::new(move |ctx, scope, result| {
                Box::pin(f(ctx, scope, result)) as BoxFuture<anyhow::Result<()>>
            }),
        }
    }

    /// Scatters `task` into `pool`, blocking (cooperatively draining the
    /// job's gather channel) until the pool admits it.
    ///
    /// # Panics
    /// Panics if `scope` already marks `pool`'s job (recursive scatter), or
    /// if the job is already `Done`.
    pub async fn scatter<F, Fut>(
        &self,
        ctx: &CancelToken,
        scope: &Scope,
        pool: &Arc<TaskPool>,
        task: F,
    ) -> anyhow::Result<()>
    where
        F: FnOnce(CancelToken, Scope) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, anyhow::Error>> + Send + 'static,
    {
        let bp = Backpressure::for_job(pool.job());
        scatter_impl(Arc::clone(&self.func), ctx, scope, &bp, pool, task, true)
            .await
            .map(|_| ())
    }

    /// Non-blocking variant: returns `Ok(false)` immediately instead of
    /// waiting if `pool` is at capacity.
    ///
    /// # Panics
    /// Same as [`Self::scatter`].
    pub async fn try_scatter<F, Fut>(
        &self,
        ctx: &CancelToken,
        scope: &Scope,
        pool: &Arc<TaskPool>,
        task: F,
    ) -> anyhow::Result<bool>
    where
        F: FnOnce(CancelToken, Scope) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, anyhow::Error>> + Send + 'static,
    {
        let bp = Backpressure::for_job(pool.job());
        scatter_impl(Arc::clone(&self.func), ctx, scope, &bp, pool, task, false).await
    }

    /// Returns the underlying callback, for binding into a derived `Gather`
    /// (used by `Combine::new` to route emitted outputs).
    pub(crate) fn func_handle(&self) -> Arc<GatherFn<T>> {
        Arc::clone(&self.func)
    }
}

pub(crate) async fn scatter_impl<T, F, Fut>(
    gather: Arc<GatherFn<T>>,
    ctx: &CancelToken,
    scope: &Scope,
    bp: &Backpressure,
    pool: &Arc<TaskPool>,
    task: F,
    blocking: bool,
) -> anyhow::Result<bool>
where
    T: Send + 'static,
    F: FnOnce(CancelToken, Scope) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, anyhow::Error>> + Send + 'static,
{
    let job = Arc::clone(pool.job());
    if scope.contains(job.id()) {
        panic!("psg: recursive scatter into the job of the currently running task");
    }
    if job.stage() == Stage::Done {
        panic!("psg: scatter into a Done job");
    }

    // Yield-before-scatter: up to 2 cooperative, non-blocking drains.
    for _ in 0..2 {
        match bp.yield_once(ctx, scope).await {
            Ok(true) => continue,
            _ => break,
        }
    }

    job.state.increment_tasks();

    let task_scope = scope.child_of(job.id());
    let task_ctx = job.cancel_token();
    let gather_for_worker = Arc::clone(&gather);
    let job_for_worker = Arc::clone(&job);
    let pool_for_worker = Arc::clone(pool);
    let outer_ctx = ctx.clone();

    let worker = Box::pin(run_worker(
        job_for_worker,
        pool_for_worker,
        outer_ctx,
        task_ctx,
        task_scope,
        gather_for_worker,
        task,
    ));

    let backpressure_for_launch = blocking.then_some(bp);
    match pool.launch(ctx, scope, backpressure_for_launch, worker).await {
        Ok(true) => Ok(true),
        Ok(false) => {
            job.state.decrement_tasks();
            Ok(false)
        }
        Err(e) => {
            job.state.decrement_tasks();
            Err(e)
        }
    }
}

async fn run_worker<T, F, Fut>(
    job: Arc<Job>,
    pool: Arc<TaskPool>,
    caller_ctx: CancelToken,
    task_ctx: CancelToken,
    task_scope: Scope,
    gather: Arc<GatherFn<T>>,
    task: F,
) where
    T: Send + 'static,
    F: FnOnce(CancelToken, Scope) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, anyhow::Error>> + Send + 'static,
{
    let result: Result<T, anyhow::Error> = if caller_ctx.is_cancelled() || task_ctx.is_cancelled() {
        Err(PsgError::Canceled.into())
    } else {
        let ctx_for_task = task_ctx.clone();
        let scope_for_task = task_scope.clone();
        match tokio::spawn(async move { task(ctx_for_task, scope_for_task).await }).await {
            Ok(r) => r,
            Err(join_err) => {
                warn!(error = %join_err, "psg: task panicked");
                Err(PsgError::TaskPanicked.into())
            }
        }
    };

    pool.decrement_and_notify();
    trace!("psg: task completed, posting result to gather channel");

    job.state.move_task_to_gather();
    let bound: BoundGather = Box::new(move |ctx, scope| {
        Box::pin(async move { (gather)(ctx, scope, result).await })
    });
    job.gather_channel_send(bound);
}
