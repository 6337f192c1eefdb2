//! The [`Job`] facade: context, gather channel, worker lifetime registry.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use psg_core::queue::MpmcQueue;
use psg_core::timer_pool::TimerPool;
use tokio::sync::{Notify, Mutex as AsyncMutex};
use tokio::task::JoinSet;
use tracing::{trace, warn};

use crate::context::{next_job_id, CancelToken, JobId, Scope};
use crate::error::PsgError;
use crate::state::{JobState, Stage};

/// A boxed, `'static` future, used for type-erased async callbacks
/// (gather/combine closures) that must be stored in a channel.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// A task's result, already bound to its `GatherFunc`, waiting to be driven
/// by a gather caller. Constructing one requires the caller's own
/// `(CancelToken, Scope)`, supplied at `recv` time, not at bind time.
pub(crate) type BoundGather = Box<dyn FnOnce(CancelToken, Scope) -> BoxFuture<anyhow::Result<()>> + Send>;

/// A rendezvous-style MPMC channel of [`BoundGather`]s.
///
/// Built directly on `psg_core`'s queue and `Notify` — an async MPMC channel
/// is exactly a lock-free queue plus a wakeup signal. `tokio::sync::mpsc`
/// was not used here because it only supports a single receiver, and
/// multiple gather callers may race to receive.
struct GatherChannel {
    queue: MpmcQueue<BoundGather>,
    notify: Notify,
}

impl GatherChannel {
    fn new() -> Self {
        Self {
            queue: MpmcQueue::new(),
            notify: Notify::new(),
        }
    }

    fn send(&self, item: BoundGather) {
        self.queue.push(item);
        self.notify.notify_one();
    }

    fn try_recv(&self) -> Option<BoundGather> {
        self.queue.pop()
    }

    async fn recv(&self) -> BoundGather {
        loop {
            let notified = self.notify.notified();
            if let Some(item) = self.queue.pop() {
                return item;
            }
            notified.await;
        }
    }
}

/// The top-level scatter-gather execution environment for a pipeline.
///
/// Owns a derived cancellable context, the composite lifecycle state
/// machine, the gather channel, a waitgroup over every worker it has ever
/// launched, and a pool of reusable timers shared by combiner workers.
pub struct Job {
    id: JobId,
    pub(crate) cancel: CancelToken,
    pub(crate) state: Arc<JobState>,
    gather: GatherChannel,
    pub(crate) timers: Arc<TimerPool>,
    workers: AsyncMutex<JoinSet<()>>,
}

impl Job {
    /// Creates a new job, deriving its cancellation from `parent` if given.
    pub fn new(parent: Option<&CancelToken>) -> Arc<Job> {
        let cancel = match parent {
            Some(p) => p.child(),
            None => CancelToken::new(),
        };
        Arc::new(Job {
            id: next_job_id(),
            cancel,
            state: JobState::new(),
            gather: GatherChannel::new(),
            timers: TimerPool::new(),
            workers: AsyncMutex::new(JoinSet::new()),
        })
    }

    /// This job's opaque identity, used only for `Scope` membership checks.
    pub fn id(&self) -> JobId {
        self.id
    }

    /// This job's cancel token, to derive child tokens for task bodies or
    /// to observe cancellation from outside.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// The job's current lifecycle stage.
    pub fn stage(&self) -> Stage {
        self.state.stage()
    }

    /// Transitions `Open -> Closed` (idempotent); cascades further if no
    /// tasks are in flight.
    pub fn close(&self) {
        self.state.close();
    }

    /// Cancels the job's context. Running tasks observe this through their
    /// derived task context; gather callbacks do not (they run under the
    /// caller's own context).
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancels the job, then awaits every worker this job has ever spawned.
    pub async fn cancel_and_wait(&self) {
        self.cancel();
        let mut workers = self.workers.lock().await;
        while workers.join_next().await.is_some() {}
    }

    pub(crate) async fn spawn_worker(&self, fut: BoxFuture<()>) {
        self.workers.lock().await.spawn(fut);
    }

    pub(crate) fn gather_channel_send(&self, item: BoundGather) {
        self.gather.send(item);
    }

    /// Non-panicking, non-reentrancy-checked single drain, used internally
    /// by the default backpressure provider so a blocked `Scatter` can
    /// cooperatively make progress on its own job's pending gathers.
    pub(crate) async fn try_drain_one_internal(
        &self,
        ctx: &CancelToken,
        scope: &Scope,
    ) -> anyhow::Result<bool> {
        match self.gather.try_recv() {
            Some(item) => {
                execute_gather(&self.state, item(ctx.clone(), scope.clone())).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub(crate) async fn drain_one_blocking_internal(
        &self,
        ctx: &CancelToken,
        scope: &Scope,
    ) -> anyhow::Result<()> {
        let item = self.gather.recv().await;
        execute_gather(&self.state, item(ctx.clone(), scope.clone())).await
    }

    fn check_not_reentrant(&self, scope: &Scope) {
        if scope.contains(self.id) {
            panic!("psg: re-entrant gather from a task belonging to this job");
        }
    }

    /// Receives and runs at most one bound gather, blocking until one is
    /// available, the job reaches `Done` (returns `Ok(false)`), or either
    /// context is canceled.
    ///
    /// # Panics
    /// Panics if `scope` already marks this job (i.e. this is being called
    /// from within one of this job's own tasks).
    pub async fn gather_one(&self, ctx: &CancelToken, scope: &Scope) -> anyhow::Result<bool> {
        self.check_not_reentrant(scope);
        tokio::select! {
            item = self.gather.recv() => {
                execute_gather(&self.state, item(ctx.clone(), scope.clone())).await?;
                Ok(true)
            }
            _ = ctx.cancelled() => Err(PsgError::Canceled.into()),
            _ = self.cancel.cancelled() => Err(PsgError::Canceled.into()),
            _ = self.state.wait_done() => Ok(false),
        }
    }

    /// Non-blocking variant of [`Self::gather_one`]: returns `Ok(false)`
    /// immediately if nothing is pending rather than waiting.
    ///
    /// # Panics
    /// Same as [`Self::gather_one`].
    pub async fn try_gather_one(&self, ctx: &CancelToken, scope: &Scope) -> anyhow::Result<bool> {
        self.check_not_reentrant(scope);
        match self.gather.try_recv() {
            Some(item) => {
                execute_gather(&self.state, item(ctx.clone(), scope.clone())).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Loops [`Self::gather_one`] until the job reaches `Done`.
    ///
    /// # Panics
    /// Same as [`Self::gather_one`].
    pub async fn gather_all(&self, ctx: &CancelToken, scope: &Scope) -> anyhow::Result<()> {
        self.check_not_reentrant(scope);
        loop {
            tokio::select! {
                item = self.gather.recv() => {
                    execute_gather(&self.state, item(ctx.clone(), scope.clone())).await?;
                }
                _ = ctx.cancelled() => return Err(PsgError::Canceled.into()),
                _ = self.cancel.cancelled() => return Err(PsgError::Canceled.into()),
                _ = self.state.wait_done() => return Ok(()),
            }
        }
    }

    /// Loops [`Self::try_gather_one`] until nothing is immediately pending.
    /// Does not wait for `Done`.
    ///
    /// # Panics
    /// Same as [`Self::gather_one`].
    pub async fn try_gather_all(&self, ctx: &CancelToken, scope: &Scope) -> anyhow::Result<()> {
        self.check_not_reentrant(scope);
        loop {
            match self.gather.try_recv() {
                Some(item) => {
                    execute_gather(&self.state, item(ctx.clone(), scope.clone())).await?;
                }
                None => return Ok(()),
            }
        }
    }

    /// `Close()` followed by [`Self::gather_all`].
    pub async fn close_and_gather_all(&self, ctx: &CancelToken, scope: &Scope) -> anyhow::Result<()> {
        self.close();
        self.gather_all(ctx, scope).await
    }
}

/// Runs a bound gather future, decrementing the job's gather counter on
/// every exit path — including a panic unwinding out of `fut`, which is
/// then re-raised to the gather caller unchanged.
pub(crate) async fn execute_gather(
    state: &JobState,
    fut: BoxFuture<anyhow::Result<()>>,
) -> anyhow::Result<()> {
    struct DecrementOnDrop<'a>(&'a JobState);
    impl Drop for DecrementOnDrop<'_> {
        fn drop(&mut self) {
            self.0.decrement_gathers();
        }
    }
    let _guard = DecrementOnDrop(state);
    let result = fut.await;
    if let Err(ref e) = result {
        warn!(error = %e, "psg: gather callback returned an error");
    } else {
        trace!("psg: gather callback completed");
    }
    result
}
