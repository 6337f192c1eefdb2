//! Per-combiner batching: the user-facing `Combine<I,O>` and `Combiner<I,O>`
//! trait, and the emit-to-gather bridge.

use std::any::Any;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::combiner_pool::{CombineEntry, CombineId, CombinerPool, ErasedCombiner};
use crate::context::{CancelToken, Scope};
use crate::error::PsgError;
use crate::job::{BoundGather, Job};
use crate::scatter::{Gather, GatherFn};
use crate::task_pool::TaskPool;
use std::future::Future;
use std::sync::atomic::AtomicU64;

static NEXT_COMBINE_ID: AtomicU64 = AtomicU64::new(1);

/// A user-supplied aggregator: receives inputs one at a time and
/// occasionally emits outputs via [`Emit`].
///
/// One instance exists per `(Combine, CombinerPool worker)` pair — a new
/// instance is lazily constructed (via the factory passed to
/// [`Combine::new`]) the first time a given worker sees this `Combine`'s id,
/// so implementations never need to be `Sync`.
pub trait Combiner<I, O>: Send {
    /// Folds one task result into this combiner's running state, emitting
    /// zero or more outputs as appropriate.
    fn combine(&mut self, ctx: &CancelToken, scope: &Scope, input: Result<I, anyhow::Error>, emit: &Emit<O>);

    /// Emits any buffered, not-yet-emitted state. Called when a hold-time
    /// deadline elapses, when the owning worker is about to exit, or when
    /// the job itself is closed and flushing.
    fn flush(&mut self, ctx: &CancelToken, scope: &Scope, emit: &Emit<O>);
}

/// The sink a [`Combiner`] emits finished outputs through.
///
/// Emitting increments the job's task counter and immediately moves it to
/// the gather counter (the same two-step the ordinary task worker body uses
/// in `scatter.rs`), then posts a bound gather — so an emitted output is
/// indistinguishable, from the gather caller's perspective, from an
/// ordinary task's result.
pub struct Emit<O> {
    job: Arc<Job>,
    gather: Arc<GatherFn<O>>,
}

impl<O> Clone for Emit<O> {
    fn clone(&self) -> Self {
        Self {
            job: Arc::clone(&self.job),
            gather: Arc::clone(&self.gather),
        }
    }
}

impl<O: Send + 'static> Emit<O> {
    /// Emits one output (or error) to this combine's bound `Gather<O>`.
    pub fn emit(&self, ctx: CancelToken, scope: Scope, value: Result<O, anyhow::Error>) {
        self.job.state.increment_tasks();
        self.job.state.move_task_to_gather();
        let gather = Arc::clone(&self.gather);
        let bound: BoundGather =
            Box::new(move |gctx, gscope| Box::pin(async move { (gather)(gctx, gscope, value).await }));
        self.job.gather_channel_send(bound);
    }
}

struct TypedCombiner<I, O, C> {
    inner: C,
    emit: Emit<O>,
    _marker: PhantomData<fn(I)>,
}

impl<I, O, C> ErasedCombiner for TypedCombiner<I, O, C>
where
    I: Send + 'static,
    O: Send + 'static,
    C: Combiner<I, O> + 'static,
{
    fn combine(&mut self, ctx: &CancelToken, scope: &Scope, input: Box<dyn Any + Send>) {
        let input = *input
            .downcast::<Result<I, anyhow::Error>>()
            .expect("psg: combine input type mismatch");
        let inner = &mut self.inner;
        let emit = &self.emit;
        let caught = std::panic::catch_unwind(AssertUnwindSafe(|| inner.combine(ctx, scope, input, emit)));
        if caught.is_err() {
            emit.emit(ctx.clone(), scope.clone(), Err(PsgError::CombinePanicked.into()));
        }
    }

    fn flush(&mut self, ctx: &CancelToken, scope: &Scope) {
        let inner = &mut self.inner;
        let emit = &self.emit;
        let caught = std::panic::catch_unwind(AssertUnwindSafe(|| inner.flush(ctx, scope, emit)));
        if caught.is_err() {
            emit.emit(ctx.clone(), scope.clone(), Err(PsgError::CombinerFlushPanicked.into()));
        }
    }
}

struct ErrCombiner<O> {
    emit: Emit<O>,
    kind: PsgError,
}

impl<O: Send + 'static> ErasedCombiner for ErrCombiner<O> {
    fn combine(&mut self, ctx: &CancelToken, scope: &Scope, _input: Box<dyn Any + Send>) {
        self.emit.emit(ctx.clone(), scope.clone(), Err(self.kind.into()));
    }

    fn flush(&mut self, ctx: &CancelToken, scope: &Scope) {
        self.emit.emit(ctx.clone(), scope.clone(), Err(self.kind.into()));
    }
}

struct CombineEntryImpl<I, O> {
    id: CombineId,
    factory: Arc<dyn Fn() -> Option<Box<dyn Combiner<I, O> + Send>> + Send + Sync>,
    emit: Emit<O>,
    min_hold_micros: Arc<AtomicI64>,
    max_hold_micros: Arc<AtomicI64>,
}

impl<I, O> CombineEntry for CombineEntryImpl<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    fn id(&self) -> CombineId {
        self.id
    }

    fn create(&self) -> Box<dyn ErasedCombiner> {
        let caught = std::panic::catch_unwind(AssertUnwindSafe(|| (self.factory)()));
        match caught {
            Ok(Some(combiner)) => Box::new(TypedCombiner {
                inner: combiner,
                emit: self.emit.clone(),
                _marker: PhantomData,
            }),
            Ok(None) => Box::new(ErrCombiner {
                emit: self.emit.clone(),
                kind: PsgError::CombinerFactoryReturnedNil,
            }),
            Err(_) => Box::new(ErrCombiner {
                emit: self.emit.clone(),
                kind: PsgError::CombinerFactoryPanicked,
            }),
        }
    }

    fn hold_times(&self) -> (i64, i64) {
        (
            self.min_hold_micros.load(Ordering::SeqCst),
            self.max_hold_micros.load(Ordering::SeqCst),
        )
    }
}

/// Binds a `Combiner<I, O>` factory to a [`CombinerPool`] and a `Gather<O>`
/// that receives its emitted outputs.
///
/// `Combine` itself does not own worker state; each worker that sees a
/// combine for the first time constructs its own combiner instance via the
/// factory.
pub struct Combine<I, O> {
    id: CombineId,
    pool: Arc<CombinerPool>,
    inner_gather: Gather<Result<I, anyhow::Error>>,
    min_hold_micros: Arc<AtomicI64>,
    max_hold_micros: Arc<AtomicI64>,
}

fn check_hold_times(min: i64, max: i64) {
    if min >= 0 && max >= 0 && min > max {
        panic!("psg: SetMinHoldTime ({min}) > SetMaxHoldTime ({max})");
    }
}

impl<I, O> Combine<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Creates a new combine binding `gather` (for emitted outputs) to
    /// `pool`, constructing a fresh combiner instance per worker via
    /// `factory`. `factory` returning `None` is treated as a contract
    /// failure and surfaces `ErrCombinerFactoryReturnedNil` from every
    /// combine/flush on that worker.
    pub fn new<F>(gather: Gather<O>, pool: Arc<CombinerPool>, factory: F) -> Arc<Self>
    where
        F: Fn() -> Option<Box<dyn Combiner<I, O> + Send>> + Send + Sync + 'static,
    {
        let id = NEXT_COMBINE_ID.fetch_add(1, Ordering::Relaxed);
        let emit = Emit {
            job: Arc::clone(pool.job()),
            gather: gather.func_handle(),
        };
        let min_hold_micros = Arc::new(AtomicI64::new(-1));
        let max_hold_micros = Arc::new(AtomicI64::new(-1));
        let entry: Arc<dyn CombineEntry> = Arc::new(CombineEntryImpl {
            id,
            factory: Arc::new(factory),
            emit,
            min_hold_micros: Arc::clone(&min_hold_micros),
            max_hold_micros: Arc::clone(&max_hold_micros),
        });

        let pool_for_route = Arc::clone(&pool);
        let entry_for_route = Arc::clone(&entry);
        let inner_gather: Gather<Result<I, anyhow::Error>> = Gather::new(move |ctx, scope, result| {
            let pool = Arc::clone(&pool_for_route);
            let entry = Arc::clone(&entry_for_route);
            async move {
                // `result` here is `Result<Result<I, anyhow::Error>, anyhow::Error>`:
                // the outer `Result` is the TaskFunc's own panic/cancel outcome,
                // the inner one is the user value/error pair the combiner sees.
                let input = result.unwrap_or_else(Err);
                pool.submit(entry, Box::new(input), &ctx, &scope).await;
                Ok(())
            }
        });

        Arc::new(Self {
            id,
            pool,
            inner_gather,
            min_hold_micros,
            max_hold_micros,
        })
    }

    /// This combine's identity, used to key per-worker `BoundCombiner`
    /// state.
    pub fn id(&self) -> CombineId {
        self.id
    }

    /// Sets the minimum time a combiner must hold state before flushing it
    /// (flush no sooner than `lastCombine + minHoldTime`). `-1` disables.
    ///
    /// # Panics
    /// Panics if `micros < -1`, or if this would make `min > max` while both
    /// are `>= 0`.
    pub fn set_min_hold_time_micros(&self, micros: i64) {
        assert!(micros >= -1, "psg: SetMinHoldTime requires >= -1");
        check_hold_times(micros, self.max_hold_micros.load(Ordering::SeqCst));
        self.min_hold_micros.store(micros, Ordering::SeqCst);
    }

    /// Sets the maximum time a combiner may hold state before flushing it
    /// (flush no later than `firstCombine + maxHoldTime`). `-1` disables.
    ///
    /// # Panics
    /// Panics if `micros < -1`, or if this would make `min > max` while both
    /// are `>= 0`.
    pub fn set_max_hold_time_micros(&self, micros: i64) {
        assert!(micros >= -1, "psg: SetMaxHoldTime requires >= -1");
        check_hold_times(self.min_hold_micros.load(Ordering::SeqCst), micros);
        self.max_hold_micros.store(micros, Ordering::SeqCst);
    }

    /// Scatters `task` (producing an `I`) into `task_pool`, routing its
    /// result through this combine's aggregator instead of directly to a
    /// gather call.
    ///
    /// # Panics
    /// Panics if `task_pool` and this combine's `CombinerPool` are bound to
    /// different jobs (cross-job posting hazard).
    pub async fn scatter<F, Fut>(
        &self,
        ctx: &CancelToken,
        scope: &Scope,
        task_pool: &Arc<TaskPool>,
        task: F,
    ) -> anyhow::Result<()>
    where
        F: FnOnce(CancelToken, Scope) -> Fut + Send + 'static,
        Fut: Future<Output = Result<I, anyhow::Error>> + Send + 'static,
    {
        self.check_same_job(task_pool);
        self.inner_gather
            .scatter(ctx, scope, task_pool, move |c, s| async move { Ok(task(c, s).await) })
            .await
    }

    /// Non-blocking variant of [`Self::scatter`].
    ///
    /// # Panics
    /// Same as [`Self::scatter`].
    pub async fn try_scatter<F, Fut>(
        &self,
        ctx: &CancelToken,
        scope: &Scope,
        task_pool: &Arc<TaskPool>,
        task: F,
    ) -> anyhow::Result<bool>
    where
        F: FnOnce(CancelToken, Scope) -> Fut + Send + 'static,
        Fut: Future<Output = Result<I, anyhow::Error>> + Send + 'static,
    {
        self.check_same_job(task_pool);
        self.inner_gather
            .try_scatter(ctx, scope, task_pool, move |c, s| async move { Ok(task(c, s).await) })
            .await
    }

    fn check_same_job(&self, task_pool: &Arc<TaskPool>) {
        if !Arc::ptr_eq(task_pool.job(), self.pool.job()) {
            panic!("psg: Scatter into a Combine whose TaskPool and CombinerPool belong to different jobs");
        }
    }
}
