//! `CombinerPool`: elastic worker election, idle timeout, spawn delay.
//!
//! Submission never blocks on channel capacity: the worker feed is an
//! unbounded `psg_core::queue::MpmcQueue` shared by every worker, so a
//! newly elected worker immediately helps work down whatever backlog caused
//! it to be spawned. One persistent worker is spawned on first submission
//! and never exits on idle; additional workers are elected elastically (up
//! to `SetLimit`, unbounded by default) only if the queue is still
//! non-empty after the spawn delay, and each exits on its own idle timeout,
//! shrinking the pool back down once the backlog clears.

use std::any::Any;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use psg_core::dynamic::DynamicValue;
use psg_core::queue::MpmcQueue;
use psg_core::timer_pool::TimerPool;
use tokio::sync::Notify;
use tokio::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::context::{CancelToken, Scope};
use crate::job::Job;
use crate::state::{Flusher, Stage};

/// Opaque identity of a [`crate::combine::Combine`], used to key per-worker
/// combiner state.
pub type CombineId = u64;

/// A type-erased [`crate::combine::Combiner`] plus its bound `Emit`,
/// constructed once per `(Combine, worker)` pair.
pub(crate) trait ErasedCombiner: Send {
    fn combine(&mut self, ctx: &CancelToken, scope: &Scope, input: Box<dyn Any + Send>);
    fn flush(&mut self, ctx: &CancelToken, scope: &Scope);
}

/// Type-erased view of a [`crate::combine::Combine`]: enough for a worker to
/// construct its own combiner instance and to compute flush deadlines.
pub(crate) trait CombineEntry: Send + Sync {
    fn id(&self) -> CombineId;
    fn create(&self) -> Box<dyn ErasedCombiner>;
    /// `(min_hold_micros, max_hold_micros)`, `-1` meaning disabled.
    fn hold_times(&self) -> (i64, i64);
}

struct CombineMsg {
    entry: Arc<dyn CombineEntry>,
    input: Box<dyn Any + Send>,
}

struct WorkQueue {
    queue: MpmcQueue<CombineMsg>,
    notify: Notify,
}

impl WorkQueue {
    fn new() -> Self {
        Self {
            queue: MpmcQueue::new(),
            notify: Notify::new(),
        }
    }

    fn push(&self, msg: CombineMsg) {
        self.queue.push(msg);
        self.notify.notify_one();
    }

    async fn recv(&self) -> CombineMsg {
        loop {
            let notified = self.notify.notified();
            if let Some(msg) = self.queue.pop() {
                return msg;
            }
            notified.await;
        }
    }
}

/// A dynamically sized pool of workers that run combiners on behalf of a
/// job.
pub struct CombinerPool {
    job: Arc<Job>,
    limit: DynamicValue<i64>,
    spawn_delay: DynamicValue<i64>,
    idle_timeout: DynamicValue<i64>,
    live_workers: AtomicU32,
    work: Arc<WorkQueue>,
}

const DEFAULT_SPAWN_DELAY_MICROS: i64 = 10;
const DEFAULT_IDLE_TIMEOUT_MICROS: i64 = 1000;

impl CombinerPool {
    /// Creates a pool bound to `job` with the default configuration:
    /// unlimited workers, a 10 microsecond spawn delay, and a 1000
    /// microsecond idle timeout.
    ///
    /// # Panics
    /// Panics if `job` has already reached `Done`.
    pub fn new(job: &Arc<Job>) -> Arc<Self> {
        if job.stage() == Stage::Done {
            panic!("psg: NewCombinerPool called on a Done job");
        }
        Arc::new(Self {
            job: Arc::clone(job),
            limit: DynamicValue::new(-1),
            spawn_delay: DynamicValue::new(DEFAULT_SPAWN_DELAY_MICROS),
            idle_timeout: DynamicValue::new(DEFAULT_IDLE_TIMEOUT_MICROS),
            live_workers: AtomicU32::new(0),
            work: Arc::new(WorkQueue::new()),
        })
    }

    /// The job this pool is bound to.
    pub fn job(&self) -> &Arc<Job> {
        &self.job
    }

    /// Sets the maximum number of live combiner workers. `< 0` unlimited.
    pub fn set_limit(&self, limit: i64) {
        self.limit.store(limit);
    }

    /// Sets how long a submitter waits to see the backlog persist before it
    /// may elect and spawn an additional elastic worker.
    pub fn set_spawn_delay_micros(&self, micros: i64) {
        assert!(micros >= 0, "psg: SetSpawnDelay requires a non-negative value");
        self.spawn_delay.store(micros);
    }

    /// Sets how long an elastic worker waits with nothing to do before it
    /// flushes and exits. `-1` disables the idle timeout.
    pub fn set_idle_timeout_micros(&self, micros: i64) {
        assert!(micros >= -1, "psg: SetIdleTimeout requires >= -1");
        self.idle_timeout.store(micros);
    }

    fn ensure_primary_worker(self: &Arc<Self>) {
        if self.limit.get() == 0 {
            return;
        }
        if self
            .live_workers
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            debug!("psg: combiner pool spawning primary worker");
            // Registered synchronously, before spawning: the job must not be
            // able to reach `Done` between "a worker was committed to" and
            // "that worker's task actually started running".
            let flusher = self.job.state.register_flusher();
            let pool = Arc::clone(self);
            tokio::spawn(async move { run_worker(pool, false, flusher).await });
        }
    }

    /// Elects and spawns one additional elastic worker, if the configured
    /// limit still has headroom. Unlike the primary worker, an elastic
    /// worker exits (and frees its slot) after its own idle timeout, so the
    /// pool can be re-elected up to `limit` repeatedly as backlog recurs.
    fn maybe_spawn_extra_worker(self: &Arc<Self>) {
        loop {
            let limit = self.limit.get();
            let live = self.live_workers.load(Ordering::SeqCst);
            if live == 0 || (limit >= 0 && live as i64 >= limit) {
                return;
            }
            if self
                .live_workers
                .compare_exchange(live, live + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                debug!("psg: combiner pool electing elastic worker");
                let flusher = self.job.state.register_flusher();
                let pool = Arc::clone(self);
                tokio::spawn(async move { run_worker(pool, true, flusher).await });
                return;
            }
        }
    }

    /// Routes one task result into the combiner identified by `entry`,
    /// spawning workers as needed.
    pub(crate) async fn submit(
        self: &Arc<Self>,
        entry: Arc<dyn CombineEntry>,
        input: Box<dyn Any + Send>,
        ctx: &CancelToken,
        scope: &Scope,
    ) {
        let _ = scope;
        self.ensure_primary_worker();

        self.work.push(CombineMsg { entry, input });

        // Only escalate to another worker if the queue is still backed up
        // after the spawn delay elapses, so a pool that keeps up with
        // incoming work never grows past its primary worker.
        let spawn_delay = Duration::from_micros(self.spawn_delay.get().max(0) as u64);
        if spawn_delay > Duration::ZERO {
            tokio::select! {
                _ = tokio::time::sleep(spawn_delay) => {
                    if !self.work.queue.is_empty() {
                        self.maybe_spawn_extra_worker();
                    }
                }
                _ = ctx.cancelled() => {}
                _ = self.job.cancel.cancelled() => {}
            }
        } else if !self.work.queue.is_empty() {
            self.maybe_spawn_extra_worker();
        }
        trace!("psg: combine input submitted");
    }
}

struct WorkerCombinerState {
    combiner: Box<dyn ErasedCombiner>,
    entry: Arc<dyn CombineEntry>,
    first_combine: Instant,
    last_combine: Instant,
    deadline: Option<Instant>,
}

fn compute_deadline(state: &WorkerCombinerState) -> Option<Instant> {
    let (min_micros, max_micros) = state.entry.hold_times();
    let min_deadline = (min_micros >= 0).then(|| state.last_combine + Duration::from_micros(min_micros as u64));
    let max_deadline = (max_micros >= 0).then(|| state.first_combine + Duration::from_micros(max_micros as u64));
    match (min_deadline, max_deadline) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

async fn wait_opt_timer(pool: &Arc<TimerPool>, deadline: Option<Instant>) {
    match deadline {
        Some(d) => {
            let mut timer = pool.checkout(d);
            timer.as_mut().await;
        }
        None => std::future::pending::<()>().await,
    }
}

fn apply_msg(
    combiners: &mut HashMap<CombineId, WorkerCombinerState>,
    heap: &mut BinaryHeap<Reverse<(Instant, CombineId)>>,
    msg: CombineMsg,
    ctx: &CancelToken,
    scope: &Scope,
) {
    let id = msg.entry.id();
    let state = combiners.entry(id).or_insert_with(|| {
        let now = Instant::now();
        WorkerCombinerState {
            combiner: msg.entry.create(),
            entry: Arc::clone(&msg.entry),
            first_combine: now,
            last_combine: now,
            deadline: None,
        }
    });
    state.combiner.combine(ctx, scope, msg.input);
    state.last_combine = Instant::now();
    state.deadline = compute_deadline(state);
    if let Some(deadline) = state.deadline {
        heap.push(Reverse((deadline, id)));
    }
}

fn flush_due(
    combiners: &mut HashMap<CombineId, WorkerCombinerState>,
    heap: &mut BinaryHeap<Reverse<(Instant, CombineId)>>,
    now: Instant,
    ctx: &CancelToken,
    scope: &Scope,
) {
    while let Some(Reverse((deadline, id))) = heap.peek().copied() {
        if deadline > now {
            break;
        }
        heap.pop();
        let Some(state) = combiners.get_mut(&id) else {
            continue;
        };
        // Lazy deletion: this heap entry may be stale if the combiner was
        // re-combined (and re-scheduled) since it was pushed.
        if state.deadline != Some(deadline) {
            continue;
        }
        state.combiner.flush(ctx, scope);
        state.deadline = None;
    }
}

fn flush_all(combiners: &mut HashMap<CombineId, WorkerCombinerState>, ctx: &CancelToken, scope: &Scope) {
    for state in combiners.values_mut() {
        state.combiner.flush(ctx, scope);
    }
}

async fn run_worker(pool: Arc<CombinerPool>, is_extra: bool, flusher: Flusher) {
    let mut combiners: HashMap<CombineId, WorkerCombinerState> = HashMap::new();
    let mut heap: BinaryHeap<Reverse<(Instant, CombineId)>> = BinaryHeap::new();
    let ctx = pool.job.cancel_token();
    let scope = Scope::root();
    // `flusher` (registered synchronously by the caller before spawning this
    // task) keeps the job out of `Done` until this worker has had a chance
    // to flush whatever state it is still holding.
    //
    // The job entering `Flushing` only means `tasks == 0` — some already
    // completed task results may still be sitting in the job's own gather
    // channel, not yet drained into this pool's work queue. So a flush
    // signal only starts a second wait, for the job to additionally report
    // `gathers == 0`, before this worker actually stops and flushes.
    let mut flush_signaled = false;

    loop {
        let deadline = heap.peek().map(|Reverse((when, _))| *when);
        let idle_deadline = if is_extra {
            let micros = pool.idle_timeout.get();
            (micros >= 0).then(|| Instant::now() + Duration::from_micros(micros as u64))
        } else {
            None
        };

        tokio::select! {
            msg = pool.work.recv() => {
                apply_msg(&mut combiners, &mut heap, msg, &ctx, &scope);
            }
            _ = wait_opt_timer(&pool.job.timers, deadline) => {
                flush_due(&mut combiners, &mut heap, Instant::now(), &ctx, &scope);
            }
            _ = wait_opt_timer(&pool.job.timers, idle_deadline), if is_extra => {
                debug!("psg: combiner elastic worker idle timeout, exiting");
                break;
            }
            _ = flusher.wait_flush(), if !flush_signaled => {
                flush_signaled = true;
            }
            _ = pool.job.state.wait_drained(), if flush_signaled => {
                break;
            }
            _ = pool.job.cancel.cancelled() => {
                break;
            }
        }
    }

    flush_all(&mut combiners, &ctx, &scope);
    drop(flusher);
    pool.live_workers.fetch_sub(1, Ordering::SeqCst);
}
