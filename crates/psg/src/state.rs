//! Job lifecycle state machine: stage ladder + composite in-flight counter.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use psg_core::counter::PackedCounter;
use tokio::sync::Notify;
use tracing::trace;

/// A job's lifecycle stage. Transitions are one-way and totally ordered:
/// `Open < Closed < Flushing < Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum Stage {
    /// Accepting new tasks.
    Open = 0,
    /// `Close()` has been called; no new tasks may be scattered.
    Closed = 1,
    /// All tasks have completed; draining remaining gathers/flushers.
    Flushing = 2,
    /// Total in-flight work (tasks + gathers + flushers) has reached zero.
    Done = 3,
}

impl Stage {
    fn from_u32(v: u32) -> Self {
        match v {
            0 => Stage::Open,
            1 => Stage::Closed,
            2 => Stage::Flushing,
            3 => Stage::Done,
            _ => unreachable!("psg: invalid stage encoding {v}"),
        }
    }
}

/// The job's lifecycle stage plus its composite tasks/gathers counter.
pub struct JobState {
    stage: AtomicU32,
    counter: PackedCounter,
    flushers: AtomicU32,
    flush_closed: AtomicBool,
    flush_notify: Notify,
    done_closed: AtomicBool,
    done_notify: Notify,
    drained_notify: Notify,
}

/// A snapshot of a job's in-flight work, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InFlightSnapshot {
    /// Currently executing tasks.
    pub tasks: u32,
    /// Completed tasks awaiting a gather call.
    pub gathers: u32,
    /// Combiner workers registered as flushers.
    pub flushers: u32,
}

impl JobState {
    /// Creates a new state machine in the `Open` stage with all counters
    /// zeroed.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            stage: AtomicU32::new(Stage::Open as u32),
            counter: PackedCounter::new(),
            flushers: AtomicU32::new(0),
            flush_closed: AtomicBool::new(false),
            flush_notify: Notify::new(),
            done_closed: AtomicBool::new(false),
            done_notify: Notify::new(),
            drained_notify: Notify::new(),
        })
    }

    /// The job's current lifecycle stage.
    pub fn stage(&self) -> Stage {
        Stage::from_u32(self.stage.load(Ordering::SeqCst))
    }

    fn try_advance(&self, from: Stage, to: Stage) -> bool {
        self.stage
            .compare_exchange(from as u32, to as u32, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Current `(tasks, gathers)` halves of the composite counter.
    pub fn snapshot(&self) -> InFlightSnapshot {
        let (tasks, gathers) = self.counter.snapshot();
        InFlightSnapshot {
            tasks,
            gathers,
            flushers: self.flushers.load(Ordering::SeqCst),
        }
    }

    /// Adds one task in flight. Panics (via the packed counter) on overflow.
    pub fn increment_tasks(&self) {
        self.counter.add_hi(1);
    }

    /// Removes one task in flight, then drives any stage transitions this
    /// unblocks.
    pub fn decrement_tasks(&self) {
        self.counter.add_hi(-1);
        self.advance_if_ready();
    }

    /// Atomically moves one unit from `tasks` to `gathers` (a task
    /// completed and its result was posted to the gather channel).
    pub fn move_task_to_gather(&self) {
        self.counter.add(-1, 1);
        self.advance_if_ready();
    }

    /// Removes one gather in flight, then drives any stage transitions this
    /// unblocks.
    pub fn decrement_gathers(&self) {
        self.counter.add_lo(-1);
        self.advance_if_ready();
    }

    /// Registers a flusher (a combiner worker holding unflushed state),
    /// keeping the job out of `Done` until it is dropped.
    pub fn register_flusher(self: &Arc<Self>) -> Flusher {
        self.flushers.fetch_add(1, Ordering::SeqCst);
        Flusher {
            state: Arc::clone(self),
        }
    }

    /// Attempts `Open -> Closed`, then drives any further transitions this
    /// unblocks. Idempotent.
    pub fn close(&self) {
        if self.try_advance(Stage::Open, Stage::Closed) {
            trace!("psg: job closed");
        }
        self.advance_if_ready();
    }

    fn advance_if_ready(&self) {
        let snap = self.snapshot();
        if self.stage() == Stage::Closed && snap.tasks == 0 && self.try_advance(Stage::Closed, Stage::Flushing) {
            trace!("psg: job flushing");
            self.flush_closed.store(true, Ordering::SeqCst);
            self.flush_notify.notify_waiters();
        }

        let snap = self.snapshot();
        if snap.tasks == 0 && snap.gathers == 0 {
            self.drained_notify.notify_waiters();
        }

        if self.stage() == Stage::Flushing
            && snap.tasks == 0
            && snap.gathers == 0
            && snap.flushers == 0
            && self.try_advance(Stage::Flushing, Stage::Done)
        {
            trace!("psg: job done");
            self.done_closed.store(true, Ordering::SeqCst);
            self.done_notify.notify_waiters();
        }
    }

    /// Resolves once the job has entered (at least) `Flushing`.
    pub async fn wait_flushed(&self) {
        loop {
            let notified = self.flush_notify.notified();
            if self.flush_closed.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }

    /// Resolves once no tasks are running and no completed-but-ungathered
    /// results remain — i.e. the job's gather channel is (momentarily)
    /// empty. Unlike [`Self::wait_flushed`] this ignores `flushers`, so it
    /// can be awaited by a flusher itself to learn when it is safe to flush
    /// and let go of its own registration.
    pub async fn wait_drained(&self) {
        loop {
            let notified = self.drained_notify.notified();
            let snap = self.snapshot();
            if snap.tasks == 0 && snap.gathers == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Resolves once the job has entered `Done`.
    pub async fn wait_done(&self) {
        loop {
            let notified = self.done_notify.notified();
            if self.done_closed.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}

/// A registered flusher handle. Dropping it unregisters, possibly letting
/// the job reach `Done`.
pub struct Flusher {
    state: Arc<JobState>,
}

impl Flusher {
    /// Resolves once the job has entered `Flushing` — the signal a combiner
    /// worker observes to know it should flush its remaining state and let
    /// go of this registration.
    pub async fn wait_flush(&self) {
        self.state.wait_flushed().await;
    }
}

impl Drop for Flusher {
    fn drop(&mut self) {
        self.state.flushers.fetch_sub(1, Ordering::SeqCst);
        self.state.advance_if_ready();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_with_no_tasks_cascades_to_done() {
        let state = JobState::new();
        state.close();
        assert_eq!(state.stage(), Stage::Done);
    }

    #[test]
    fn tasks_block_the_closed_to_flushing_transition() {
        let state = JobState::new();
        state.increment_tasks();
        state.close();
        assert_eq!(state.stage(), Stage::Closed);

        state.decrement_tasks();
        assert_eq!(state.stage(), Stage::Done);
    }

    #[test]
    fn gather_in_flight_blocks_done() {
        let state = JobState::new();
        state.increment_tasks();
        state.close();
        state.move_task_to_gather();
        assert_eq!(state.stage(), Stage::Flushing);

        state.decrement_gathers();
        assert_eq!(state.stage(), Stage::Done);
    }

    #[test]
    fn registered_flusher_blocks_done() {
        let state = JobState::new();
        let flusher = state.register_flusher();
        state.close();
        assert_eq!(state.stage(), Stage::Flushing);

        drop(flusher);
        assert_eq!(state.stage(), Stage::Done);
    }

    #[tokio::test]
    async fn wait_done_resolves_after_close() {
        let state = JobState::new();
        state.close();
        tokio::time::timeout(std::time::Duration::from_millis(200), state.wait_done())
            .await
            .expect("done should already be closed");
    }

    #[tokio::test]
    async fn wait_drained_waits_for_gathers_not_just_tasks() {
        let state = JobState::new();
        state.increment_tasks();
        state.close();
        state.move_task_to_gather();
        // `Flushing` only requires tasks == 0; a gather is still pending.
        assert_eq!(state.stage(), Stage::Flushing);

        let waited = tokio::spawn({
            let state = Arc::clone(&state);
            async move { state.wait_drained().await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert!(!waited.is_finished());

        state.decrement_gathers();
        tokio::time::timeout(std::time::Duration::from_millis(200), waited)
            .await
            .expect("wait_drained should resolve once gathers reaches zero")
            .unwrap();
    }
}
