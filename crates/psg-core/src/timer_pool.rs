use std::pin::Pin;
use std::sync::Arc;

use tokio::time::{Instant, Sleep};

use crate::queue::MpmcQueue;

/// A pool of reusable [`tokio::time::Sleep`] timers.
///
/// Combiner workers and the job's flush/hold-time logic repeatedly need a
/// one-shot deadline timer; rather than allocate a fresh `Sleep` on every
/// loop iteration (as `EngineRuntime::run`'s `fetch_backoff:
/// Option<Pin<Box<Sleep>>>` does ad hoc for a single timer), callers check
/// one out of the pool and it's returned automatically on drop.
pub struct TimerPool {
    free: MpmcQueue<Pin<Box<Sleep>>>,
}

impl TimerPool {
    /// Creates an empty pool; timers are allocated lazily on first checkout.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            free: MpmcQueue::new(),
        })
    }

    /// Checks out a timer armed for `deadline`, reusing a returned one if
    /// available.
    pub fn checkout(self: &Arc<Self>, deadline: Instant) -> PooledTimer {
        let mut sleep = self
            .free
            .pop()
            .unwrap_or_else(|| Box::pin(tokio::time::sleep_until(deadline)));
        sleep.as_mut().reset(deadline);
        PooledTimer {
            sleep: Some(sleep),
            pool: Arc::clone(self),
        }
    }
}

/// A checked-out timer. Returned to its pool automatically when dropped.
pub struct PooledTimer {
    sleep: Option<Pin<Box<Sleep>>>,
    pool: Arc<TimerPool>,
}

impl PooledTimer {
    /// Returns a pinned mutable reference to the underlying sleep future,
    /// for use in a `select!` arm or `.await`.
    pub fn as_mut(&mut self) -> Pin<&mut Sleep> {
        self.sleep
            .as_mut()
            .expect("PooledTimer polled after being returned")
            .as_mut()
    }

    /// Re-arms this timer for a new deadline without returning it to the pool.
    pub fn reset(&mut self, deadline: Instant) {
        self.as_mut().reset(deadline);
    }
}

impl Drop for PooledTimer {
    fn drop(&mut self) {
        if let Some(sleep) = self.sleep.take() {
            self.pool.free.push(sleep);
        }
    }
}
