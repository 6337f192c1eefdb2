use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::Notify;

use crate::queue::MpmcQueue;

const FRESH: u8 = 0;
const NOTIFIED: u8 = 1;
const CLOSED: u8 = 2;

/// A one-slot signaling object handed out by a [`WaiterQueue`].
///
/// A waiter starts out *fresh*. Exactly one of two things then happens
/// first, decided by a single CAS on the internal state:
///
/// - the queue [`notify`](Waiter::notify)s it, moving it to *notified* and
///   waking its owner; or
/// - the owner [`close`](Waiter::close)s it because it resolved its need
///   some other way (e.g. it was admitted via a racing tentative increment,
///   or its context was canceled).
///
/// If `close` loses the race against a concurrent `notify`, the waiter was
/// already handed a wakeup it isn't going to consume; `close` then re-posts
/// that wakeup to the next waiter in the queue so it is never dropped on the
/// floor.
pub struct Waiter {
    state: AtomicU8,
    signal: Notify,
    queue: Weak<Inner>,
}

impl Waiter {
    fn new(queue: Weak<Inner>) -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(FRESH),
            signal: Notify::new(),
            queue,
        })
    }

    /// Waits until this waiter is notified.
    ///
    /// Returns immediately if the waiter has already been notified (the
    /// notification is latched, so this is safe to call after having
    /// already observed readiness some other way).
    pub async fn wait(&self) {
        if self.state.load(Ordering::SeqCst) == NOTIFIED {
            return;
        }
        self.signal.notified().await;
    }

    /// Delivers a wakeup. Returns `true` if this waiter accepted it (it was
    /// fresh), `false` if the waiter had already been closed by its owner,
    /// in which case the caller should try the next waiter in the queue.
    pub(crate) fn notify(&self) -> bool {
        match self
            .state
            .compare_exchange(FRESH, NOTIFIED, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => {
                self.signal.notify_one();
                true
            }
            Err(_) => false,
        }
    }

    /// Gives up waiting. If a wakeup had already been delivered, it is
    /// re-posted to the next waiter in the owning queue so it isn't lost.
    pub fn close(self: &Arc<Self>) {
        match self
            .state
            .compare_exchange(FRESH, CLOSED, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => {}
            Err(_) => {
                if let Some(queue) = self.queue.upgrade() {
                    queue.notify_next();
                }
            }
        }
    }
}

struct Inner {
    queue: MpmcQueue<Arc<Waiter>>,
}

impl Inner {
    fn notify_next(&self) {
        while let Some(waiter) = self.queue.pop() {
            if waiter.notify() {
                return;
            }
            // Waiter was already closed by its owner; it declined the
            // wakeup, so try the next one.
        }
    }
}

/// FIFO queue of [`Waiter`]s, used by `TaskPool`/`CombinerPool` to block
/// producers non-blockingly until capacity frees up.
pub struct WaiterQueue {
    inner: Arc<Inner>,
}

impl WaiterQueue {
    /// Creates an empty waiter queue.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                queue: MpmcQueue::new(),
            }),
        }
    }

    /// Enqueues a new fresh waiter and returns it.
    pub fn push(&self) -> Arc<Waiter> {
        let waiter = Waiter::new(Arc::downgrade(&self.inner));
        self.inner.queue.push(waiter.clone());
        waiter
    }

    /// Pops the front waiter and notifies it; if that waiter had already
    /// been closed by its owner, keeps trying subsequent waiters until one
    /// accepts the wakeup or the queue is empty.
    pub fn notify(&self) {
        self.inner.notify_next();
    }
}

impl Default for WaiterQueue {
    fn default() -> Self {
        Self::new()
    }
}
