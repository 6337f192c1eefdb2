//! Explicit cancellation and job-membership tracking.
//!
//! Cancellation and recursive-call detection are threaded as two small,
//! independently-typed values passed explicitly to every task/gather call:
//! [`CancelToken`] and [`Scope`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::Notify;

struct State {
    cancelled: bool,
    children: Vec<Weak<Inner>>,
}

struct Inner {
    state: Mutex<State>,
    notify: Notify,
}

impl Inner {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                cancelled: false,
                children: Vec::new(),
            }),
            notify: Notify::new(),
        })
    }

    fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    /// Cancels this token and every live child, in one pass under this
    /// token's own lock so a concurrent `child()` call can't race a wakeup
    /// (see [`CancelToken::child`]).
    fn cancel(self: &Arc<Self>) {
        let children = {
            let mut guard = self.state.lock();
            if guard.cancelled {
                return;
            }
            guard.cancelled = true;
            std::mem::take(&mut guard.children)
        };
        self.notify.notify_waiters();
        for weak in children {
            if let Some(child) = weak.upgrade() {
                child.cancel();
            }
        }
    }

    async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// A cheaply-cloneable cancellation handle with child/parent propagation.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    /// Creates a new, independent (root) cancel token.
    pub fn new() -> Self {
        Self {
            inner: Inner::new(),
        }
    }

    /// Derives a child token: cancelled whenever either this token or the
    /// child itself is cancelled.
    pub fn child(&self) -> CancelToken {
        let child_inner = Inner::new();
        let mut guard = self.inner.state.lock();
        if guard.cancelled {
            drop(guard);
            child_inner.cancel();
        } else {
            guard.children.push(Arc::downgrade(&child_inner));
        }
        CancelToken {
            inner: child_inner,
        }
    }

    /// Cancels this token and every descendant derived from it.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// Returns `true` if this token (or an ancestor) has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// Resolves once this token has been cancelled.
    pub async fn cancelled(&self) {
        self.inner.cancelled().await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Opaque identifier for a [`crate::job::Job`], used only for `Scope`
/// membership checks.
pub type JobId = u64;

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_job_id() -> JobId {
    NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed)
}

/// An immutable, append-only bag of job-membership markers.
///
/// `Scatter`/`GatherOne` use [`Scope::contains`] to detect recursive calls
/// back into the job whose task is currently executing.
#[derive(Clone, Default)]
pub struct Scope {
    path: Arc<Vec<JobId>>,
}

impl Scope {
    /// The empty scope, for callers outside of any job's task.
    pub fn root() -> Self {
        Self::default()
    }

    /// Returns a new scope extending this one with `job_id`.
    pub fn child_of(&self, job_id: JobId) -> Self {
        let mut path = (*self.path).clone();
        path.push(job_id);
        Self {
            path: Arc::new(path),
        }
    }

    /// Returns `true` if `job_id` appears anywhere in this scope's path.
    pub fn contains(&self, job_id: JobId) -> bool {
        self.path.contains(&job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn cancel_wakes_waiter() {
        let token = CancelToken::new();
        let t2 = token.clone();
        let waited = tokio::spawn(async move { t2.cancelled().await });

        tokio::time::sleep(Duration::from_millis(5)).await;
        token.cancel();

        tokio::time::timeout(Duration::from_secs(1), waited)
            .await
            .expect("cancel should wake waiter")
            .unwrap();
    }

    #[tokio::test]
    async fn child_observes_parent_cancellation() {
        let parent = CancelToken::new();
        let child = parent.child();
        assert!(!child.is_cancelled());

        parent.cancel();
        assert!(child.is_cancelled());
        tokio::time::timeout(Duration::from_millis(200), child.cancelled())
            .await
            .expect("child should observe parent cancel");
    }

    #[test]
    fn child_created_after_cancel_is_already_cancelled() {
        let parent = CancelToken::new();
        parent.cancel();
        let child = parent.child();
        assert!(child.is_cancelled());
    }

    #[test]
    fn scope_contains_tracks_path() {
        let root = Scope::root();
        assert!(!root.contains(1));
        let a = root.child_of(1);
        assert!(a.contains(1));
        assert!(!a.contains(2));
        let b = a.child_of(2);
        assert!(b.contains(1));
        assert!(b.contains(2));
    }
}
