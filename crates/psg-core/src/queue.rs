use crossbeam_queue::SegQueue;

/// An unbounded, lock-free multi-producer multi-consumer queue.
///
/// Backed by [`crossbeam_queue::SegQueue`], which provides the same
/// asymptotic and ABA-safety properties as the Michael-Scott queue this
/// crate's design is otherwise modeled on, without reaching for raw
/// pointers and `unsafe` in a crate that forbids it.
pub struct MpmcQueue<T> {
    inner: SegQueue<T>,
}

impl<T> MpmcQueue<T> {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self {
            inner: SegQueue::new(),
        }
    }

    /// Pushes a value onto the back of the queue.
    pub fn push(&self, value: T) {
        self.inner.push(value);
    }

    /// Pops a value from the front of the queue, if any.
    pub fn pop(&self) -> Option<T> {
        self.inner.pop()
    }

    /// Returns `true` if the queue currently holds no elements.
    ///
    /// This is inherently racy under concurrent access; it is provided for
    /// diagnostics and tests, not for correctness-critical decisions.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Returns the number of elements currently in the queue.
    ///
    /// Racy in the same sense as [`Self::is_empty`].
    pub fn len(&self) -> usize {
        self.inner.len()
    }
}

impl<T> Default for MpmcQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
