use parking_lot::Mutex;
use tokio::sync::watch;

/// An atomic cell paired with a change signal.
///
/// `store` atomically swaps in a new value and wakes every outstanding
/// `changed()` waiter obtained from a prior `load`, mirroring the Go
/// source's `{value, close-on-store channel}` pair. `tokio::sync::watch`
/// already implements exactly this contract, so `DynamicValue` is a thin,
/// typed wrapper around it rather than a hand-rolled atomic pointer swap.
pub struct DynamicValue<T> {
    tx: Mutex<watch::Sender<T>>,
}

impl<T: Clone> DynamicValue<T> {
    /// Creates a new cell holding `initial`.
    pub fn new(initial: T) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Mutex::new(tx) }
    }

    /// Returns the current value together with a receiver that resolves
    /// `changed()` the next time (and every time) [`Self::store`] is called.
    pub fn load(&self) -> (T, watch::Receiver<T>) {
        let rx = self.tx.lock().subscribe();
        let value = rx.borrow().clone();
        (value, rx)
    }

    /// Reads the current value without subscribing to future changes.
    pub fn get(&self) -> T {
        self.tx.lock().borrow().clone()
    }

    /// Replaces the value, waking every receiver's `changed()`.
    pub fn store(&self, value: T) {
        // `send` only errors when every receiver (including the sender's own
        // implicit one) has been dropped, which cannot happen here since we
        // always hold the `Sender`.
        let _ = self.tx.lock().send(value);
    }
}
