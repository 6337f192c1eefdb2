use thiserror::Error;

/// Error kinds this crate itself can surface.
///
/// Contract violations (nil-required arguments, scattering from within a
/// Done job, mismatched job ownership, `SetMinHoldTime` > `SetMaxHoldTime`)
/// are reported as panics, not as `PsgError` variants — they indicate a bug
/// in the caller the library cannot meaningfully recover from. Everything
/// that *can* happen during otherwise-correct use of the library surfaces
/// through this enum, wrapped in `anyhow::Error` so it composes with
/// whatever error type user task/gather/combiner callbacks return.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PsgError {
    /// A task's user function panicked; the panic was caught at the worker
    /// boundary and this error was substituted for the task's result.
    #[error("task panicked")]
    TaskPanicked,
    /// A combiner's `Combine` method panicked.
    #[error("combine panicked")]
    CombinePanicked,
    /// A combiner's `Flush` method panicked.
    #[error("combiner flush panicked")]
    CombinerFlushPanicked,
    /// A combiner factory panicked while constructing a combiner.
    #[error("combiner factory panicked")]
    CombinerFactoryPanicked,
    /// A combiner factory returned no combiner instead of panicking.
    #[error("combiner factory returned no combiner")]
    CombinerFactoryReturnedNil,
    /// The operation was canceled (caller context or job context).
    #[error("canceled")]
    Canceled,
}
