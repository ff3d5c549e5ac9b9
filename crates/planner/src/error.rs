use std::time::Duration;

/// Status values returned by planner operations. None of them is fatal; the
/// caller decides whether to retry, skip or report.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlannerError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Out-of-range handle, a handle to a free slot, or a handle from before
    /// the slot was released or reloaded.
    #[error("invalid event handle")]
    InvalidHandle,

    #[error("plan lock not acquired within {0:?}")]
    Timeout(Duration),

    #[error("no stop event slot available")]
    NoStopSlotAvailable,

    /// The handle buffer was too small. The first `written` entries are valid.
    #[error("handle buffer too small ({written} handle(s) written)")]
    PartialResult { written: usize },

    #[error("no matching events")]
    NotFound,

    #[error("config source failed: {0}")]
    Source(String),
}
