//! Cancellation marker, distinguishable from real failures.

use std::fmt;

/// Returned (inside `anyhow::Error`) when a job was canceled by the caller.
///
/// Cancellation is not a failure: callers should downcast with
/// [`is_canceled`] before treating a pipeline error as fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Canceled;

impl fmt::Display for Canceled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "operation canceled")
    }
}

impl std::error::Error for Canceled {}

/// True if `err` (or anything in its chain) is a [`Canceled`] marker.
pub fn is_canceled(err: &anyhow::Error) -> bool {
    err.chain().any(|e| e.is::<Canceled>())
}
