//! Deadline and cancellation wrapper for external calls.

use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Why a guarded call did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupted {
    Timeout(Duration),
    Cancelled,
}

impl fmt::Display for Interrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout(d) => write!(f, "timed out after {}s", d.as_secs_f64()),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Run `fut` until it completes, `timeout` elapses, or `cancel` fires.
///
/// Cancellation wins ties so a cancelled run never reports a late result.
pub async fn bounded<F, T>(
    timeout: Duration,
    cancel: &CancellationToken,
    fut: F,
) -> Result<T, Interrupted>
where
    F: Future<Output = T>,
{
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(Interrupted::Cancelled),
        res = tokio::time::timeout(timeout, fut) => res.map_err(|_| Interrupted::Timeout(timeout)),
    }
}
