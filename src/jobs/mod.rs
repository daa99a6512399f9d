pub mod idle;
pub mod scheduler;

pub use idle::{ControlHandle, ControlLoop, IdleHandle};
pub use scheduler::{BackgroundJob, JobContext, JobScheduler};

use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Cooperative cancellation flag shared between a job and whoever may stop it.
///
/// Setting the token never interrupts the job; the job notices at its next
/// [`checkpoint`] or when a [`StopToken::sleep`] returns early.
#[derive(Debug, Clone, Default)]
pub struct StopToken {
    inner: CancellationToken,
}

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.inner.cancel();
    }

    pub fn is_set(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// Resolves once the token is set.
    pub async fn stopped(&self) {
        self.inner.cancelled().await
    }

    /// Sleeps for `duration` unless the token is set first.
    ///
    /// Returns `Err(Cancelled)` when woken by the token.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        tokio::select! {
            _ = self.inner.cancelled() => Err(Error::Cancelled),
            _ = tokio::time::sleep(duration) => checkpoint(self),
        }
    }
}

/// Returns `Err(Cancelled)` iff the token has been set.
pub fn checkpoint(token: &StopToken) -> Result<()> {
    if token.is_set() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}
