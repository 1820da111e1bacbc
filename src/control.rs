//! Cooperative cancellation and pause signalling.
//!
//! Every long operation carries a [`CancelFlag`] and checks it at least
//! once per processed entry. The copier additionally honours a
//! [`PauseFlag`] between chunks, sleeping in short intervals until
//! resumed or cancelled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};

/// How long a paused loop sleeps before re-checking the flags.
pub const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Shared cancellation flag. `cancel` is idempotent.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag {
    cancelled: Arc<AtomicBool>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Returns `Err(Cancelled)` once the flag is set.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Re-arm the flag for a fresh run.
    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }
}

/// Shared pause flag polled by the copy loop.
#[derive(Clone, Debug, Default)]
pub struct PauseFlag {
    paused: Arc<AtomicBool>,
}

impl PauseFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Sleep in [`PAUSE_POLL_INTERVAL`] steps while paused. Cancellation
    /// wins over pause.
    pub async fn wait_if_paused(&self, cancel: &CancelFlag) -> Result<()> {
        while self.is_paused() {
            cancel.check()?;
            tokio::time::sleep(PAUSE_POLL_INTERVAL).await;
        }
        cancel.check()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_is_idempotent() {
        let flag = CancelFlag::new();
        assert!(flag.check().is_ok());
        flag.cancel();
        flag.cancel();
        assert!(flag.is_cancelled());
        assert!(matches!(flag.check(), Err(Error::Cancelled)));
        flag.reset();
        assert!(flag.check().is_ok());
    }

    #[tokio::test]
    async fn cancelled_wait_unblocks() {
        let pause = PauseFlag::new();
        let cancel = CancelFlag::new();
        pause.pause();
        let waiter = {
            let (pause, cancel) = (pause.clone(), cancel.clone());
            tokio::spawn(async move { pause.wait_if_paused(&cancel).await })
        };
        cancel.cancel();
        let res = waiter.await.expect("join");
        assert!(matches!(res, Err(Error::Cancelled)));
    }
}
