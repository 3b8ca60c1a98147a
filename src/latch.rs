//! Single-fire completion signal
//!
//! A `Latch` fires at most once. Any number of tasks may wait on it,
//! before or after it fires.

use tokio::sync::watch;

#[derive(Debug)]
pub struct Latch {
    tx: watch::Sender<bool>,
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

impl Latch {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Fire the latch. Returns true only for the call that fired it.
    pub fn fire(&self) -> bool {
        self.tx.send_if_modified(|fired| {
            if *fired {
                false
            } else {
                *fired = true;
                true
            }
        })
    }

    pub fn is_fired(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the latch has fired
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in self, so the channel cannot close while we wait.
        let _ = rx.wait_for(|fired| *fired).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_fires_once() {
        let latch = Latch::new();
        assert!(!latch.is_fired());
        assert!(latch.fire());
        assert!(!latch.fire());
        assert!(latch.is_fired());
    }

    #[tokio::test]
    async fn test_wait_before_and_after_fire() {
        let latch = Arc::new(Latch::new());
        let waiter = {
            let latch = Arc::clone(&latch);
            tokio::spawn(async move { latch.wait().await })
        };

        tokio::task::yield_now().await;
        latch.fire();
        waiter.await.unwrap();

        // Late waiters return immediately
        latch.wait().await;
    }
}
