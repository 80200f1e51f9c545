//! Wait-for-N barrier between the build jobs and the publish job.

use std::time::Duration;
use tokio::sync::watch;

/// Countdown barrier. Each dependency holds a [`BarrierToken`]; the
/// barrier opens once every token has arrived or been dropped.
#[derive(Debug)]
pub struct FanInBarrier {
    remaining: watch::Sender<usize>,
    issued: usize,
    expected: usize,
}

/// A dependency's place in the barrier. Arrives exactly once, on
/// [`BarrierToken::arrive`] or drop.
#[derive(Debug)]
pub struct BarrierToken {
    remaining: watch::Sender<usize>,
}

impl FanInBarrier {
    pub fn new(expected: usize) -> Self {
        let (remaining, _) = watch::channel(expected);
        Self {
            remaining,
            issued: 0,
            expected,
        }
    }

    /// Issue a token for one dependency. Returns `None` once `expected`
    /// tokens have been issued.
    pub fn token(&mut self) -> Option<BarrierToken> {
        if self.issued == self.expected {
            return None;
        }
        self.issued += 1;
        Some(BarrierToken {
            remaining: self.remaining.clone(),
        })
    }

    /// Dependencies that have not arrived yet.
    pub fn remaining(&self) -> usize {
        *self.remaining.borrow()
    }

    /// Wait until every dependency has arrived.
    pub async fn wait(&self) {
        let mut rx = self.remaining.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Wait at most `timeout`. On timeout returns the number of
    /// dependencies still outstanding.
    pub async fn wait_timeout(&self, timeout: Duration) -> Result<(), usize> {
        tokio::time::timeout(timeout, self.wait())
            .await
            .map_err(|_| self.remaining())
    }
}

impl BarrierToken {
    pub fn arrive(self) {}
}

impl Drop for BarrierToken {
    fn drop(&mut self) {
        self.remaining.send_modify(|n| *n = n.saturating_sub(1));
    }
}
