//! Abort signal shared by build jobs and uploads.
//!
//! One [`AbortHandle`] fans out to any number of [`AbortSignal`] clones.
//! Once aborted, the signal stays aborted.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

/// Why a run or job was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
pub enum AbortReason {
    #[display("external cancellation")]
    External,
    #[display("fan-in barrier timeout")]
    BarrierTimeout,
    #[display("run timeout")]
    RunTimeout,
    #[display("job timeout")]
    JobTimeout,
}

/// Sending side of an abort signal.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    tx: Arc<watch::Sender<Option<AbortReason>>>,
}

/// Receiving side of an abort signal.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<Option<AbortReason>>,
}

impl AbortHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Abort with `reason`. The first reason wins.
    pub fn abort(&self, reason: AbortReason) {
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }

    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            rx: self.tx.subscribe(),
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.tx.borrow().is_some()
    }
}

impl Default for AbortHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        AbortHandle::new().signal()
    }

    pub fn reason(&self) -> Option<AbortReason> {
        *self.rx.borrow()
    }

    pub fn is_aborted(&self) -> bool {
        self.reason().is_some()
    }

    /// Resolves once the signal fires. Pending forever if every handle
    /// is dropped without aborting.
    pub async fn aborted(&self) -> AbortReason {
        let mut rx = self.rx.clone();
        loop {
            if let Some(reason) = *rx.borrow_and_update() {
                return reason;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}
