//! Completion and cancellation plumbing shared across the pipeline.

use std::sync::Arc;

use tokio::sync::watch;

/// Handle returned by `close`; resolves once shutdown has completed.
///
/// Clones observe the same completion, so repeated `close` calls hand out the
/// same logical handle.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    rx: watch::Receiver<bool>,
}

/// Writer half of a [`ShutdownHandle`].
#[derive(Debug, Clone)]
pub(crate) struct ShutdownCell {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownCell {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub(crate) fn handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            rx: self.tx.subscribe(),
        }
    }

    pub(crate) fn complete(&self) {
        self.tx.send_replace(true);
    }

    pub(crate) fn is_complete(&self) -> bool {
        *self.tx.borrow()
    }
}

impl ShutdownHandle {
    /// Waits until the transport has shut down.
    pub async fn wait(&mut self) {
        // wait_for only errs if the sender is gone, at which point shutdown
        // can no longer be observed pending.
        let _ = self.rx.wait_for(|done| *done).await;
    }

    /// Whether shutdown has already completed.
    pub fn is_complete(&self) -> bool {
        *self.rx.borrow()
    }
}

/// Cooperative interrupt flag observed by the upload task at its suspension
/// points. The tokio rendition of the uploader thread's interrupt status.
#[derive(Debug, Clone)]
pub(crate) struct Interrupt {
    tx: Arc<watch::Sender<bool>>,
}

impl Interrupt {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub(crate) fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub(crate) fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the interrupt fires; pends forever otherwise.
    pub(crate) async fn triggered(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|set| *set).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn handle_clones_share_completion() {
        let cell = ShutdownCell::new();
        let first = cell.handle();
        let mut second = cell.handle();
        assert!(!first.is_complete());

        cell.complete();
        second.wait().await;
        assert!(first.is_complete());
    }

    #[tokio::test]
    async fn interrupt_wakes_waiters() {
        let interrupt = Interrupt::new();
        let waiter = {
            let interrupt = interrupt.clone();
            tokio::spawn(async move { interrupt.triggered().await })
        };
        interrupt.trigger();
        waiter.await.unwrap();
        assert!(interrupt.is_triggered());
    }
}
