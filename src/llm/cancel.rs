// ABOUTME: Cooperative cancellation - an AbortController owned by the caller
// ABOUTME: and cloneable AbortSignals observed by adapters at suspension points.

use std::fmt;

use tokio::sync::watch;

/// Caller-side handle that triggers cancellation.
pub struct AbortController {
    tx: watch::Sender<bool>,
}

impl AbortController {
    /// Create a new, untriggered controller.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// A signal to hand to a request.
    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            rx: self.tx.subscribe(),
        }
    }

    /// Trigger cancellation. Idempotent.
    pub fn abort(&self) {
        self.tx.send_replace(true);
    }

    /// True once [`abort`](Self::abort) has been called.
    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

/// Read side of an [`AbortController`].
///
/// The default signal is never triggered.
#[derive(Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

impl AbortSignal {
    /// A signal that can never fire.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    /// Check without waiting.
    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the signal fires. Pends forever if it never can.
    pub async fn aborted(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // Controller dropped without aborting.
                futures::future::pending::<()>().await;
            }
        }
    }
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::never()
    }
}

impl fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortSignal")
            .field("aborted", &self.is_aborted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_default_signal_never_fires() {
        let signal = AbortSignal::default();
        assert!(!signal.is_aborted());
    }

    #[test]
    fn test_abort_visible_to_all_signals() {
        let controller = AbortController::new();
        let a = controller.signal();
        let b = a.clone();
        assert!(!a.is_aborted());

        controller.abort();
        assert!(a.is_aborted());
        assert!(b.is_aborted());
        assert!(controller.is_aborted());
    }

    #[tokio::test]
    async fn test_aborted_resolves_after_trigger() {
        let controller = AbortController::new();
        let signal = controller.signal();

        let waiter = tokio::spawn(async move { signal.aborted().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        controller.abort();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("aborted() should resolve")
            .unwrap();
    }

    #[tokio::test]
    async fn test_aborted_resolves_immediately_when_already_triggered() {
        let controller = AbortController::new();
        controller.abort();
        let signal = controller.signal();

        tokio::time::timeout(Duration::from_millis(100), signal.aborted())
            .await
            .expect("already-triggered signal should resolve at once");
    }

    #[tokio::test]
    async fn test_dropped_controller_pends() {
        let controller = AbortController::new();
        let signal = controller.signal();
        drop(controller);

        let result = tokio::time::timeout(Duration::from_millis(50), signal.aborted()).await;
        assert!(result.is_err());
    }
}
