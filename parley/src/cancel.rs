//! Cancellation signal tied to transport shutdown.
//!
//! A [`CancelSource`] is owned by the transport; every inbound event carries
//! a cheap [`Cancellation`] clone of it. Handlers poll or await it during long
//! work. Dropping the source without cancelling leaves all clones pending
//! forever.

use tokio::sync::watch;

/// Owning side of a cancellation signal.
#[derive(Debug)]
pub struct CancelSource {
    tx: watch::Sender<bool>,
}

impl CancelSource {
    /// Create a new, not yet cancelled, source.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Hand out a cancellation observer.
    #[must_use]
    pub fn token(&self) -> Cancellation {
        Cancellation {
            rx: Some(self.tx.subscribe()),
        }
    }

    /// Signal cancellation to every observer. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Whether [`cancel`](Self::cancel) has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Observing side of a cancellation signal.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    rx: Option<watch::Receiver<bool>>,
}

impl Cancellation {
    /// A cancellation that never fires.
    #[must_use]
    pub const fn never() -> Self {
        Self { rx: None }
    }

    /// Whether cancellation has been signalled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.rx.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Resolve once cancellation is signalled.
    pub async fn cancelled(&self) {
        let Some(rx) = &self.rx else {
            return std::future::pending().await;
        };
        let mut rx = rx.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            // Source dropped without cancelling.
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_wakes_observers() {
        let source = CancelSource::new();
        let token = source.token();
        assert!(!token.is_cancelled());

        let waiter = tokio::spawn({
            let token = token.clone();
            async move { token.cancelled().await }
        });

        source.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(token.is_cancelled());
        assert!(source.is_cancelled());
    }

    #[test]
    fn test_cancelled_wakes_pending_poll() {
        let source = CancelSource::new();
        let token = source.token();
        let mut fut = tokio_test::task::spawn(token.cancelled());

        tokio_test::assert_pending!(fut.poll());
        source.cancel();
        assert!(fut.is_woken());
        tokio_test::assert_ready!(fut.poll());
    }

    #[tokio::test]
    async fn test_never_stays_pending() {
        let token = Cancellation::never();
        assert!(!token.is_cancelled());
        let res = tokio::time::timeout(Duration::from_millis(20), token.cancelled()).await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn test_dropped_source_stays_pending() {
        let token = CancelSource::new().token();
        let res = tokio::time::timeout(Duration::from_millis(20), token.cancelled()).await;
        assert!(res.is_err());
    }
}
