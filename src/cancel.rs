//! A cooperative cancellation handle, passed to every suspendable
//! operation per the concurrency model (`connect`, `read`, `write`,
//! `wait<T>`, `broadcast`).
//!
//! `tokio-util` didn't yet carry a `CancellationToken` at the version this
//! crate pins (that landed in a later `tokio-util`), so this is the same
//! handful of lines built directly on `tokio::sync::watch`, the way the
//! teacher builds small coordination primitives directly on `tokio::sync`
//! rather than reaching for an extra crate.

use std::sync::Arc;

use tokio::sync::watch;

/// Fired once, observed by any number of cloned tokens.
///
/// Holds an `Arc` of the originating sender so the `watch` channel stays
/// open for as long as any clone of the token is alive, even after the
/// `CancellationSource` itself is dropped — otherwise `watch::Receiver::recv`
/// observes the channel closing (all senders gone) and `cancelled()` would
/// resolve immediately instead of pending.
#[derive(Clone)]
pub struct CancellationToken {
    rx: watch::Receiver<bool>,
    _tx: Arc<watch::Sender<bool>>,
}

pub struct CancellationSource {
    tx: Arc<watch::Sender<bool>>,
    token: CancellationToken,
}

impl CancellationSource {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        let tx = Arc::new(tx);
        Self {
            tx: tx.clone(),
            token: CancellationToken { rx, _tx: tx },
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl Default for CancellationSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    /// A token that never fires, for call sites that don't need
    /// cancellation (e.g. background watchdog ticks).
    pub fn never() -> Self {
        CancellationSource::new().token()
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once `cancel()` has been called on the originating source.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    #[tokio::test]
    async fn cancelled_resolves_after_cancel() {
        let source = CancellationSource::new();
        let token = source.token();
        assert!(!token.is_cancelled());
        source.cancel();
        token.cancelled().await;
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn never_does_not_report_cancelled() {
        let token = CancellationToken::never();
        assert!(!token.is_cancelled());
        assert!(token.cancelled().now_or_never().is_none());
    }

    #[tokio::test]
    async fn clones_observe_the_same_cancellation() {
        let source = CancellationSource::new();
        let a = source.token();
        let b = source.token();
        source.cancel();
        a.cancelled().await;
        b.cancelled().await;
    }
}
