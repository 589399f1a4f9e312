//! A keyed, typed promise registry with per-wait timeout and cancellation.
//!
//! Every layer above the wire codec resolves request/response pairs through
//! here rather than matching responses to requests by hand: a caller
//! registers a [`wait`](Waiter::wait) under a [`WaitKey`], and whichever
//! message handler later decodes the matching reply calls
//! [`complete`](Waiter::complete) with it.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tokio::time;

#[derive(Debug)]
pub enum Error {
    Timeout,
    Cancelled,
    /// A second `wait()` replaced this one before it resolved.
    Replaced,
    /// `complete()` was called with a value of a different type than the
    /// one `wait()` was registered with.
    TypeMismatch,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Timeout => write!(f, "wait timed out"),
            Error::Cancelled => write!(f, "wait was cancelled"),
            Error::Replaced => write!(f, "wait was replaced by a newer registration"),
            Error::TypeMismatch => write!(f, "wait completed with a value of the wrong type"),
        }
    }
}

impl std::error::Error for Error {}

/// A composite identity matching incoming events to pending waits, built
/// from an ordered tuple of printable tokens (e.g. `(Transfer, Download,
/// username, filename, token)`).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct WaitKey(Vec<String>);

impl WaitKey {
    pub fn new(parts: impl IntoIterator<Item = impl ToString>) -> Self {
        Self(parts.into_iter().map(|p| p.to_string()).collect())
    }
}

impl fmt::Display for WaitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({})", self.0.join(", "))
    }
}

/// Builds a [`WaitKey`] from any number of `Display`-able parts.
#[macro_export]
macro_rules! wait_key {
    ($($part:expr),+ $(,)?) => {
        $crate::waiter::WaitKey::new(vec![$(format!("{}", $part)),+])
    };
}

/// A pending completion, type-erased so the registry can hold waits of
/// different `T` in the same map. `resolve_err` closes over the concrete
/// `T` at registration time, so it can fail a wait whose type it no longer
/// statically knows (used for replace/cancel/type-mismatch).
struct WaitEntry {
    sender: Box<dyn Any + Send>,
    resolve_err: Box<dyn FnOnce(Box<dyn Any + Send>, Error) + Send>,
}

fn make_entry<T: Send + 'static>(tx: oneshot::Sender<Result<T, Error>>) -> WaitEntry {
    WaitEntry {
        sender: Box::new(tx),
        resolve_err: Box::new(|sender, err| {
            if let Ok(tx) = sender.downcast::<oneshot::Sender<Result<T, Error>>>() {
                let _ = tx.send(Err(err));
            }
        }),
    }
}

/// The registry itself. Cheap to clone (it's an `Arc` internally via
/// `Mutex` sharing would require wrapping in `Arc` by the owner); callers
/// typically hold one behind an `Arc<Waiter>`.
#[derive(Default)]
pub struct Waiter {
    entries: Mutex<HashMap<WaitKey, WaitEntry>>,
    default_timeout: Duration,
}

impl Waiter {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            default_timeout,
        }
    }

    /// Registers a pending wait for `key` and suspends until it is
    /// completed, thrown, replaced, or the timeout (`timeout` or the
    /// configured default) elapses.
    pub async fn wait<T: Send + 'static>(
        &self,
        key: WaitKey,
        timeout: Option<Duration>,
    ) -> Result<T, Error> {
        let (tx, rx) = oneshot::channel::<Result<T, Error>>();
        let entry = make_entry(tx);
        {
            let mut entries = self.entries.lock().await;
            if let Some(prev) = entries.insert(key.clone(), entry) {
                (prev.resolve_err)(prev.sender, Error::Replaced);
            }
        }

        let deadline = timeout.unwrap_or(self.default_timeout);
        match time::timeout(deadline, rx).await {
            Ok(Ok(result)) => result,
            // sender dropped (e.g. cancel_all ran and the entry was
            // already removed by the time we raced it) without a value.
            Ok(Err(_)) => Err(Error::Cancelled),
            Err(_) => {
                self.entries.lock().await.remove(&key);
                Err(Error::Timeout)
            }
        }
    }

    /// Resolves the pending wait at `key` with `value`. A no-op if no wait
    /// is outstanding for `key`. If a wait is outstanding but was
    /// registered with a different `T`, it fails with [`Error::TypeMismatch`].
    pub async fn complete<T: Send + 'static>(&self, key: &WaitKey, value: T) {
        let entry = self.entries.lock().await.remove(key);
        if let Some(entry) = entry {
            match entry.sender.downcast::<oneshot::Sender<Result<T, Error>>>() {
                Ok(tx) => {
                    let _ = tx.send(Ok(value));
                }
                Err(sender) => (entry.resolve_err)(sender, Error::TypeMismatch),
            }
        }
    }

    /// Fails the pending wait at `key` with `error`. A no-op if absent.
    pub async fn throw(&self, key: &WaitKey, error: Error) {
        if let Some(entry) = self.entries.lock().await.remove(key) {
            (entry.resolve_err)(entry.sender, error);
        }
    }

    /// Fails every outstanding wait with [`Error::Cancelled`].
    pub async fn cancel_all(&self) {
        let mut entries = self.entries.lock().await;
        for (_, entry) in entries.drain() {
            (entry.resolve_err)(entry.sender, Error::Cancelled);
        }
    }

    #[cfg(test)]
    async fn pending_count(&self) -> usize {
        self.entries.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn complete_resolves_the_matching_wait() {
        let waiter = Waiter::new(Duration::from_secs(1));
        let key = wait_key!("Download", "alice", 7);
        let key2 = key.clone();
        let waiter = std::sync::Arc::new(waiter);
        let w2 = waiter.clone();
        let handle = tokio::spawn(async move { w2.wait::<u32>(key2, None).await });
        // give the waiter task a chance to register before completing.
        tokio::task::yield_now().await;
        waiter.complete(&key, 42u32).await;
        assert_eq!(handle.await.unwrap().unwrap(), 42);
    }

    #[tokio::test]
    async fn complete_on_absent_key_is_a_no_op() {
        let waiter = Waiter::new(Duration::from_secs(1));
        waiter.complete(&wait_key!("nothing"), 1u32).await;
    }

    #[tokio::test]
    async fn second_wait_replaces_first_with_replaced_error() {
        let waiter = std::sync::Arc::new(Waiter::new(Duration::from_secs(1)));
        let key = wait_key!("Search", 100);
        let w1 = waiter.clone();
        let k1 = key.clone();
        let first = tokio::spawn(async move { w1.wait::<u32>(k1, None).await });
        tokio::task::yield_now().await;

        let w2 = waiter.clone();
        let k2 = key.clone();
        let _second = tokio::spawn(async move { w2.wait::<u32>(k2, None).await });
        tokio::task::yield_now().await;

        assert!(matches!(first.await.unwrap(), Err(Error::Replaced)));
    }

    #[tokio::test]
    async fn type_mismatch_on_complete_fails_the_wait() {
        let waiter = std::sync::Arc::new(Waiter::new(Duration::from_secs(1)));
        let key = wait_key!("k");
        let w1 = waiter.clone();
        let k1 = key.clone();
        let handle = tokio::spawn(async move { w1.wait::<u32>(k1, None).await });
        tokio::task::yield_now().await;

        waiter.complete(&key, "not a u32".to_string()).await;
        assert!(matches!(handle.await.unwrap(), Err(Error::TypeMismatch)));
    }

    #[tokio::test]
    async fn timeout_fires_and_removes_the_entry() {
        let waiter = Waiter::new(Duration::from_secs(30));
        let key = wait_key!("slow");
        let result = waiter.wait::<u32>(key, Some(Duration::from_millis(10))).await;
        assert!(matches!(result, Err(Error::Timeout)));
        assert_eq!(waiter.pending_count().await, 0);
    }

    #[tokio::test]
    async fn cancel_all_fails_every_outstanding_wait() {
        let waiter = std::sync::Arc::new(Waiter::new(Duration::from_secs(30)));
        let mut handles = Vec::new();
        for i in 0..3 {
            let w = waiter.clone();
            let key = wait_key!("batch", i);
            handles.push(tokio::spawn(async move { w.wait::<u32>(key, None).await }));
        }
        tokio::task::yield_now().await;
        waiter.cancel_all().await;
        for handle in handles {
            assert!(matches!(handle.await.unwrap(), Err(Error::Cancelled)));
        }
    }

    #[tokio::test]
    async fn throw_fails_the_wait_with_the_given_error() {
        let waiter = std::sync::Arc::new(Waiter::new(Duration::from_secs(30)));
        let key = wait_key!("throws");
        let w = waiter.clone();
        let k = key.clone();
        let handle = tokio::spawn(async move { w.wait::<u32>(k, None).await });
        tokio::task::yield_now().await;
        waiter.throw(&key, Error::Cancelled).await;
        assert!(matches!(handle.await.unwrap(), Err(Error::Cancelled)));
    }
}
