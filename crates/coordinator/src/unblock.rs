//! Futures used to signal that a blocked scheduler can make progress again.

use futures::future::{self, BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::sync::oneshot;

pub type UnblockFuture = Shared<BoxFuture<'static, ()>>;

pub fn immediate() -> UnblockFuture {
    future::ready(()).boxed().shared()
}

pub fn delay(duration: Duration) -> UnblockFuture {
    tokio::time::sleep(duration).boxed().shared()
}

pub fn from_future<F>(future: F) -> UnblockFuture
where
    F: Future + Send + 'static,
{
    future.map(|_| ()).boxed().shared()
}

/// Resolves when any of `futures` resolves.
pub fn any(futures: Vec<UnblockFuture>) -> UnblockFuture {
    if futures.is_empty() {
        return immediate();
    }
    from_future(future::select_all(futures))
}

pub fn is_done(future: &UnblockFuture) -> bool {
    future.clone().now_or_never().is_some()
}

/// Waits until one of `futures` resolves or `timeout` elapses. Returns false
/// on timeout. An empty list resolves immediately.
pub async fn wait_any(futures: Vec<UnblockFuture>, timeout: Duration) -> bool {
    if futures.is_empty() {
        return true;
    }
    tokio::time::timeout(timeout, future::select_all(futures)).await.is_ok()
}

/// A future completed explicitly through its paired [`Unblocker`].
pub fn settable() -> (Unblocker, UnblockFuture) {
    let (sender, receiver) = oneshot::channel();
    (
        Unblocker {
            sender: Mutex::new(Some(sender)),
        },
        from_future(receiver),
    )
}

pub struct Unblocker {
    sender: Mutex<Option<oneshot::Sender<()>>>,
}

impl Unblocker {
    pub fn set(&self) {
        if let Some(sender) = self.sender.lock().take() {
            let _ = sender.send(());
        }
    }
}

/// A reusable wakeup. Every call to [`Signal::notify`] completes the futures
/// handed out so far and arms a fresh one.
pub struct Signal {
    current: Mutex<(Unblocker, UnblockFuture)>,
}

impl Signal {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(settable()),
        }
    }

    pub fn future(&self) -> UnblockFuture {
        self.current.lock().1.clone()
    }

    pub fn notify(&self) {
        let (unblocker, _) = std::mem::replace(&mut *self.current.lock(), settable());
        unblocker.set();
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_settable_future() {
        let (unblocker, future) = settable();
        assert!(!is_done(&future));
        unblocker.set();
        unblocker.set();
        future.clone().await;
        assert!(is_done(&future));
    }

    #[tokio::test]
    async fn test_signal_rearms() {
        let signal = Signal::new();
        let first = signal.future();
        signal.notify();
        assert!(is_done(&first));
        assert!(!is_done(&signal.future()));
    }

    #[tokio::test]
    async fn test_wait_any() {
        let (_unblocker, pending) = settable();
        assert!(wait_any(Vec::new(), Duration::from_millis(1)).await);
        assert!(!wait_any(vec![pending.clone()], Duration::from_millis(10)).await);
        assert!(wait_any(vec![pending, immediate()], Duration::from_secs(1)).await);
        assert!(is_done(&any(vec![immediate()])));
    }
}
