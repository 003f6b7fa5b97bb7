//! One-shot completion futures.
//!
//! The session hands out [`SshFuture`] values for operations that finish
//! later: packet writes and key exchanges. A future is tri-state (pending,
//! success, error), completes exactly once (the first writer wins), and
//! supports both blocking waits and completion listeners. Errors are
//! shared behind `Arc` so every observer sees the same value.

use skiff_platform::SkiffError;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Result type observed through a future.
pub type FutureResult<T> = Result<T, Arc<SkiffError>>;

type ListenerFn<T> = Box<dyn FnOnce(&FutureResult<T>) + Send>;

struct Inner<T> {
    value: Option<FutureResult<T>>,
    listeners: Vec<ListenerFn<T>>,
}

/// A one-shot, waitable, listenable completion value.
pub struct SshFuture<T> {
    inner: Mutex<Inner<T>>,
    cond: Condvar,
}

impl<T: Clone + Send + 'static> SshFuture<T> {
    /// Creates a pending future.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                value: None,
                listeners: Vec::new(),
            }),
            cond: Condvar::new(),
        })
    }

    /// Completes the future with a success value.
    ///
    /// Returns `false` if it was already completed.
    pub fn complete(&self, value: T) -> bool {
        self.finish(Ok(value))
    }

    /// Completes the future with an error.
    ///
    /// Returns `false` if it was already completed.
    pub fn fail(&self, err: SkiffError) -> bool {
        self.finish(Err(Arc::new(err)))
    }

    fn finish(&self, result: FutureResult<T>) -> bool {
        let listeners = {
            let mut inner = self.inner.lock().expect("future lock poisoned");
            if inner.value.is_some() {
                return false;
            }
            inner.value = Some(result.clone());
            std::mem::take(&mut inner.listeners)
        };
        self.cond.notify_all();
        let value = self.value().expect("value just set");
        for listener in listeners {
            listener(&value);
        }
        true
    }

    /// Returns the completion value, if any.
    pub fn value(&self) -> Option<FutureResult<T>> {
        self.inner.lock().expect("future lock poisoned").value.clone()
    }

    /// Whether the future has completed.
    pub fn is_done(&self) -> bool {
        self.inner
            .lock()
            .expect("future lock poisoned")
            .value
            .is_some()
    }

    /// Blocks until the future completes.
    pub fn wait(&self) -> FutureResult<T> {
        let mut inner = self.inner.lock().expect("future lock poisoned");
        while inner.value.is_none() {
            inner = self.cond.wait(inner).expect("future lock poisoned");
        }
        inner.value.clone().expect("checked above")
    }

    /// Blocks until the future completes or `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<FutureResult<T>> {
        let deadline = std::time::Instant::now() + timeout;
        let mut inner = self.inner.lock().expect("future lock poisoned");
        while inner.value.is_none() {
            let now = std::time::Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(inner, deadline - now)
                .expect("future lock poisoned");
            inner = guard;
        }
        inner.value.clone()
    }

    /// Completes `target` with whatever this future resolves to.
    ///
    /// Used to link a drained pending-write future to the real write it
    /// turned into.
    pub fn chain(&self, target: Arc<SshFuture<T>>) {
        self.add_listener(move |result| {
            target.finish(result.clone());
        });
    }

    /// Registers a completion listener.
    ///
    /// Runs immediately if the future is already complete.
    pub fn add_listener(&self, listener: impl FnOnce(&FutureResult<T>) + Send + 'static) {
        let ready = {
            let mut inner = self.inner.lock().expect("future lock poisoned");
            match inner.value.clone() {
                Some(value) => value,
                None => {
                    inner.listeners.push(Box::new(listener));
                    return;
                }
            }
        };
        listener(&ready);
    }
}

/// A future for a packet write handoff.
pub type WriteFuture = SshFuture<()>;

/// A future for a key exchange round.
pub type KexFuture = SshFuture<()>;

/// Convenience: an already-successful write future.
pub fn completed_write() -> Arc<WriteFuture> {
    let future = WriteFuture::new();
    future.complete(());
    future
}

/// Convenience: an already-failed write future.
pub fn failed_write(err: SkiffError) -> Arc<WriteFuture> {
    let future = WriteFuture::new();
    future.fail(err);
    future
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_first_completion_wins() {
        let future = SshFuture::<u32>::new();
        assert!(future.complete(1));
        assert!(!future.complete(2));
        assert!(!future.fail(SkiffError::Closed("late".into())));
        assert_eq!(future.value().unwrap().unwrap(), 1);
    }

    #[test]
    fn test_wait_returns_value() {
        let future = SshFuture::<u32>::new();
        let waiter = {
            let future = Arc::clone(&future);
            std::thread::spawn(move || future.wait())
        };
        std::thread::sleep(Duration::from_millis(10));
        future.complete(7);
        assert_eq!(waiter.join().unwrap().unwrap(), 7);
    }

    #[test]
    fn test_wait_timeout_expires() {
        let future = SshFuture::<u32>::new();
        assert!(future.wait_timeout(Duration::from_millis(20)).is_none());
        assert!(!future.is_done());
    }

    #[test]
    fn test_listener_fires_on_completion() {
        let future = SshFuture::<u32>::new();
        let fired = Arc::new(AtomicUsize::new(0));
        {
            let fired = Arc::clone(&fired);
            future.add_listener(move |value| {
                assert!(value.is_ok());
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }
        future.complete(3);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listener_fires_immediately_when_done() {
        let future = SshFuture::<u32>::new();
        future.fail(SkiffError::Closed("gone".into()));

        let fired = Arc::new(AtomicUsize::new(0));
        {
            let fired = Arc::clone(&fired);
            future.add_listener(move |value| {
                assert!(value.is_err());
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_observers_see_same_value() {
        let future = SshFuture::<u32>::new();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let future = Arc::clone(&future);
            handles.push(std::thread::spawn(move || future.wait()));
        }
        future.complete(42);
        for handle in handles {
            assert_eq!(handle.join().unwrap().unwrap(), 42);
        }
    }
}
