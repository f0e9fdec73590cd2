//! Cooperative stop token.
//!
//! The token replaces a process-wide stop flag. It is passed to every role and
//! checked at each blocking wait and loop head. Cancelling it also runs every
//! registered wake hook so that condition-variable waiters owned by other
//! components re-check their predicates immediately instead of at their next
//! timeout.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

type WakeHook = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Inner {
    stopped: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
    hooks: Mutex<Vec<(u64, WakeHook)>>,
    next_hook: AtomicU64,
}

/// Cloneable handle to a shared stop flag
#[derive(Clone, Default)]
pub struct StopToken {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for StopToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopToken")
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Raise the stop flag and wake every waiter.
    ///
    /// Idempotent; hooks only run on the first call.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let _guard = self.inner.lock.lock();
            self.inner.cond.notify_all();
        }
        let hooks: Vec<WakeHook> = self
            .inner
            .hooks
            .lock()
            .iter()
            .map(|(_, hook)| Arc::clone(hook))
            .collect();
        for hook in hooks {
            hook();
        }
    }

    /// Register a hook that is run when the token is stopped.
    ///
    /// If the token is already stopped the hook runs immediately. The hook is
    /// removed when the returned guard is dropped.
    pub fn on_stop<F>(&self, hook: F) -> WakeRegistration
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = self.inner.next_hook.fetch_add(1, Ordering::Relaxed);
        let hook: WakeHook = Arc::new(hook);
        self.inner.hooks.lock().push((id, Arc::clone(&hook)));
        if self.is_stopped() {
            hook();
        }
        WakeRegistration {
            token: self.clone(),
            id,
        }
    }

    /// Sleep for up to `timeout`, returning early if the token is stopped.
    ///
    /// Returns `true` if the token was stopped.
    pub fn sleep(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.lock.lock();
        while !self.is_stopped() {
            if self.inner.cond.wait_until(&mut guard, deadline).timed_out() {
                break;
            }
        }
        self.is_stopped()
    }

    /// Block until the token is stopped.
    pub fn wait(&self) {
        let mut guard = self.inner.lock.lock();
        while !self.is_stopped() {
            self.inner.cond.wait(&mut guard);
        }
    }
}

/// Keeps a wake hook registered on a [`StopToken`]
pub struct WakeRegistration {
    token: StopToken,
    id: u64,
}

impl Drop for WakeRegistration {
    fn drop(&mut self) {
        self.token
            .inner
            .hooks
            .lock()
            .retain(|(id, _)| *id != self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn test_stop_is_idempotent_and_visible_to_clones() {
        let token = StopToken::new();
        let clone = token.clone();
        assert!(!clone.is_stopped());
        token.stop();
        token.stop();
        assert!(clone.is_stopped());
    }

    #[test]
    fn test_sleep_returns_early_on_stop() {
        let token = StopToken::new();
        let stopper = token.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            stopper.stop();
        });

        let start = Instant::now();
        assert!(token.sleep(Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }

    #[test]
    fn test_sleep_times_out_without_stop() {
        let token = StopToken::new();
        assert!(!token.sleep(Duration::from_millis(10)));
    }

    #[test]
    fn test_hooks_run_once_and_unregister_on_drop() {
        let token = StopToken::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let kept = {
            let calls = Arc::clone(&calls);
            token.on_stop(move || {
                calls.fetch_add(1, Ordering::SeqCst);
            })
        };
        {
            let calls = Arc::clone(&calls);
            let _dropped = token.on_stop(move || {
                calls.fetch_add(100, Ordering::SeqCst);
            });
        }

        token.stop();
        token.stop();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        drop(kept);
    }

    #[test]
    fn test_hook_registered_after_stop_runs_immediately() {
        let token = StopToken::new();
        token.stop();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let _reg = token.on_stop(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
