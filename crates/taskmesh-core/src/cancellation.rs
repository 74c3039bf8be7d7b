//! Cooperative cancellation capability.
//!
//! A [`Cancellation`] is attached to every cancellable task. It moves one way,
//! from running to cancelled, and notifies registered listeners exactly once.
//! Listeners that arrive after the transition are invoked inline, so no
//! listener is ever left waiting for a signal that already fired.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::TaskCancelled;

/// Callback invoked once a task is cancelled.
pub type CancellationListener = Box<dyn FnOnce(TaskCancelled) + Send>;

/// Handle returned when a listener is queued, used to remove it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Inner {
    reason: Option<String>,
    next_listener: u64,
    listeners: Vec<(ListenerId, CancellationListener)>,
}

/// Cancellation state of a single task.
pub struct Cancellation {
    cancel_children: bool,
    // Mirrors `inner.reason.is_some()` for lock-free checks in hot loops.
    cancelled: AtomicBool,
    inner: Mutex<Inner>,
}

impl Cancellation {
    /// Create a running cancellation state.
    ///
    /// `cancel_children` decides whether cancelling the owning task also bans
    /// and cancels its descendants across the cluster.
    pub fn new(cancel_children: bool) -> Self {
        Self {
            cancel_children,
            cancelled: AtomicBool::new(false),
            inner: Mutex::new(Inner {
                reason: None,
                next_listener: 0,
                listeners: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the task has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// The reason given at cancellation time, if cancelled.
    pub fn reason(&self) -> Option<String> {
        self.lock().reason.clone()
    }

    /// Whether descendants should be cancelled along with this task.
    pub fn should_cancel_children_on_cancellation(&self) -> bool {
        self.cancel_children
    }

    /// Returns an error if the task has been cancelled.
    pub fn ensure_not_cancelled(&self) -> Result<(), TaskCancelled> {
        if !self.is_cancelled() {
            return Ok(());
        }
        let reason = self.reason().unwrap_or_default();
        Err(TaskCancelled::new(reason))
    }

    /// Cancel the task.
    ///
    /// Returns `true` if this call performed the transition, `false` if the
    /// task was already cancelled. Queued listeners run on the calling thread
    /// after the lock is released.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let listeners = {
            let mut inner = self.lock();
            if inner.reason.is_some() {
                return false;
            }
            inner.reason = Some(reason.clone());
            self.cancelled.store(true, Ordering::Release);
            std::mem::take(&mut inner.listeners)
        };

        let err = TaskCancelled::new(reason);
        for (_, listener) in listeners {
            listener(err.clone());
        }
        true
    }

    /// Run `listener` once the task is cancelled.
    ///
    /// If the task is already cancelled the listener runs immediately and
    /// `None` is returned. Otherwise it is queued and its id returned.
    pub fn notify_if_cancelled(&self, listener: CancellationListener) -> Option<ListenerId> {
        let mut inner = self.lock();
        if let Some(reason) = inner.reason.clone() {
            drop(inner);
            listener(TaskCancelled::new(reason));
            return None;
        }
        let id = ListenerId(inner.next_listener);
        inner.next_listener += 1;
        inner.listeners.push((id, listener));
        Some(id)
    }

    /// Remove a queued listener. Returns `false` if it already ran or was
    /// never queued.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut inner = self.lock();
        let before = inner.listeners.len();
        inner.listeners.retain(|(lid, _)| *lid != id);
        inner.listeners.len() != before
    }

    /// Number of listeners still waiting.
    pub fn pending_listeners(&self) -> usize {
        self.lock().listeners.len()
    }
}

impl fmt::Debug for Cancellation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("Cancellation")
            .field("cancel_children", &self.cancel_children)
            .field("reason", &inner.reason)
            .field("listeners", &inner.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn counting_listener(counter: &Arc<AtomicUsize>) -> CancellationListener {
        let counter = counter.clone();
        Box::new(move |err| {
            assert_eq!(err.reason, "stop");
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_ensure_not_cancelled() {
        let c = Cancellation::new(false);
        assert!(c.ensure_not_cancelled().is_ok());
        assert!(c.cancel("stop"));
        let err = c.ensure_not_cancelled().unwrap_err();
        assert_eq!(err.to_string(), "task cancelled [stop]");
    }

    #[test]
    fn test_cancel_is_one_way_and_keeps_first_reason() {
        let c = Cancellation::new(true);
        assert!(c.cancel("stop"));
        assert!(!c.cancel("again"));
        assert_eq!(c.reason().as_deref(), Some("stop"));
        assert!(c.should_cancel_children_on_cancellation());
    }

    #[test]
    fn test_queued_listeners_fire_once() {
        let c = Cancellation::new(false);
        let counter = Arc::new(AtomicUsize::new(0));
        assert!(c.notify_if_cancelled(counting_listener(&counter)).is_some());
        assert!(c.notify_if_cancelled(counting_listener(&counter)).is_some());
        assert_eq!(c.pending_listeners(), 2);

        c.cancel("stop");
        c.cancel("stop");
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(c.pending_listeners(), 0);
    }

    #[test]
    fn test_late_listener_runs_inline() {
        let c = Cancellation::new(false);
        c.cancel("stop");
        let counter = Arc::new(AtomicUsize::new(0));
        assert!(c.notify_if_cancelled(counting_listener(&counter)).is_none());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_removed_listener_does_not_fire() {
        let c = Cancellation::new(false);
        let counter = Arc::new(AtomicUsize::new(0));
        let id = c.notify_if_cancelled(counting_listener(&counter)).unwrap();
        assert!(c.remove_listener(id));
        assert!(!c.remove_listener(id));
        c.cancel("stop");
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_concurrent_cancel_transitions_once() {
        let c = Arc::new(Cancellation::new(false));
        let counter = Arc::new(AtomicUsize::new(0));
        c.notify_if_cancelled(counting_listener(&counter));

        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let c = c.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    c.cancel("stop")
                })
            })
            .collect();

        let transitions = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(transitions, 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
