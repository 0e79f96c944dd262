// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC

//! Implementation of [`AbortHandle`] and [`AbortSignal`].

use std::sync::{self, Arc, atomic};
use std::task;

struct AbortState {
    aborted: atomic::AtomicBool,
    waker: sync::Mutex<Option<task::Waker>>,
}

/// Requesting side of an abort request.
///
/// Obtained through [`abort_pair()`]. Invoking [`abort()`](Self::abort)
/// marks the associated [`AbortSignal`] as aborted and wakes whatever task
/// last [registered](AbortSignal::register) with it.
#[derive(Clone)]
pub struct AbortHandle {
    state: Arc<AbortState>,
}

impl AbortHandle {
    pub fn abort(&self) {
        self.state.aborted.store(true, atomic::Ordering::Release);
        let waker = self
            .state
            .waker
            .lock()
            .unwrap_or_else(sync::PoisonError::into_inner)
            .take();
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.state.aborted.load(atomic::Ordering::Acquire)
    }
}

/// Observing side of an abort request.
///
/// An abortable [`Future`](std::future::Future) owns the `AbortSignal`,
/// checks [`is_aborted()`](Self::is_aborted) whenever it gets polled and
/// [registers](Self::register) its current [`Waker`](task::Waker) before
/// returning [`Pending`](task::Poll::Pending).
pub struct AbortSignal {
    state: Arc<AbortState>,
}

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        self.state.aborted.load(atomic::Ordering::Acquire)
    }

    pub fn register(&self, waker: &task::Waker) {
        let mut registered = self.state.waker.lock().unwrap_or_else(sync::PoisonError::into_inner);
        match registered.as_ref() {
            Some(registered_waker) if registered_waker.will_wake(waker) => (),
            _ => *registered = Some(waker.clone()),
        }
    }
}

/// Create a connected pair of [`AbortHandle`] and [`AbortSignal`].
pub fn abort_pair() -> (AbortHandle, AbortSignal) {
    let state = Arc::new(AbortState {
        aborted: atomic::AtomicBool::new(false),
        waker: sync::Mutex::new(None),
    });
    (
        AbortHandle { state: state.clone() },
        AbortSignal { state },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingWaker(AtomicUsize);

    impl task::Wake for CountingWaker {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, atomic::Ordering::Relaxed);
        }
    }

    #[test]
    fn test_abort_wakes_registered() {
        let (handle, signal) = abort_pair();
        let counter = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let waker = task::Waker::from(counter.clone());
        signal.register(&waker);
        assert!(!signal.is_aborted());
        handle.abort();
        assert!(signal.is_aborted());
        assert!(handle.is_aborted());
        assert_eq!(counter.0.load(atomic::Ordering::Relaxed), 1);

        // The waker is consumed by the first abort.
        handle.abort();
        assert_eq!(counter.0.load(atomic::Ordering::Relaxed), 1);
    }
}
